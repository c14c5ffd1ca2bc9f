use scraper::{ElementRef, Html, Selector};
use scrape_core::Record;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("invalid css selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Turns a decoded document into candidate records.
pub trait Extractor: Send + Sync {
    fn extract(&self, document: &str, selector: Option<&str>) -> Result<Vec<Record>, ExtractError>;
}

/// Structural extractor built on `scraper`:
/// - with a selector, one record per matching element, fields taken from
///   descendants' class names, link/image attributes and `data-*` attributes
/// - without one, rows of the table with the most data rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectorExtractor;

impl Extractor for SelectorExtractor {
    fn extract(&self, document: &str, selector: Option<&str>) -> Result<Vec<Record>, ExtractError> {
        let doc = Html::parse_document(document);
        match selector.map(str::trim).filter(|s| !s.is_empty()) {
            Some(css) => records_for_selector(&doc, css),
            None => records_from_tables(&doc),
        }
    }
}

const META_KEYS: [&str; 4] = ["_index", "link", "src", "alt"];

fn records_for_selector(doc: &Html, css: &str) -> Result<Vec<Record>, ExtractError> {
    let selector = parse_selector(css)?;
    let mut records = Vec::new();

    for (idx, element) in doc.select(&selector).enumerate() {
        let mut record = Record::new();
        record.insert("_index".into(), Value::from(idx + 1));

        match element.value().name() {
            "a" => {
                if let Some(href) = attr(element, "href") {
                    record.insert("link".into(), href.into());
                }
            }
            "img" => insert_image(&mut record, element, "src", "alt"),
            _ => {}
        }

        // Descendants only; the element's own classes describe the record.
        for child in element.descendants().skip(1).filter_map(ElementRef::wrap) {
            for class in child.value().classes() {
                let field = class_suffix(class);
                if field.len() < 2 {
                    continue;
                }
                let text = element_text(child);
                if !text.is_empty() && !record.contains_key(&field) {
                    record.insert(field.clone(), text.into());
                }
                match child.value().name() {
                    "a" => {
                        if let Some(href) = attr(child, "href") {
                            record.insert(format!("{field}_url"), href.into());
                        }
                    }
                    "img" => insert_image(
                        &mut record,
                        child,
                        &format!("{field}_image"),
                        &format!("{field}_alt"),
                    ),
                    _ => {}
                }
            }
        }

        for (name, value) in element.value().attrs() {
            let Some(rest) = name.strip_prefix("data-") else {
                continue;
            };
            let field = clean_key(rest);
            if !field.is_empty() && !value.is_empty() {
                record.insert(field, value.into());
            }
        }

        if record.keys().all(|k| META_KEYS.contains(&k.as_str())) {
            let text = element_text(element);
            if !text.is_empty() {
                record.insert("text".into(), text.into());
            }
        }

        if record.len() > 2 {
            record.shift_remove("_index");
        }
        if record.len() > 1 || !record.contains_key("_index") {
            records.push(record);
        }
    }

    Ok(records)
}

fn records_from_tables(doc: &Html) -> Result<Vec<Record>, ExtractError> {
    let table_sel = parse_selector("table")?;
    let row_sel = parse_selector("tr")?;
    let th_sel = parse_selector("th")?;
    let td_sel = parse_selector("td")?;
    let cell_sel = parse_selector("td, th")?;

    let mut best: Vec<Record> = Vec::new();
    for table in doc.select(&table_sel) {
        let mut rows = table.select(&row_sel);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let mut headers: Vec<String> = header_row.select(&th_sel).map(element_text).collect();
        if headers.is_empty() {
            headers = header_row.select(&td_sel).map(element_text).collect();
        }
        if headers.is_empty() {
            continue;
        }
        for (i, header) in headers.iter_mut().enumerate() {
            if header.is_empty() {
                *header = format!("col_{}", i + 1);
            }
        }

        let mut records = Vec::new();
        for row in rows {
            let cells: Vec<String> = row
                .select(&cell_sel)
                .take(headers.len())
                .map(element_text)
                .collect();
            if cells.iter().all(String::is_empty) {
                continue;
            }
            let record: Record = headers
                .iter()
                .enumerate()
                .map(|(i, header)| {
                    let value = cells.get(i).map_or(Value::Null, |c| Value::from(c.as_str()));
                    (header.clone(), value)
                })
                .collect();
            records.push(record);
        }

        if records.len() > best.len() {
            best = records;
        }
    }
    Ok(best)
}

fn parse_selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|err| ExtractError::InvalidSelector {
        selector: css.to_string(),
        message: err.to_string(),
    })
}

fn insert_image(record: &mut Record, element: ElementRef<'_>, src_key: &str, alt_key: &str) {
    if let Some(src) = attr(element, "src").or_else(|| attr(element, "data-src")) {
        record.insert(src_key.to_string(), src.into());
    }
    if let Some(alt) = attr(element, "alt") {
        record.insert(alt_key.to_string(), alt.into());
    }
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Whitespace-separated text of all descendant text nodes.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `product__title` -> `title`, `card--featured` -> `featured`.
fn class_suffix(class: &str) -> String {
    let part = if let Some((_, tail)) = class.rsplit_once("__") {
        tail
    } else if let Some((_, tail)) = class.rsplit_once("--") {
        tail
    } else {
        class
    };
    clean_key(part)
}

fn clean_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}
