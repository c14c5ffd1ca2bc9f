use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::Record;

/// Lowercases and drops every non-alphanumeric character, so that
/// `"Company Name"`, `"company_name"` and `"companyName"` compare equal.
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub requested: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldCatalog {
    /// Union of record keys in first-seen order.
    pub available: Vec<String>,
    pub matched: Vec<FieldMatch>,
    pub unmatched: Vec<String>,
}

impl FieldCatalog {
    /// Distinct matched field names, in request order.
    pub fn selected(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.matched
            .iter()
            .map(|m| m.field.as_str())
            .filter(|f| seen.insert(*f))
            .collect()
    }
}

pub fn catalog(records: &[Record], requested: &[String]) -> FieldCatalog {
    let mut seen = HashSet::new();
    let mut available = Vec::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                available.push(key.clone());
            }
        }
    }

    // Shortest key wins when several normalize alike; ties keep first-seen.
    let mut by_norm: HashMap<String, &str> = HashMap::new();
    for field in &available {
        let norm = normalize_field_name(field);
        if norm.is_empty() {
            continue;
        }
        by_norm
            .entry(norm)
            .and_modify(|current| {
                if field.len() < current.len() {
                    *current = field.as_str();
                }
            })
            .or_insert(field.as_str());
    }

    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for req in requested {
        let norm = normalize_field_name(req);
        if norm.is_empty() {
            continue;
        }
        match by_norm.get(&norm) {
            Some(field) => matched.push(FieldMatch {
                requested: req.clone(),
                field: (*field).to_string(),
            }),
            None => unmatched.push(req.clone()),
        }
    }

    FieldCatalog {
        available,
        matched,
        unmatched,
    }
}

/// True when at least one requested name can take part in matching.
pub fn filtering_requested(requested: &[String]) -> bool {
    requested
        .iter()
        .any(|r| !normalize_field_name(r).is_empty())
}

/// Keeps only matched fields. Without usable requested names every record is
/// returned untouched; records emptied by the filter are dropped.
pub fn filter_records(records: Vec<Record>, catalog: &FieldCatalog, requested: &[String]) -> Vec<Record> {
    if !filtering_requested(requested) {
        return records;
    }
    let keep: HashSet<&str> = catalog.selected().into_iter().collect();
    records
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .filter(|(k, _)| keep.contains(k.as_str()))
                .collect::<Record>()
        })
        .filter(|record| !record.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::normalize_field_name;

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        assert_eq!(normalize_field_name("Company Name"), "companyname");
        assert_eq!(normalize_field_name("company_name"), "companyname");
        assert_eq!(normalize_field_name("rating-Count"), "ratingcount");
        assert_eq!(normalize_field_name("--"), "");
    }
}
