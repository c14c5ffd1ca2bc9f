use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use engine_logging::{engine_debug, engine_info};
use scrape_core::Record;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::persist::{ArtifactWriter, PersistError};

/// Where an exported table can be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// File name, e.g. `3fa9c01b.csv`.
    pub name: String,
    pub path: PathBuf,
    /// Retrieval path handed back to the caller.
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("no records to export")]
    Empty,
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
}

/// Writes a record set as one table artifact.
pub trait TableWriter: Send + Sync {
    fn write_table(&self, records: &[Record]) -> Result<ArtifactRef, ExportError>;
}

/// Hands non-empty record sets to `writer`; an empty set is signalled with
/// [`ExportError::Empty`] and nothing is written.
pub fn export_records(writer: &dyn TableWriter, records: &[Record]) -> Result<ArtifactRef, ExportError> {
    if records.is_empty() {
        return Err(ExportError::Empty);
    }
    writer.write_table(records)
}

const NAME_ATTEMPTS: u32 = 8;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// UTF-8 CSV writer: column union in first-seen order, CRLF rows.
#[derive(Debug, Clone)]
pub struct CsvTableWriter {
    writer: ArtifactWriter,
    url_prefix: String,
}

impl CsvTableWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            writer: ArtifactWriter::new(dir),
            url_prefix: "/download".to_string(),
        }
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }
}

impl TableWriter for CsvTableWriter {
    fn write_table(&self, records: &[Record]) -> Result<ArtifactRef, ExportError> {
        let csv = build_csv(records);
        let mut attempt = 0;
        loop {
            let name = format!("{}.csv", artifact_stem(&csv));
            match self.writer.write_new(&name, csv.as_bytes()) {
                Ok(path) => {
                    engine_info!("Exported {} records to {}", records.len(), path.display());
                    return Ok(ArtifactRef {
                        url: format!("{}/{name}", self.url_prefix),
                        name,
                        path,
                    });
                }
                Err(PersistError::AlreadyExists(path)) if attempt + 1 < NAME_ATTEMPTS => {
                    engine_debug!("Artifact name {} taken; picking another", path.display());
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Keys of all records, in first-seen order.
pub fn column_union(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|r| r.keys())
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect()
}

/// Renders records as RFC 4180 CSV with a header row. Missing fields become
/// empty cells; arrays and objects are written as JSON text.
pub fn build_csv(records: &[Record]) -> String {
    let columns = column_union(records);
    let mut out = String::new();
    push_row(&mut out, columns.iter().map(String::as_str));
    for record in records {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| record.get(c).map(cell_text).unwrap_or_default())
            .collect();
        push_row(&mut out, cells.iter().map(String::as_str));
    }
    out
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if cell.contains([',', '"', '\r', '\n']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push_str("\r\n");
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Eight hex chars derived from the content, the clock and a process counter.
fn artifact_stem(content: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(counter.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_are_short_hex_and_distinct() {
        let a = artifact_stem("same");
        let b = artifact_stem("same");
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
