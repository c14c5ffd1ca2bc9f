use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One immutable step of the decision trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Map<String, Value>>,
}

impl TraceEntry {
    pub fn ok(step: impl Into<String>) -> Self {
        Self::new(step, true)
    }

    pub fn failed(step: impl Into<String>) -> Self {
        Self::new(step, false)
    }

    pub fn new(step: impl Into<String>, ok: bool) -> Self {
        Self {
            step: step.into(),
            ok,
            elapsed_ms: None,
            detail: None,
        }
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn detail_value(&self, key: &str) -> Option<&Value> {
        self.detail.as_ref().and_then(|d| d.get(key))
    }
}

/// Receives trace entries as they are produced.
pub trait TraceSink: Send {
    fn record(&mut self, entry: TraceEntry);
}

/// Append-only, ordered log of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionTrace {
    entries: Vec<TraceEntry>,
}

impl DecisionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|e| !e.ok).count()
    }

    pub fn into_entries(self) -> Vec<TraceEntry> {
        self.entries
    }
}

impl TraceSink for DecisionTrace {
    fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }
}
