use serde::{Deserialize, Serialize};

use crate::{FieldCatalog, Mode, Record, RunPhase, TraceEntry};

/// Outcome of one run as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub mode_used: Mode,
    /// False only when the run ended in [`RunPhase::Failed`].
    pub success: bool,
    pub has_data: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub record_count: usize,
    pub phase: RunPhase,
    pub decision_trace: Vec<TraceEntry>,
    pub fields: FieldCatalog,
    /// Exported records, in iteration order. Not serialized.
    #[serde(skip)]
    pub records: Vec<Record>,
}

impl AnalysisResult {
    pub fn failed(mode: Mode, message: impl Into<String>, trace: Vec<TraceEntry>) -> Self {
        Self {
            mode_used: mode,
            success: false,
            has_data: false,
            message: message.into(),
            artifact: None,
            record_count: 0,
            phase: RunPhase::Failed,
            decision_trace: trace,
            fields: FieldCatalog::default(),
            records: Vec::new(),
        }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &TraceEntry> {
        self.decision_trace.iter().filter(|e| !e.ok)
    }
}
