//! Scrape core: pure request model, sequencing and cataloging logic.
//!
//! Nothing in this crate touches the network or the filesystem; the engine
//! crate drives these pieces against real collaborators.
mod catalog;
mod error;
mod pagination;
mod phase;
mod request;
mod result;
mod template;
mod trace;

pub use catalog::{
    catalog, filter_records, filtering_requested, normalize_field_name, FieldCatalog, FieldMatch,
};
pub use error::ConfigError;
pub use pagination::{
    lookup_path, CursorError, Mutation, PageSequencer, PaginationConfig, ParamChange, Step,
    StopReason,
};
pub use phase::{advance, RunEvent, RunPhase};
pub use request::{
    param_text, ExtractionRequest, HttpMethod, Mode, RenderOptions, MAX_DELAY_MS, MAX_RETRIES,
    MAX_SCROLL_COUNT, MAX_SCROLL_DELAY_MS, MAX_WAIT_SECONDS,
};
pub use result::AnalysisResult;
pub use template::{expand, BatchConfig, Expansion, DEFAULT_PLACEHOLDER};
pub use trace::{DecisionTrace, TraceEntry, TraceSink};

/// One extracted record: field name to scalar (or stringified) value.
/// Field order follows first insertion.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Query parameters as supplied by the caller. Non-string values are rendered
/// with [`param_text`] when the request is encoded.
pub type Params = std::collections::BTreeMap<String, serde_json::Value>;
