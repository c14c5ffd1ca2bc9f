//! Scrape engine: network, decoding, extraction and export around the pure
//! core, plus the orchestrator that drives a run.
mod decode;
mod export;
mod extract;
mod fetch;
mod guard;
mod json_records;
mod orchestrator;
mod persist;
mod render;
mod settings;
mod types;

pub use decode::{decode_document, is_json_content_type, DecodedDocument};
pub use export::{
    build_csv, column_union, export_records, ArtifactRef, CsvTableWriter, ExportError, TableWriter,
};
pub use extract::{ExtractError, Extractor, SelectorExtractor};
pub use fetch::{
    compose_url, FetchSettings, Fetcher, GuardedFetcher, OversizePolicy, DEFAULT_USER_AGENT,
};
pub use guard::{
    is_blocked_ip, parse_target, AddressGuard, HostResolver, StaticResolver, SystemResolver,
    VettedTarget,
};
pub use json_records::{find_json_records, JsonRecords};
pub use orchestrator::Orchestrator;
pub use persist::{ensure_output_dir, ArtifactWriter, PersistError};
pub use render::{RenderError, Renderer};
pub use settings::EngineSettings;
pub use types::{FailureKind, FetchError, FetchOutcome, FetchRequest};
