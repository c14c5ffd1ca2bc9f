use crate::Mode;

/// Request-level problems detected before any network activity.
/// These are the only errors that fail a whole run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{mode} mode requires a target address")]
    MissingAddress { mode: Mode },
    #[error("render mode requires a non-empty selector")]
    MissingSelector,
    #[error("only http/https addresses are supported, got '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid pagination: {0}")]
    InvalidPagination(String),
    #[error("cursor pagination is only available in xhr mode, not {mode}")]
    CursorRequiresApiMode { mode: Mode },
    #[error("{field} must be at most {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("header '{0}' is given more than once (header names are case-insensitive)")]
    DuplicateHeader(String),
    #[error("invalid batch placeholder name '{0}'")]
    InvalidPlaceholder(String),
    #[error("render mode is not available: no renderer is configured")]
    RendererUnavailable,
    #[error("every target address is blocked: {0}")]
    AddressBlocked(String),
}
