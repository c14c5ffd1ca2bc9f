use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BatchConfig, ConfigError, PaginationConfig, Params};

pub const MAX_DELAY_MS: u64 = 10_000;
pub const MAX_RETRIES: u32 = 5;
pub const MAX_WAIT_SECONDS: u64 = 60;
pub const MAX_SCROLL_COUNT: u32 = 50;
pub const MAX_SCROLL_DELAY_MS: u64 = 10_000;

const DEFAULT_DELAY_MS: u64 = 500;
const DEFAULT_XHR_RETRIES: u32 = 2;

/// Acquisition strategy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Static document fetch followed by structural extraction.
    Document,
    /// Direct API call with JSON decoding.
    Xhr,
    /// Rendered-page capture followed by structural extraction.
    Render,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Document => "document",
            Mode::Xhr => "xhr",
            Mode::Render => "render",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Knobs handed to the render collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub wait_seconds: u64,
    pub scroll_count: u32,
    pub scroll_delay_ms: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_seconds: 5,
            scroll_count: 0,
            scroll_delay_ms: 2_000,
        }
    }
}

/// Everything the orchestrator needs for one run. Deserializes from the JSON
/// shape accepted by the CLI; `url` and `api_url` are accepted as aliases of
/// `address`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub mode: Mode,
    #[serde(alias = "url", alias = "api_url")]
    pub address: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Unset means the per-mode default (2 for xhr, 0 otherwise).
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub requested_fields: Vec<String>,
    #[serde(default, alias = "css_selector")]
    pub selector: Option<String>,
    #[serde(default)]
    pub render: RenderOptions,
    #[serde(default)]
    pub stop_on_empty_page: bool,
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

impl ExtractionRequest {
    pub fn new(mode: Mode, address: impl Into<String>) -> Self {
        Self {
            mode,
            address: address.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            params: Params::new(),
            body: None,
            cookies: BTreeMap::new(),
            delay_ms: DEFAULT_DELAY_MS,
            max_retries: None,
            pagination: None,
            batch: BatchConfig::default(),
            requested_fields: Vec::new(),
            selector: None,
            render: RenderOptions::default(),
            stop_on_empty_page: false,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_requested_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn stopping_on_empty_page(mut self) -> Self {
        self.stop_on_empty_page = true;
        self
    }

    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(match self.mode {
            Mode::Xhr => DEFAULT_XHR_RETRIES,
            Mode::Document | Mode::Render => 0,
        })
    }

    /// Trimmed selector, `None` when absent or blank.
    pub fn selector(&self) -> Option<&str> {
        self.selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The body is only sent for POST calls in xhr mode.
    pub fn effective_body(&self) -> Option<&Value> {
        match (self.mode, self.method) {
            (Mode::Xhr, HttpMethod::Post) => self.body.as_ref(),
            _ => None,
        }
    }

    /// Document and render modes always issue plain GETs.
    pub fn effective_method(&self) -> HttpMethod {
        match self.mode {
            Mode::Xhr => self.method,
            Mode::Document | Mode::Render => HttpMethod::Get,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(ConfigError::MissingAddress { mode: self.mode });
        }
        if !has_http_scheme(address) {
            return Err(ConfigError::UnsupportedScheme(address.to_string()));
        }
        if self.mode == Mode::Render && self.selector().is_none() {
            return Err(ConfigError::MissingSelector);
        }

        if let Some(pagination) = &self.pagination {
            pagination.validate()?;
            if matches!(pagination, PaginationConfig::Cursor { .. }) && self.mode != Mode::Xhr {
                return Err(ConfigError::CursorRequiresApiMode { mode: self.mode });
            }
        }

        check_range("delay_ms", self.delay_ms, MAX_DELAY_MS)?;
        check_range(
            "max_retries",
            u64::from(self.effective_max_retries()),
            u64::from(MAX_RETRIES),
        )?;
        if self.mode == Mode::Render {
            check_range("wait_seconds", self.render.wait_seconds, MAX_WAIT_SECONDS)?;
            check_range(
                "scroll_count",
                u64::from(self.render.scroll_count),
                u64::from(MAX_SCROLL_COUNT),
            )?;
            check_range(
                "scroll_delay_ms",
                self.render.scroll_delay_ms,
                MAX_SCROLL_DELAY_MS,
            )?;
        }

        let mut seen = HashSet::new();
        for name in self.headers.keys() {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateHeader(name.clone()));
            }
        }

        self.batch.validate()
    }
}

/// Text form of a parameter value as it goes on the wire.
pub fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn has_http_scheme(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}
