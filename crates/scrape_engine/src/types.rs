use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use scrape_core::{HttpMethod, Params};
use serde_json::Value;

/// One HTTP exchange, with every template already substituted but nothing
/// encoded yet.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub address: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub params: Params,
    pub body: Option<Value>,
    pub cookies: BTreeMap<String, String>,
    pub max_retries: u32,
}

impl FetchRequest {
    pub fn get(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            params: Params::new(),
            body: None,
            cookies: BTreeMap::new(),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: u16,
    pub bytes: Vec<u8>,
    /// Response headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    /// Address actually requested, query included.
    pub url: String,
    pub final_url: String,
    pub redirect_count: usize,
    pub elapsed: Duration,
    /// Set when the body was cut at the byte cap.
    pub truncated: bool,
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    InvalidRequest,
    BlockedAddress { host: String, address: String },
    Dns,
    Timeout,
    Network,
    RedirectLimitExceeded,
    HttpStatus(u16),
    SizeExceeded { max_bytes: u64, actual: Option<u64> },
    Parse,
}

impl FailureKind {
    /// Short machine-readable label used in trace details.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::InvalidUrl => "invalid_url",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::BlockedAddress { .. } => "blocked_address",
            FailureKind::Dns => "dns",
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::RedirectLimitExceeded => "redirect_limit",
            FailureKind::HttpStatus(_) => "http_status",
            FailureKind::SizeExceeded { .. } => "size_exceeded",
            FailureKind::Parse => "parse",
        }
    }

    /// Transport-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Dns | FailureKind::Timeout | FailureKind::Network
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::InvalidRequest => write!(f, "invalid request"),
            FailureKind::BlockedAddress { host, address } => {
                write!(f, "blocked address {address} for host {host}")
            }
            FailureKind::Dns => write!(f, "dns resolution failed"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::RedirectLimitExceeded => write!(f, "redirect limit exceeded"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::SizeExceeded { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::Parse => write!(f, "parse error"),
        }
    }
}
