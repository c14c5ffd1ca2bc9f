//! Deployment settings: defaults, then an optional RON file, then `.env`
//! and `SCRAPE_*` environment variables.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use engine_logging::{engine_info, engine_warn};
use log::LevelFilter;
use scrape_engine::{EngineSettings, OversizePolicy};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value '{value}' for {name}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub fn load_settings(path: Option<&Path>) -> Result<EngineSettings, SettingsError> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None => EngineSettings::default(),
    };

    // A missing .env is normal outside development.
    if let Ok(dotenv_path) = dotenvy::dotenv() {
        engine_info!("Loaded environment from {:?}", dotenv_path);
    }
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok())?;
    Ok(settings)
}

pub fn read_settings_file(path: &Path) -> Result<EngineSettings, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&content).map_err(|err| SettingsError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Applies `SCRAPE_*` overrides read through `lookup`. Unset variables leave
/// the current value alone.
pub fn apply_env_overrides<F>(settings: &mut EngineSettings, lookup: F) -> Result<(), SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("SCRAPE_BLOCK_PRIVATE_NETWORKS") {
        settings.block_private_networks = parse_bool("SCRAPE_BLOCK_PRIVATE_NETWORKS", &v)?;
        if !settings.block_private_networks {
            engine_warn!("Private network blocking is disabled");
        }
    }
    if let Some(v) = lookup("SCRAPE_TRUSTED_HOSTS") {
        settings.trusted_hosts = v
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = lookup("SCRAPE_MAX_RESPONSE_BYTES") {
        settings.max_response_bytes = parse_number("SCRAPE_MAX_RESPONSE_BYTES", &v)?;
    }
    if let Some(v) = lookup("SCRAPE_CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = parse_number("SCRAPE_CONNECT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("SCRAPE_READ_TIMEOUT_MS") {
        settings.read_timeout_ms = parse_number("SCRAPE_READ_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("SCRAPE_RETRY_BACKOFF_MS") {
        settings.retry_backoff_ms = parse_number("SCRAPE_RETRY_BACKOFF_MS", &v)?;
    }
    if let Some(v) = lookup("SCRAPE_RETRY_CLIENT_ERRORS") {
        settings.retry_client_errors = parse_bool("SCRAPE_RETRY_CLIENT_ERRORS", &v)?;
    }
    if let Some(v) = lookup("SCRAPE_OVERSIZE_POLICY") {
        settings.oversize_policy = match v.trim().to_ascii_lowercase().as_str() {
            "reject" => OversizePolicy::Reject,
            "truncate" => OversizePolicy::Truncate,
            _ => return Err(invalid("SCRAPE_OVERSIZE_POLICY", &v, "reject or truncate")),
        };
    }
    if let Some(v) = lookup("SCRAPE_EXPORTS_DIR") {
        settings.exports_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("SCRAPE_LOG_LEVEL") {
        log_level_from("SCRAPE_LOG_LEVEL", &v)?;
        settings.log_level = v.trim().to_string();
    }
    Ok(())
}

pub fn log_level(settings: &EngineSettings) -> Result<LevelFilter, SettingsError> {
    log_level_from("log_level", &settings.log_level)
}

fn log_level_from(name: &'static str, value: &str) -> Result<LevelFilter, SettingsError> {
    LevelFilter::from_str(value.trim())
        .map_err(|_| invalid(name, value, "off, error, warn, info, debug or trace"))
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "a boolean")),
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, value, "a non-negative integer"))
}

fn invalid(name: &'static str, value: &str, expected: &'static str) -> SettingsError {
    SettingsError::Invalid {
        name,
        value: value.to_string(),
        expected,
    }
}
