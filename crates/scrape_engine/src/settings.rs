use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fetch::{FetchSettings, OversizePolicy, DEFAULT_USER_AGENT};
use crate::guard::AddressGuard;

/// Deployment-level knobs shared by every run of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub block_private_networks: bool,
    /// Domains allowed to resolve to internal addresses.
    pub trusted_hosts: Vec<String>,
    pub max_response_bytes: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub redirect_limit: usize,
    pub retry_backoff_ms: u64,
    pub retry_client_errors: bool,
    pub oversize_policy: OversizePolicy,
    pub exports_dir: PathBuf,
    pub user_agent: String,
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            block_private_networks: true,
            trusted_hosts: Vec::new(),
            max_response_bytes: 2_000_000,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 20_000,
            redirect_limit: 5,
            retry_backoff_ms: 500,
            retry_client_errors: false,
            oversize_policy: OversizePolicy::Reject,
            exports_dir: PathBuf::from("exports"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn fetch_settings(&self) -> FetchSettings {
        let connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        let read_timeout = Duration::from_millis(self.read_timeout_ms);
        FetchSettings {
            connect_timeout,
            read_timeout,
            request_timeout: connect_timeout + read_timeout,
            redirect_limit: self.redirect_limit,
            max_bytes: self.max_response_bytes,
            oversize: self.oversize_policy,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            retry_client_errors: self.retry_client_errors,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn address_guard(&self) -> AddressGuard {
        AddressGuard::system(self.block_private_networks)
            .with_trusted_hosts(&self.trusted_hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;

    #[test]
    fn fetch_settings_derive_from_millis() {
        let settings = EngineSettings {
            connect_timeout_ms: 1_000,
            read_timeout_ms: 2_500,
            ..EngineSettings::default()
        };
        let fetch = settings.fetch_settings();
        assert_eq!(fetch.connect_timeout, Duration::from_secs(1));
        assert_eq!(fetch.request_timeout, Duration::from_millis(3_500));
        assert_eq!(fetch.max_bytes, 2_000_000);
    }

    #[tokio::test]
    async fn trusted_hosts_reach_the_guard() {
        let trusting = EngineSettings {
            trusted_hosts: vec!["LocalHost".into()],
            ..EngineSettings::default()
        };
        let guard = trusting.address_guard();
        assert!(guard.vet("http://localhost:9/").await.is_ok());
        let err = guard.vet("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err.kind, FailureKind::BlockedAddress { .. }));

        let strict = EngineSettings::default().address_guard();
        assert!(strict.vet("http://localhost:9/").await.is_err());
    }
}
