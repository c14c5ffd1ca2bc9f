use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use engine_logging::{engine_debug, engine_warn};
use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, LOCATION,
};
use scrape_core::{param_text, HttpMethod, Params, TraceEntry, TraceSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::guard::{parse_target, AddressGuard, VettedTarget};
use crate::{FailureKind, FetchError, FetchOutcome, FetchRequest};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// What to do with a body larger than `max_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Abort the read and fail with `SizeExceeded`.
    #[default]
    Reject,
    /// Return the first `max_bytes` with `truncated` set.
    Truncate,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Upper bound for one request hop, connect through last body byte.
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub oversize: OversizePolicy,
    /// Base of the exponential backoff between attempts.
    pub retry_backoff: Duration,
    /// Retry 4xx responses like 5xx ones.
    pub retry_client_errors: bool,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: 2_000_000,
            oversize: OversizePolicy::Reject,
            retry_backoff: Duration::from_millis(500),
            retry_client_errors: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchSettings {
    /// Delay before attempt number `attempt` (1-based, so the first retry is 1).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.retry_backoff.saturating_mul(factor)
    }

    fn should_retry_status(&self, status: u16) -> bool {
        status >= 500 || (self.retry_client_errors && (400..500).contains(&status))
    }
}

/// Performs one logical HTTP exchange, retries included.
///
/// Implementations record every retried attempt into `trace`; the final
/// outcome is left to the caller, which sees it as the return value.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        trace: &mut dyn TraceSink,
    ) -> Result<FetchOutcome, FetchError>;
}

/// reqwest-backed fetcher with SSRF containment, byte cap and retries.
///
/// Redirects are followed here rather than by reqwest so that every hop is
/// vetted and pinned before a connection is made.
#[derive(Debug, Clone)]
pub struct GuardedFetcher {
    settings: FetchSettings,
    guard: AddressGuard,
}

enum Attempt {
    Complete(FetchOutcome),
    Status(u16),
}

impl GuardedFetcher {
    pub fn new(settings: FetchSettings, guard: AddressGuard) -> Self {
        Self { settings, guard }
    }

    fn build_client(&self, target: &VettedTarget) -> Result<reqwest::Client, FetchError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .read_timeout(self.settings.read_timeout)
            .timeout(self.settings.request_timeout)
            .user_agent(self.settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none());

        // Pin the vetted addresses so the connection cannot re-resolve elsewhere.
        if let Some(domain) = &target.domain {
            if !target.addrs.is_empty() {
                let port = target.url.port_or_known_default().unwrap_or(80);
                let addrs: Vec<SocketAddr> = target
                    .addrs
                    .iter()
                    .map(|ip| SocketAddr::new(*ip, port))
                    .collect();
                builder = builder.resolve_to_addrs(domain, &addrs);
            }
        }

        builder
            .build()
            .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))
    }

    /// One attempt, redirect hops included.
    async fn attempt(
        &self,
        start: &Url,
        request: &FetchRequest,
        headers: &HeaderMap,
    ) -> Result<Attempt, FetchError> {
        let started = Instant::now();
        let mut url = start.clone();
        let mut method = request.method;
        let mut body = request.body.as_ref();
        let mut headers = headers.clone();
        let mut redirects = 0usize;

        loop {
            let target = self.guard.vet_url(url).await?;
            let client = self.build_client(&target)?;
            let response = send(&client, &target.url, method, body, &headers).await?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(next) = redirect_location(&target.url, response.headers())? {
                    redirects += 1;
                    if redirects > self.settings.redirect_limit {
                        return Err(FetchError::new(
                            FailureKind::RedirectLimitExceeded,
                            format!(
                                "more than {} redirects starting at {start}",
                                self.settings.redirect_limit
                            ),
                        ));
                    }
                    // 307 and 308 replay the request; the others become a plain GET.
                    if !matches!(status.as_u16(), 307 | 308) {
                        method = HttpMethod::Get;
                        body = None;
                        headers.remove(CONTENT_TYPE);
                    }
                    if next.origin() != target.url.origin() {
                        headers.remove(COOKIE);
                        headers.remove(AUTHORIZATION);
                    }
                    engine_debug!("Redirect {} -> {} ({})", target.url, next, status.as_u16());
                    url = next;
                    continue;
                }
            }

            if !status.is_success() {
                return Ok(Attempt::Status(status.as_u16()));
            }

            if let Some(content_len) = response.content_length() {
                if content_len > self.settings.max_bytes
                    && self.settings.oversize == OversizePolicy::Reject
                {
                    return Err(too_large(self.settings.max_bytes, Some(content_len)));
                }
            }

            let response_headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let (bytes, truncated) = self.read_capped(response).await?;

            return Ok(Attempt::Complete(FetchOutcome {
                status: status.as_u16(),
                bytes,
                headers: response_headers,
                url: start.to_string(),
                final_url: target.url.to_string(),
                redirect_count: redirects,
                elapsed: started.elapsed(),
                truncated,
                attempts: 0,
            }));
        }
    }

    async fn read_capped(&self, response: reqwest::Response) -> Result<(Vec<u8>, bool), FetchError> {
        let max = self.settings.max_bytes;
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > max {
                match self.settings.oversize {
                    OversizePolicy::Reject => return Err(too_large(max, Some(next_len))),
                    OversizePolicy::Truncate => {
                        let room = usize::try_from(max).unwrap_or(usize::MAX) - bytes.len();
                        bytes.extend_from_slice(&chunk[..room]);
                        return Ok((bytes, true));
                    }
                }
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok((bytes, false))
    }
}

#[async_trait::async_trait]
impl Fetcher for GuardedFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        trace: &mut dyn TraceSink,
    ) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();
        let url = compose_url(&request.address, &request.params)?;
        let headers = build_headers(request)?;

        let mut attempt_no: u32 = 0;
        loop {
            attempt_no += 1;
            let attempt_started = Instant::now();
            let result = self.attempt(&url, request, &headers).await;

            let failure = match result {
                Ok(Attempt::Complete(mut outcome)) => {
                    outcome.attempts = attempt_no;
                    outcome.elapsed = started.elapsed();
                    engine_debug!(
                        "Fetched {} status={} bytes={} attempts={}",
                        outcome.url,
                        outcome.status,
                        outcome.bytes.len(),
                        attempt_no
                    );
                    return Ok(outcome);
                }
                Ok(Attempt::Status(status)) => {
                    let err = FetchError::new(
                        FailureKind::HttpStatus(status),
                        format!("{url} returned status {status}"),
                    );
                    if !self.settings.should_retry_status(status) {
                        return Err(err);
                    }
                    err
                }
                Err(err) if err.kind.is_transient() => err,
                Err(err) => return Err(err),
            };

            if attempt_no > request.max_retries {
                return Err(failure);
            }

            let backoff = self.settings.backoff_for(attempt_no);
            engine_warn!(
                "Attempt {} for {} failed ({}); retrying in {:?}",
                attempt_no,
                url,
                failure,
                backoff
            );
            trace.record(
                TraceEntry::failed("fetch_retry")
                    .elapsed(attempt_started.elapsed())
                    .detail("attempt", attempt_no)
                    .detail("url", url.as_str())
                    .detail("error", failure.kind.label())
                    .detail("message", failure.message.clone())
                    .detail(
                        "backoff_ms",
                        u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    ),
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

async fn send(
    client: &reqwest::Client,
    url: &Url,
    method: HttpMethod,
    body: Option<&Value>,
    headers: &HeaderMap,
) -> Result<reqwest::Response, FetchError> {
    let mut builder = match method {
        HttpMethod::Get => client.get(url.clone()),
        HttpMethod::Post => client.post(url.clone()),
    };
    if let (HttpMethod::Post, Some(body)) = (method, body) {
        let bytes = serde_json::to_vec(body)
            .map_err(|err| FetchError::new(FailureKind::InvalidRequest, err.to_string()))?;
        builder = builder.body(bytes);
    }
    builder
        .headers(headers.clone())
        .send()
        .await
        .map_err(map_reqwest_error)
}

/// Next hop of a redirect response, resolved against the current URL.
/// `None` when the response carries no `Location`.
fn redirect_location(current: &Url, headers: &HeaderMap) -> Result<Option<Url>, FetchError> {
    let Some(location) = headers.get(LOCATION) else {
        return Ok(None);
    };
    let location = location.to_str().map_err(|err| {
        FetchError::new(FailureKind::InvalidUrl, format!("redirect location: {err}"))
    })?;
    let next = current.join(location).map_err(|err| {
        FetchError::new(FailureKind::InvalidUrl, format!("redirect to '{location}': {err}"))
    })?;
    parse_target(next.as_str()).map(Some)
}

/// Appends `params` to the raw address through the URL serializer.
/// Existing query keys named in `params` are replaced.
pub fn compose_url(address: &str, params: &Params) -> Result<Url, FetchError> {
    let mut url = parse_target(address)?;
    if params.is_empty() {
        return Ok(url);
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !params.contains_key(k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        for (k, v) in params {
            query.append_pair(k, &param_text(v));
        }
    }
    Ok(url)
}

fn build_headers(request: &FetchRequest) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| FetchError::new(FailureKind::InvalidRequest, format!("{name}: {err}")))?;
        let value = HeaderValue::from_str(value).map_err(|err| {
            FetchError::new(FailureKind::InvalidRequest, format!("{name}: {err}"))
        })?;
        headers.insert(name, value);
    }

    if !request.cookies.is_empty() {
        let mut cookie = request
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        if let Some(existing) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
            cookie = format!("{existing}; {cookie}");
        }
        let value = HeaderValue::from_str(&cookie)
            .map_err(|err| FetchError::new(FailureKind::InvalidRequest, format!("cookie: {err}")))?;
        headers.insert(COOKIE, value);
    }

    if request.method == HttpMethod::Post
        && request.body.is_some()
        && !headers.contains_key(CONTENT_TYPE)
    {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    Ok(headers)
}

fn too_large(max_bytes: u64, actual: Option<u64>) -> FetchError {
    FetchError::new(
        FailureKind::SizeExceeded { max_bytes, actual },
        format!("response larger than {max_bytes} bytes"),
    )
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compose_url_replaces_existing_keys_and_keeps_others() {
        let mut params = Params::new();
        params.insert("page".into(), json!(3));
        params.insert("q".into(), json!("a b"));
        let url = compose_url("https://example.com/list?page=1&sort=asc", &params).unwrap();
        assert_eq!(url.as_str(), "https://example.com/list?sort=asc&page=3&q=a+b");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let settings = FetchSettings {
            retry_backoff: Duration::from_millis(100),
            ..FetchSettings::default()
        };
        assert_eq!(settings.backoff_for(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_for(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn client_errors_are_terminal_unless_configured() {
        let default = FetchSettings::default();
        assert!(default.should_retry_status(503));
        assert!(!default.should_retry_status(404));
        let lenient = FetchSettings {
            retry_client_errors: true,
            ..FetchSettings::default()
        };
        assert!(lenient.should_retry_status(429));
    }

    #[test]
    fn cookies_and_json_content_type_are_added() {
        let mut request = FetchRequest::get("https://example.com");
        request.method = HttpMethod::Post;
        request.body = Some(json!({"a": 1}));
        request.cookies.insert("session".into(), "abc".into());
        request.cookies.insert("theme".into(), "dark".into());

        let headers = build_headers(&request).unwrap();
        assert_eq!(headers[COOKIE], "session=abc; theme=dark");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }
}
