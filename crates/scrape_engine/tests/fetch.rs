use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scrape_core::{DecisionTrace, HttpMethod};
use scrape_engine::{
    AddressGuard, FailureKind, FetchRequest, FetchSettings, Fetcher, GuardedFetcher,
    HostResolver, OversizePolicy, StaticResolver,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_settings() -> FetchSettings {
    FetchSettings {
        retry_backoff: Duration::from_millis(1),
        ..FetchSettings::default()
    }
}

fn open_fetcher(settings: FetchSettings) -> GuardedFetcher {
    GuardedFetcher::new(settings, AddressGuard::disabled())
}

fn resolver_guard(host: &str, ip: &str) -> AddressGuard {
    let addr: IpAddr = ip.parse().unwrap();
    AddressGuard::new(
        true,
        Arc::new(StaticResolver::new().with_host(host, vec![addr])),
    )
}

#[tokio::test]
async fn returns_body_and_metadata() {
    engine_logging::initialize_for_tests();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<html>ok</html>", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let url = format!("{}/doc", server.uri());

    let outcome = fetcher
        .fetch(&FetchRequest::get(&url), &mut trace)
        .await
        .expect("fetch ok");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.url, url);
    assert_eq!(outcome.final_url, url);
    assert_eq!(outcome.redirect_count, 0);
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.truncated);
    assert!(outcome.content_type().unwrap().starts_with("text/html"));
    assert_eq!(outcome.bytes, b"<html>ok</html>");
    assert!(trace.is_empty());
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/missing", server.uri()));
    request.max_retries = 3;

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(404));
    assert!(trace.is_empty());
}

#[tokio::test]
async fn client_errors_retry_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = open_fetcher(FetchSettings {
        retry_client_errors: true,
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/limited", server.uri()));
    request.max_retries = 1;

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(429));
    assert_eq!(trace.failures(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/flaky", server.uri()));
    request.max_retries = 2;

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("third attempt");
    assert_eq!(outcome.attempts, 3);
    assert_eq!(trace.len(), 2);
    for (i, entry) in trace.entries().iter().enumerate() {
        assert_eq!(entry.step, "fetch_retry");
        assert!(!entry.ok);
        assert_eq!(entry.detail_value("attempt"), Some(&json!(i + 1)));
        assert_eq!(entry.detail_value("error"), Some(&json!("http_status")));
    }
}

#[tokio::test]
async fn exhausted_retries_return_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/down", server.uri()));
    request.max_retries = 1;

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::HttpStatus(500));
    assert_eq!(trace.failures(), 1);
}

#[tokio::test]
async fn times_out_on_slow_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(250))
                .set_body_string("slow"),
        )
        .mount(&server)
        .await;

    let fetcher = open_fetcher(FetchSettings {
        request_timeout: Duration::from_millis(50),
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/slow", server.uri()));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Timeout);
}

#[tokio::test]
async fn rejects_response_over_the_byte_cap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/large"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .insert_header("Content-Length", "11")
                .set_body_string("01234567890"),
        )
        .mount(&server)
        .await;

    let fetcher = open_fetcher(FetchSettings {
        max_bytes: 10,
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/large", server.uri()));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::SizeExceeded {
            max_bytes: 10,
            actual: Some(11)
        }
    );
}

#[tokio::test]
async fn truncate_policy_returns_capped_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/large"))
        .respond_with(ResponseTemplate::new(200).set_body_string("0123456789"))
        .mount(&server)
        .await;

    let fetcher = open_fetcher(FetchSettings {
        max_bytes: 4,
        oversize: OversizePolicy::Truncate,
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/large", server.uri()));

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("truncated ok");
    assert!(outcome.truncated);
    assert_eq!(outcome.bytes, b"0123");
}

#[tokio::test]
async fn shapes_post_with_params_cookies_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(query_param("page", "2"))
        .and(query_param("lang", "en"))
        .and(header("cookie", "session=abc; theme=dark"))
        .and(header("content-type", "application/json"))
        .and(header("user-agent", "scrape-test/1.0"))
        .and(body_json(json!({"query": "{ items }", "variables": {"id": "42"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = open_fetcher(FetchSettings {
        user_agent: "scrape-test/1.0".into(),
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/graphql?page=1&lang=en", server.uri()));
    request.method = HttpMethod::Post;
    request.params.insert("page".into(), json!(2));
    request.body = Some(json!({"query": "{ items }", "variables": {"id": "42"}}));
    request.cookies.insert("session".into(), "abc".into());
    request.cookies.insert("theme".into(), "dark".into());

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("post ok");
    assert!(outcome.url.ends_with("/graphql?lang=en&page=2"));
}

#[tokio::test]
async fn stops_following_redirects_at_the_limit() {
    let server = MockServer::start().await;
    for (from, to) in [("/a", "/b"), ("/b", "/c"), ("/c", "/d")] {
        Mock::given(method("GET"))
            .and(path(from))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", to))
            .mount(&server)
            .await;
    }

    let fetcher = open_fetcher(FetchSettings {
        redirect_limit: 2,
        ..quick_settings()
    });
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/a", server.uri()));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::RedirectLimitExceeded);
}

#[tokio::test]
async fn follows_redirects_within_the_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/old", server.uri()));

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("redirected");
    assert_eq!(outcome.redirect_count, 1);
    assert!(outcome.final_url.ends_with("/new"));
    assert_eq!(outcome.bytes, b"moved");
}

#[tokio::test]
async fn guard_blocks_hosts_resolving_to_internal_addresses() {
    for ip in ["127.0.0.1", "10.0.0.5"] {
        let fetcher = GuardedFetcher::new(quick_settings(), resolver_guard("intranet.test", ip));
        let mut trace = DecisionTrace::new();
        let request = FetchRequest::get("http://intranet.test/admin");

        let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
        assert_eq!(
            err.kind,
            FailureKind::BlockedAddress {
                host: "intranet.test".into(),
                address: ip.into()
            }
        );
    }
}

#[tokio::test]
async fn guard_blocks_loopback_literal_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let fetcher = GuardedFetcher::new(quick_settings(), AddressGuard::system(true));
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/secret", server.uri()));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert!(matches!(err.kind, FailureKind::BlockedAddress { .. }));
}

#[tokio::test]
async fn disabled_guard_lets_loopback_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/local"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = GuardedFetcher::new(quick_settings(), AddressGuard::system(false));
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("{}/local", server.uri()));

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("allowed");
    assert_eq!(outcome.bytes, b"hi");
}

#[tokio::test]
async fn guard_vets_public_hosts_and_reports_dns_failures() {
    let guard = resolver_guard("shop.test", "93.184.216.34");

    let vetted = guard.vet("https://shop.test/items").await.expect("public");
    assert_eq!(vetted.domain.as_deref(), Some("shop.test"));
    assert_eq!(vetted.addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);

    let err = guard.vet("https://nowhere.test/").await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Dns);

    let err = guard.vet("http://localhost:8080/").await.unwrap_err();
    assert!(matches!(err.kind, FailureKind::BlockedAddress { .. }));
}

/// Guard that lets `host` reach the local mock server.
fn trusted_local_guard(host: &str) -> AddressGuard {
    resolver_guard(host, "127.0.0.1").with_trusted_hosts([host])
}

#[tokio::test]
async fn redirects_into_internal_addresses_are_blocked() {
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/to-literal"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("http://127.0.0.1:{port}/secret")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("INTERNAL-SECRET"))
        .expect(0)
        .mount(&server)
        .await;

    let fetcher = GuardedFetcher::new(quick_settings(), trusted_local_guard("public.test"));
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("http://public.test:{port}/to-literal"));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::BlockedAddress {
            host: "127.0.0.1".into(),
            address: "127.0.0.1".into()
        }
    );
}

#[tokio::test]
async fn redirects_to_hosts_resolving_internally_are_blocked() {
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/to-domain"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("Location", "http://intranet.test/admin"),
        )
        .mount(&server)
        .await;

    let resolver = StaticResolver::new()
        .with_host("public.test", vec!["127.0.0.1".parse().unwrap()])
        .with_host("intranet.test", vec!["10.0.0.5".parse().unwrap()]);
    let guard = AddressGuard::new(true, Arc::new(resolver)).with_trusted_hosts(["public.test"]);
    let fetcher = GuardedFetcher::new(quick_settings(), guard);
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("http://public.test:{port}/to-domain"));

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::BlockedAddress {
            host: "intranet.test".into(),
            address: "10.0.0.5".into()
        }
    );
}

#[tokio::test]
async fn vetted_redirects_are_followed_with_the_guard_on() {
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/next"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next"))
        .respond_with(ResponseTemplate::new(200).set_body_string("arrived"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = GuardedFetcher::new(quick_settings(), trusted_local_guard("public.test"));
    let mut trace = DecisionTrace::new();
    let request = FetchRequest::get(format!("http://public.test:{port}/start"));

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("followed");
    assert_eq!(outcome.redirect_count, 1);
    assert_eq!(outcome.final_url, format!("http://public.test:{port}/next"));
    assert_eq!(outcome.url, format!("http://public.test:{port}/start"));
    assert_eq!(outcome.bytes, b"arrived");
}

#[tokio::test]
async fn see_other_turns_post_into_get() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(303).insert_header("Location", "/result"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = open_fetcher(quick_settings());
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("{}/submit", server.uri()));
    request.method = HttpMethod::Post;
    request.body = Some(json!({"q": 1}));

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("redirected");
    assert_eq!(outcome.bytes, b"done");
}

/// Fails the first `failures` lookups, then resolves to loopback.
struct FlakyResolver {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl HostResolver for FlakyResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(io::Error::other("temporary failure in name resolution"));
        }
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

#[tokio::test]
async fn dns_failures_are_retried() {
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = Arc::new(FlakyResolver {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let guard = AddressGuard::new(true, resolver.clone()).with_trusted_hosts(["flaky.test"]);
    let fetcher = GuardedFetcher::new(quick_settings(), guard);
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get(format!("http://flaky.test:{port}/data"));
    request.max_retries = 2;

    let outcome = fetcher.fetch(&request, &mut trace).await.expect("second attempt");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(trace.len(), 1);
    assert_eq!(trace.entries()[0].step, "fetch_retry");
    assert_eq!(trace.entries()[0].detail_value("error"), Some(&json!("dns")));
}

#[tokio::test]
async fn dns_failures_exhaust_retries() {
    let resolver = Arc::new(FlakyResolver {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let fetcher = GuardedFetcher::new(quick_settings(), AddressGuard::new(true, resolver.clone()));
    let mut trace = DecisionTrace::new();
    let mut request = FetchRequest::get("http://nowhere.test/");
    request.max_retries = 1;

    let err = fetcher.fetch(&request, &mut trace).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Dns);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(trace.failures(), 1);
}
