//! The tinyproxy check cycle.
//!
//! One invocation fetches the stats page, classifies the outcome and reports
//! either an OK service check plus six metrics, or a CRITICAL service check
//! plus one error event. Nothing is carried over between invocations.

mod http;
mod stats;

pub use http::*;
pub use stats::*;

use chrono::Utc;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::CheckConfig;
use crate::report::{Event, MetricSink, ServiceCheckStatus, CHECK_NAME};

/// Failure categories of one invocation, in the order they are checked.
///
/// `Display` renders the event text; [`ProbeError::title`] the event title.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{url} timed out after {} seconds.", format_seconds(.timeout))]
    Timeout { url: String, timeout: f64 },
    #[error("Unable to connect to {url}.")]
    Connect { url: String, reason: String },
    #[error("{url} returned a status of {status}")]
    BadStatus { url: String, status: u16 },
    #[error("{url} response was not well-formed JSON: {body}")]
    MalformedJson { url: String, body: String },
    #[error("{url} response field \"{field}\" is missing or not an integer")]
    InvalidMetric { url: String, field: &'static str },
}

impl ProbeError {
    /// Event title, also sent as the service check message.
    pub fn title(&self) -> &'static str {
        match self {
            // Transport failures share the timeout title.
            ProbeError::Timeout { .. } | ProbeError::Connect { .. } => "HTTP timeout",
            ProbeError::BadStatus { .. } => "Invalid HTTP response code",
            ProbeError::MalformedJson { .. } => "JSON parse error",
            ProbeError::InvalidMetric { .. } => "Invalid metric value",
        }
    }
}

/// Seconds as `1.0`, `0.2`, `1e-05` or `1e+16`.
fn format_seconds(secs: &f64) -> String {
    let repr = format!("{:?}", secs);
    match repr.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => repr,
    }
}

/// What a single invocation reported, for logging by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Ok,
    Critical(&'static str),
}

/// Stable key grouping error events from identically configured instances.
pub fn aggregation_key(config: &CheckConfig) -> String {
    let inputs = format!("{}/{}/{}", config.host, config.port, config.stat_host);
    format!("{:x}", Sha256::digest(inputs.as_bytes()))
}

/// State that lives for exactly one invocation.
#[derive(Debug)]
pub struct CheckContext<'a> {
    config: &'a CheckConfig,
    url: String,
    version: Option<String>,
    aggregation_key: Option<String>,
}

impl<'a> CheckContext<'a> {
    pub fn new(config: &'a CheckConfig) -> Self {
        Self {
            config,
            url: config.target_url(),
            version: None,
            aggregation_key: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn observe_version(&mut self, version: String) {
        self.version = Some(version);
    }

    /// `url:` always, `version:` once a version has been observed.
    pub fn tags(&self) -> Vec<String> {
        let mut tags = vec![format!("url:{}", self.url)];
        if let Some(version) = &self.version {
            tags.push(format!("version:{}", version));
        }
        tags
    }

    /// Computed on first use, then reused for the rest of the invocation.
    pub fn aggregation_key(&mut self) -> &str {
        let config = self.config;
        self.aggregation_key
            .get_or_insert_with(|| aggregation_key(config))
    }

    fn report_ok(&self, sink: &dyn MetricSink) {
        sink.service_check(CHECK_NAME, ServiceCheckStatus::Ok, &self.tags(), None);
    }

    fn report_error(&mut self, err: &ProbeError, sink: &dyn MetricSink) {
        let tags = self.tags();
        sink.service_check(
            CHECK_NAME,
            ServiceCheckStatus::Critical,
            &tags,
            Some(err.title()),
        );

        let aggregation_key = self.aggregation_key().to_string();
        sink.event(Event {
            timestamp: Utc::now().timestamp(),
            event_type: CHECK_NAME.to_string(),
            msg_title: err.title().to_string(),
            tags,
            msg_text: err.to_string(),
            aggregation_key,
        });
    }
}

/// Runs check invocations against tinyproxy stats pages.
#[derive(Debug, Clone)]
pub struct TinyproxyCheck {
    client: Client,
}

impl TinyproxyCheck {
    pub fn new() -> Result<Self, reqwest::Error> {
        // The stats page is served by the proxy itself; never route through another one
        Ok(Self::with_client(Client::builder().no_proxy().build()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Execute one invocation and report it through `sink`.
    ///
    /// Every failure is reported, never returned.
    pub async fn run(&self, config: &CheckConfig, sink: &dyn MetricSink) -> CheckOutcome {
        let mut ctx = CheckContext::new(config);

        match self.collect(&mut ctx).await {
            Ok((payload, response_time)) => {
                ctx.report_ok(sink);
                emit_metrics(&ctx, &payload, response_time, sink);
                CheckOutcome::Ok
            }
            Err(err) => {
                tracing::warn!("{}: {}", err.title(), err);
                ctx.report_error(&err, sink);
                CheckOutcome::Critical(err.title())
            }
        }
    }

    /// Fetch and decode the stats page. Returns the payload and response time in seconds.
    async fn collect(&self, ctx: &mut CheckContext<'_>) -> Result<(StatsPayload, f64), ProbeError> {
        let config = ctx.config;
        let response = fetch_stats(&self.client, ctx.url(), &config.stat_host, config.timeout).await?;

        if !response.status.is_success() {
            return Err(ProbeError::BadStatus {
                url: ctx.url().to_string(),
                status: response.status.as_u16(),
            });
        }

        let document = StatsDocument::parse(&response.body).map_err(|_| ProbeError::MalformedJson {
            url: ctx.url().to_string(),
            body: response.body.clone(),
        })?;

        if let Some(version) = document.version() {
            ctx.observe_version(version);
        }

        let payload = document
            .into_payload()
            .map_err(|field| ProbeError::InvalidMetric {
                url: ctx.url().to_string(),
                field,
            })?;

        Ok((payload, response.elapsed.as_secs_f64()))
    }
}

fn emit_metrics(ctx: &CheckContext<'_>, payload: &StatsPayload, response_time: f64, sink: &dyn MetricSink) {
    let tags = ctx.tags();
    sink.gauge("tinyproxy.response_time", response_time, &tags);
    sink.gauge("tinyproxy.opens", payload.opens as f64, &tags);
    sink.monotonic_count("tinyproxy.reqs", payload.reqs as f64, &tags);
    sink.monotonic_count("tinyproxy.badconns", payload.badconns as f64, &tags);
    sink.monotonic_count("tinyproxy.deniedconns", payload.deniedconns as f64, &tags);
    sink.monotonic_count("tinyproxy.refusedconns", payload.refusedconns as f64, &tags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Emission, MemorySink};
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::time::Duration;

    const FULL_STATS: &str =
        r#"{"version":"1.8.3","opens":5,"reqs":100,"badconns":2,"deniedconns":0,"refusedconns":1}"#;

    async fn spawn_stats_server(status: StatusCode, body: &'static str) -> SocketAddr {
        let app = Router::new().route("/", get(move || async move { (status, body) }));
        serve(app).await
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn local_config(port: u16) -> CheckConfig {
        CheckConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn run_check(config: &CheckConfig) -> (CheckOutcome, MemorySink) {
        let sink = MemorySink::new();
        let outcome = TinyproxyCheck::new().unwrap().run(config, &sink).await;
        (outcome, sink)
    }

    /// Exactly one CRITICAL service check and one event, no metrics.
    fn single_error(sink: &MemorySink) -> Event {
        let checks = sink.service_checks();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].0, ServiceCheckStatus::Critical);
        assert!(sink.metrics().is_empty());

        let mut events = sink.events();
        assert_eq!(events.len(), 1);
        let event = events.remove(0);
        assert_eq!(checks[0].1, event.tags);
        assert_eq!(checks[0].2.as_deref(), Some(event.msg_title.as_str()));
        assert_eq!(event.event_type, "tinyproxy");
        event
    }

    #[test]
    fn test_tags_and_url() {
        let config = CheckConfig::default();
        let mut ctx = CheckContext::new(&config);
        assert_eq!(ctx.url(), "http://localhost:8888");
        assert_eq!(ctx.tags(), vec!["url:http://localhost:8888"]);

        ctx.observe_version("1.8.3".to_string());
        assert_eq!(
            ctx.tags(),
            vec!["url:http://localhost:8888", "version:1.8.3"]
        );
    }

    #[test]
    fn test_aggregation_key_is_stable() {
        let config = CheckConfig::default();
        assert_eq!(
            aggregation_key(&config),
            "d63c6c45d7f65381eb349921cf8995dd0e3681ff5df87f57bef53f4414c7bebc"
        );

        let other = CheckConfig {
            stat_host: "other.stats".to_string(),
            ..Default::default()
        };
        assert_eq!(
            aggregation_key(&other),
            "398ecd9e2ba11baf6387b5bcaab26851fff9935a1bb7785a6a193db7114c3e0f"
        );
    }

    #[test]
    fn test_aggregation_key_memoized_per_context() {
        let config = CheckConfig::default();
        let mut ctx = CheckContext::new(&config);
        let first = ctx.aggregation_key().to_string();
        assert_eq!(ctx.aggregation_key(), first);
        assert_eq!(first, aggregation_key(&config));
    }

    #[test]
    fn test_error_titles_and_messages() {
        let url = "http://localhost:8888".to_string();

        let err = ProbeError::Timeout { url: url.clone(), timeout: 1.0 };
        assert_eq!(err.title(), "HTTP timeout");
        assert_eq!(err.to_string(), "http://localhost:8888 timed out after 1.0 seconds.");

        let err = ProbeError::Connect { url: url.clone(), reason: "refused".to_string() };
        assert_eq!(err.title(), "HTTP timeout");
        assert_eq!(err.to_string(), "Unable to connect to http://localhost:8888.");

        let err = ProbeError::BadStatus { url: url.clone(), status: 503 };
        assert_eq!(err.title(), "Invalid HTTP response code");
        assert_eq!(err.to_string(), "http://localhost:8888 returned a status of 503");

        let err = ProbeError::MalformedJson { url: url.clone(), body: "<html>".to_string() };
        assert_eq!(err.title(), "JSON parse error");
        assert_eq!(
            err.to_string(),
            "http://localhost:8888 response was not well-formed JSON: <html>"
        );

        let err = ProbeError::InvalidMetric { url, field: "opens" };
        assert_eq!(err.title(), "Invalid metric value");
        assert!(err.to_string().contains("\"opens\""));
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(&1.0), "1.0");
        assert_eq!(format_seconds(&0.2), "0.2");
        assert_eq!(format_seconds(&2.25), "2.25");
        assert_eq!(format_seconds(&30.0), "30.0");
        assert_eq!(format_seconds(&1e-5), "1e-05");
        assert_eq!(format_seconds(&1.5e-7), "1.5e-07");
        assert_eq!(format_seconds(&1e16), "1e+16");
        assert_eq!(format_seconds(&1.25e123), "1.25e+123");

        let err = ProbeError::Timeout {
            url: "http://localhost:8888".to_string(),
            timeout: 1e-5,
        };
        assert_eq!(err.to_string(), "http://localhost:8888 timed out after 1e-05 seconds.");
    }

    #[tokio::test]
    async fn test_unusable_timeout_is_reported_not_panicked() {
        let port = closed_port();
        for timeout in [-1.0, 0.0, f64::NAN, 1e30] {
            let config = CheckConfig {
                timeout,
                ..local_config(port)
            };
            let (outcome, sink) = run_check(&config).await;
            assert_eq!(outcome, CheckOutcome::Critical("HTTP timeout"));
            single_error(&sink);
        }
    }

    #[tokio::test]
    async fn test_successful_check() {
        let addr = spawn_stats_server(StatusCode::OK, FULL_STATS).await;
        let config = local_config(addr.port());
        let (outcome, sink) = run_check(&config).await;

        assert_eq!(outcome, CheckOutcome::Ok);
        assert!(sink.events().is_empty());

        let tags = vec![
            format!("url:http://127.0.0.1:{}", addr.port()),
            "version:1.8.3".to_string(),
        ];
        let checks = sink.service_checks();
        assert_eq!(checks, vec![(ServiceCheckStatus::Ok, tags.clone(), None)]);

        let metrics = sink.metrics();
        assert_eq!(metrics.len(), 6);
        match &metrics[0] {
            Emission::Gauge { name, value, tags: t } => {
                assert_eq!(name, "tinyproxy.response_time");
                assert!(*value >= 0.0);
                assert_eq!(t, &tags);
            }
            other => panic!("unexpected emission {other:?}"),
        }

        let gauge = |name: &str, value: f64| Emission::Gauge {
            name: name.to_string(),
            value,
            tags: tags.clone(),
        };
        let count = |name: &str, value: f64| Emission::MonotonicCount {
            name: name.to_string(),
            value,
            tags: tags.clone(),
        };
        assert_eq!(
            metrics[1..].to_vec(),
            vec![
                gauge("tinyproxy.opens", 5.0),
                count("tinyproxy.reqs", 100.0),
                count("tinyproxy.badconns", 2.0),
                count("tinyproxy.deniedconns", 0.0),
                count("tinyproxy.refusedconns", 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_success_without_version() {
        let addr = spawn_stats_server(
            StatusCode::OK,
            r#"{"version":"","opens":"3","reqs":10,"badconns":0,"deniedconns":0,"refusedconns":0}"#,
        )
        .await;
        let (outcome, sink) = run_check(&local_config(addr.port())).await;

        assert_eq!(outcome, CheckOutcome::Ok);
        let checks = sink.service_checks();
        assert_eq!(checks[0].1, vec![format!("url:http://127.0.0.1:{}", addr.port())]);
        assert_eq!(sink.metrics().len(), 6);
    }

    #[tokio::test]
    async fn test_timeout() {
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                FULL_STATS
            }),
        );
        let addr = serve(app).await;
        let config = CheckConfig {
            timeout: 0.2,
            ..local_config(addr.port())
        };

        let (outcome, sink) = run_check(&config).await;
        assert_eq!(outcome, CheckOutcome::Critical("HTTP timeout"));

        let event = single_error(&sink);
        assert_eq!(event.msg_title, "HTTP timeout");
        assert_eq!(
            event.msg_text,
            format!("http://127.0.0.1:{} timed out after 0.2 seconds.", addr.port())
        );
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let config = local_config(closed_port());
        let (outcome, sink) = run_check(&config).await;
        assert_eq!(outcome, CheckOutcome::Critical("HTTP timeout"));

        let event = single_error(&sink);
        assert_eq!(event.msg_title, "HTTP timeout");
        assert_eq!(event.msg_text, format!("Unable to connect to {}.", config.target_url()));
        assert_eq!(event.tags, vec![format!("url:{}", config.target_url())]);
        assert_eq!(event.aggregation_key, aggregation_key(&config));
    }

    #[tokio::test]
    async fn test_bad_status() {
        let addr = spawn_stats_server(StatusCode::INTERNAL_SERVER_ERROR, "oops").await;
        let (outcome, sink) = run_check(&local_config(addr.port())).await;
        assert_eq!(outcome, CheckOutcome::Critical("Invalid HTTP response code"));

        let event = single_error(&sink);
        assert_eq!(event.msg_title, "Invalid HTTP response code");
        assert!(event.msg_text.contains("returned a status of 500"));
        // No version can be known before a successful decode.
        assert!(event.tags.iter().all(|t| !t.starts_with("version:")));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let addr = spawn_stats_server(StatusCode::OK, "not json").await;
        let (outcome, sink) = run_check(&local_config(addr.port())).await;
        assert_eq!(outcome, CheckOutcome::Critical("JSON parse error"));

        let event = single_error(&sink);
        assert_eq!(event.msg_title, "JSON parse error");
        assert_eq!(
            event.msg_text,
            format!(
                "http://127.0.0.1:{} response was not well-formed JSON: not json",
                addr.port()
            )
        );
        assert_eq!(event.tags.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_metric_field() {
        let addr = spawn_stats_server(
            StatusCode::OK,
            r#"{"version":"1.8.3","opens":5,"reqs":100,"badconns":2,"deniedconns":0}"#,
        )
        .await;
        let (outcome, sink) = run_check(&local_config(addr.port())).await;
        assert_eq!(outcome, CheckOutcome::Critical("Invalid metric value"));

        let event = single_error(&sink);
        assert!(event.msg_text.contains("refusedconns"));
        assert_eq!(
            event.tags,
            vec![
                format!("url:http://127.0.0.1:{}", addr.port()),
                "version:1.8.3".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_stat_host_selects_vhost() {
        let app = Router::new().route(
            "/",
            get(|headers: axum::http::HeaderMap| async move {
                match headers.get("host").and_then(|h| h.to_str().ok()) {
                    Some("stats.example") => (StatusCode::OK, FULL_STATS),
                    _ => (StatusCode::NOT_FOUND, "no such vhost"),
                }
            }),
        );
        let addr = serve(app).await;

        let (outcome, _) = run_check(&local_config(addr.port())).await;
        assert_eq!(outcome, CheckOutcome::Critical("Invalid HTTP response code"));

        let config = CheckConfig {
            stat_host: "stats.example".to_string(),
            ..local_config(addr.port())
        };
        let (outcome, _) = run_check(&config).await;
        assert_eq!(outcome, CheckOutcome::Ok);
    }

    #[tokio::test]
    async fn test_aggregation_key_across_invocations() {
        let port = closed_port();
        let config = local_config(port);
        let other = CheckConfig {
            stat_host: "other.stats".to_string(),
            ..local_config(port)
        };

        let (_, first) = run_check(&config).await;
        let (_, second) = run_check(&config).await;
        let (_, third) = run_check(&other).await;

        let key = |sink: &MemorySink| single_error(sink).aggregation_key;
        assert_eq!(key(&first), key(&second));
        assert_ne!(key(&first), key(&third));
    }

    #[tokio::test]
    async fn test_invocations_do_not_share_version() {
        let ok = spawn_stats_server(StatusCode::OK, FULL_STATS).await;
        let broken = spawn_stats_server(StatusCode::BAD_GATEWAY, "").await;
        let check = TinyproxyCheck::new().unwrap();
        let sink = MemorySink::new();

        assert_eq!(check.run(&local_config(ok.port()), &sink).await, CheckOutcome::Ok);
        sink.clear();

        check.run(&local_config(broken.port()), &sink).await;
        let event = single_error(&sink);
        assert_eq!(event.tags, vec![format!("url:http://127.0.0.1:{}", broken.port())]);
    }
}
