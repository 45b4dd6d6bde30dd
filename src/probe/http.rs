//! HTTP fetch of the stats page.

use std::time::{Duration, Instant};

use reqwest::header::HOST;
use reqwest::{Client, StatusCode};

use super::ProbeError;
use crate::config::timeout_duration;

/// A stats response as received, before any interpretation.
#[derive(Debug, Clone)]
pub struct StatsResponse {
    pub status: StatusCode,
    pub body: String,
    /// Time from request start until the full body was read.
    pub elapsed: Duration,
}

/// GET `url` with `Host: stat_host`, bounded by `timeout` seconds.
///
/// Only transport problems are errors here; the status code is left to the caller.
pub async fn fetch_stats(
    client: &Client,
    url: &str,
    stat_host: &str,
    timeout: f64,
) -> Result<StatsResponse, ProbeError> {
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            ProbeError::Timeout {
                url: url.to_string(),
                timeout,
            }
        } else {
            tracing::debug!("Request to {} failed: {}", url, e);
            ProbeError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    tracing::debug!("Requesting {} (Host: {})", url, stat_host);
    let start = Instant::now();

    let response = client
        .get(url)
        .header(HOST, stat_host)
        .timeout(timeout_duration(timeout))
        .send()
        .await
        .map_err(classify)?;

    let status = response.status();

    // Read the full body to measure complete transfer time
    let body = response.text().await.map_err(classify)?;
    let elapsed = start.elapsed();

    tracing::debug!("{} returned {} in {:?}", url, status, elapsed);

    Ok(StatsResponse {
        status,
        body,
        elapsed,
    })
}
