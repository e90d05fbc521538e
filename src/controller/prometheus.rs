//! Prometheus metrics integration for canary analysis
//!
//! This module builds PromQL queries for a canary revision, runs them
//! against Prometheus and parses the instant-query response.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Prometheus HTTP error: {0}")]
    Http(String),

    #[error("Prometheus query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("No data returned from Prometheus")]
    NoData,

    #[error("metrics provider not configured")]
    NotConfigured,
}

/// Source of pre-aggregated metric values
///
/// The returned value is already a ratio, percentage or percentile; the
/// analysis engine only range-checks it.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn query(&self, query: &str, window: Duration) -> Result<f64, ProviderError>;
}

/// Build the query for a metric check
///
/// A raw query wins over the built-in template. `$workload`, `$revision` and
/// `$window` placeholders are substituted in both.
pub fn build_query(
    name: &str,
    raw: Option<&str>,
    workload: &str,
    revision: &str,
) -> Result<String, ProviderError> {
    let template = match raw {
        Some(q) if !q.trim().is_empty() => q.to_string(),
        _ => match name {
            "error-rate" => build_error_rate_query(),
            "latency-p95" => build_latency_p95_query(),
            "success-rate" => build_success_rate_query(),
            other => {
                return Err(ProviderError::InvalidQuery(format!(
                    "unknown metric template '{}' and no query given",
                    other
                )))
            }
        },
    };
    Ok(template
        .replace("$workload", workload)
        .replace("$revision", revision))
}

/// Error rate: (5xx errors / total requests) * 100
fn build_error_rate_query() -> String {
    r#"sum(rate(http_requests_total{status=~"5..",workload="$workload",revision="$revision"}[$window])) / sum(rate(http_requests_total{workload="$workload",revision="$revision"}[$window])) * 100"#.to_string()
}

/// 95th percentile latency in seconds
fn build_latency_p95_query() -> String {
    r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{workload="$workload",revision="$revision"}[$window])) by (le))"#.to_string()
}

/// Success rate: (non-5xx / total requests) * 100
fn build_success_rate_query() -> String {
    r#"sum(rate(http_requests_total{status!~"5..",workload="$workload",revision="$revision"}[$window])) / sum(rate(http_requests_total{workload="$workload",revision="$revision"}[$window])) * 100"#.to_string()
}

fn window_literal(window: Duration) -> String {
    format!("{}s", window.as_secs().max(1))
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse Prometheus instant query response and extract metric value
///
/// Parses the JSON response from Prometheus /api/v1/query endpoint
/// and returns the first metric value as f64.
fn parse_prometheus_instant_query(json_response: &str) -> Result<f64, ProviderError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| ProviderError::Parse(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(ProviderError::Http(format!(
            "Prometheus query failed with status: {} ({})",
            response.status,
            response.error.unwrap_or_default()
        )));
    }

    let result = response
        .data
        .and_then(|d| d.result.into_iter().next())
        .ok_or(ProviderError::NoData)?;

    let value = result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| ProviderError::Parse(format!("Invalid value: {}", e)))?;

    if value.is_nan() {
        return Err(ProviderError::NoData);
    }
    Ok(value)
}

/// Prometheus HTTP client
pub struct PrometheusProvider {
    client: reqwest::Client,
    address: String,
    timeout: Duration,
}

impl PrometheusProvider {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build Prometheus HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    async fn query(&self, query: &str, window: Duration) -> Result<f64, ProviderError> {
        let query = query.replace("$window", &window_literal(window));
        let url = format!("{}/api/v1/query", self.address);

        let response = self
            .client
            .get(&url)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Http(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(ProviderError::InvalidQuery(query));
        }
        if !response.status().is_success() {
            return Err(ProviderError::Http(format!(
                "Prometheus returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        parse_prometheus_instant_query(&body)
    }
}

/// Provider used when no Prometheus address is configured
pub struct UnconfiguredProvider;

#[async_trait]
impl MetricsProvider for UnconfiguredProvider {
    async fn query(&self, _query: &str, _window: Duration) -> Result<f64, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

/// Scripted provider for tests
///
/// Answers are consumed in order; once exhausted every query returns the
/// fallback.
#[cfg(test)]
pub struct MockMetricsProvider {
    script: std::sync::Mutex<std::collections::VecDeque<Result<f64, ProviderError>>>,
    fallback: std::sync::Mutex<Result<f64, ProviderError>>,
    queries: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockMetricsProvider {
    pub fn new(fallback: f64) -> Self {
        Self {
            script: Default::default(),
            fallback: std::sync::Mutex::new(Ok(fallback)),
            queries: Default::default(),
        }
    }

    pub fn push(&self, answer: Result<f64, ProviderError>) {
        self.script.lock().unwrap().push_back(answer);
    }

    pub fn set_fallback(&self, answer: Result<f64, ProviderError>) {
        *self.fallback.lock().unwrap() = answer;
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl MetricsProvider for MockMetricsProvider {
    async fn query(&self, query: &str, _window: Duration) -> Result<f64, ProviderError> {
        self.queries.lock().unwrap().push(query.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => self.fallback.lock().unwrap().clone(),
        }
    }
}
