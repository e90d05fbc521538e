//! Controller settings
//!
//! Read from `KULKU_*` environment variables at startup. Durations use the
//! same "30s" / "5m" / "1h" format as workload policies.

use crate::controller::rollout::validation::parse_duration;
use crate::model::DEFAULT_REVISION_HISTORY_LIMIT;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of reconcile workers
    pub workers: usize,
    /// Keys the work queue may hold before rejecting new ones
    pub queue_capacity: usize,
    /// Period of the full re-enqueue of every known workload
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Per-call timeout for execution runtime calls
    pub call_timeout: Duration,
    /// Retries of a transient runtime failure within one call
    pub call_retries: u32,
    /// Requeue delay while a rollout is in flight
    pub active_requeue: Duration,
    /// Requeue delay while a rollout is paused
    pub paused_requeue: Duration,
    /// Canary analysis interval when the policy does not set one
    pub canary_interval: Duration,
    /// Analysis window when the policy does not set one
    pub analysis_window: Duration,
    /// Revisions kept when the policy does not set a limit
    pub revision_history_limit: usize,
    pub http_port: u16,
    /// Prometheus base URL; metric analysis is unavailable when unset
    pub prometheus_address: Option<String>,
    pub cdevents_enabled: bool,
    pub cdevents_sink_url: Option<String>,
    /// JSON snapshot the in-memory store is restored from and flushed to
    pub state_file: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 4,
            queue_capacity: 1024,
            resync_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            call_timeout: Duration::from_secs(5),
            call_retries: 3,
            active_requeue: Duration::from_secs(5),
            paused_requeue: Duration::from_secs(30),
            canary_interval: Duration::from_secs(60),
            analysis_window: Duration::from_secs(300),
            revision_history_limit: DEFAULT_REVISION_HISTORY_LIMIT,
            http_port: 8080,
            prometheus_address: None,
            cdevents_enabled: false,
            cdevents_sink_url: None,
            state_file: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        Ok(ControllerConfig {
            workers: number(&get, "KULKU_WORKERS", defaults.workers)?.max(1),
            queue_capacity: number(&get, "KULKU_QUEUE_CAPACITY", defaults.queue_capacity)?,
            resync_interval: duration(&get, "KULKU_RESYNC_INTERVAL", defaults.resync_interval)?,
            backoff_base: duration(&get, "KULKU_BACKOFF_BASE", defaults.backoff_base)?,
            backoff_cap: duration(&get, "KULKU_BACKOFF_CAP", defaults.backoff_cap)?,
            call_timeout: duration(&get, "KULKU_CALL_TIMEOUT", defaults.call_timeout)?,
            call_retries: number(&get, "KULKU_CALL_RETRIES", defaults.call_retries)?,
            active_requeue: duration(&get, "KULKU_ACTIVE_REQUEUE", defaults.active_requeue)?,
            paused_requeue: duration(&get, "KULKU_PAUSED_REQUEUE", defaults.paused_requeue)?,
            canary_interval: duration(&get, "KULKU_CANARY_INTERVAL", defaults.canary_interval)?,
            analysis_window: duration(&get, "KULKU_ANALYSIS_WINDOW", defaults.analysis_window)?,
            revision_history_limit: number(
                &get,
                "KULKU_REVISION_HISTORY_LIMIT",
                defaults.revision_history_limit,
            )?,
            http_port: number(&get, "KULKU_HTTP_PORT", defaults.http_port)?,
            prometheus_address: get("KULKU_PROMETHEUS_ADDRESS"),
            cdevents_enabled: get("KULKU_CDEVENTS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            cdevents_sink_url: get("KULKU_CDEVENTS_SINK_URL"),
            state_file: get("KULKU_STATE_FILE"),
        })
    }
}

fn number<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            reason: "expected a non-negative integer",
        }),
        None => Ok(default),
    }
}

fn duration<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(value) => parse_duration(&value).ok_or(ConfigError::Invalid {
            var,
            value,
            reason: "expected a duration like 30s, 5m or 1h",
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.backoff_cap, Duration::from_secs(300));
        assert!(!config.cdevents_enabled);
    }

    #[test]
    fn test_overrides() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("KULKU_WORKERS", "8"),
            ("KULKU_RESYNC_INTERVAL", "1m"),
            ("KULKU_PROMETHEUS_ADDRESS", "http://prom:9090"),
            ("KULKU_CDEVENTS_ENABLED", "true"),
            ("KULKU_HTTP_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.prometheus_address.as_deref(), Some("http://prom:9090"));
        assert!(config.cdevents_enabled);
        assert_eq!(config.http_port, 9000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ControllerConfig::from_lookup(lookup(&[("KULKU_BACKOFF_BASE", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "KULKU_BACKOFF_BASE",
                ..
            }
        ));

        assert!(ControllerConfig::from_lookup(lookup(&[("KULKU_WORKERS", "-1")])).is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config =
            ControllerConfig::from_lookup(lookup(&[("KULKU_PROMETHEUS_ADDRESS", "  ")])).unwrap();
        assert!(config.prometheus_address.is_none());
    }
}
