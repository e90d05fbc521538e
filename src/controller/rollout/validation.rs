use super::surge::is_valid_surge_format;
use crate::model::DesiredSpec;
use std::time::Duration;

/// Validate a DesiredSpec
///
/// Checks constraints that serde cannot express. Used by the reconcile loop
/// and by the ingestion path before a spec is stored.
///
/// # Validation Rules
/// - `workload` and `template.hash` cannot be empty
/// - `maxSurge` / `maxUnavailable` must be a percentage (0-100%) or a
///   non-negative integer, and not both literally zero
/// - Canary: `stepWeight` and `maxWeight` must be 1-100 with step <= max
/// - Canary: durations must be valid format (e.g., "30s", "5m")
/// - Canary: at least one metric, each with a non-empty name and min <= max
///
/// # Returns
/// * `Ok(())` - Validation passed
/// * `Err(String)` - Validation error message
pub fn validate_spec(spec: &DesiredSpec) -> Result<(), String> {
    if spec.workload.trim().is_empty() {
        return Err("workload cannot be empty".to_string());
    }

    if spec.template.hash.trim().is_empty() {
        return Err("template.hash cannot be empty".to_string());
    }

    let policy = &spec.policy;
    if let Some(max_surge) = &policy.max_surge {
        if !is_valid_surge_format(max_surge) {
            return Err(format!(
                "policy.maxSurge invalid format '{}': must be percentage (e.g., '25%') or absolute number (e.g., '5')",
                max_surge
            ));
        }
    }

    if let Some(max_unavailable) = &policy.max_unavailable {
        if !is_valid_surge_format(max_unavailable) {
            return Err(format!(
                "policy.maxUnavailable invalid format '{}': must be percentage (e.g., '25%') or absolute number (e.g., '0')",
                max_unavailable
            ));
        }
    }

    if is_zero(policy.max_surge()) && is_zero(policy.max_unavailable()) {
        return Err("policy.maxSurge and policy.maxUnavailable cannot both be 0".to_string());
    }

    if let Some(canary) = &policy.canary {
        if !(1..=100).contains(&canary.step_weight) {
            return Err(format!(
                "policy.canary.stepWeight must be 1-100, got {}",
                canary.step_weight
            ));
        }
        if !(1..=100).contains(&canary.max_weight) {
            return Err(format!(
                "policy.canary.maxWeight must be 1-100, got {}",
                canary.max_weight
            ));
        }
        if canary.step_weight > canary.max_weight {
            return Err(format!(
                "policy.canary.stepWeight ({}) cannot exceed maxWeight ({})",
                canary.step_weight, canary.max_weight
            ));
        }

        for (field, value) in [
            ("interval", &canary.interval),
            ("warmup", &canary.warmup),
            ("analysisWindow", &canary.analysis_window),
        ] {
            if let Some(duration) = value {
                if parse_duration(duration).is_none() {
                    return Err(format!("policy.canary.{} invalid: {}", field, duration));
                }
            }
        }

        if canary.failure_threshold == Some(0) {
            return Err("policy.canary.failureThreshold must be >= 1".to_string());
        }

        if canary.metrics.is_empty() {
            return Err("policy.canary.metrics must have at least one metric".to_string());
        }

        for (i, metric) in canary.metrics.iter().enumerate() {
            if metric.name.trim().is_empty() {
                return Err(format!("metrics[{}].name cannot be empty", i));
            }
            if let (Some(min), Some(max)) = (metric.min, metric.max) {
                if min > max {
                    return Err(format!(
                        "metrics[{}] min ({}) cannot exceed max ({})",
                        i, min, max
                    ));
                }
            }
        }
    }

    Ok(())
}

fn is_zero(value: &str) -> bool {
    matches!(value.trim().trim_end_matches('%').parse::<u32>(), Ok(0))
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero is rejected, and hours are capped at one week so typos like
/// "8760h" fail validation.
///
/// # Returns
/// Some(Duration) if parse successful and within limits, None if invalid or out of range
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    let (limit, factor) = match unit {
        's' => (86_400, 1),
        'm' => (1_440, 60),
        'h' => (168, 3_600),
        _ => return None,
    };
    if number > limit {
        return None;
    }
    number.checked_mul(factor).map(Duration::from_secs)
}
