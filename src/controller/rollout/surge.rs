use crate::model::UpdatePolicy;

/// Validate surge/unavailable value format
///
/// Returns true if the value is a valid format:
/// - Percentage: "0%" to "100%" (non-negative)
/// - Absolute: non-negative integer
pub(crate) fn is_valid_surge_format(value: &str) -> bool {
    let value = value.trim();
    if let Some(percent_str) = value.strip_suffix('%') {
        match percent_str.parse::<i64>() {
            Ok(percent) => (0..=100).contains(&percent),
            Err(_) => false,
        }
    } else {
        value.parse::<u32>().is_ok()
    }
}

/// Parse a surge value (percentage like "25%" or absolute like "5")
///
/// Percentages are taken of `desired` and rounded up.
/// Invalid values (negative, out of range, or malformed) return 0.
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_surge_value("25%", 10), 3);  // 25% of 10 = 2.5 -> ceil = 3
/// assert_eq!(parse_surge_value("5", 10), 5);   // absolute 5
/// assert_eq!(parse_surge_value("-5", 10), 0);  // negative -> 0
/// ```
pub fn parse_surge_value(value: &str, desired: u32) -> u32 {
    resolve(value, desired, f64::ceil)
}

/// Parse a max-unavailable value; percentages round down
///
/// Rounding down keeps availability on the safe side: 25% of 6 allows one
/// unready instance, not two.
pub fn parse_unavailable_value(value: &str, desired: u32) -> u32 {
    resolve(value, desired, f64::floor)
}

fn resolve(value: &str, desired: u32, round: fn(f64) -> f64) -> u32 {
    let value = value.trim();
    if let Some(percent_str) = value.strip_suffix('%') {
        match percent_str.parse::<u32>() {
            Ok(percent) if percent <= 100 => {
                round(desired as f64 * percent as f64 / 100.0) as u32
            }
            _ => 0,
        }
    } else {
        value.parse::<u32>().unwrap_or(0)
    }
}

/// Instances of the canary revision for a traffic weight
///
/// canary = ceil(desired * weight / 100), so any nonzero weight gets at
/// least one instance.
pub fn canary_replicas(desired: u32, weight: u32) -> u32 {
    match weight {
        0 => 0,
        w if w >= 100 => desired,
        w => ((desired as u64 * w as u64).div_ceil(100)) as u32,
    }
}

/// Split `desired` between the stable and canary revision
///
/// Returns (stable, canary).
pub fn calculate_replica_split(desired: u32, weight: u32) -> (u32, u32) {
    let canary = canary_replicas(desired, weight);
    (desired - canary, canary)
}

/// Resolved surge and availability bounds for one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurgeBounds {
    pub desired: u32,
    pub max_surge: u32,
    pub max_unavailable: u32,
}

impl SurgeBounds {
    /// Resolve the policy's values against `desired`
    ///
    /// When both round to zero (e.g. "10%" of 3 unavailable, "0" surge) the
    /// rollout could never make progress, so surge is raised to one.
    pub fn resolve(policy: &UpdatePolicy, desired: u32) -> Self {
        let mut max_surge = parse_surge_value(policy.max_surge(), desired);
        let max_unavailable = parse_unavailable_value(policy.max_unavailable(), desired);
        if max_surge == 0 && max_unavailable == 0 && desired > 0 {
            max_surge = 1;
        }
        SurgeBounds {
            desired,
            max_surge,
            max_unavailable,
        }
    }

    /// Upper bound on instances of all revisions
    ///
    /// Saturates: an absolute surge can be as large as `u32::MAX`.
    pub fn max_total(&self) -> u32 {
        self.desired.saturating_add(self.max_surge)
    }

    /// Lower bound on ready instances
    pub fn min_ready(&self) -> u32 {
        self.desired.saturating_sub(self.max_unavailable)
    }
}
