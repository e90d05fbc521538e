use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Declared target state for one workload
///
/// Owned by the operator (or a GitOps layer) and written through the state
/// store. The template is captured into an immutable Revision the first time
/// the controller sees its hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSpec {
    /// Workload key
    pub workload: String,

    /// Number of desired instances
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Template describing the instances that will be created
    pub template: Template,

    /// Update policy (surge/unavailable bounds, deadline, canary)
    #[serde(default)]
    pub policy: UpdatePolicy,

    /// Which writer owns each mutable field
    #[serde(default, skip_serializing_if = "OwnershipTable::is_default")]
    pub ownership: OwnershipTable,

    /// Bumped on every accepted change
    #[serde(default)]
    pub generation: u64,
}

fn default_replicas() -> u32 {
    1
}

/// Opaque instance template, addressed by its content hash
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Template {
    /// Content hash supplied by the client
    pub hash: String,

    /// Opaque payload handed to the execution runtime
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Template {
    pub fn new(hash: impl Into<String>, payload: serde_json::Value) -> Self {
        Template {
            hash: hash.into(),
            payload,
        }
    }

    /// Compute a stable 10-character hash for a template payload
    ///
    /// Used by clients that do not carry their own content hash. FNV-1a over
    /// the JSON encoding keeps the value stable across processes.
    pub fn hash_payload(payload: &serde_json::Value) -> String {
        let json = payload.to_string();

        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in json.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }

        format!("{hash:016x}")[..10].to_string()
    }
}

/// How a template change is rolled out
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// Maximum number of instances above `replicas` during an update.
    /// Absolute ("1") or percentage ("25%"). Defaults to "25%".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<String>,

    /// Maximum number of desired instances that may be unready during an update.
    /// Absolute ("1") or percentage ("25%"). Defaults to "0".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,

    /// Seconds a rollout may stay active before it is marked Failed.
    /// Defaults to 600.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<u64>,

    /// Number of revisions retained for rollback. Defaults to 10.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<usize>,

    /// Metric-gated canary promotion. Absent means a plain rolling update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryPolicy>,
}

pub const DEFAULT_MAX_SURGE: &str = "25%";
pub const DEFAULT_MAX_UNAVAILABLE: &str = "0";
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: u64 = 600;
pub const DEFAULT_REVISION_HISTORY_LIMIT: usize = 10;

impl UpdatePolicy {
    pub fn max_surge(&self) -> &str {
        self.max_surge.as_deref().unwrap_or(DEFAULT_MAX_SURGE)
    }

    pub fn max_unavailable(&self) -> &str {
        self.max_unavailable
            .as_deref()
            .unwrap_or(DEFAULT_MAX_UNAVAILABLE)
    }

    pub fn progress_deadline_seconds(&self) -> u64 {
        self.progress_deadline_seconds
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }

    pub fn revision_history_limit(&self) -> usize {
        self.revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
    }

    /// Strategy name for logging and metric labels
    pub fn strategy_name(&self) -> &'static str {
        if self.canary.is_some() {
            "canary"
        } else {
            "rolling"
        }
    }
}

/// Canary promotion gated by metric analysis
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryPolicy {
    /// Traffic weight added on every passing analysis
    #[serde(default = "default_step_weight")]
    pub step_weight: u32,

    /// Highest weight reached by stepping; the next pass promotes to 100
    #[serde(default = "default_max_weight")]
    pub max_weight: u32,

    /// Analysis interval (e.g., "60s", "1m"). Defaults to the controller setting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Consecutive failing samples before the canary is aborted. Defaults to 5.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    /// Time to wait after the canary starts before the first sample
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup: Option<String>,

    /// Window passed to the metrics provider and kept in the sample history.
    /// Defaults to "5m".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_window: Option<String>,

    /// What to do when the metrics provider cannot answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Metrics evaluated on every interval
    #[serde(default)]
    pub metrics: Vec<MetricCheck>,
}

fn default_step_weight() -> u32 {
    10
}

fn default_max_weight() -> u32 {
    50
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

impl CanaryPolicy {
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.clone().unwrap_or_default()
    }
}

/// What to do when the metrics provider is unreachable during analysis
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Hold the canary until the provider recovers (default, safest)
    #[default]
    Pause,
    /// Treat the missing sample as passing (risky)
    Continue,
    /// Count the missing sample as a failure
    Rollback,
}

/// One metric evaluated against a threshold range
///
/// The provider returns a pre-aggregated value (a ratio or a percentile), so
/// the check is a plain range comparison.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricCheck {
    /// Metric name or built-in template (error-rate, latency-p95, success-rate)
    pub name: String,

    /// Raw provider query. Overrides the built-in template when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Lowest passing value (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Highest passing value (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl MetricCheck {
    pub fn passes(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Mutable fields of a DesiredSpec that can be claimed by a writer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SpecField {
    Replicas,
    Template,
    Policy,
}

/// Writers that mutate desired state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FieldOwner {
    Operator,
    Autoscaler,
    RolloutController,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("field {field:?} is owned by {owner:?}, refusing write from {writer:?}")]
pub struct OwnershipError {
    pub field: SpecField,
    pub owner: FieldOwner,
    pub writer: FieldOwner,
}

/// Per-field ownership tags
///
/// Unlisted fields belong to the operator. A write is accepted only from the
/// field's owner.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct OwnershipTable {
    owners: BTreeMap<SpecField, FieldOwner>,
}

impl OwnershipTable {
    pub fn owner(&self, field: SpecField) -> FieldOwner {
        self.owners
            .get(&field)
            .copied()
            .unwrap_or(FieldOwner::Operator)
    }

    pub fn assign(&mut self, field: SpecField, owner: FieldOwner) {
        if owner == FieldOwner::Operator {
            self.owners.remove(&field);
        } else {
            self.owners.insert(field, owner);
        }
    }

    pub fn check(&self, field: SpecField, writer: FieldOwner) -> Result<(), OwnershipError> {
        let owner = self.owner(field);
        if owner == writer {
            Ok(())
        } else {
            Err(OwnershipError {
                field,
                owner,
                writer,
            })
        }
    }

    fn is_default(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
#[path = "workload_test.rs"]
mod tests;
