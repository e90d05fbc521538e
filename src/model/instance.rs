use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a running unit of work
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstancePhase {
    #[default]
    Pending,
    Ready,
    Terminating,
    Failed,
}

/// Readiness signal reported by the execution runtime
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthSignal {
    Ready,
    NotReady,
    Unknown,
}

/// A concrete instance owned by one revision
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInstance {
    pub id: String,
    pub workload: String,
    pub revision: String,
    pub phase: InstancePhase,
    pub created_at: DateTime<Utc>,
}

impl ReplicaInstance {
    pub fn is_ready(&self) -> bool {
        self.phase == InstancePhase::Ready
    }
}

/// Create-if-absent request sent to the runtime
///
/// The id is chosen by the controller so a retried create is idempotent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    pub id: String,
    pub workload: String,
    pub revision: String,
    pub payload: serde_json::Value,
}
