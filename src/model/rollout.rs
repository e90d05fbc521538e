use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of decisions kept in the rollout history
pub const MAX_DECISIONS: usize = 20;

/// Phase of a rollout
///
/// Represents the current lifecycle stage of the update for one workload
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No update has ever been in flight
    #[default]
    Idle,
    /// Instances of the target revision are being brought up under surge/unavailable bounds
    Progressing,
    /// Operator paused the rollout; health is observed but nothing is scaled
    Paused,
    /// Canary revision receives partial traffic while metrics are evaluated
    Analyzing,
    /// Target revision is being scaled to desired and the old revision drained
    Promoting,
    /// Target revision is fully scaled, old revisions are at zero
    Completed,
    /// Progress deadline exceeded, requires operator intervention
    Failed,
    /// Canary aborted, previous revision restored
    RolledBack,
}

impl Phase {
    /// True while an update is in flight and the progress deadline applies
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Progressing | Phase::Analyzing | Phase::Promoting
        )
    }

    /// True for phases an operator must act on before the rollout moves again
    pub fn needs_intervention(&self) -> bool {
        matches!(self, Phase::Failed | Phase::RolledBack)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Surge/unavailable bookkeeping for the current tick
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCounters {
    /// Live (non-terminating) instances across all revisions
    #[serde(default)]
    pub total: u32,
    /// Instances observed Ready
    #[serde(default)]
    pub ready: u32,
    /// Instances of the target revision
    #[serde(default)]
    pub updated: u32,
    /// Instances above desired
    #[serde(default)]
    pub surge: u32,
    /// Desired instances that are not Ready
    #[serde(default)]
    pub unavailable: u32,
}

/// Ephemeral state of a metric-gated canary
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryRun {
    /// Traffic weight (percent) routed to the canary revision
    pub weight: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Number of advances so far; only rollback resets it
    #[serde(default)]
    pub step_index: u32,
    /// Metric names evaluated on every interval
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Samples inside the analysis window, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<MetricSample>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

/// One point-in-time metric evaluation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub metric: String,
    /// None when the provider could not answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// Reconcile stopped on an invariant or configuration error
    Degraded,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Action taken by the controller
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionAction {
    /// A new target revision started rolling out
    Start,
    /// Canary weight increased
    StepAdvance,
    /// Target revision is being fully scaled
    Promotion,
    Complete,
    Pause,
    Resume,
    Rollback,
    /// Progress deadline expired
    Fail,
}

/// Reason for the decision
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    TemplateChanged,
    AnalysisPassed,
    AnalysisFailed,
    SurgeSatisfied,
    ReplicasConverged,
    ManualPause,
    ManualResume,
    ManualPromotion,
    ManualRollback,
    Timeout,
}

/// Metric snapshot at decision time
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetricSnapshot {
    pub value: Option<f64>,
    pub passed: bool,
}

/// Decision record for observability
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub action: DecisionAction,
    pub from: Phase,
    pub to: Phase,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, MetricSnapshot>>,
}

/// Per-workload rollout record
///
/// Exactly one exists per workload. It is the single source of truth for
/// whether an update is in flight and survives restarts through the store.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    pub workload: String,

    /// Revision fully scaled before the update started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// Revision the update is moving to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,

    #[serde(default)]
    pub phase: Phase,

    /// Phase to return to on resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<Phase>,

    #[serde(default)]
    pub counters: ReplicaCounters,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryRun>,

    /// Last weight pushed to the traffic router (canary only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_weight: Option<u32>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Reason for the most recent non-Idle transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<String>,

    /// Reason carried by the most recent requeue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_requeue_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,

    /// When the current update entered Progressing (shifted forward by paused time)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    /// DesiredSpec generation last acted on
    #[serde(default)]
    pub observed_generation: u64,
}

impl RolloutState {
    pub fn new(workload: impl Into<String>) -> Self {
        RolloutState {
            workload: workload.into(),
            ..Default::default()
        }
    }

    /// Revision that instances should converge to right now
    pub fn live_revision(&self) -> Option<&str> {
        self.target_revision
            .as_deref()
            .or(self.current_revision.as_deref())
    }

    /// Move to a new phase and append a decision record
    pub fn transition(
        &mut self,
        to: Phase,
        action: DecisionAction,
        reason: DecisionReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        let from = self.phase;
        self.phase = to;
        if to != Phase::Idle {
            self.last_transition_reason = Some(format!("{:?}: {}", reason, message));
        }
        self.message = Some(message.clone());
        self.record_decision(Decision {
            timestamp: now,
            action,
            from,
            to,
            reason,
            message: Some(message),
            metrics: None,
        });
    }

    /// Append a decision, dropping the oldest beyond the history limit
    pub fn record_decision(&mut self, decision: Decision) {
        self.decisions.push(decision);
        if self.decisions.len() > MAX_DECISIONS {
            let excess = self.decisions.len() - MAX_DECISIONS;
            self.decisions.drain(..excess);
        }
    }

    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn set_condition(
        &mut self,
        kind: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.kind == kind) {
            if existing.reason != reason || existing.message != message {
                existing.reason = reason;
                existing.message = message;
                existing.last_transition_time = now;
            }
            return;
        }
        self.conditions.push(Condition {
            kind,
            reason,
            message,
            last_transition_time: now,
        });
    }

    pub fn clear_condition(&mut self, kind: ConditionType) {
        self.conditions.retain(|c| c.kind != kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions_bounded() {
        let mut state = RolloutState::new("web");
        let now = Utc::now();
        for i in 0..(MAX_DECISIONS + 5) {
            state.transition(
                Phase::Progressing,
                DecisionAction::Start,
                DecisionReason::TemplateChanged,
                format!("step {}", i),
                now,
            );
        }
        assert_eq!(state.decisions.len(), MAX_DECISIONS);
        assert_eq!(state.decisions[0].message.as_deref(), Some("step 5"));
    }

    #[test]
    fn test_transition_records_reason() {
        let mut state = RolloutState::new("web");
        state.transition(
            Phase::Failed,
            DecisionAction::Fail,
            DecisionReason::Timeout,
            "deadline exceeded",
            Utc::now(),
        );
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(
            state.last_transition_reason.as_deref(),
            Some("Timeout: deadline exceeded")
        );
        assert_eq!(state.decisions[0].from, Phase::Idle);
    }

    #[test]
    fn test_set_condition_replaces_existing() {
        let mut state = RolloutState::new("web");
        let now = Utc::now();
        state.set_condition(ConditionType::Degraded, "InvariantViolation", "a", now);
        state.set_condition(ConditionType::Degraded, "InvariantViolation", "b", now);
        assert_eq!(state.conditions.len(), 1);
        assert_eq!(
            state.condition(ConditionType::Degraded).map(|c| c.message.as_str()),
            Some("b")
        );
        state.clear_condition(ConditionType::Degraded);
        assert!(state.conditions.is_empty());
    }
}
