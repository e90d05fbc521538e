//! Operator control surface
//!
//! `ControlPlane` is the one entry point for ingestion (put/delete spec) and
//! for the operator verbs (status, pause, resume, promote, rollback). The
//! HTTP API and the CLI are thin wrappers around it.

use super::queue::WorkQueue;
use super::reconcile::{Context, ObjectRef, ReconcileError};
use super::revision::RevisionError;
use super::rollback::RollbackManager;
use super::rollout::orchestrator::publish_state;
use super::rollout::status::exclude_paused_time;
use super::rollout::validation::validate_spec;
use crate::model::{
    DecisionAction, DecisionReason, DesiredSpec, FieldOwner, OwnershipError, Phase, RevisionRef,
    RolloutState, SpecField,
};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    #[error("workload {workload} has no active rollout (phase {phase})")]
    NoActiveRollout { workload: String, phase: Phase },

    #[error("invalid target revision: {0}")]
    InvalidRevision(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Revision(RevisionError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl ControlError {
    /// Process exit code reported by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlError::NoActiveRollout { .. } => 2,
            ControlError::InvalidRevision(_) => 3,
            ControlError::WorkloadNotFound(_) => 4,
            _ => 1,
        }
    }

    /// Short machine-readable tag used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::WorkloadNotFound(_) => "WORKLOAD_NOT_FOUND",
            ControlError::NoActiveRollout { .. } => "NO_ACTIVE_ROLLOUT",
            ControlError::InvalidRevision(_) => "INVALID_REVISION",
            ControlError::InvalidSpec(_) => "INVALID_SPEC",
            ControlError::Ownership(_) => "FIELD_OWNED",
            ControlError::Store(e) if e.is_transient() => "STORE_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// What `status` reports for one workload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub workload: String,
    pub desired_replicas: u32,
    pub generation: u64,
    pub strategy: String,
    pub rollout: RolloutState,
}

impl RolloutStatus {
    fn new(spec: &DesiredSpec, rollout: RolloutState) -> Self {
        RolloutStatus {
            workload: spec.workload.clone(),
            desired_replicas: spec.replicas,
            generation: spec.generation,
            strategy: spec.policy.strategy_name().to_string(),
            rollout,
        }
    }
}

pub struct ControlPlane {
    ctx: Arc<Context>,
    queue: Option<Arc<WorkQueue>>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<Context>) -> Self {
        ControlPlane { ctx, queue: None }
    }

    /// Enqueue the workload after every accepted change
    pub fn with_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn kick(&self, workload: &str) {
        if let Some(ref queue) = self.queue {
            if let Err(e) = queue.add(ObjectRef::workload(workload)) {
                warn!(workload = %workload, error = %e, "Failed to enqueue after control action");
            }
        }
    }

    pub async fn status(&self, workload: &str) -> Result<RolloutStatus, ControlError> {
        let spec = self
            .ctx
            .store
            .get_spec(workload)
            .await?
            .ok_or_else(|| ControlError::WorkloadNotFound(workload.to_string()))?;
        let rollout = self
            .ctx
            .store
            .get_rollout(workload)
            .await?
            .map(|r| r.value)
            .unwrap_or_else(|| RolloutState::new(workload));
        Ok(RolloutStatus::new(&spec.value, rollout))
    }

    pub async fn list(&self) -> Result<Vec<RolloutStatus>, ControlError> {
        let mut out = Vec::new();
        for workload in self.ctx.store.list_workloads().await? {
            match self.status(&workload).await {
                Ok(status) => out.push(status),
                // Deleted between list and get
                Err(ControlError::WorkloadNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Stop scaling an active rollout; health keeps being observed
    pub async fn pause(&self, workload: &str) -> Result<RolloutStatus, ControlError> {
        self.mutate(workload, |state, now| {
            if !state.phase.is_active() {
                return Err(state.phase);
            }
            state.paused_from = Some(state.phase);
            state.paused_at = Some(now);
            state.transition(
                Phase::Paused,
                DecisionAction::Pause,
                DecisionReason::ManualPause,
                "paused by operator",
                now,
            );
            Ok(())
        })
        .await
    }

    /// Return to the phase the rollout was paused in
    ///
    /// The time spent paused does not count toward the progress deadline.
    pub async fn resume(&self, workload: &str) -> Result<RolloutStatus, ControlError> {
        self.mutate(workload, |state, now| {
            if state.phase != Phase::Paused {
                return Err(state.phase);
            }
            exclude_paused_time(state, now);
            let to = state.paused_from.take().unwrap_or(Phase::Progressing);
            state.transition(
                to,
                DecisionAction::Resume,
                DecisionReason::ManualResume,
                format!("resumed by operator into {}", to),
                now,
            );
            Ok(())
        })
        .await
    }

    /// Skip the remaining canary steps and promote the target to 100%
    ///
    /// On a Failed or RolledBack rollout this is the operator roll-forward:
    /// the recorded target is rolled out again from a fresh deadline,
    /// without canary analysis.
    pub async fn promote(&self, workload: &str) -> Result<RolloutStatus, ControlError> {
        self.mutate(workload, |state, now| match state.phase {
            Phase::Analyzing => {
                if let Some(run) = state.canary.as_mut() {
                    run.weight = 100;
                }
                state.traffic_weight = Some(100);
                state.progress_started_at = Some(now);
                state.transition(
                    Phase::Promoting,
                    DecisionAction::Promotion,
                    DecisionReason::ManualPromotion,
                    "promoted by operator",
                    now,
                );
                Ok(())
            }
            Phase::Failed | Phase::RolledBack => {
                let Some(target) = state.target_revision.clone() else {
                    return Err(state.phase);
                };
                state.canary = None;
                state.traffic_weight = None;
                state.progress_started_at = Some(now);
                state.paused_from = None;
                state.paused_at = None;
                state.transition(
                    Phase::Progressing,
                    DecisionAction::Start,
                    DecisionReason::ManualPromotion,
                    format!("rolling forward to revision {}", target),
                    now,
                );
                Ok(())
            }
            phase => Err(phase),
        })
        .await
    }

    pub async fn rollback(
        &self,
        workload: &str,
        reference: &RevisionRef,
    ) -> Result<RolloutStatus, ControlError> {
        RollbackManager::new(&self.ctx)
            .rollback_to(workload, reference)
            .await?;
        self.kick(workload);
        self.status(workload).await
    }

    /// Accept a desired spec from `writer`
    ///
    /// Returns the stored generation. Re-submitting an identical spec is a
    /// no-op. Fields claimed by another writer must come back unchanged.
    pub async fn put_spec(
        &self,
        mut spec: DesiredSpec,
        writer: FieldOwner,
    ) -> Result<u64, ControlError> {
        validate_spec(&spec).map_err(ControlError::InvalidSpec)?;

        let existing = self.ctx.store.get_spec(&spec.workload).await?;
        let version = existing.as_ref().map(|s| s.version);
        match existing {
            Some(stored) => {
                let current = stored.value;
                if writer != FieldOwner::Operator {
                    spec.ownership = current.ownership.clone();
                }
                let changed = [
                    (SpecField::Replicas, spec.replicas != current.replicas),
                    (SpecField::Template, spec.template != current.template),
                    (SpecField::Policy, spec.policy != current.policy),
                ];
                for (field, differs) in changed {
                    if differs {
                        current.ownership.check(field, writer)?;
                    }
                }
                if changed.iter().all(|(_, differs)| !differs)
                    && spec.ownership == current.ownership
                {
                    return Ok(current.generation);
                }
                spec.generation = current.generation + 1;
            }
            None => spec.generation = 1,
        }

        let generation = spec.generation;
        let workload = spec.workload.clone();
        self.ctx.store.put_spec(spec, version).await?;
        info!(
            workload = %workload,
            generation = generation,
            writer = ?writer,
            "Accepted desired spec"
        );
        self.kick(&workload);
        Ok(generation)
    }

    /// Remove a workload; the next reconcile tears its instances down
    pub async fn delete_spec(&self, workload: &str) -> Result<(), ControlError> {
        if !self.ctx.store.delete_spec(workload).await? {
            return Err(ControlError::WorkloadNotFound(workload.to_string()));
        }
        info!(workload = %workload, "Deleted desired spec");
        self.kick(workload);
        Ok(())
    }

    /// Apply `change` to the stored rollout under the workload's lease
    ///
    /// `change` returns the offending phase when the verb does not apply.
    async fn mutate<F>(&self, workload: &str, change: F) -> Result<RolloutStatus, ControlError>
    where
        F: FnOnce(&mut RolloutState, chrono::DateTime<chrono::Utc>) -> Result<(), Phase>,
    {
        {
            let ctx = &self.ctx;
            let _lease = ctx.leases.acquire(workload).await;

            let spec = ctx
                .store
                .get_spec(workload)
                .await?
                .ok_or_else(|| ControlError::WorkloadNotFound(workload.to_string()))?
                .value;
            let Some(stored) = ctx.store.get_rollout(workload).await? else {
                return Err(ControlError::NoActiveRollout {
                    workload: workload.to_string(),
                    phase: Phase::Idle,
                });
            };

            let mut state = stored.value.clone();
            change(&mut state, ctx.clock.now()).map_err(|phase| ControlError::NoActiveRollout {
                workload: workload.to_string(),
                phase,
            })?;
            publish_state(ctx, &spec, Some(&stored.value), Some(stored.version), &state).await?;
            info!(
                workload = %workload,
                from = ?stored.value.phase,
                to = ?state.phase,
                "Control action applied"
            );
        }
        self.kick(workload);
        self.status(workload).await
    }
}

#[cfg(test)]
#[path = "control_test.rs"]
mod tests;
