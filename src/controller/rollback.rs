//! Rollback to an earlier revision
//!
//! A rollback is an ordinary rolling update with the endpoints swapped: the
//! chosen revision's template is written back into the spec and the rollout
//! enters Progressing towards it. Scaling then follows the same surge and
//! unavailability bounds as any forward rollout.

use super::control::ControlError;
use super::reconcile::Context;
use super::revision::{RevisionError, RevisionManager};
use super::rollout::orchestrator::{announce_state, serving_revision};
use crate::model::{
    DecisionAction, DecisionReason, FieldOwner, Phase, RevisionRef, RolloutState, SpecField,
};
use tracing::{error, info};

pub struct RollbackManager<'a> {
    ctx: &'a Context,
}

impl<'a> RollbackManager<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        RollbackManager { ctx }
    }

    /// Roll `workload` to the revision named by `reference`
    ///
    /// `Previous` resolves against the revision serving right now, so two
    /// consecutive `Previous` rollbacks return to where they started.
    pub async fn rollback_to(
        &self,
        workload: &str,
        reference: &RevisionRef,
    ) -> Result<RolloutState, ControlError> {
        let ctx = self.ctx;
        let _lease = ctx.leases.acquire(workload).await;

        let stored_spec = ctx
            .store
            .get_spec(workload)
            .await?
            .ok_or_else(|| ControlError::WorkloadNotFound(workload.to_string()))?;
        let stored = ctx
            .store
            .get_rollout(workload)
            .await?
            .ok_or_else(|| ControlError::NoActiveRollout {
                workload: workload.to_string(),
                phase: Phase::Idle,
            })?;
        let old = stored.value;

        let live = serving_revision(&old).map(str::to_string);
        let revision = RevisionManager::from_context(ctx)
            .resolve(workload, reference, live.as_deref())
            .await
            .map_err(|e| match e {
                RevisionError::NotFound { .. } => ControlError::InvalidRevision(e.to_string()),
                other => ControlError::Revision(other),
            })?;
        if old.live_revision() == Some(revision.id.as_str()) {
            return Err(ControlError::InvalidRevision(format!(
                "revision {} is already the rollout target",
                revision.id
            )));
        }

        stored_spec
            .value
            .ownership
            .check(SpecField::Template, FieldOwner::Operator)?;

        let mut spec = stored_spec.value;
        spec.template = revision.template.clone();
        spec.generation += 1;

        let now = ctx.clock.now();
        let mut state = old.clone();
        state.current_revision = live.clone();
        state.target_revision = Some(revision.id.clone());
        state.canary = None;
        state.traffic_weight = None;
        state.paused_from = None;
        state.paused_at = None;
        state.progress_started_at = Some(now);
        state.transition(
            Phase::Progressing,
            DecisionAction::Rollback,
            DecisionReason::ManualRollback,
            format!(
                "rolling back from {} to revision {} (sequence {})",
                live.as_deref().unwrap_or("none"),
                revision.id,
                revision.sequence
            ),
            now,
        );

        // Rollout record first; a rejected spec write restores it
        let written = ctx.store.put_rollout(state.clone(), Some(stored.version)).await?;
        if let Err(e) = ctx
            .store
            .put_spec(spec.clone(), Some(stored_spec.version))
            .await
        {
            if let Err(revert) = ctx.store.put_rollout(old.clone(), Some(written)).await {
                error!(
                    workload = %workload,
                    error = %revert,
                    "Failed to restore rollout after rejected rollback"
                );
            }
            return Err(e.into());
        }
        announce_state(ctx, &spec, Some(&old), &state).await;

        info!(
            workload = %workload,
            from = ?live,
            to = %revision.id,
            "Rollback started"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{spec, Harness};
    use crate::model::{FieldOwner, Template};
    use crate::store::StateStore;

    async fn two_revisions(h: &Harness) {
        h.apply(spec("web", 4, "a")).await;
        h.settle("web", 20).await;
        h.apply(spec("web", 4, "b")).await;
        h.settle("web", 20).await;
        assert_eq!(h.state("web").await.current_revision.as_deref(), Some("web-b"));
    }

    #[tokio::test]
    async fn test_failed_spec_write_leaves_rollout_untouched() {
        let h = Harness::new();
        two_revisions(&h).await;
        let before = h.state("web").await;

        h.store.fail_next_spec_writes(1);
        let err = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Store(ref e) if e.is_transient()));

        assert_eq!(h.state("web").await, before);
        let spec = h.store.get_spec("web").await.unwrap().unwrap().value;
        assert_eq!(spec.template.hash, "b");

        let actions = h.runtime.action_count();
        h.tick("web").await.unwrap();
        assert_eq!(h.runtime.action_count(), actions);
        assert_eq!(h.state("web").await.phase, Phase::Completed);

        // A retry goes through as an ordinary rollback
        let state = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap();
        assert_eq!(state.phase, Phase::Progressing);
        assert_eq!(state.target_revision.as_deref(), Some("web-a"));
    }

    #[tokio::test]
    async fn test_rollback_previous_is_symmetric() {
        let h = Harness::new();
        two_revisions(&h).await;

        let state = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap();
        assert_eq!(state.phase, Phase::Progressing);
        assert_eq!(state.target_revision.as_deref(), Some("web-a"));
        assert_eq!(state.decisions.last().unwrap().reason, DecisionReason::ManualRollback);

        h.settle("web", 20).await;
        let spec_a = h.store.get_spec("web").await.unwrap().unwrap().value;
        assert_eq!(spec_a.template.hash, "a");
        assert_eq!(h.runtime.revision_counts("web").get("web-a"), Some(&4));
        assert_eq!(h.state("web").await.current_revision.as_deref(), Some("web-a"));

        // Rolling back again returns to the revision live before the first rollback
        RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap();
        h.settle("web", 20).await;
        let spec_b = h.store.get_spec("web").await.unwrap().unwrap().value;
        assert_eq!(spec_b.template, Template::new("b", serde_json::json!({ "image": "web:b" })));
        assert_eq!(spec_b.replicas, 4);
        let counts = h.runtime.revision_counts("web");
        assert_eq!(counts.get("web-b"), Some(&4));
        assert_eq!(counts.get("web-a"), None);

        // Rollbacks reuse revisions instead of minting new ones
        assert_eq!(h.store.list_revisions("web").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_by_sequence() {
        let h = Harness::new();
        two_revisions(&h).await;

        let state = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Sequence(1))
            .await
            .unwrap();
        assert_eq!(state.target_revision.as_deref(), Some("web-a"));
    }

    #[tokio::test]
    async fn test_rollback_to_live_revision_rejected() {
        let h = Harness::new();
        two_revisions(&h).await;

        let err = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Id("web-b".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRevision(_)));
        assert_eq!(err.exit_code(), 3);

        let err = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Sequence(7))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRevision(_)));
    }

    #[tokio::test]
    async fn test_rollback_without_history_is_invalid() {
        let h = Harness::new();
        h.apply(spec("web", 2, "a")).await;
        h.settle("web", 5).await;

        let err = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRevision(_)));
    }

    #[tokio::test]
    async fn test_rollback_unknown_workload() {
        let h = Harness::new();
        let err = RollbackManager::new(&h.ctx)
            .rollback_to("nope", &RevisionRef::Previous)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_rollback_respects_template_owner() {
        let h = Harness::new();
        two_revisions(&h).await;

        let stored = h.store.get_spec("web").await.unwrap().unwrap();
        let mut owned = stored.value;
        owned.ownership.assign(SpecField::Template, FieldOwner::RolloutController);
        h.store.put_spec(owned, Some(stored.version)).await.unwrap();

        let err = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Ownership(_)));
        assert_eq!(h.state("web").await.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn test_rollback_from_failed_rollout() {
        let h = Harness::new();
        let mut desired = spec("web", 3, "a");
        desired.policy.progress_deadline_seconds = Some(30);
        h.apply(desired.clone()).await;
        h.settle("web", 5).await;

        h.runtime
            .set_revision_health("web-b", crate::model::HealthSignal::NotReady);
        desired.template = Template::new("b", serde_json::Value::Null);
        h.apply(desired).await;
        h.tick("web").await.unwrap();
        h.clock.advance(std::time::Duration::from_secs(31));
        h.tick("web").await.unwrap();
        assert_eq!(h.state("web").await.phase, Phase::Failed);

        let state = RollbackManager::new(&h.ctx)
            .rollback_to("web", &RevisionRef::Previous)
            .await
            .unwrap();
        assert_eq!(state.target_revision.as_deref(), Some("web-a"));

        h.settle("web", 20).await;
        let state = h.state("web").await;
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.current_revision.as_deref(), Some("web-a"));
        assert_eq!(h.runtime.revision_counts("web").get("web-b"), None);
    }
}
