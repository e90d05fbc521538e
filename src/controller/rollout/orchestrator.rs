//! Rollout state machine for one workload
//!
//! Every tick re-derives what to do from the stored spec, the stored rollout
//! state and the instances observed right now. Running a tick twice without
//! an upstream change performs no actions the second time.

use super::plan::{
    plan_scale, projected_counts, projected_ready, verify_plan, Observed, ScaleGoal, ScalePlan,
};
use super::status::{compute_counters, is_progress_deadline_exceeded, requeue_interval};
use super::surge::{canary_replicas, SurgeBounds};
use super::traffic::build_backend_weights;
use super::validation::validate_spec;
use crate::controller::canary::start_canary_run;
use crate::controller::cdevents::emit_status_change_event;
use crate::controller::reconcile::{
    Context, ObjectRef, ReconcileError, ReconcileOutcome, Reconciler, ResourceKind,
};
use crate::controller::revision::RevisionManager;
use crate::model::{
    ConditionType, DecisionAction, DecisionReason, DesiredSpec, HealthSignal, InstancePhase,
    InstanceRequest, Phase, RolloutState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Consecutive failed health checks after Ready that mark an instance Failed
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

#[derive(Default)]
struct HealthRecord {
    was_ready: bool,
    misses: u32,
}

/// Remembers per-instance health across ticks
#[derive(Default)]
pub struct HealthTracker {
    records: Mutex<HashMap<String, HashMap<String, HealthRecord>>>,
}

impl HealthTracker {
    /// Record a probe result; true once the instance counts as failed
    pub fn observe(&self, workload: &str, id: &str, signal: HealthSignal) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(workload.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        if signal == HealthSignal::Ready {
            record.was_ready = true;
            record.misses = 0;
        } else if record.was_ready {
            record.misses += 1;
        }
        record.was_ready && record.misses >= HEALTH_FAILURE_THRESHOLD
    }

    /// Drop records of instances that no longer exist
    pub fn retain(&self, workload: &str, live: &HashSet<String>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instances) = records.get_mut(workload) {
            instances.retain(|id, _| live.contains(id));
        }
    }

    pub fn forget(&self, workload: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workload);
    }
}

/// Reconciler for `ResourceKind::Workload`
#[derive(Default)]
pub struct RolloutOrchestrator {
    health: HealthTracker,
}

impl RolloutOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// List instances and probe them all concurrently
    async fn observe(&self, workload: &str, ctx: &Context) -> Result<Vec<Observed>, ReconcileError> {
        let instances = ctx.runtime.list_instances(workload).await?;
        let probes = join_all(
            instances
                .iter()
                .map(|instance| ctx.runtime.instance_health(&instance.id)),
        )
        .await;

        let mut observed = Vec::with_capacity(instances.len());
        for (instance, probe) in instances.iter().zip(probes) {
            let signal = probe?;
            let terminating = instance.phase == InstancePhase::Terminating;
            let unhealthy = self.health.observe(workload, &instance.id, signal);
            if unhealthy && instance.phase != InstancePhase::Failed {
                warn!(
                    workload = %workload,
                    instance = %instance.id,
                    "Instance failed repeated health checks, replacing"
                );
            }
            let failed = instance.phase == InstancePhase::Failed || unhealthy;
            observed.push(Observed {
                id: instance.id.clone(),
                revision: instance.revision.clone(),
                ready: signal == HealthSignal::Ready && !failed && !terminating,
                failed,
                terminating,
            });
        }

        let live: HashSet<String> = observed.iter().map(|o| o.id.clone()).collect();
        self.health.retain(workload, &live);
        Ok(observed)
    }

    /// Create first, then delete; each batch runs concurrently and completes
    /// only when every call has been acknowledged
    async fn dispatch(
        &self,
        spec: &DesiredSpec,
        plan: &ScalePlan,
        ctx: &Context,
    ) -> Result<(), ReconcileError> {
        let mut payloads: HashMap<String, serde_json::Value> = HashMap::new();
        for create in &plan.creates {
            if payloads.contains_key(&create.revision) {
                continue;
            }
            let revision = ctx
                .store
                .get_revision(&spec.workload, &create.revision)
                .await?
                .ok_or_else(|| {
                    ReconcileError::InvariantViolation(format!(
                        "revision {} has no stored template",
                        create.revision
                    ))
                })?;
            payloads.insert(create.revision.clone(), revision.value.template.payload);
        }

        let requests: Vec<InstanceRequest> = plan
            .creates
            .iter()
            .map(|create| InstanceRequest {
                id: create.id.clone(),
                workload: spec.workload.clone(),
                revision: create.revision.clone(),
                payload: payloads
                    .get(&create.revision)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        let created = join_all(requests.iter().map(|r| ctx.runtime.create_instance(r))).await;
        for result in created {
            result?;
        }

        let deleted = join_all(plan.deletes.iter().map(|id| ctx.runtime.delete_instance(id))).await;
        for result in deleted {
            result?;
        }
        Ok(())
    }

    /// Remove everything owned by a workload whose spec was deleted
    async fn teardown(
        &self,
        workload: &str,
        ctx: &Context,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let instances = ctx.runtime.list_instances(workload).await?;
        let deleted = join_all(
            instances
                .iter()
                .map(|instance| ctx.runtime.delete_instance(&instance.id)),
        )
        .await;
        for result in deleted {
            result?;
        }

        let had_rollout = ctx.store.delete_rollout(workload).await?;
        for revision in ctx.store.list_revisions(workload).await? {
            ctx.store.delete_revision(workload, &revision.value.id).await?;
        }
        self.health.forget(workload);

        if had_rollout || !instances.is_empty() {
            info!(
                workload = %workload,
                instances = instances.len(),
                "Spec deleted, tore down workload"
            );
        }
        Ok(ReconcileOutcome::Done)
    }
}

/// Revision whose instances serve at rest
///
/// After an aborted canary the stable revision serves even though the
/// rejected target is still recorded.
pub fn serving_revision(state: &RolloutState) -> Option<&str> {
    match state.phase {
        Phase::RolledBack => state.current_revision.as_deref(),
        _ => state.live_revision(),
    }
}

/// Start an update when the spec names a revision that is not live
///
/// A Failed or RolledBack rollout for the same template holds until the
/// operator changes the template, rolls back or promotes it forward. Paused rollouts pick the
/// change up after resume.
pub fn detect_template_change(
    spec: &DesiredSpec,
    revision_id: &str,
    state: &mut RolloutState,
    now: DateTime<Utc>,
) -> bool {
    if state.phase == Phase::Paused || state.live_revision() == Some(revision_id) {
        return false;
    }

    let canary = spec.policy.canary.as_ref().filter(|_| {
        state
            .current_revision
            .as_deref()
            .is_some_and(|current| current != revision_id)
    });

    state.target_revision = Some(revision_id.to_string());
    state.progress_started_at = Some(now);
    state.paused_from = None;
    state.paused_at = None;

    match canary {
        Some(policy) => {
            let run = start_canary_run(policy, now);
            let weight = run.weight;
            state.canary = Some(run);
            state.traffic_weight = Some(weight);
            state.transition(
                Phase::Analyzing,
                DecisionAction::Start,
                DecisionReason::TemplateChanged,
                format!("canary of revision {} started at {}%", revision_id, weight),
                now,
            );
        }
        None => {
            state.canary = None;
            state.traffic_weight = None;
            state.transition(
                Phase::Progressing,
                DecisionAction::Start,
                DecisionReason::TemplateChanged,
                format!("rolling out revision {}", revision_id),
                now,
            );
        }
    }
    true
}

/// Per-revision replica goals for the current phase, target first
///
/// None means no scaling at all (Paused, Failed).
pub fn scale_goals(state: &RolloutState, desired: u32) -> Option<Vec<ScaleGoal>> {
    let current = state.current_revision.as_deref();
    let target = state.target_revision.as_deref();
    match state.phase {
        Phase::Idle | Phase::Completed | Phase::RolledBack => {
            current.map(|c| vec![ScaleGoal::new(c, desired)])
        }
        Phase::Progressing | Phase::Promoting => target.map(|t| vec![ScaleGoal::new(t, desired)]),
        Phase::Analyzing => match (target, current) {
            (Some(t), Some(c)) => {
                let weight = state.canary.as_ref().map_or(0, |run| run.weight);
                let canary = canary_replicas(desired, weight);
                Some(vec![
                    ScaleGoal::new(t, canary),
                    ScaleGoal::new(c, desired - canary),
                ])
            }
            (Some(t), None) => Some(vec![ScaleGoal::new(t, desired)]),
            _ => None,
        },
        Phase::Paused | Phase::Failed => None,
    }
}

/// Persist, route traffic and emit events for a changed rollout state
///
/// Traffic and CDEvent failures are logged and never fail the tick.
pub async fn publish_state(
    ctx: &Context,
    spec: &DesiredSpec,
    old: Option<&RolloutState>,
    version: Option<u64>,
    state: &RolloutState,
) -> Result<(), ReconcileError> {
    if old == Some(state) {
        return Ok(());
    }
    ctx.store.put_rollout(state.clone(), version).await?;
    announce_state(ctx, spec, old, state).await;
    Ok(())
}

/// Side effects of an already persisted rollout change
pub async fn announce_state(
    ctx: &Context,
    spec: &DesiredSpec,
    old: Option<&RolloutState>,
    state: &RolloutState,
) {
    let before = old.map(build_backend_weights).unwrap_or_default();
    let after = build_backend_weights(state);
    if before != after && !after.is_empty() {
        if let Err(e) = ctx.traffic_router.set_weights(&state.workload, &after).await {
            warn!(workload = %state.workload, error = %e, "Failed to update traffic weights (non-fatal)");
        }
    }
    if let Some(ref metrics) = ctx.metrics {
        let (_, canary) = super::traffic::calculate_traffic_weights(state);
        metrics.set_traffic_weight(&state.workload, canary);
    }

    if let Err(e) = emit_status_change_event(spec, old, state, ctx.cdevents_sink.as_ref()).await {
        warn!(workload = %state.workload, error = %e, "Failed to emit CDEvent (non-fatal)");
    }
}

#[async_trait]
impl Reconciler for RolloutOrchestrator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Workload
    }

    async fn reconcile(
        &self,
        key: &ObjectRef,
        ctx: &Context,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let workload = key.workload.as_str();
        let Some(spec) = ctx.store.get_spec(workload).await? else {
            return self.teardown(workload, ctx).await;
        };
        let spec = spec.value;
        validate_spec(&spec).map_err(ReconcileError::ValidationError)?;

        let revisions = RevisionManager::from_context(ctx);
        let revision = revisions.ensure_revision(&spec).await?;

        let (version, old) = match ctx.store.get_rollout(workload).await? {
            Some(stored) => (Some(stored.version), Some(stored.value)),
            None => (None, None),
        };
        let mut state = old
            .clone()
            .unwrap_or_else(|| RolloutState::new(workload));
        let now = ctx.clock.now();

        let observed = self.observe(workload, ctx).await?;

        if detect_template_change(&spec, &revision.id, &mut state, now) {
            info!(
                workload = %workload,
                revision = %revision.id,
                phase = ?state.phase,
                "Template changed, starting rollout"
            );
        }

        let deadline = spec.policy.progress_deadline_seconds();
        if is_progress_deadline_exceeded(&state, deadline, now) {
            warn!(workload = %workload, deadline_seconds = deadline, "Progress deadline exceeded");
            // A stalled canary stops receiving traffic
            if state.phase == Phase::Analyzing {
                state.traffic_weight = Some(0);
            }
            state.transition(
                Phase::Failed,
                DecisionAction::Fail,
                DecisionReason::Timeout,
                format!("progress deadline of {}s exceeded", deadline),
                now,
            );
        }

        let bounds = SurgeBounds::resolve(&spec.policy, spec.replicas);
        let plan = match scale_goals(&state, spec.replicas) {
            Some(goals) => plan_scale(&observed, &goals, &bounds),
            None => ScalePlan::default(),
        };
        verify_plan(&observed, &plan, &bounds).map_err(ReconcileError::InvariantViolation)?;

        if !plan.is_empty() {
            info!(
                workload = %workload,
                phase = ?state.phase,
                creates = plan.creates.len(),
                deletes = plan.deletes.len(),
                "Scaling instances"
            );
            self.dispatch(&spec, &plan, ctx).await?;
        }

        let counts = projected_counts(&observed, &plan);
        let ready_counts = projected_ready(&observed, &plan);
        complete_if_converged(&mut state, &counts, &ready_counts, &bounds, now);

        let total: u32 = counts.values().sum();
        let ready: u32 = ready_counts.values().sum();
        let updated = serving_revision(&state)
            .and_then(|r| counts.get(r))
            .copied()
            .unwrap_or(0);
        state.counters = compute_counters(total, ready, updated, &bounds);
        state.observed_generation = spec.generation;
        state.clear_condition(ConditionType::Degraded);

        revisions.record_replicas(workload, &counts).await?;

        let converged = plan.is_empty()
            && total == spec.replicas
            && ready == spec.replicas
            && observed.len() as u32 == total;
        let outcome = match requeue_interval(state.phase, converged, &ctx.config) {
            Some(after) => {
                let reason = if state.phase.is_active() || state.phase == Phase::Paused {
                    format!("rollout {}", state.phase)
                } else {
                    "replicas converging".to_string()
                };
                state.last_requeue_reason = Some(reason.clone());
                ReconcileOutcome::requeue(after, reason)
            }
            None => {
                state.last_requeue_reason = None;
                ReconcileOutcome::Done
            }
        };

        publish_state(ctx, &spec, old.as_ref(), version, &state).await?;

        debug!(
            workload = %workload,
            phase = ?state.phase,
            total = total,
            ready = ready,
            "Reconciled workload"
        );
        Ok(outcome)
    }
}

/// Finish the update once the target alone runs desired instances
fn complete_if_converged(
    state: &mut RolloutState,
    counts: &BTreeMap<String, u32>,
    ready_counts: &BTreeMap<String, u32>,
    bounds: &SurgeBounds,
    now: DateTime<Utc>,
) {
    if !matches!(state.phase, Phase::Progressing | Phase::Promoting) {
        return;
    }
    let Some(target) = state.target_revision.clone() else {
        return;
    };

    let target_count = counts.get(&target).copied().unwrap_or(0);
    let others: u32 = counts
        .iter()
        .filter(|(revision, _)| **revision != target)
        .map(|(_, count)| *count)
        .sum();
    let target_ready = ready_counts.get(&target).copied().unwrap_or(0);

    if others == 0 && target_count == bounds.desired && target_ready >= bounds.min_ready() {
        state.current_revision = Some(target.clone());
        state.target_revision = None;
        state.canary = None;
        state.traffic_weight = None;
        state.progress_started_at = None;
        state.transition(
            Phase::Completed,
            DecisionAction::Complete,
            DecisionReason::ReplicasConverged,
            format!("revision {} serving {} replicas", target, bounds.desired),
            now,
        );
    }
}
