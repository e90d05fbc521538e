//! Metric-gated canary analysis
//!
//! While a rollout is Analyzing, every interval each configured metric is
//! queried for the canary revision and range-checked. All passing advances
//! the traffic weight; a failing interval counts toward the failure
//! threshold, and reaching it aborts the canary.

use super::prometheus::build_query;
use super::queue::WorkQueue;
use super::reconcile::{Context, ObjectRef, ReconcileError};
use super::rollout::orchestrator::publish_state;
use super::rollout::validation::parse_duration;
use crate::model::{
    CanaryPolicy, CanaryRun, Decision, DecisionAction, DecisionReason, FailurePolicy,
    MetricSample, MetricSnapshot, Phase, RolloutState,
};
use crate::server::ShutdownSignal;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one analysis interval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanaryDecision {
    /// All metrics passed: raise the weight (or promote at max)
    Advance,
    /// Keep the current weight
    Hold,
    /// Failure threshold reached: weight 0, RolledBack
    Abort,
}

/// Fresh canary run at the first step
pub fn start_canary_run(policy: &CanaryPolicy, now: DateTime<Utc>) -> CanaryRun {
    CanaryRun {
        weight: policy.step_weight.min(policy.max_weight),
        consecutive_failures: 0,
        step_index: 0,
        metrics: policy.metrics.iter().map(|m| m.name.clone()).collect(),
        samples: Vec::new(),
        started_at: now,
        last_evaluated_at: None,
    }
}

/// Decide an interval's outcome from its samples
///
/// Every sample passing is a pass. Any failure extends the failure streak;
/// once the streak reaches `failure_threshold` the canary is aborted.
pub fn evaluate(run: &CanaryRun, samples: &[MetricSample], failure_threshold: u32) -> CanaryDecision {
    if !samples.is_empty() && samples.iter().all(|s| s.passed) {
        return CanaryDecision::Advance;
    }
    if run.consecutive_failures + 1 >= failure_threshold.max(1) {
        CanaryDecision::Abort
    } else {
        CanaryDecision::Hold
    }
}

/// Weight after a passing interval
///
/// Steps by `step` up to `max`; a pass while already at `max` promotes to 100.
pub fn next_weight(weight: u32, step: u32, max: u32) -> u32 {
    if weight >= max {
        100
    } else {
        (weight + step).min(max)
    }
}

pub fn interval(policy: &CanaryPolicy, default: Duration) -> Duration {
    policy
        .interval
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(default)
}

pub fn analysis_window(policy: &CanaryPolicy, default: Duration) -> Duration {
    policy
        .analysis_window
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(default)
}

/// Whether the next sample is due
///
/// The first sample waits for both the warmup and one interval after the
/// canary started; later ones one interval after the previous sample.
pub fn is_evaluation_due(
    run: &CanaryRun,
    interval: Duration,
    warmup: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    let elapsed = |since: DateTime<Utc>| {
        now.signed_duration_since(since)
            .to_std()
            .unwrap_or_default()
    };

    if let Some(warmup) = warmup {
        if elapsed(run.started_at) < warmup {
            return false;
        }
    }
    elapsed(run.last_evaluated_at.unwrap_or(run.started_at)) >= interval
}

/// Apply a decision to the rollout state
///
/// Samples older than the analysis window are dropped. The step index only
/// moves forward, except on abort which resets it.
pub fn apply_decision(
    state: &mut RolloutState,
    policy: &CanaryPolicy,
    decision: CanaryDecision,
    samples: Vec<MetricSample>,
    window: Duration,
    now: DateTime<Utc>,
) {
    let Some(mut run) = state.canary.take() else {
        return;
    };

    let snapshot: BTreeMap<String, MetricSnapshot> = samples
        .iter()
        .map(|s| {
            (
                s.metric.clone(),
                MetricSnapshot {
                    value: s.value,
                    passed: s.passed,
                },
            )
        })
        .collect();

    let cutoff = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    run.samples.extend(samples);
    run.samples.retain(|s| s.timestamp >= cutoff);
    run.last_evaluated_at = Some(now);

    match decision {
        CanaryDecision::Advance => {
            run.consecutive_failures = 0;
            let from = run.weight;
            run.weight = next_weight(run.weight, policy.step_weight, policy.max_weight);
            run.step_index += 1;
            state.traffic_weight = Some(run.weight);
            let weight = run.weight;
            state.canary = Some(run);

            if weight >= 100 {
                state.progress_started_at = Some(now);
                state.transition(
                    Phase::Promoting,
                    DecisionAction::Promotion,
                    DecisionReason::AnalysisPassed,
                    format!("analysis passed at {}%, promoting", from),
                    now,
                );
            } else {
                state.progress_started_at = Some(now);
                let message = format!("canary weight {}% -> {}%", from, weight);
                state.message = Some(message.clone());
                state.record_decision(Decision {
                    timestamp: now,
                    action: DecisionAction::StepAdvance,
                    from: Phase::Analyzing,
                    to: Phase::Analyzing,
                    reason: DecisionReason::AnalysisPassed,
                    message: Some(message),
                    metrics: Some(snapshot.clone()),
                });
            }
        }
        CanaryDecision::Hold => {
            run.consecutive_failures += 1;
            state.message = Some(format!(
                "analysis failed ({}/{} consecutive)",
                run.consecutive_failures,
                policy.failure_threshold()
            ));
            state.canary = Some(run);
        }
        CanaryDecision::Abort => {
            run.consecutive_failures += 1;
            let at = run.weight;
            run.weight = 0;
            run.step_index = 0;
            state.traffic_weight = Some(0);
            state.canary = Some(run);
            state.transition(
                Phase::RolledBack,
                DecisionAction::Rollback,
                DecisionReason::AnalysisFailed,
                format!(
                    "analysis failed {} consecutive times at {}%",
                    policy.failure_threshold(),
                    at
                ),
                now,
            );
        }
    }

    if let Some(last) = state.decisions.last_mut() {
        if last.timestamp == now && last.metrics.is_none() && decision != CanaryDecision::Hold {
            last.metrics = Some(snapshot);
        }
    }
}

/// Query every metric of the policy for the canary revision
///
/// Provider errors follow the failure policy: `Continue` records a passing
/// sample, `Rollback` a failing one. `Pause` returns None so the interval is
/// skipped without counting.
pub async fn collect_samples(
    ctx: &Context,
    policy: &CanaryPolicy,
    workload: &str,
    revision: &str,
    now: DateTime<Utc>,
) -> Option<Vec<MetricSample>> {
    let window = analysis_window(policy, ctx.config.analysis_window);
    let answers = join_all(policy.metrics.iter().map(|metric| async move {
        let query = build_query(&metric.name, metric.query.as_deref(), workload, revision)?;
        ctx.metrics_provider.query(&query, window).await
    }))
    .await;

    let mut samples = Vec::with_capacity(answers.len());
    for (metric, answer) in policy.metrics.iter().zip(answers) {
        let sample = match answer {
            Ok(value) => MetricSample {
                metric: metric.name.clone(),
                value: Some(value),
                passed: metric.passes(value),
                timestamp: now,
            },
            Err(e) => {
                warn!(
                    workload = %workload,
                    metric = %metric.name,
                    error = %e,
                    policy = ?policy.failure_policy(),
                    "Metric query failed"
                );
                match policy.failure_policy() {
                    FailurePolicy::Pause => return None,
                    FailurePolicy::Continue => MetricSample {
                        metric: metric.name.clone(),
                        value: None,
                        passed: true,
                        timestamp: now,
                    },
                    FailurePolicy::Rollback => MetricSample {
                        metric: metric.name.clone(),
                        value: None,
                        passed: false,
                        timestamp: now,
                    },
                }
            }
        };
        if let Some(ref m) = ctx.metrics {
            m.record_canary_sample(workload, &sample.metric, sample.passed);
        }
        samples.push(sample);
    }
    Some(samples)
}

/// Run one analysis interval for a workload if it is due
///
/// Holds the workload's lease for the whole evaluation so it never
/// interleaves with a reconcile of the same workload. Returns the decision
/// taken, or None when nothing was due.
pub async fn evaluate_workload(
    ctx: &Context,
    workload: &str,
) -> Result<Option<CanaryDecision>, ReconcileError> {
    let _lease = ctx.leases.acquire(workload).await;

    let Some(spec) = ctx.store.get_spec(workload).await? else {
        return Ok(None);
    };
    let Some(stored) = ctx.store.get_rollout(workload).await? else {
        return Ok(None);
    };
    let spec = spec.value;
    let (version, old) = (stored.version, stored.value);

    if old.phase != Phase::Analyzing {
        return Ok(None);
    }
    let (Some(policy), Some(run), Some(target)) = (
        spec.policy.canary.as_ref(),
        old.canary.as_ref(),
        old.target_revision.as_deref(),
    ) else {
        return Ok(None);
    };

    let now = ctx.clock.now();
    let every = interval(policy, ctx.config.canary_interval);
    let warmup = policy.warmup.as_deref().and_then(parse_duration);
    if !is_evaluation_due(run, every, warmup, now) {
        return Ok(None);
    }

    // Sample only once the canary instances for this weight are serving
    let expected = super::rollout::surge::canary_replicas(spec.replicas, run.weight);
    let ready = ctx
        .runtime
        .list_instances(workload)
        .await?
        .iter()
        .filter(|i| i.revision == target && i.is_ready())
        .count() as u32;
    if ready < expected {
        debug!(
            workload = %workload,
            ready = ready,
            expected = expected,
            "Canary instances not ready, delaying analysis"
        );
        return Ok(None);
    }

    let mut state = old.clone();
    let decision = match collect_samples(ctx, policy, workload, target, now).await {
        Some(samples) => {
            let decision = evaluate(run, &samples, policy.failure_threshold());
            let window = analysis_window(policy, ctx.config.analysis_window);
            apply_decision(&mut state, policy, decision, samples, window, now);
            decision
        }
        None => {
            if let Some(run) = state.canary.as_mut() {
                run.last_evaluated_at = Some(now);
            }
            state.message = Some("metrics provider unavailable, holding canary".to_string());
            CanaryDecision::Hold
        }
    };

    info!(
        workload = %workload,
        decision = ?decision,
        weight = state.traffic_weight.unwrap_or(0),
        phase = ?state.phase,
        "Canary analysis"
    );

    publish_state(ctx, &spec, Some(&old), Some(version), &state).await?;
    Ok(Some(decision))
}

/// Timer that drives canary analysis for every Analyzing workload
pub struct CanaryScheduler {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    poll: Duration,
}

impl CanaryScheduler {
    pub fn new(ctx: Arc<Context>, queue: Arc<WorkQueue>, poll: Duration) -> Self {
        CanaryScheduler { ctx, queue, poll }
    }

    /// One pass over all workloads; workloads whose state changed are
    /// enqueued so the orchestrator rescales them
    pub async fn tick(&self) {
        let workloads = match self.ctx.store.list_workloads().await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "Canary scheduler failed to list workloads");
                return;
            }
        };

        let results = join_all(workloads.iter().map(|w| evaluate_workload(&self.ctx, w))).await;
        for (workload, result) in workloads.iter().zip(results) {
            match result {
                Ok(Some(_)) => {
                    if let Err(e) = self.queue.add(ObjectRef::workload(workload.as_str())) {
                        warn!(workload = %workload, error = %e, "Failed to enqueue after analysis");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(workload = %workload, error = %e, "Canary analysis failed"),
            }
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Canary scheduler stopping");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
