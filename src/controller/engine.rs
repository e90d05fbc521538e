//! Reconcile engine: worker pool, watch fan-in, resync and error policy
//!
//! Watch events and the periodic resync feed one `WorkQueue`. Each worker
//! pops a key, takes the workload lease, runs the reconciler registered for
//! the key's kind and schedules the key again according to the outcome.

use super::backoff::Backoff;
use super::canary::CanaryScheduler;
use super::queue::WorkQueue;
use super::reconcile::{Context, ErrorClass, ObjectRef, ReconcileError, ReconcileOutcome, ResourceKind};
use super::registry::ReconcilerRegistry;
use crate::model::{ConditionType, RolloutState};
use crate::server::ShutdownSignal;
use crate::store::{WatchEvent, WatchKind};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, error, info, warn};

/// How often the canary scheduler looks for due analyses
pub const CANARY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Key a watch event should wake up
///
/// Spec and instance changes drive the rollout; revision and rollout record
/// changes only affect history retention.
pub fn key_for(event: &WatchEvent) -> ObjectRef {
    match event.kind {
        WatchKind::Spec | WatchKind::Instance => ObjectRef::workload(event.workload.as_str()),
        WatchKind::Rollout | WatchKind::Revision => ObjectRef::history(event.workload.as_str()),
    }
}

pub struct Engine {
    ctx: Arc<Context>,
    registry: ReconcilerRegistry,
    queue: Arc<WorkQueue>,
    backoff: Backoff,
}

impl Engine {
    pub fn new(ctx: Arc<Context>, registry: ReconcilerRegistry) -> Self {
        let queue = Arc::new(WorkQueue::new(ctx.config.queue_capacity));
        let backoff = Backoff::new(ctx.config.backoff_base, ctx.config.backoff_cap);
        Engine {
            ctx,
            registry,
            queue,
            backoff,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    fn enqueue(&self, key: ObjectRef, delay: Duration) {
        if let Err(e) = self.queue.add_after(key.clone(), delay) {
            warn!(key = %key, error = %e, "Failed to enqueue");
        }
    }

    /// Enqueue every known workload under both kinds
    pub async fn resync(&self) {
        match self.ctx.store.list_workloads().await {
            Ok(workloads) => {
                debug!(workloads = workloads.len(), "Resync");
                for workload in workloads {
                    self.enqueue(ObjectRef::workload(workload.as_str()), Duration::ZERO);
                    self.enqueue(ObjectRef::history(workload.as_str()), Duration::ZERO);
                }
            }
            Err(e) => warn!(error = %e, "Resync failed to list workloads"),
        }
    }

    /// Run one key through its reconciler and apply the error policy
    ///
    /// The caller must have popped `key` from the queue; it is released here.
    pub async fn process(&self, key: &ObjectRef) {
        let start = Instant::now();
        let result = match self.registry.get(key.kind) {
            Some(reconciler) => {
                let _lease = self.ctx.leases.acquire(&key.workload).await;
                reconciler.reconcile(key, &self.ctx).await
            }
            None => {
                error!(key = %key, "No reconciler registered for kind");
                self.queue.done(key);
                return;
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                self.backoff.reset(&key.to_string());
                if let Some(ref metrics) = self.ctx.metrics {
                    metrics.record_reconciliation_success(key.kind.as_str(), elapsed);
                }
                match outcome {
                    ReconcileOutcome::Requeue { after, reason } => {
                        debug!(key = %key, after_ms = after.as_millis() as u64, reason = %reason, "Requeue");
                        self.enqueue(key.clone(), after);
                    }
                    ReconcileOutcome::Done if key.kind == ResourceKind::Workload => {
                        self.release_if_deleted(&key.workload).await;
                    }
                    ReconcileOutcome::Done => {}
                }
            }
            Err(e) => {
                if let Some(ref metrics) = self.ctx.metrics {
                    metrics.record_reconciliation_error(key.kind.as_str(), elapsed);
                }
                self.handle_error(key, &e).await;
            }
        }

        self.queue.done(key);
        if let Some(ref metrics) = self.ctx.metrics {
            metrics.set_queue_depth(self.queue.len());
        }
    }

    /// Drop the lease slot once a deleted workload has been torn down
    async fn release_if_deleted(&self, workload: &str) {
        match self.ctx.store.get_spec(workload).await {
            Ok(None) => {
                self.ctx.leases.forget(workload);
                debug!(workload = %workload, "Released lease of deleted workload");
            }
            Ok(Some(_)) => {}
            Err(e) => debug!(workload = %workload, error = %e, "Skipping lease release"),
        }
    }

    async fn handle_error(&self, key: &ObjectRef, e: &ReconcileError) {
        match e.class() {
            ErrorClass::Transient | ErrorClass::FatalLocal => {
                let delay = self.backoff.next_delay(&key.to_string());
                warn!(
                    key = %key,
                    error = %e,
                    class = ?e.class(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed, will retry"
                );
                self.enqueue(key.clone(), delay);
                if key.kind == ResourceKind::Workload {
                    self.note_backoff(&key.workload, e, delay).await;
                }
            }
            ErrorClass::Invariant | ErrorClass::Config => {
                error!(
                    key = %key,
                    error = %e,
                    reason = e.reason(),
                    "Reconcile stopped, waiting for resync or a spec change"
                );
                if key.kind == ResourceKind::Workload {
                    self.mark_degraded(&key.workload, e).await;
                }
            }
        }
    }

    /// Record a non-retryable error on the rollout's Degraded condition
    async fn mark_degraded(&self, workload: &str, e: &ReconcileError) {
        let now = self.ctx.clock.now();
        self.update_rollout(workload, "Degraded condition", |state| {
            state.set_condition(ConditionType::Degraded, e.reason(), e.to_string(), now);
        })
        .await;
    }

    /// Surface a backoff through status until the next successful tick
    async fn note_backoff(&self, workload: &str, e: &ReconcileError, delay: Duration) {
        let reason = format!(
            "{} retrying in {}ms: {}",
            e.reason(),
            delay.as_millis(),
            e
        );
        self.update_rollout(workload, "requeue reason", |state| {
            state.last_requeue_reason = Some(reason);
        })
        .await;
    }

    /// Apply `change` to the stored rollout under the workload's lease
    ///
    /// A workload without a rollout record gets a fresh one only while its
    /// spec still exists. Failures are logged, never propagated.
    async fn update_rollout<F>(&self, workload: &str, what: &str, change: F)
    where
        F: FnOnce(&mut RolloutState),
    {
        let _lease = self.ctx.leases.acquire(workload).await;
        let stored = match self.ctx.store.get_rollout(workload).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(workload = %workload, error = %err, what = what, "Failed to read rollout");
                return;
            }
        };
        let (version, old) = match stored {
            Some(s) => (Some(s.version), s.value),
            None => match self.ctx.store.get_spec(workload).await {
                Ok(Some(_)) => (None, RolloutState::new(workload)),
                // Deleted workloads get no new record
                _ => return,
            },
        };

        let mut state = old.clone();
        change(&mut state);
        if state == old && version.is_some() {
            return;
        }
        if let Err(err) = self.ctx.store.put_rollout(state, version).await {
            warn!(workload = %workload, error = %err, what = what, "Failed to record on rollout");
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.pop().await {
            self.process(&key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn watch(self: Arc<Self>, mut events: Receiver<WatchEvent>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                event = events.recv() => match event {
                    Ok(event) => self.enqueue(key_for(&event), Duration::ZERO),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Watch fell behind, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch channel closed");
                        return;
                    }
                },
            }
        }
    }

    /// Run workers, the watch loop, the canary scheduler and the resync timer
    /// until `shutdown` fires, then drain workers and flush the store
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let events = self.ctx.store.subscribe();
        let workers = self.ctx.config.workers.max(1);
        info!(
            workers = workers,
            resync_secs = self.ctx.config.resync_interval.as_secs(),
            "Starting reconcile engine"
        );

        let mut handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(self.clone().worker(id)))
            .collect();
        handles.push(tokio::spawn(self.clone().watch(events, shutdown.clone())));

        let scheduler = CanaryScheduler::new(self.ctx.clone(), self.queue.clone(), CANARY_POLL_INTERVAL);
        handles.push(tokio::spawn(scheduler.run(shutdown.clone())));

        let mut signal = shutdown;
        let mut ticker = tokio::time::interval(self.ctx.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = ticker.tick() => self.resync().await,
            }
        }

        info!("Stopping reconcile engine");
        self.queue.shutdown();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        match self.ctx.store.flush().await {
            Ok(()) => info!("State store flushed"),
            Err(e) => error!(error = %e, "Failed to flush state store"),
        }
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
