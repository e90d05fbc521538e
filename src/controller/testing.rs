//! Shared fixtures for controller tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::cdevents::MockEventSink;
use super::clock::MockClock;
use super::control::ControlPlane;
use super::prometheus::MockMetricsProvider;
use super::reconcile::{Context, ObjectRef, ReconcileError, ReconcileOutcome, Reconciler};
use super::rollout::traffic::MockTrafficRouter;
use super::rollout::RolloutOrchestrator;
use crate::config::ControllerConfig;
use crate::model::{CanaryPolicy, DesiredSpec, RolloutState, Template, UpdatePolicy};
use crate::runtime::SimulatedRuntime;
use crate::store::{MemoryStore, StateStore};
use chrono::{TimeZone, Utc};
use std::sync::Arc;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<SimulatedRuntime>,
    pub clock: Arc<MockClock>,
    pub provider: Arc<MockMetricsProvider>,
    pub router: Arc<MockTrafficRouter>,
    pub sink: Arc<MockEventSink>,
    pub ctx: Context,
    pub orchestrator: RolloutOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(SimulatedRuntime::new());
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let provider = Arc::new(MockMetricsProvider::new(0.0));
        let router = Arc::new(MockTrafficRouter::new());
        let sink = Arc::new(MockEventSink::new());

        let ctx = Context::new(
            store.clone(),
            runtime.clone(),
            clock.clone(),
            ControllerConfig::default(),
        )
        .with_metrics_provider(provider.clone())
        .with_traffic_router(router.clone())
        .with_cdevents_sink(sink.clone());

        Harness {
            store,
            runtime,
            clock,
            provider,
            router,
            sink,
            ctx,
            orchestrator: RolloutOrchestrator::new(),
        }
    }

    /// Write a spec the way the ingestion path does, bumping the generation
    pub async fn apply(&self, mut spec: DesiredSpec) {
        let existing = self.store.get_spec(&spec.workload).await.unwrap();
        spec.generation = existing.as_ref().map_or(1, |s| s.value.generation + 1);
        self.store
            .put_spec(spec, existing.map(|s| s.version))
            .await
            .unwrap();
    }

    pub async fn tick(&self, workload: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let key = ObjectRef::workload(workload);
        let _lease = self.ctx.leases.acquire(workload).await;
        self.orchestrator.reconcile(&key, &self.ctx).await
    }

    /// Tick until the rollout is at rest or `max` ticks have run
    pub async fn settle(&self, workload: &str, max: usize) -> usize {
        for n in 1..=max {
            let outcome = self.tick(workload).await.unwrap();
            if outcome == ReconcileOutcome::Done {
                return n;
            }
        }
        max
    }

    /// Control plane sharing this harness's collaborators and leases
    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(Arc::new(self.ctx.clone()))
    }

    pub async fn state(&self, workload: &str) -> RolloutState {
        self.store
            .get_rollout(workload)
            .await
            .unwrap()
            .expect("rollout state should exist")
            .value
    }
}

pub fn spec(workload: &str, replicas: u32, hash: &str) -> DesiredSpec {
    DesiredSpec {
        workload: workload.to_string(),
        replicas,
        template: Template::new(hash, serde_json::json!({ "image": format!("{}:{}", workload, hash) })),
        policy: UpdatePolicy::default(),
        ownership: Default::default(),
        generation: 0,
    }
}

pub fn rolling_spec(workload: &str, replicas: u32, hash: &str, surge: &str, unavailable: &str) -> DesiredSpec {
    let mut s = spec(workload, replicas, hash);
    s.policy.max_surge = Some(surge.to_string());
    s.policy.max_unavailable = Some(unavailable.to_string());
    s
}

pub fn canary_policy() -> CanaryPolicy {
    serde_yaml::from_str(
        r#"
stepWeight: 10
maxWeight: 50
interval: 1m
failureThreshold: 5
metrics:
  - name: error-rate
    max: 5.0
"#,
    )
    .unwrap()
}

pub fn canary_spec(workload: &str, replicas: u32, hash: &str) -> DesiredSpec {
    let mut s = spec(workload, replicas, hash);
    s.policy.canary = Some(canary_policy());
    s
}
