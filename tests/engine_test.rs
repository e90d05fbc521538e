//! End-to-end runs of the reconcile engine with short timers

#![allow(clippy::unwrap_used, clippy::expect_used)]

use kulku::config::ControllerConfig;
use kulku::controller::clock::SystemClock;
use kulku::controller::{Context, ControlPlane, Engine, ReconcilerRegistry, RolloutStatus};
use kulku::model::{DesiredSpec, FieldOwner, Phase, RevisionRef, Template, UpdatePolicy};
use kulku::runtime::SimulatedRuntime;
use kulku::server::{shutdown_channel, ShutdownController};
use kulku::store::{MemoryStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Daemon {
    store: Arc<MemoryStore>,
    runtime: Arc<SimulatedRuntime>,
    control: ControlPlane,
    stop: ShutdownController,
    engine: JoinHandle<()>,
}

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        resync_interval: Duration::from_millis(50),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(100),
        active_requeue: Duration::from_millis(10),
        paused_requeue: Duration::from_millis(50),
        ..ControllerConfig::default()
    }
}

fn start(store: MemoryStore) -> Daemon {
    let store = Arc::new(store);
    let runtime = Arc::new(SimulatedRuntime::new().with_bus(store.bus()));
    let ctx = Arc::new(Context::new(
        store.clone(),
        runtime.clone(),
        Arc::new(SystemClock),
        fast_config(),
    ));
    let engine = Arc::new(Engine::new(ctx.clone(), ReconcilerRegistry::standard()));
    let control = ControlPlane::new(ctx).with_queue(engine.queue());
    let (stop, signal) = shutdown_channel();
    let engine = tokio::spawn(engine.run(signal));
    Daemon {
        store,
        runtime,
        control,
        stop,
        engine,
    }
}

impl Daemon {
    /// Poll status until `done` holds, failing after five seconds
    async fn wait_for<F>(&self, workload: &str, done: F) -> RolloutStatus
    where
        F: Fn(&RolloutStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(status) = self.control.status(workload).await {
                if done(&status) {
                    return status;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workload {} did not reach the expected state",
                workload
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) -> Arc<MemoryStore> {
        self.stop.shutdown();
        tokio::time::timeout(Duration::from_secs(2), self.engine)
            .await
            .expect("engine should stop after shutdown")
            .unwrap();
        self.store
    }
}

fn web(hash: &str) -> DesiredSpec {
    DesiredSpec {
        workload: "web".to_string(),
        replicas: 6,
        template: Template::new(hash, serde_json::json!({ "image": format!("web:{}", hash) })),
        policy: UpdatePolicy {
            max_surge: Some("1".to_string()),
            max_unavailable: Some("1".to_string()),
            ..UpdatePolicy::default()
        },
        ownership: Default::default(),
        generation: 0,
    }
}

fn completed_on(revision: &'static str) -> impl Fn(&RolloutStatus) -> bool {
    move |s| {
        s.rollout.phase == Phase::Completed && s.rollout.current_revision.as_deref() == Some(revision)
    }
}

#[tokio::test]
async fn test_update_rollback_and_delete() {
    let daemon = start(MemoryStore::new());

    daemon.control.put_spec(web("a"), FieldOwner::Operator).await.unwrap();
    daemon.wait_for("web", completed_on("web-a")).await;
    assert_eq!(daemon.runtime.revision_counts("web").get("web-a"), Some(&6));

    daemon.control.put_spec(web("b"), FieldOwner::Operator).await.unwrap();
    let status = daemon.wait_for("web", completed_on("web-b")).await;
    assert_eq!(status.generation, 2);
    let counts = daemon.runtime.revision_counts("web");
    assert_eq!(counts.get("web-b"), Some(&6));
    assert_eq!(counts.get("web-a"), None);

    daemon
        .control
        .rollback("web", &RevisionRef::Previous)
        .await
        .unwrap();
    daemon.wait_for("web", completed_on("web-a")).await;
    assert_eq!(daemon.runtime.revision_counts("web").get("web-a"), Some(&6));
    assert_eq!(daemon.store.list_revisions("web").await.unwrap().len(), 2);

    daemon.control.delete_spec("web").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while daemon.runtime.instance_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "instances were not torn down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    daemon.stop().await;
}

#[tokio::test]
async fn test_pause_holds_rollout_until_resume() {
    let daemon = start(MemoryStore::new());
    daemon.control.put_spec(web("a"), FieldOwner::Operator).await.unwrap();
    daemon.wait_for("web", completed_on("web-a")).await;

    // Keep the update in flight long enough to pause it
    daemon
        .runtime
        .set_revision_health("web-b", kulku::model::HealthSignal::NotReady);
    daemon.control.put_spec(web("b"), FieldOwner::Operator).await.unwrap();
    daemon
        .wait_for("web", |s| s.rollout.phase == Phase::Progressing)
        .await;
    daemon.control.pause("web").await.unwrap();

    daemon.runtime.clear_revision_health("web-b");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = daemon.control.status("web").await.unwrap();
    assert_eq!(status.rollout.phase, Phase::Paused);
    assert_ne!(daemon.runtime.revision_counts("web").get("web-b"), Some(&6));

    daemon.control.resume("web").await.unwrap();
    daemon.wait_for("web", completed_on("web-b")).await;

    daemon.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let daemon = start(MemoryStore::open(&path).unwrap());
    daemon.control.put_spec(web("a"), FieldOwner::Operator).await.unwrap();
    daemon.wait_for("web", completed_on("web-a")).await;
    daemon.stop().await;
    assert!(path.exists());

    let restored = MemoryStore::open(&path).unwrap();
    let spec = restored.get_spec("web").await.unwrap().unwrap().value;
    assert_eq!(spec.template.hash, "a");
    let rollout = restored.get_rollout("web").await.unwrap().unwrap().value;
    assert_eq!(rollout.phase, Phase::Completed);
    assert_eq!(restored.list_revisions("web").await.unwrap().len(), 1);
}
