#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::controller::testing::{rolling_spec, spec, Harness};
use crate::model::{ConditionType, Phase};
use crate::store::{ChangeType, StateStore};

fn engine(h: &Harness) -> Engine {
    Engine::new(Arc::new(h.ctx.clone()), ReconcilerRegistry::standard())
}

async fn run_once(engine: &Engine, key: ObjectRef) {
    engine.queue().add(key.clone()).unwrap();
    let popped = engine.queue().pop().await.unwrap();
    assert_eq!(popped, key);
    engine.process(&popped).await;
}

#[test]
fn test_key_for_routes_by_watch_kind() {
    let event = |kind| WatchEvent::new(kind, "web", "x", ChangeType::Modified);
    assert_eq!(key_for(&event(WatchKind::Spec)), ObjectRef::workload("web"));
    assert_eq!(key_for(&event(WatchKind::Instance)), ObjectRef::workload("web"));
    assert_eq!(key_for(&event(WatchKind::Rollout)), ObjectRef::history("web"));
    assert_eq!(key_for(&event(WatchKind::Revision)), ObjectRef::history("web"));
}

#[tokio::test]
async fn test_active_rollout_is_requeued() {
    let h = Harness::new();
    let engine = engine(&h);
    h.apply(spec("web", 3, "a")).await;

    run_once(&engine, ObjectRef::workload("web")).await;

    assert_eq!(h.state("web").await.phase, Phase::Progressing);
    assert_eq!(engine.queue().len(), 1);
}

#[tokio::test]
async fn test_converged_workload_is_not_requeued() {
    let h = Harness::new();
    let engine = engine(&h);
    h.apply(spec("web", 3, "a")).await;
    h.settle("web", 5).await;

    run_once(&engine, ObjectRef::workload("web")).await;

    assert_eq!(h.state("web").await.phase, Phase::Completed);
    assert!(engine.queue().is_empty());
}

#[tokio::test]
async fn test_transient_error_backs_off_then_resets() {
    let h = Harness::new();
    let engine = engine(&h);
    h.apply(spec("web", 3, "a")).await;
    let key = ObjectRef::workload("web");

    h.store.set_unavailable(true);
    run_once(&engine, key.clone()).await;
    assert_eq!(engine.backoff().failures("workload/web"), 1);
    assert_eq!(engine.queue().len(), 1);

    engine.process(&key).await;
    assert_eq!(engine.backoff().failures("workload/web"), 2);

    h.store.set_unavailable(false);
    engine.process(&key).await;
    assert_eq!(engine.backoff().failures("workload/web"), 0);
    assert_eq!(h.state("web").await.phase, Phase::Progressing);

    // While backing off, status names the failure instead of the last good tick
    h.runtime.fail_next_calls(1);
    engine.process(&key).await;
    assert_eq!(engine.backoff().failures("workload/web"), 1);
    let status = h.control().status("web").await.unwrap();
    let reason = status.rollout.last_requeue_reason.unwrap();
    assert!(reason.starts_with("RuntimeError retrying in"), "{}", reason);

    // Recovered and converged: nothing left to wait for
    engine.process(&key).await;
    let status = h.control().status("web").await.unwrap();
    assert_eq!(status.rollout.phase, Phase::Completed);
    assert_eq!(status.rollout.last_requeue_reason, None);
}

#[tokio::test]
async fn test_invalid_spec_marks_degraded_without_retry() {
    let h = Harness::new();
    let engine = engine(&h);
    h.apply(rolling_spec("web", 3, "a", "lots", "0")).await;

    run_once(&engine, ObjectRef::workload("web")).await;

    let state = h.state("web").await;
    let degraded = state.condition(ConditionType::Degraded).unwrap();
    assert_eq!(degraded.reason, "InvalidSpec");
    assert!(engine.queue().is_empty());
    assert_eq!(engine.backoff().failures("workload/web"), 0);
    assert_eq!(h.runtime.action_count(), 0);

    // A corrected spec clears the condition on the next pass
    h.apply(spec("web", 3, "a")).await;
    run_once(&engine, ObjectRef::workload("web")).await;
    assert!(h.state("web").await.condition(ConditionType::Degraded).is_none());
}

#[tokio::test]
async fn test_degraded_skipped_for_deleted_workload() {
    let h = Harness::new();
    let engine = engine(&h);
    let err = ReconcileError::InvariantViolation("boom".to_string());

    engine.mark_degraded("gone", &err).await;
    assert!(h.store.get_rollout("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resync_enqueues_both_kinds() {
    let h = Harness::new();
    let engine = engine(&h);
    h.apply(spec("web", 1, "a")).await;
    h.apply(spec("api", 1, "a")).await;

    engine.resync().await;
    assert_eq!(engine.queue().len(), 4);

    // Coalesced on a second resync
    engine.resync().await;
    assert_eq!(engine.queue().len(), 4);
}

#[tokio::test]
async fn test_history_key_runs_pruner() {
    let h = Harness::new();
    let engine = engine(&h);
    let mut desired = spec("web", 1, "a");
    desired.policy.revision_history_limit = Some(1);
    for hash in ["a", "b", "c"] {
        let mut next = desired.clone();
        next.template = crate::model::Template::new(hash, serde_json::Value::Null);
        h.apply(next).await;
        h.settle("web", 10).await;
    }
    assert_eq!(h.store.list_revisions("web").await.unwrap().len(), 3);

    run_once(&engine, ObjectRef::history("web")).await;

    let mut left: Vec<String> = h
        .store
        .list_revisions("web")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.value.id)
        .collect();
    left.sort();
    assert_eq!(left, vec!["web-c"]);
}
