use super::*;
use crate::controller::reconcile::ResourceKind;
use std::sync::Arc;

fn key(name: &str) -> ObjectRef {
    ObjectRef::workload(name)
}

#[tokio::test(start_paused = true)]
async fn test_pops_in_eligibility_order() {
    let queue = WorkQueue::default();
    queue.add_after(key("c"), Duration::from_secs(3)).unwrap();
    queue.add_after(key("a"), Duration::from_secs(1)).unwrap();
    queue.add_after(key("b"), Duration::from_secs(2)).unwrap();

    assert_eq!(queue.pop().await, Some(key("a")));
    assert_eq!(queue.pop().await, Some(key("b")));
    assert_eq!(queue.pop().await, Some(key("c")));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_key_waits() {
    let queue = WorkQueue::default();
    let start = Instant::now();
    queue.add_after(key("web"), Duration::from_secs(5)).unwrap();

    assert_eq!(queue.pop().await, Some(key("web")));
    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_adds_coalesce_to_earliest() {
    let queue = WorkQueue::default();
    let start = Instant::now();
    queue.add_after(key("web"), Duration::from_secs(30)).unwrap();
    queue.add_after(key("web"), Duration::from_secs(1)).unwrap();
    queue.add_after(key("web"), Duration::from_secs(10)).unwrap();
    assert_eq!(queue.len(), 1);

    assert_eq!(queue.pop().await, Some(key("web")));
    assert!(start.elapsed() < Duration::from_secs(2));
    queue.done(&key("web"));
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_kinds_are_distinct_keys() {
    let queue = WorkQueue::default();
    queue.add(key("web")).unwrap();
    queue
        .add(ObjectRef::new(ResourceKind::History, "web"))
        .unwrap();
    assert_eq!(queue.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_key_not_handed_out_while_processing() {
    let queue = Arc::new(WorkQueue::default());
    queue.add(key("web")).unwrap();
    let first = queue.pop().await.unwrap();

    // Re-add while in flight is parked, not queued
    queue.add(key("web")).unwrap();
    assert!(queue.is_empty());

    let q = queue.clone();
    let waiter = tokio::spawn(async move { q.pop().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished());

    queue.done(&first);
    assert_eq!(waiter.await.unwrap(), Some(key("web")));
}

#[tokio::test(start_paused = true)]
async fn test_capacity_bound() {
    let queue = WorkQueue::new(2);
    queue.add(key("a")).unwrap();
    queue.add(key("b")).unwrap();
    assert_eq!(queue.add(key("c")), Err(QueueError::Full(2)));
    // Coalescing into an existing key is always accepted
    assert!(queue.add(key("a")).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_wakes_waiters() {
    let queue = Arc::new(WorkQueue::default());
    let q = queue.clone();
    let waiter = tokio::spawn(async move { q.pop().await });
    tokio::task::yield_now().await;

    queue.shutdown();
    assert_eq!(waiter.await.unwrap(), None);
    assert_eq!(queue.add(key("web")), Err(QueueError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn test_add_wakes_sleeping_worker_early() {
    let queue = Arc::new(WorkQueue::default());
    queue.add_after(key("slow"), Duration::from_secs(60)).unwrap();

    let q = queue.clone();
    let waiter = tokio::spawn(async move { q.pop().await });
    tokio::task::yield_now().await;

    let start = Instant::now();
    queue.add(key("fast")).unwrap();
    assert_eq!(waiter.await.unwrap(), Some(key("fast")));
    assert!(start.elapsed() < Duration::from_secs(60));
}
