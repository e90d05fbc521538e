//! Tests for shutdown fan-out

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_clear() {
    let (_controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_reaches_every_clone() {
    let (controller, signal) = shutdown_channel();
    let cloned = signal.clone();
    let late = controller.signal();

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(cloned.is_shutdown());
    assert!(late.is_shutdown());
}

#[tokio::test]
async fn test_wait_completes_after_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok(), "wait() should return once shutdown is requested");
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_wait_returns_immediately_when_already_stopped() {
    let (controller, signal) = shutdown_channel();
    controller.shutdown();
    controller.shutdown();

    let waited = tokio::time::timeout(Duration::from_millis(100), signal.stopped()).await;
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_dropped_controller_releases_waiters() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let waited = tokio::time::timeout(Duration::from_millis(100), signal.wait()).await;
    assert!(waited.is_ok());
}
