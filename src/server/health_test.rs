//! Tests for probes, metrics and the control API over real HTTP

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::api::ErrorResponse;
use super::health::*;
use super::metrics::create_metrics;
use super::shutdown::shutdown_channel;
use crate::controller::testing::{spec, Harness};
use crate::controller::RolloutStatus;
use crate::model::Phase;
use std::sync::Arc;
use std::time::Duration;

struct TestServer {
    base: String,
    client: reqwest::Client,
    readiness: ReadinessState,
    harness: Harness,
    _stop: super::shutdown::ShutdownController,
}

async fn start() -> TestServer {
    let harness = Harness::new();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    metrics.set_traffic_weight("web", 30);
    let router = build_router(readiness.clone(), metrics, Arc::new(harness.control()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, signal) = shutdown_channel();
    tokio::spawn(serve(listener, router, signal));

    TestServer {
        base,
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap(),
        readiness,
        harness,
        _stop: stop,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let server = start().await;
    let response = server.client.get(server.url("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    let server = start().await;

    let response = server.client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(response.status(), 503);

    server.readiness.set_ready();
    let response = server.client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    server.readiness.set_not_ready();
    let response = server.client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text_format() {
    let server = start().await;
    let response = server.client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"kulku_traffic_weight{workload="web"} 30"#));
}

#[tokio::test]
async fn test_put_then_status() {
    let server = start().await;

    let response = server
        .client
        .put(server.url("/api/v1/workloads/web"))
        .json(&spec("web", 3, "a"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let accepted: serde_json::Value = response.json().await.unwrap();
    assert_eq!(accepted["generation"], 1);

    server.harness.settle("web", 5).await;

    let status: RolloutStatus = server
        .client
        .get(server.url("/api/v1/workloads/web"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.rollout.phase, Phase::Completed);
    assert_eq!(status.desired_replicas, 3);

    let listed: Vec<RolloutStatus> = server
        .client
        .get(server.url("/api/v1/workloads"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let server = start().await;

    let response = server.client.get(server.url("/api/v1/workloads/nope")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "WORKLOAD_NOT_FOUND");

    server.harness.apply(spec("web", 2, "a")).await;
    server.harness.settle("web", 5).await;

    let response = server
        .client
        .post(server.url("/api/v1/workloads/web/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "NO_ACTIVE_ROLLOUT");

    let response = server
        .client
        .post(server.url("/api/v1/workloads/web/rollback"))
        .json(&serde_json::json!({ "revision": "previous" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "INVALID_REVISION");
}

#[tokio::test]
async fn test_rollback_without_body_targets_previous() {
    let server = start().await;
    server.harness.apply(spec("web", 2, "a")).await;
    server.harness.settle("web", 5).await;
    server.harness.apply(spec("web", 2, "b")).await;
    server.harness.settle("web", 10).await;

    let response = server
        .client
        .post(server.url("/api/v1/workloads/web/rollback"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let status: RolloutStatus = response.json().await.unwrap();
    assert_eq!(status.rollout.target_revision.as_deref(), Some("web-a"));
}

#[tokio::test]
async fn test_delete_workload() {
    let server = start().await;
    server.harness.apply(spec("web", 1, "a")).await;

    let response = server.client.delete(server.url("/api/v1/workloads/web")).send().await.unwrap();
    assert_eq!(response.status(), 204);

    let response = server.client.delete(server.url("/api/v1/workloads/web")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_invalid_spec_rejected() {
    let server = start().await;
    let response = server
        .client
        .put(server.url("/api/v1/workloads/web"))
        .json(&spec("web", 3, ""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "INVALID_SPEC");
}

#[tokio::test]
async fn test_serve_stops_on_shutdown() {
    let harness = Harness::new();
    let router = build_router(
        ReadinessState::new(),
        create_metrics().unwrap(),
        Arc::new(harness.control()),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (stop, signal) = shutdown_channel();
    let handle = tokio::spawn(serve(listener, router, signal));

    stop.shutdown();
    let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(finished.unwrap().unwrap().is_ok());
}

#[test]
fn test_readiness_state_transitions() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    state.set_ready();
    let cloned = state.clone();
    assert!(cloned.is_ready());

    cloned.set_not_ready();
    assert!(!state.is_ready());
}
