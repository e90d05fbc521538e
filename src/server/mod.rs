//! HTTP server, metrics and shutdown plumbing
//!
//! - `/healthz` and `/readyz` probes
//! - `/metrics` in Prometheus text format
//! - `/api/v1/workloads/...` control API
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod api;
mod health;
pub mod metrics;
pub mod shutdown;

pub use api::ErrorResponse;
pub use health::{bind, build_router, serve, ReadinessState, ServerState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
