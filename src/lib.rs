//! kulku - declarative reconciliation control plane
//!
//! Converges running instances toward a desired spec with bounded rolling
//! updates, metric-gated canary promotion and revision-based rollback.

pub mod cli;
pub mod config;
pub mod controller;
pub mod model;
pub mod runtime;
pub mod server;
pub mod store;
