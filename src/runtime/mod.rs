//! Execution collaborator seam
//!
//! The controller never runs work itself. It asks an `InstanceRuntime` to
//! create and delete instances and to report their health. Every call must be
//! idempotent on the instance id so a retried or replayed batch is safe.

pub mod simulated;

pub use simulated::SimulatedRuntime;

use crate::model::{HealthSignal, InstanceRequest, ReplicaInstance};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime rejected request: {0}")]
    Rejected(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Timeout { .. } | RuntimeError::Unavailable(_)
        )
    }
}

/// Trait for the external execution layer
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Create the instance if absent; returns its id
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, RuntimeError>;

    /// Delete the instance if present
    async fn delete_instance(&self, id: &str) -> Result<(), RuntimeError>;

    async fn instance_health(&self, id: &str) -> Result<HealthSignal, RuntimeError>;

    /// Instances currently known for a workload
    async fn list_instances(&self, workload: &str) -> Result<Vec<ReplicaInstance>, RuntimeError>;
}

/// Wraps a runtime with a per-call timeout and bounded retry
///
/// Only transient errors are retried. Backoff doubles from `retry_base` on
/// every attempt.
pub struct RetryingRuntime {
    inner: Arc<dyn InstanceRuntime>,
    timeout: Duration,
    retries: u32,
    retry_base: Duration,
}

impl RetryingRuntime {
    pub fn new(inner: Arc<dyn InstanceRuntime>, timeout: Duration, retries: u32) -> Self {
        RetryingRuntime {
            inner,
            timeout,
            retries,
            retry_base: Duration::from_millis(100),
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout {
                    op,
                    after: self.timeout,
                }),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self.retry_base.saturating_mul(1 << attempt.min(16));
                    warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Runtime call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl InstanceRuntime for RetryingRuntime {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, RuntimeError> {
        self.call("create_instance", || self.inner.create_instance(request))
            .await
    }

    async fn delete_instance(&self, id: &str) -> Result<(), RuntimeError> {
        self.call("delete_instance", || self.inner.delete_instance(id))
            .await
    }

    async fn instance_health(&self, id: &str) -> Result<HealthSignal, RuntimeError> {
        self.call("instance_health", || self.inner.instance_health(id))
            .await
    }

    async fn list_instances(&self, workload: &str) -> Result<Vec<ReplicaInstance>, RuntimeError> {
        self.call("list_instances", || self.inner.list_instances(workload))
            .await
    }
}
