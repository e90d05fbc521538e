//! Typed, versioned access to desired and persisted state
//!
//! Every write carries the version the caller last read (`expected`):
//! `None` means "create only", `Some(v)` means "replace version v". A mismatch
//! is a `Conflict`, which callers treat as transient and retry on the next tick.

pub mod memory;
pub mod watch;

pub use memory::MemoryStore;
pub use watch::{ChangeType, EventBus, WatchEvent, WatchKind};

use crate::model::{DesiredSpec, Revision, RolloutState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to persist state: {0}")]
    Persistence(String),
}

impl StoreError {
    /// Unavailable and version conflicts resolve themselves on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Conflict { .. }
        )
    }
}

/// A record together with the version it was read at
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Storage seam used by every component
///
/// One handle is created at process start and passed into constructors.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_spec(&self, workload: &str) -> Result<Option<Versioned<DesiredSpec>>, StoreError>;

    async fn put_spec(&self, spec: DesiredSpec, expected: Option<u64>) -> Result<u64, StoreError>;

    /// Returns false when there was nothing to delete
    async fn delete_spec(&self, workload: &str) -> Result<bool, StoreError>;

    /// Workloads that have a spec or a rollout record
    async fn list_workloads(&self) -> Result<Vec<String>, StoreError>;

    async fn get_rollout(
        &self,
        workload: &str,
    ) -> Result<Option<Versioned<RolloutState>>, StoreError>;

    async fn put_rollout(
        &self,
        state: RolloutState,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn delete_rollout(&self, workload: &str) -> Result<bool, StoreError>;

    /// Revisions of a workload ordered by sequence
    async fn list_revisions(&self, workload: &str) -> Result<Vec<Versioned<Revision>>, StoreError>;

    async fn get_revision(
        &self,
        workload: &str,
        id: &str,
    ) -> Result<Option<Versioned<Revision>>, StoreError>;

    async fn put_revision(
        &self,
        revision: Revision,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn delete_revision(&self, workload: &str, id: &str) -> Result<bool, StoreError>;

    /// Make every accepted write durable
    async fn flush(&self) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}
