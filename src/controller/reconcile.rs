//! Reconcile contract shared by every resource kind
//!
//! A reconciler is level-triggered: given a key it reads desired and observed
//! state, performs a bounded set of idempotent actions and reports when it
//! wants to run again. It never depends on having seen a particular event.

use super::cdevents::{EventSink, HttpEventSink};
use super::clock::Clock;
use super::lease::LeaseTable;
use super::prometheus::{MetricsProvider, UnconfiguredProvider};
use super::revision::RevisionError;
use super::rollout::traffic::{LoggingRouter, TrafficRouter};
use crate::config::ControllerConfig;
use crate::model::OwnershipError;
use crate::runtime::{InstanceRuntime, RuntimeError};
use crate::server::SharedMetrics;
use crate::store::{StateStore, StoreError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Resource kind tag used for dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Desired replicas and rollout progress of one workload
    Workload,
    /// Revision history retention of one workload
    History,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "workload",
            ResourceKind::History => "history",
        }
    }
}

/// Key processed by the work queue
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub workload: String,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, workload: impl Into<String>) -> Self {
        ObjectRef {
            kind,
            workload: workload.into(),
        }
    }

    pub fn workload(workload: impl Into<String>) -> Self {
        Self::new(ResourceKind::Workload, workload)
    }

    pub fn history(workload: impl Into<String>) -> Self {
        Self::new(ResourceKind::History, workload)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.workload)
    }
}

/// What the engine should do with a key after a successful reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Requeue { after: Duration, reason: String },
    Done,
}

impl ReconcileOutcome {
    pub fn requeue(after: Duration, reason: impl Into<String>) -> Self {
        ReconcileOutcome::Requeue {
            after,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid spec: {0}")]
    ValidationError(String),

    #[error("Metrics evaluation failed: {0}")]
    MetricsEvaluationFailed(String),

    #[error("{0}")]
    Ownership(#[from] OwnershipError),
}

/// How the engine treats a reconcile error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Store or collaborator hiccup; retried with backoff
    Transient,
    /// Aborted attempt with nothing half-written; retried with backoff
    FatalLocal,
    /// Computed actions would break surge/unavailable bounds; tick skipped, Degraded
    Invariant,
    /// Spec cannot be acted on until it changes; Degraded
    Config,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) if e.is_transient() => ErrorClass::Transient,
            ReconcileError::Store(_) => ErrorClass::FatalLocal,
            ReconcileError::Runtime(e) if e.is_transient() => ErrorClass::Transient,
            ReconcileError::Runtime(_) => ErrorClass::FatalLocal,
            ReconcileError::Revision(RevisionError::EmptyHash(_)) => ErrorClass::Config,
            ReconcileError::Revision(_) => ErrorClass::FatalLocal,
            ReconcileError::MetricsEvaluationFailed(_) => ErrorClass::Transient,
            ReconcileError::InvariantViolation(_) => ErrorClass::Invariant,
            ReconcileError::ValidationError(_) | ReconcileError::Ownership(_) => {
                ErrorClass::Config
            }
        }
    }

    /// Whether the engine requeues the key with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::FatalLocal)
    }

    /// Reason tag stored on the Degraded condition
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Store(_) => "StoreError",
            ReconcileError::Runtime(_) => "RuntimeError",
            ReconcileError::Revision(_) => "RevisionError",
            ReconcileError::InvariantViolation(_) => "InvariantViolation",
            ReconcileError::ValidationError(_) => "InvalidSpec",
            ReconcileError::MetricsEvaluationFailed(_) => "MetricsEvaluationFailed",
            ReconcileError::Ownership(_) => "OwnershipConflict",
        }
    }
}

/// Collaborators shared by every reconciler
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn InstanceRuntime>,
    pub metrics_provider: Arc<dyn MetricsProvider>,
    pub traffic_router: Arc<dyn TrafficRouter>,
    pub cdevents_sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub leases: LeaseTable,
    pub config: ControllerConfig,
    /// Optional controller metrics for Prometheus
    /// When Some, records reconciliation counts and durations
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Create a Context with no metrics provider, a logging traffic router
    /// and CDEvents disabled
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn InstanceRuntime>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Context {
            store,
            runtime,
            metrics_provider: Arc::new(UnconfiguredProvider),
            traffic_router: Arc::new(LoggingRouter),
            cdevents_sink: Arc::new(HttpEventSink::disabled()),
            clock,
            leases: LeaseTable::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics_provider = provider;
        self
    }

    pub fn with_traffic_router(mut self, router: Arc<dyn TrafficRouter>) -> Self {
        self.traffic_router = router;
        self
    }

    pub fn with_cdevents_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.cdevents_sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// One reconciler per resource kind, resolved once at startup
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn reconcile(
        &self,
        key: &ObjectRef,
        ctx: &Context,
    ) -> Result<ReconcileOutcome, ReconcileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let transient = ReconcileError::Store(StoreError::Unavailable("down".into()));
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(transient.is_retryable());

        let invariant = ReconcileError::InvariantViolation("surge".into());
        assert_eq!(invariant.class(), ErrorClass::Invariant);
        assert!(!invariant.is_retryable());

        let config = ReconcileError::ValidationError("bad".into());
        assert_eq!(config.class(), ErrorClass::Config);
        assert!(!config.is_retryable());

        let fatal = ReconcileError::Revision(RevisionError::Store(StoreError::Unavailable(
            "down".into(),
        )));
        assert_eq!(fatal.class(), ErrorClass::FatalLocal);
        assert!(fatal.is_retryable());

        let rejected = ReconcileError::Runtime(RuntimeError::Rejected("quota".into()));
        assert_eq!(rejected.class(), ErrorClass::FatalLocal);
    }

    #[test]
    fn test_object_ref_display() {
        assert_eq!(ObjectRef::workload("web").to_string(), "workload/web");
        assert_eq!(ObjectRef::history("web").to_string(), "history/web");
    }
}
