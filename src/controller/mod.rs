pub mod backoff;
pub mod canary;
pub mod cdevents;
pub mod clock;
pub mod control;
pub mod engine;
pub mod lease;
pub mod prometheus;
pub mod queue;
pub mod reconcile;
pub mod registry;
pub mod revision;
pub mod rollback;
pub mod rollout;

#[cfg(test)]
pub(crate) mod testing;

pub use control::{ControlError, ControlPlane, RolloutStatus};
pub use engine::Engine;
pub use reconcile::{Context, ObjectRef, ReconcileError, ReconcileOutcome, Reconciler, ResourceKind};
pub use registry::ReconcilerRegistry;
