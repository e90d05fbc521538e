//! Records owned by the control plane
//!
//! Desired state (`DesiredSpec`), immutable template snapshots (`Revision`),
//! observed instances and the per-workload `RolloutState`.

pub mod instance;
pub mod revision;
pub mod rollout;
pub mod workload;

pub use instance::*;
pub use revision::*;
pub use rollout::*;
pub use workload::*;
