pub mod orchestrator;
pub mod plan;
pub mod status;
pub mod surge;
pub mod traffic;
pub mod validation;

pub use orchestrator::*;
pub use plan::*;
pub use status::*;
pub use surge::*;
pub use traffic::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "rollout_test.rs"]
mod tests;
