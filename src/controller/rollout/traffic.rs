use crate::model::{Phase, RolloutState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Traffic share of one revision (0-100)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendWeight {
    pub revision: String,
    pub weight: u32,
}

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("traffic router unavailable: {0}")]
    Unavailable(String),
}

/// Data-plane collaborator that receives weight changes
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn set_weights(&self, workload: &str, backends: &[BackendWeight])
        -> Result<(), TrafficError>;
}

/// Calculate (stable, canary) traffic weights for the rollout
///
/// Without an active canary all traffic goes to the stable side.
pub fn calculate_traffic_weights(state: &RolloutState) -> (u32, u32) {
    match (state.traffic_weight, &state.target_revision, state.phase) {
        (Some(weight), Some(_), _) => {
            let canary = weight.min(100);
            (100 - canary, canary)
        }
        (_, Some(_), Phase::Promoting) => (0, 100),
        _ => (100, 0),
    }
}

/// Build backend weights from the rollout state
///
/// Creates a list of revision weights:
/// - Stable (current) revision with the calculated stable weight
/// - Canary (target) revision with the calculated canary weight
///
/// When only one revision is known it receives all traffic.
pub fn build_backend_weights(state: &RolloutState) -> Vec<BackendWeight> {
    let (stable_weight, canary_weight) = calculate_traffic_weights(state);

    match (&state.current_revision, &state.target_revision) {
        (Some(current), Some(target)) if state.traffic_weight.is_some() && current != target => {
            vec![
                BackendWeight {
                    revision: current.clone(),
                    weight: stable_weight,
                },
                BackendWeight {
                    revision: target.clone(),
                    weight: canary_weight,
                },
            ]
        }
        _ => match state.live_revision() {
            Some(live) => vec![BackendWeight {
                revision: live.to_string(),
                weight: 100,
            }],
            None => vec![],
        },
    }
}

/// Router that only records weight changes in the log
///
/// Used when no data plane is wired in; instance counts still follow the
/// canary weight.
pub struct LoggingRouter;

#[async_trait]
impl TrafficRouter for LoggingRouter {
    async fn set_weights(
        &self,
        workload: &str,
        backends: &[BackendWeight],
    ) -> Result<(), TrafficError> {
        let weights: Vec<String> = backends
            .iter()
            .map(|b| format!("{}={}", b.revision, b.weight))
            .collect();
        info!(workload = %workload, weights = %weights.join(","), "Traffic weights updated");
        Ok(())
    }
}

/// Router that records every call for assertions
#[cfg(test)]
#[derive(Default)]
pub struct MockTrafficRouter {
    calls: std::sync::Mutex<Vec<(String, Vec<BackendWeight>)>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockTrafficRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Vec<BackendWeight>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl TrafficRouter for MockTrafficRouter {
    async fn set_weights(
        &self,
        workload: &str,
        backends: &[BackendWeight],
    ) -> Result<(), TrafficError> {
        self.calls
            .lock()
            .unwrap()
            .push((workload.to_string(), backends.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canary_state(weight: Option<u32>) -> RolloutState {
        let mut state = RolloutState::new("web");
        state.current_revision = Some("web-a".to_string());
        state.target_revision = Some("web-b".to_string());
        state.phase = Phase::Analyzing;
        state.traffic_weight = weight;
        state
    }

    #[test]
    fn test_canary_split() {
        let state = canary_state(Some(20));
        assert_eq!(calculate_traffic_weights(&state), (80, 20));
        assert_eq!(
            build_backend_weights(&state),
            vec![
                BackendWeight {
                    revision: "web-a".to_string(),
                    weight: 80
                },
                BackendWeight {
                    revision: "web-b".to_string(),
                    weight: 20
                },
            ]
        );
    }

    #[test]
    fn test_aborted_canary_sends_everything_to_stable() {
        let mut state = canary_state(Some(0));
        state.phase = Phase::RolledBack;
        let backends = build_backend_weights(&state);
        assert_eq!(backends[0].weight, 100);
        assert_eq!(backends[1].weight, 0);
    }

    #[test]
    fn test_no_canary_single_backend() {
        let mut state = RolloutState::new("web");
        state.current_revision = Some("web-a".to_string());
        assert_eq!(calculate_traffic_weights(&state), (100, 0));
        assert_eq!(
            build_backend_weights(&state),
            vec![BackendWeight {
                revision: "web-a".to_string(),
                weight: 100
            }]
        );

        assert!(build_backend_weights(&RolloutState::new("empty")).is_empty());
    }
}
