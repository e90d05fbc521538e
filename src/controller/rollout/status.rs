use crate::config::ControllerConfig;
use crate::model::{Phase, ReplicaCounters, RolloutState};
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::surge::SurgeBounds;

/// Check if progress deadline has been exceeded
///
/// A rollout is considered stuck if:
/// - It's in Progressing, Analyzing or Promoting phase
/// - progress_started_at is set
/// - Current time exceeds progress_started_at + deadline_seconds
///
/// Paused time does not count: resume shifts progress_started_at forward
/// by the paused duration. Each canary step that advances restarts the
/// clock, so a healthy multi-step analysis never times out.
pub fn is_progress_deadline_exceeded(
    state: &RolloutState,
    deadline_seconds: u64,
    now: DateTime<Utc>,
) -> bool {
    match state.phase {
        Phase::Progressing | Phase::Analyzing | Phase::Promoting => {}
        _ => return false,
    }

    let started = match state.progress_started_at {
        Some(t) => t,
        None => return false,
    };

    let elapsed = now.signed_duration_since(started);
    elapsed.num_seconds() > deadline_seconds as i64
}

/// Shift the deadline start by the time spent paused
pub fn exclude_paused_time(state: &mut RolloutState, now: DateTime<Utc>) {
    if let (Some(started), Some(paused_at)) = (state.progress_started_at, state.paused_at) {
        let paused_for = now.signed_duration_since(paused_at);
        if paused_for > chrono::Duration::zero() {
            state.progress_started_at = Some(started + paused_for);
        }
    }
    state.paused_at = None;
}

/// Replica counters after a tick's actions
pub fn compute_counters(
    total: u32,
    ready: u32,
    updated: u32,
    bounds: &SurgeBounds,
) -> ReplicaCounters {
    ReplicaCounters {
        total,
        ready,
        updated,
        surge: total.saturating_sub(bounds.desired),
        unavailable: bounds.desired.saturating_sub(ready),
    }
}

/// How long until the workload should be looked at again
///
/// Active rollouts poll quickly; a paused one slowly. At rest the periodic
/// resync is enough unless instances are still converging.
pub fn requeue_interval(
    phase: Phase,
    converged: bool,
    config: &ControllerConfig,
) -> Option<Duration> {
    match phase {
        Phase::Progressing | Phase::Analyzing | Phase::Promoting => Some(config.active_requeue),
        Phase::Paused => Some(config.paused_requeue),
        Phase::Idle | Phase::Completed | Phase::RolledBack if !converged => {
            Some(config.active_requeue)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_deadline_only_for_active_phases() {
        let mut state = RolloutState::new("web");
        state.phase = Phase::Progressing;
        state.progress_started_at = Some(at(0));

        assert!(!is_progress_deadline_exceeded(&state, 600, at(600)));
        assert!(is_progress_deadline_exceeded(&state, 600, at(601)));

        state.phase = Phase::Analyzing;
        assert!(!is_progress_deadline_exceeded(&state, 600, at(600)));
        assert!(is_progress_deadline_exceeded(&state, 600, at(601)));

        state.phase = Phase::Promoting;
        assert!(is_progress_deadline_exceeded(&state, 600, at(601)));

        state.phase = Phase::Paused;
        assert!(!is_progress_deadline_exceeded(&state, 600, at(10_000)));
    }

    #[test]
    fn test_paused_time_excluded() {
        let mut state = RolloutState::new("web");
        state.phase = Phase::Progressing;
        state.progress_started_at = Some(at(0));
        state.paused_at = Some(at(100));

        exclude_paused_time(&mut state, at(400));
        assert_eq!(state.progress_started_at, Some(at(300)));
        assert!(state.paused_at.is_none());
        assert!(!is_progress_deadline_exceeded(&state, 600, at(850)));
        assert!(is_progress_deadline_exceeded(&state, 600, at(901)));
    }

    #[test]
    fn test_counters() {
        let bounds = SurgeBounds {
            desired: 6,
            max_surge: 1,
            max_unavailable: 1,
        };
        let counters = compute_counters(7, 5, 2, &bounds);
        assert_eq!(counters.surge, 1);
        assert_eq!(counters.unavailable, 1);
    }

    #[test]
    fn test_requeue_interval() {
        let config = ControllerConfig::default();
        assert_eq!(
            requeue_interval(Phase::Progressing, true, &config),
            Some(config.active_requeue)
        );
        assert_eq!(
            requeue_interval(Phase::Paused, true, &config),
            Some(config.paused_requeue)
        );
        assert_eq!(requeue_interval(Phase::Completed, true, &config), None);
        assert_eq!(
            requeue_interval(Phase::Completed, false, &config),
            Some(config.active_requeue)
        );
        assert_eq!(requeue_interval(Phase::Failed, false, &config), None);
    }
}
