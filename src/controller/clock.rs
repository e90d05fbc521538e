//! Wall-clock abstraction for deadline, warmup and interval checks
//!
//! `SystemClock` is used in production. `MockClock` lets tests move time
//! forward deterministically. The work queue schedules on tokio's monotonic
//! clock instead; this trait only covers timestamps that are persisted.

use chrono::{DateTime, Utc};

/// Source of the current time
///
/// Injected via `Context` so deadline and canary timing can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: std::time::Duration) {
        let step = chrono::Duration::from_std(duration).expect("duration out of range");
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += step;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
