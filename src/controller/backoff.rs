//! Per-key exponential backoff for failed reconciles

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Tracks consecutive failures per key
///
/// The n-th consecutive failure waits `base * 2^(n-1)`, capped at `cap`.
/// A success forgets the key.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        };
        self.delay_for(attempt)
    }

    pub fn reset(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .map(|f| f.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..11).map(|_| backoff.next_delay("web").as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
    }

    #[test]
    fn test_reset_forgets_failures() {
        let backoff = Backoff::default();
        backoff.next_delay("web");
        backoff.next_delay("web");
        assert_eq!(backoff.failures("web"), 2);

        backoff.reset("web");
        assert_eq!(backoff.failures("web"), 0);
        assert_eq!(backoff.next_delay("web"), Duration::from_secs(1));
    }

    #[test]
    fn test_keys_are_independent() {
        let backoff = Backoff::default();
        backoff.next_delay("web");
        backoff.next_delay("web");
        assert_eq!(backoff.next_delay("api"), Duration::from_secs(1));
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            backoff.next_delay("web");
        }
        assert_eq!(backoff.next_delay("web"), DEFAULT_BACKOFF_CAP);
    }
}
