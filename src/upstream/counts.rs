use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of one request or one probe against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Plain-value snapshot of [`Counts`]. Also the persisted form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountsSnapshot {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// Outcome counters for one backend and one source (live traffic or probes).
///
/// Every mutation takes the lock for the whole compound update, so the two
/// streak counters are never both non-zero as seen by any reader.
#[derive(Debug, Default)]
pub struct Counts {
    inner: Mutex<CountsSnapshot>,
}

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(&self) {
        let mut c = self.inner.lock();
        c.requests = c.requests.wrapping_add(1);
    }

    pub fn on_success(&self) {
        let mut c = self.inner.lock();
        Self::apply_success(&mut c);
    }

    pub fn on_failure(&self) {
        let mut c = self.inner.lock();
        Self::apply_failure(&mut c);
    }

    /// `on_request` plus one outcome, under a single lock acquisition.
    pub fn record(&self, outcome: Outcome) {
        let mut c = self.inner.lock();
        c.requests = c.requests.wrapping_add(1);
        match outcome {
            Outcome::Success => Self::apply_success(&mut c),
            Outcome::Failure => Self::apply_failure(&mut c),
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = CountsSnapshot::default();
    }

    pub fn snapshot(&self) -> CountsSnapshot {
        *self.inner.lock()
    }

    /// Replace all counters with a persisted snapshot.
    pub fn restore(&self, snapshot: CountsSnapshot) {
        *self.inner.lock() = snapshot;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn apply_success(c: &mut CountsSnapshot) {
        c.total_successes = c.total_successes.wrapping_add(1);
        c.consecutive_successes = c.consecutive_successes.wrapping_add(1);
        c.consecutive_failures = 0;
    }

    fn apply_failure(c: &mut CountsSnapshot) {
        c.total_failures = c.total_failures.wrapping_add(1);
        c.consecutive_failures = c.consecutive_failures.wrapping_add(1);
        c.consecutive_successes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_success_resets_failure_streak() {
        let counts = Counts::new();
        counts.record(Outcome::Failure);
        counts.record(Outcome::Failure);
        counts.record(Outcome::Success);
        let s = counts.snapshot();
        assert_eq!(s.requests, 3);
        assert_eq!(s.total_failures, 2);
        assert_eq!(s.total_successes, 1);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.consecutive_successes, 1);
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let counts = Counts::new();
        counts.on_success();
        counts.on_success();
        counts.on_failure();
        let s = counts.snapshot();
        assert_eq!(s.requests, 0);
        assert_eq!(s.consecutive_successes, 0);
        assert_eq!(s.consecutive_failures, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let counts = Counts::new();
        counts.record(Outcome::Failure);
        counts.reset();
        assert_eq!(counts.snapshot(), CountsSnapshot::default());
    }

    #[test]
    fn test_restore_replaces_state() {
        let counts = Counts::new();
        counts.record(Outcome::Success);
        let persisted = CountsSnapshot {
            requests: 10,
            total_successes: 4,
            total_failures: 6,
            consecutive_successes: 0,
            consecutive_failures: 3,
        };
        counts.restore(persisted);
        assert_eq!(counts.snapshot(), persisted);
        assert_eq!(counts.consecutive_failures(), 3);
    }

    #[test]
    fn test_snapshot_missing_fields_default_to_zero() {
        let s: CountsSnapshot = serde_json::from_str(r#"{"requests": 5, "extra": true}"#).unwrap();
        assert_eq!(s.requests, 5);
        assert_eq!(s.total_failures, 0);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn test_concurrent_records_keep_streak_invariant() {
        let counts = Arc::new(Counts::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counts = counts.clone();
                std::thread::spawn(move || {
                    for j in 0..500 {
                        let outcome = if (i + j) % 3 == 0 {
                            Outcome::Failure
                        } else {
                            Outcome::Success
                        };
                        counts.record(outcome);
                        let s = counts.snapshot();
                        assert!(s.consecutive_failures == 0 || s.consecutive_successes == 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = counts.snapshot();
        assert_eq!(s.requests, 4000);
        assert_eq!(s.total_successes + s.total_failures, 4000);
    }
}
