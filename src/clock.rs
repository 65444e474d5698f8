//! Wall-clock abstraction.
//!
//! Every score written to the store is derived from a [`Clock`], so tests can
//! drive deadlines and cleanup thresholds deterministically with a
//! [`ManualClock`].

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

/// Source of the current epoch time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Whole seconds since the Unix epoch.
    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1_000)
    }
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at the given epoch milliseconds.
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Creates a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_millis())
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(i64::try_from(by.as_millis()).unwrap_or(i64::MAX), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Converts a configured millisecond span to signed millis, saturating at `i64::MAX`.
pub fn signed_millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Converts epoch milliseconds to the seconds representation used for scores.
pub fn millis_to_score(millis: i64) -> i64 {
    millis.div_euclid(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_700_000_000_500);
        assert_eq!(clock.now_secs(), 1_700_000_000);

        clock.advance(Duration::from_millis(600));
        assert_eq!(clock.now_millis(), 1_700_000_001_100);
        assert_eq!(clock.now_secs(), 1_700_000_001);

        clock.set_millis(42_000);
        assert_eq!(clock.now_secs(), 42);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2023-11-14 as a lower bound
        assert!(SystemClock.now_secs() > 1_700_000_000);
    }

    #[test]
    fn test_millis_to_score_floors() {
        assert_eq!(millis_to_score(1_999), 1);
        assert_eq!(millis_to_score(2_000), 2);
        assert_eq!(millis_to_score(-1), -1);
    }

    #[test]
    fn test_signed_millis_saturates() {
        assert_eq!(signed_millis(5_000), 5_000);
        assert_eq!(signed_millis(u64::MAX), i64::MAX);
    }
}
