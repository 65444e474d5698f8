//! Streak-based health watchdog.
//!
//! Each heartbeat produces one [`WatchdogSample`]. Every concern keeps its own
//! streak of consecutive unhealthy samples; a healthy sample resets it. A
//! concern fires when its streak reaches the threshold, which records the
//! firing time and starts a new streak. Firings are not logged here; the
//! periodic health summary reports concerns that fired within its window.

use std::fmt;

/// Health inputs gathered by one heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WatchdogSample {
    pub max_permits: usize,
    pub available_permits: usize,
    /// Worker tasks currently executing an agent.
    pub executing: usize,
    /// Agents in waiting that were eligible this cycle.
    pub ready: usize,
    /// Dispatch headroom at the start of the cycle.
    pub headroom: usize,
    pub acquired: usize,
    /// Whether the cycle's store round-trips succeeded.
    pub store_ok: bool,
}

impl WatchdogSample {
    pub fn permits_free_ratio(&self) -> f64 {
        if self.max_permits == 0 {
            return 1.0;
        }
        self.available_permits as f64 / self.max_permits as f64
    }

    pub fn acquired_fill_ratio(&self) -> f64 {
        if self.headroom == 0 {
            return 1.0;
        }
        self.acquired as f64 / self.headroom as f64
    }
}

/// Conditions the watchdog tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogConcern {
    /// Permits are gone but nothing is executing.
    PermitLeak,
    /// Plenty of permits and ready work, yet almost nothing acquired.
    CapacitySkew,
    /// Ready work and free permits, store healthy, nothing acquired.
    ZeroProgress,
    /// Store round-trips failing.
    StoreStall,
}

impl WatchdogConcern {
    pub const ALL: [WatchdogConcern; 4] = [
        WatchdogConcern::PermitLeak,
        WatchdogConcern::CapacitySkew,
        WatchdogConcern::ZeroProgress,
        WatchdogConcern::StoreStall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogConcern::PermitLeak => "permit_leak",
            WatchdogConcern::CapacitySkew => "capacity_skew",
            WatchdogConcern::ZeroProgress => "zero_progress",
            WatchdogConcern::StoreStall => "store_stall",
        }
    }

    fn is_unhealthy(&self, sample: &WatchdogSample) -> bool {
        let free = sample.permits_free_ratio();
        match self {
            WatchdogConcern::PermitLeak => {
                sample.max_permits > 0 && free < 0.01 && sample.executing == 0 && sample.ready > 0
            }
            WatchdogConcern::CapacitySkew => {
                sample.ready > 0 && free > 0.9 && sample.acquired_fill_ratio() < 0.1
            }
            WatchdogConcern::ZeroProgress => {
                sample.ready > 0
                    && sample.available_permits > 0
                    && sample.acquired == 0
                    && sample.store_ok
            }
            WatchdogConcern::StoreStall => !sample.store_ok,
        }
    }
}

impl fmt::Display for WatchdogConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Streak {
    count: u32,
    last_fired_ms: Option<i64>,
    fired_total: u64,
}

/// Independent streak counters, one per concern.
#[derive(Debug, Clone)]
pub struct Watchdog {
    threshold: u32,
    streaks: [Streak; 4],
}

impl Watchdog {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: [Streak::default(); 4],
        }
    }

    fn index(concern: WatchdogConcern) -> usize {
        match concern {
            WatchdogConcern::PermitLeak => 0,
            WatchdogConcern::CapacitySkew => 1,
            WatchdogConcern::ZeroProgress => 2,
            WatchdogConcern::StoreStall => 3,
        }
    }

    /// Feeds one sample and returns the concerns that fired on it.
    pub fn observe(&mut self, sample: &WatchdogSample, now_ms: i64) -> Vec<WatchdogConcern> {
        let mut fired = Vec::new();
        for concern in WatchdogConcern::ALL {
            let threshold = self.threshold;
            let streak = &mut self.streaks[Self::index(concern)];
            if !concern.is_unhealthy(sample) {
                streak.count = 0;
                continue;
            }
            streak.count += 1;
            if streak.count >= threshold {
                streak.count = 0;
                streak.last_fired_ms = Some(now_ms);
                streak.fired_total += 1;
                fired.push(concern);
            }
        }
        fired
    }

    pub fn streak(&self, concern: WatchdogConcern) -> u32 {
        self.streaks[Self::index(concern)].count
    }

    pub fn fired_total(&self, concern: WatchdogConcern) -> u64 {
        self.streaks[Self::index(concern)].fired_total
    }

    /// Concerns that fired at or after `since_ms`.
    pub fn active_since(&self, since_ms: i64) -> Vec<WatchdogConcern> {
        WatchdogConcern::ALL
            .into_iter()
            .filter(|c| {
                matches!(self.streaks[Self::index(*c)].last_fired_ms, Some(t) if t >= since_ms)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> WatchdogSample {
        WatchdogSample {
            max_permits: 10,
            available_permits: 5,
            executing: 5,
            ready: 3,
            headroom: 5,
            acquired: 3,
            store_ok: true,
        }
    }

    #[test]
    fn test_healthy_sample_fires_nothing() {
        let mut watchdog = Watchdog::new(3);
        for i in 0..10 {
            assert!(watchdog.observe(&healthy(), i).is_empty());
        }
    }

    #[test]
    fn test_stall_fires_after_streak() {
        let mut watchdog = Watchdog::new(3);
        let stalled = WatchdogSample {
            store_ok: false,
            ..healthy()
        };
        assert!(watchdog.observe(&stalled, 1).is_empty());
        assert!(watchdog.observe(&stalled, 2).is_empty());
        assert_eq!(watchdog.streak(WatchdogConcern::StoreStall), 2);
        assert_eq!(watchdog.observe(&stalled, 3), vec![WatchdogConcern::StoreStall]);
        assert_eq!(watchdog.streak(WatchdogConcern::StoreStall), 0);
        assert_eq!(watchdog.active_since(3), vec![WatchdogConcern::StoreStall]);
        assert!(watchdog.active_since(4).is_empty());
    }

    #[test]
    fn test_healthy_sample_resets_streak() {
        let mut watchdog = Watchdog::new(3);
        let stalled = WatchdogSample {
            store_ok: false,
            ..healthy()
        };
        watchdog.observe(&stalled, 1);
        watchdog.observe(&stalled, 2);
        watchdog.observe(&healthy(), 3);
        assert_eq!(watchdog.streak(WatchdogConcern::StoreStall), 0);
        assert!(watchdog.observe(&stalled, 4).is_empty());
    }

    #[test]
    fn test_permit_leak_detection() {
        let mut watchdog = Watchdog::new(2);
        let leaked = WatchdogSample {
            available_permits: 0,
            executing: 0,
            headroom: 0,
            acquired: 0,
            ..healthy()
        };
        watchdog.observe(&leaked, 1);
        let fired = watchdog.observe(&leaked, 2);
        assert!(fired.contains(&WatchdogConcern::PermitLeak));
        // No free permits means no zero-progress finding
        assert!(!fired.contains(&WatchdogConcern::ZeroProgress));
    }

    #[test]
    fn test_skew_and_zero_progress() {
        let mut watchdog = Watchdog::new(1);
        let idle = WatchdogSample {
            available_permits: 10,
            executing: 0,
            headroom: 10,
            acquired: 0,
            ..healthy()
        };
        let fired = watchdog.observe(&idle, 1);
        assert!(fired.contains(&WatchdogConcern::CapacitySkew));
        assert!(fired.contains(&WatchdogConcern::ZeroProgress));
        assert_eq!(watchdog.fired_total(WatchdogConcern::ZeroProgress), 1);
    }

    #[test]
    fn test_ratios() {
        let sample = healthy();
        assert!((sample.permits_free_ratio() - 0.5).abs() < f64::EPSILON);
        assert!((sample.acquired_fill_ratio() - 0.6).abs() < f64::EPSILON);
        assert_eq!(WatchdogSample::default().permits_free_ratio(), 1.0);
    }
}
