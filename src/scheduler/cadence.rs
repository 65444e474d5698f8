//! Period gating, run budgets and single-flight background tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tracing::warn;

use crate::utils::lock;

/// Tracks when a periodic task last ran.
#[derive(Debug)]
pub struct CadenceGuard {
    last_run_ms: AtomicI64,
}

impl Default for CadenceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CadenceGuard {
    /// A guard that has never run, so the first check is always due.
    pub fn new() -> Self {
        Self {
            last_run_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn is_period_elapsed(&self, now_ms: i64, period_ms: i64) -> bool {
        let last = self.last_run_ms.load(Ordering::SeqCst);
        last == i64::MIN || now_ms.saturating_sub(last) >= period_ms
    }

    /// Claims the current period. Only one caller per period gets `true`.
    pub fn try_begin(&self, now_ms: i64, period_ms: i64) -> bool {
        let last = self.last_run_ms.load(Ordering::SeqCst);
        if last != i64::MIN && now_ms.saturating_sub(last) < period_ms {
            return false;
        }
        self.last_run_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn mark(&self, now_ms: i64) {
        self.last_run_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn last_run_ms(&self) -> Option<i64> {
        match self.last_run_ms.load(Ordering::SeqCst) {
            i64::MIN => None,
            ms => Some(ms),
        }
    }
}

/// Wall-clock budget for one pass of work.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl RunBudget {
    /// `limit_ms == 0` falls back to `default_ms`; both zero means unbounded.
    pub fn from_millis(limit_ms: u64, default_ms: u64) -> Self {
        let effective = if limit_ms > 0 { limit_ms } else { default_ms };
        Self {
            started: Instant::now(),
            limit: (effective > 0).then(|| Duration::from_millis(effective)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn over_budget(&self) -> bool {
        matches!(self.limit, Some(limit) if self.started.elapsed() >= limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }
}

/// Cooperative stop signal checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A background task of which at most one instance runs at a time.
///
/// Each spawn gets its own generation. `active` holds the generation of the
/// running instance, or 0 when the slot is free, so a late drop of an aborted
/// instance cannot free the slot of its replacement.
#[derive(Debug)]
pub struct BackgroundSlot {
    name: &'static str,
    active: Arc<AtomicU64>,
    next_generation: AtomicU64,
    started_ms: AtomicI64,
    handle: Mutex<Option<(u64, AbortHandle)>>,
}

/// Frees the slot when its instance ends or is aborted.
struct SlotRelease {
    active: Arc<AtomicU64>,
    generation: u64,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let _ = self.active.compare_exchange(
            self.generation,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl BackgroundSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            active: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(1),
            started_ms: AtomicI64::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    /// Spawns `task` unless a previous instance is still running.
    pub fn try_spawn<F>(&self, now_ms: i64, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if self
            .active
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.started_ms.store(now_ms, Ordering::SeqCst);

        let release = SlotRelease {
            active: Arc::clone(&self.active),
            generation,
        };
        let handle = tokio::spawn(async move {
            let _release = release;
            task.await;
        });
        *lock(&self.handle) = Some((generation, handle.abort_handle()));
        true
    }

    /// Aborts a task that has run longer than `limit` and frees the slot.
    pub fn abort_if_hung(&self, now_ms: i64, limit: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        let elapsed = now_ms.saturating_sub(self.started_ms.load(Ordering::SeqCst));
        let limit_ms = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
        if elapsed < limit_ms {
            return false;
        }
        warn!(task = self.name, elapsed_ms = elapsed, "Background task hung, aborting");
        self.abort();
        true
    }

    /// Aborts the current instance, if any, and frees its slot.
    pub fn abort(&self) {
        if let Some((generation, handle)) = lock(&self.handle).take() {
            handle.abort();
            let _ = self.active.compare_exchange(
                generation,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_guard() {
        let guard = CadenceGuard::new();
        assert!(guard.is_period_elapsed(0, 1_000));
        assert!(guard.try_begin(5_000, 1_000));
        assert!(!guard.try_begin(5_500, 1_000));
        assert!(!guard.is_period_elapsed(5_999, 1_000));
        assert!(guard.try_begin(6_000, 1_000));
        assert_eq!(guard.last_run_ms(), Some(6_000));
    }

    #[test]
    fn test_run_budget() {
        assert!(!RunBudget::unbounded().over_budget());
        assert!(RunBudget::from_millis(0, 0).limit().is_none());
        assert_eq!(
            RunBudget::from_millis(0, 300).limit(),
            Some(Duration::from_millis(300))
        );

        let budget = RunBudget::from_millis(1, 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(budget.over_budget());
    }

    #[test]
    fn test_interrupt() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!interrupt.is_triggered());
        clone.trigger();
        assert!(interrupt.is_triggered());
        interrupt.reset();
        assert!(!clone.is_triggered());
    }

    #[tokio::test]
    async fn test_background_slot_single_flight() {
        let slot = BackgroundSlot::new("test");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        assert!(slot.try_spawn(0, async move {
            let _ = rx.await;
        }));
        assert!(slot.is_running());
        assert!(!slot.try_spawn(0, async {}));

        tx.send(()).expect("send");
        for _ in 0..100 {
            if !slot.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!slot.is_running());
        assert!(slot.try_spawn(10, async {}));
    }

    #[tokio::test]
    async fn test_background_slot_hung_abort() {
        let slot = BackgroundSlot::new("hung");
        assert!(slot.try_spawn(0, std::future::pending::<()>()));
        assert!(!slot.abort_if_hung(1_000, Duration::from_secs(60)));
        assert!(slot.abort_if_hung(61_000, Duration::from_secs(60)));
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn test_aborted_instance_does_not_free_its_replacement() {
        let slot = BackgroundSlot::new("replaced");
        assert!(slot.try_spawn(0, std::future::pending::<()>()));
        assert!(slot.abort_if_hung(61_000, Duration::from_secs(60)));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(slot.try_spawn(61_000, async move {
            let _ = rx.await;
        }));

        // Lets the aborted instance unwind and drop its release guard.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(slot.is_running());
        assert!(!slot.try_spawn(61_100, async {}));

        tx.send(()).expect("send");
        for _ in 0..100 {
            if !slot.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!slot.is_running());
    }
}
