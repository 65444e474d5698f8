//! Recovery of runs stuck on this process.
//!
//! Only the local active map is scanned: this process is the only one that
//! can tell whether its own work is stuck. An overdue run is aborted, dropped
//! from local tracking and conditionally removed from the working set. The
//! waiting set is never touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::acquisition::{AcquisitionService, ActiveSnapshot};
use super::cadence::{CadenceGuard, Interrupt, RunBudget};
use crate::clock::{signed_millis, Clock};
use crate::config::{BatchConfig, SchedulerConfig, ZombieCleanupConfig};
use crate::metrics::MetricsCollector;
use crate::pattern::{AgentPattern, Fallback};
use crate::store::{parse_score_secs, SchedulerStore, SetKind};

/// Returns true if a run with `deadline_score` is past `deadline + threshold_ms`.
///
/// A score that does not parse is always overdue, so corrupted entries
/// cannot leak local tracking forever.
pub fn is_overdue(deadline_score: &str, now_ms: i64, threshold_ms: u64) -> bool {
    match parse_score_secs(deadline_score) {
        Some(deadline_secs) => {
            let cutoff = deadline_secs
                .saturating_mul(1_000)
                .saturating_add(signed_millis(threshold_ms));
            now_ms > cutoff
        }
        None => true,
    }
}

pub struct ZombieCleanupService {
    acquisition: Arc<AcquisitionService>,
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    config: ZombieCleanupConfig,
    batch: BatchConfig,
    exceptional: AgentPattern,
    cadence: CadenceGuard,
    cleaned_total: AtomicU64,
    metrics: MetricsCollector,
}

impl ZombieCleanupService {
    pub fn new(
        acquisition: Arc<AcquisitionService>,
        store: Arc<dyn SchedulerStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        let zombie = config.zombie_cleanup.clone();
        let exceptional = AgentPattern::compile(
            "zombie_cleanup.exceptional_agents_pattern",
            &zombie.exceptional_agents_pattern,
            Fallback::MatchNone,
        );
        Self {
            acquisition,
            store,
            clock,
            config: zombie,
            batch: config.batch_operations.clone(),
            exceptional,
            cadence: CadenceGuard::new(),
            cleaned_total: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Grace period for `agent_type`, honouring the exceptional pattern.
    pub fn threshold_ms_for(&self, agent_type: &str) -> u64 {
        if self.exceptional.matches(agent_type) {
            self.config.exceptional_agents_threshold_ms
        } else {
            self.config.threshold_ms
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Claims the current interval. Callers run [`cleanup`](Self::cleanup) only on `true`.
    pub fn try_begin(&self, now_ms: i64) -> bool {
        self.config.enabled && self.cadence.try_begin(now_ms, signed_millis(self.config.interval_ms))
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.config.enabled
            && self
                .cadence
                .is_period_elapsed(now_ms, signed_millis(self.config.interval_ms))
    }

    /// Budget for one pass; unbudgeted passes are bounded by the interval.
    pub fn budget(&self) -> RunBudget {
        RunBudget::from_millis(self.config.run_budget_ms, self.config.interval_ms)
    }

    pub fn run_budget_ms(&self) -> u64 {
        self.config.run_budget_ms
    }

    /// Runs a pass if the interval has elapsed. Returns the cleaned count when it ran.
    pub async fn run_if_due(&self, interrupt: &Interrupt) -> Option<usize> {
        if !self.try_begin(self.clock.now_millis()) {
            return None;
        }
        Some(self.cleanup(self.budget(), interrupt).await)
    }

    /// Scans local tracking and cleans every overdue run.
    ///
    /// Stops early when interrupted or over budget; the rest is left for the
    /// next pass. Returns the number of local runs cleaned.
    pub async fn cleanup(&self, budget: RunBudget, interrupt: &Interrupt) -> usize {
        let now_ms = self.clock.now_millis();
        let mut evicted: Vec<ActiveSnapshot> = Vec::new();

        for entry in self.acquisition.active_snapshot() {
            if interrupt.is_triggered() {
                debug!("Zombie cleanup interrupted");
                break;
            }
            if budget.over_budget() {
                debug!(elapsed_ms = budget.elapsed().as_millis() as u64, "Zombie cleanup budget exhausted");
                break;
            }

            let threshold = self.threshold_ms_for(&entry.agent_type);
            if !is_overdue(&entry.score, now_ms, threshold) {
                continue;
            }
            if parse_score_secs(&entry.score).is_none() {
                error!(agent_type = %entry.agent_type, score = %entry.score, "Unparseable deadline score, force-cleaning");
            }

            if self.acquisition.evict_active(&entry.agent_type, entry.run_id) {
                warn!(
                    agent_type = %entry.agent_type,
                    deadline = %entry.score,
                    threshold_ms = threshold,
                    "Cancelled zombie agent"
                );
                evicted.push(entry);
            }
        }

        if evicted.is_empty() {
            return 0;
        }

        let removed = self.remove_from_working(&evicted, interrupt).await;
        let cleaned = evicted.len();
        self.cleaned_total.fetch_add(cleaned as u64, Ordering::SeqCst);
        self.metrics.record_cleanup("zombie", cleaned);
        info!(cleaned, removed, "Zombie cleanup complete");
        cleaned
    }

    /// Conditionally removes evicted runs from working. Zero matches is not an error.
    async fn remove_from_working(&self, evicted: &[ActiveSnapshot], interrupt: &Interrupt) -> usize {
        let entries: Vec<(String, String)> = evicted
            .iter()
            .map(|e| (e.agent_type.clone(), e.score.clone()))
            .collect();

        let chunk = if self.batch.enabled {
            self.batch.chunk_size(entries.len())
        } else {
            1
        };

        let mut removed = 0;
        for batch in entries.chunks(chunk) {
            if interrupt.is_triggered() {
                break;
            }
            match self
                .store
                .remove_agents_conditional(SetKind::Working, batch)
                .await
            {
                Ok(gone) => removed += gone.len(),
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "Failed to remove zombie entries from working set");
                }
            }
        }
        removed
    }

    pub fn cleaned_total(&self) -> u64 {
        self.cleaned_total.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_100_000;

    #[test]
    fn test_overdue_boundary() {
        let deadline = (NOW_MS / 1000 - 60).to_string();
        assert!(!is_overdue(&deadline, NOW_MS, 61_000));
        assert!(!is_overdue(&deadline, NOW_MS, 60_000));
        assert!(is_overdue(&deadline, NOW_MS, 59_000));
    }

    #[test]
    fn test_unparseable_score_is_overdue() {
        assert!(is_overdue("garbage", NOW_MS, 30_000));
        assert!(is_overdue("", NOW_MS, 0));
    }

    #[test]
    fn test_huge_threshold_never_overdue() {
        let deadline = (NOW_MS / 1000 - 3_600).to_string();
        assert!(!is_overdue(&deadline, NOW_MS, u64::MAX));
        assert!(!is_overdue(&deadline, NOW_MS, i64::MAX as u64 + 1));
    }

    #[test]
    fn test_float_scores_parse() {
        let deadline = format!("{}.0", NOW_MS / 1000 + 10);
        assert!(!is_overdue(&deadline, NOW_MS, 0));
    }
}
