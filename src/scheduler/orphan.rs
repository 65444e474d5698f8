//! Recovery of working entries abandoned by dead processes.
//!
//! One process at a time runs a pass, serialized by a TTL'd leadership key.
//! The key is not renewed while a pass runs; the TTL must cover the longest
//! expected pass and expiry is the only recovery if the holder dies.
//!
//! ```text
//!   claim(SET NX PX) ──fail──▶ skip cycle
//!        │ ok
//!        ▼
//!   page working set (score <= now - threshold)
//!        ├─ active here ─────────────▶ keep
//!        ├─ registered here ─────────▶ move to waiting (cadence score)
//!        └─ otherwise / numeric name ▶ conditional remove
//!        │
//!        ▼
//!   release(compare-and-delete)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::acquisition::AcquisitionService;
use super::cadence::{CadenceGuard, Interrupt, RunBudget};
use crate::clock::{millis_to_score, signed_millis, Clock};
use crate::config::{BatchConfig, OrphanCleanupConfig, SchedulerConfig};
use crate::metrics::MetricsCollector;
use crate::store::{SchedulerStore, ScoredAgent, SetKind};

const PAGE_SIZE: usize = 500;

/// Agent names made only of 9 to 11 digits are corrupted entries.
fn is_numeric_only(agent_type: &str) -> bool {
    (9..=11).contains(&agent_type.len()) && agent_type.bytes().all(|b| b.is_ascii_digit())
}

/// How the pass related to leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadershipOutcome {
    Claimed,
    /// Another process holds the key; the pass was skipped.
    Contended,
    /// The claim itself failed; the pass was skipped.
    Failed,
    /// Leadership bypassed by `force_all_pods`.
    Forced,
}

impl LeadershipOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadershipOutcome::Claimed => "claimed",
            LeadershipOutcome::Contended => "contended",
            LeadershipOutcome::Failed => "error",
            LeadershipOutcome::Forced => "forced",
        }
    }

    pub fn may_run(&self) -> bool {
        matches!(self, LeadershipOutcome::Claimed | LeadershipOutcome::Forced)
    }
}

/// Result of one orphan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub leadership: LeadershipOutcome,
    /// Entries conditionally removed from working.
    pub removed: usize,
    /// Locally registered entries moved back to waiting.
    pub requeued: usize,
    /// Numeric-only names removed from waiting.
    pub corrupted_waiting: usize,
    /// Entries skipped because they are running here.
    pub skipped_active: usize,
}

impl OrphanReport {
    fn skipped(leadership: LeadershipOutcome) -> Self {
        Self {
            leadership,
            removed: 0,
            requeued: 0,
            corrupted_waiting: 0,
            skipped_active: 0,
        }
    }

    pub fn cleaned(&self) -> usize {
        self.removed + self.requeued + self.corrupted_waiting
    }
}

/// Builds the `host::uuid` owner id used for the leadership key.
pub fn generate_owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}::{}", host, Uuid::new_v4())
}

pub struct OrphanCleanupService {
    acquisition: Arc<AcquisitionService>,
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    config: OrphanCleanupConfig,
    batch: BatchConfig,
    owner_id: String,
    cadence: CadenceGuard,
    cleaned_total: AtomicU64,
    metrics: MetricsCollector,
}

impl OrphanCleanupService {
    pub fn new(
        acquisition: Arc<AcquisitionService>,
        store: Arc<dyn SchedulerStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::with_owner_id(acquisition, store, clock, config, generate_owner_id())
    }

    pub fn with_owner_id(
        acquisition: Arc<AcquisitionService>,
        store: Arc<dyn SchedulerStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            acquisition,
            store,
            clock,
            config: config.orphan_cleanup.clone(),
            batch: config.batch_operations.clone(),
            owner_id: owner_id.into(),
            cadence: CadenceGuard::new(),
            cleaned_total: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn try_begin(&self, now_ms: i64) -> bool {
        self.config.enabled && self.cadence.try_begin(now_ms, signed_millis(self.config.interval_ms))
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.config.enabled
            && self
                .cadence
                .is_period_elapsed(now_ms, signed_millis(self.config.interval_ms))
    }

    pub fn budget(&self) -> RunBudget {
        RunBudget::from_millis(self.config.run_budget_ms, self.config.interval_ms)
    }

    pub fn run_budget_ms(&self) -> u64 {
        self.config.run_budget_ms
    }

    pub fn cleaned_total(&self) -> u64 {
        self.cleaned_total.load(Ordering::SeqCst)
    }

    /// Runs a pass if the interval has elapsed.
    pub async fn run_if_due(&self, interrupt: &Interrupt) -> Option<OrphanReport> {
        if !self.try_begin(self.clock.now_millis()) {
            return None;
        }
        Some(self.cleanup(self.budget(), interrupt).await)
    }

    /// Runs a pass now, regardless of the interval.
    pub async fn force_cleanup(&self) -> OrphanReport {
        self.cadence.mark(self.clock.now_millis());
        self.cleanup(RunBudget::unbounded(), &Interrupt::new()).await
    }

    /// Claims leadership (unless forced), cleans and releases.
    pub async fn cleanup(&self, budget: RunBudget, interrupt: &Interrupt) -> OrphanReport {
        let leadership = self.claim_leadership().await;
        self.metrics.record_leadership_claim(leadership.as_str());
        if !leadership.may_run() {
            debug!(outcome = leadership.as_str(), "Orphan cleanup skipped, leadership not held");
            self.metrics.record_cleanup_skipped("orphan");
            return OrphanReport::skipped(leadership);
        }

        let mut report = OrphanReport::skipped(leadership);
        self.clean_working(&mut report, &budget, interrupt).await;
        if self.config.remove_numeric_only_agents {
            self.clean_corrupted_waiting(&mut report, &budget, interrupt)
                .await;
        }

        if leadership == LeadershipOutcome::Claimed {
            self.release_leadership().await;
        }

        let cleaned = report.cleaned();
        self.cleaned_total.fetch_add(cleaned as u64, Ordering::SeqCst);
        self.metrics.record_cleanup("orphan", cleaned);
        if cleaned > 0 {
            info!(
                removed = report.removed,
                requeued = report.requeued,
                corrupted = report.corrupted_waiting,
                skipped_active = report.skipped_active,
                "Orphan cleanup complete"
            );
        } else {
            debug!(skipped_active = report.skipped_active, "Orphan cleanup found nothing");
        }
        report
    }

    async fn claim_leadership(&self) -> LeadershipOutcome {
        if self.config.force_all_pods {
            return LeadershipOutcome::Forced;
        }
        let ttl = Duration::from_millis(self.config.leadership_ttl_ms);
        match self.store.try_acquire_leadership(&self.owner_id, ttl).await {
            Ok(true) => {
                debug!(owner = %self.owner_id, "Claimed orphan cleanup leadership");
                LeadershipOutcome::Claimed
            }
            Ok(false) => LeadershipOutcome::Contended,
            Err(e) => {
                warn!(error = %e, "Failed to claim orphan cleanup leadership");
                LeadershipOutcome::Failed
            }
        }
    }

    /// Releases leadership if this process still holds it.
    pub async fn release_leadership(&self) -> bool {
        match self.store.release_leadership(&self.owner_id).await {
            Ok(released) => {
                if !released {
                    debug!(owner = %self.owner_id, "Leadership already expired or taken over");
                }
                released
            }
            Err(e) => {
                warn!(error = %e, "Failed to release orphan cleanup leadership");
                false
            }
        }
    }

    async fn clean_working(&self, report: &mut OrphanReport, budget: &RunBudget, interrupt: &Interrupt) {
        let cutoff = millis_to_score(
            self.clock
                .now_millis()
                .saturating_sub(signed_millis(self.config.threshold_ms)),
        );
        let mut offset = 0;

        loop {
            if interrupt.is_triggered() || budget.over_budget() {
                debug!("Orphan cleanup stopped early");
                return;
            }

            let page = match self
                .store
                .range_by_score(SetKind::Working, i64::MIN, cutoff, offset, PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Failed to scan working set for orphans");
                    return;
                }
            };
            if page.is_empty() {
                return;
            }
            let page_len = page.len();

            let mut removals: Vec<(String, String)> = Vec::new();
            let mut retained = 0;
            for entry in page {
                if self.acquisition.is_active(&entry.agent_type) {
                    report.skipped_active += 1;
                    retained += 1;
                } else if !is_numeric_only(&entry.agent_type)
                    && self.acquisition.is_registered(&entry.agent_type)
                {
                    if self.requeue_local(&entry).await {
                        report.requeued += 1;
                    } else {
                        retained += 1;
                    }
                } else {
                    removals.push((entry.agent_type, entry.score));
                }
            }

            let removed = self.remove_conditional(SetKind::Working, &removals).await;
            report.removed += removed;
            retained += removals.len() - removed;

            if page_len < PAGE_SIZE {
                return;
            }
            offset += retained;
        }
    }

    /// Moves an abandoned entry of a locally registered agent back to waiting.
    async fn requeue_local(&self, entry: &ScoredAgent) -> bool {
        let offset = self
            .acquisition
            .cadence_offset_ms(&entry.agent_type, &entry.score)
            .unwrap_or(0);
        let score = millis_to_score(self.clock.now_millis() + offset);
        match self
            .store
            .move_agent_conditional(SetKind::Working, &entry.agent_type, &entry.score, score)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                warn!(agent_type = %entry.agent_type, error = %e, "Failed to requeue orphaned agent");
                false
            }
        }
    }

    async fn clean_corrupted_waiting(
        &self,
        report: &mut OrphanReport,
        budget: &RunBudget,
        interrupt: &Interrupt,
    ) {
        let mut offset = 0;
        loop {
            if interrupt.is_triggered() || budget.over_budget() {
                return;
            }
            let page = match self
                .store
                .range_by_score(SetKind::Waiting, i64::MIN, i64::MAX, offset, PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Failed to scan waiting set for corrupted entries");
                    return;
                }
            };
            let page_len = page.len();

            let corrupted: Vec<(String, String)> = page
                .into_iter()
                .filter(|e| is_numeric_only(&e.agent_type))
                .map(|e| (e.agent_type, e.score))
                .collect();
            let removed = self.remove_conditional(SetKind::Waiting, &corrupted).await;
            report.corrupted_waiting += removed;

            if page_len < PAGE_SIZE {
                return;
            }
            offset += page_len - removed;
        }
    }

    async fn remove_conditional(&self, set: SetKind, entries: &[(String, String)]) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let chunk = if self.batch.enabled {
            self.batch.chunk_size(entries.len())
        } else {
            1
        };

        let mut removed = 0;
        for batch in entries.chunks(chunk) {
            match self.store.remove_agents_conditional(set, batch).await {
                Ok(gone) => removed += gone.len(),
                Err(e) => warn!(?set, error = %e, "Conditional removal failed"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::agent::Collaborators;
    use crate::store::MemoryStore;

    const NOW_MS: i64 = 1_700_000_000_000;

    fn service(config: SchedulerConfig, owner: &str) -> (OrphanCleanupService, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = Arc::new(config);
        let acquisition = Arc::new(AcquisitionService::new(
            store.clone(),
            clock.clone(),
            Arc::clone(&config),
            Collaborators::default(),
        ));
        let orphan =
            OrphanCleanupService::with_owner_id(acquisition, store.clone(), clock, &config, owner);
        (orphan, store)
    }

    #[test]
    fn test_owner_id_format() {
        let owner = generate_owner_id();
        let (host, id) = owner.split_once("::").expect("separator");
        assert!(!host.is_empty());
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_numeric_only_names() {
        assert!(is_numeric_only("123456789"));
        assert!(is_numeric_only("12345678901"));
        assert!(!is_numeric_only("12345678"));
        assert!(!is_numeric_only("123456789012"));
        assert!(!is_numeric_only("agent-123456789"));
    }

    #[tokio::test]
    async fn test_removes_stale_foreign_entries() {
        let (orphan, store) = service(SchedulerConfig::default(), "x");
        store.initialize().await.expect("init");
        let now_secs = (NOW_MS / 1000) as f64;
        store.insert_raw(SetKind::Working, "stale", now_secs - 3_600.0);
        store.insert_raw(SetKind::Working, "fresh", now_secs - 10.0);
        store.insert_raw(SetKind::Waiting, "123456789", now_secs);

        let report = orphan.force_cleanup().await;
        assert_eq!(report.leadership, LeadershipOutcome::Claimed);
        assert_eq!(report.removed, 1);
        assert_eq!(report.corrupted_waiting, 1);
        assert_eq!(store.score(SetKind::Working, "stale"), None);
        assert!(store.score(SetKind::Working, "fresh").is_some());
        assert_eq!(store.score(SetKind::Waiting, "123456789"), None);
        // Leadership is released after the pass
        assert_eq!(store.leadership_owner().await.expect("owner"), None);
        assert_eq!(orphan.cleaned_total(), 2);
    }

    #[tokio::test]
    async fn test_skips_when_leadership_held_elsewhere() {
        let (orphan, store) = service(SchedulerConfig::default(), "x");
        store.initialize().await.expect("init");
        store
            .try_acquire_leadership("y", Duration::from_secs(60))
            .await
            .expect("claim");
        store.insert_raw(SetKind::Working, "stale", 1.0);

        let report = orphan.force_cleanup().await;
        assert_eq!(report.leadership, LeadershipOutcome::Contended);
        assert_eq!(report.cleaned(), 0);
        assert!(store.score(SetKind::Working, "stale").is_some());
        assert_eq!(
            store.leadership_owner().await.expect("owner").as_deref(),
            Some("y")
        );
    }

    #[tokio::test]
    async fn test_force_all_pods_ignores_leadership() {
        let mut config = SchedulerConfig::default();
        config.orphan_cleanup.force_all_pods = true;
        let (orphan, store) = service(config, "x");
        store.initialize().await.expect("init");
        store
            .try_acquire_leadership("y", Duration::from_secs(60))
            .await
            .expect("claim");
        store.insert_raw(SetKind::Working, "stale", 1.0);

        let report = orphan.force_cleanup().await;
        assert_eq!(report.leadership, LeadershipOutcome::Forced);
        assert_eq!(report.removed, 1);
        // Someone else's leadership is left alone
        assert_eq!(
            store.leadership_owner().await.expect("owner").as_deref(),
            Some("y")
        );
    }

    #[tokio::test]
    async fn test_skip_on_store_error() {
        let (orphan, store) = service(SchedulerConfig::default(), "x");
        store.set_available(false);
        let report = orphan.force_cleanup().await;
        assert_eq!(report.leadership, LeadershipOutcome::Failed);
        assert_eq!(report.cleaned(), 0);
    }
}
