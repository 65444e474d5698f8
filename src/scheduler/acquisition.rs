//! Acquisition, dispatch and reschedule of agents.
//!
//! Per agent the state machine is `Waiting → Working → Waiting`, where the
//! return to waiting carries either the normal interval (success) or the
//! error interval / immediate retry (failure). Unregistration only drops the
//! local registration; the shared entry is left for cleanup or for the new
//! owner.
//!
//! Concurrency is bounded by a semaphore. Each dispatched run holds its
//! permit in a one-shot [`PermitSlot`]; the worker's completion path and a
//! zombie eviction race to take it, and whichever comes first releases it.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::agent::{AgentExecution, Collaborators};
use super::cadence::{CadenceGuard, RunBudget};
use super::jitter::{
    apply_jitter, cadence_preserving_offset_ms, registration_delay_ms, round_up_to_second,
    shutdown_delay_ms,
};
use crate::clock::{millis_to_score, signed_millis, Clock};
use crate::config::SchedulerConfig;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::pattern::AgentNameFilter;
use crate::store::{SchedulerStore, SetKind};
use crate::utils::{lock, read, write};

/// Candidates read per unit of headroom, to absorb filtered-out entries.
const CANDIDATE_OVERSCAN: usize = 4;
const MIN_CANDIDATE_WINDOW: usize = 16;
/// Store attempts for a completion release before parking it for recovery.
const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_RETRY_BASE: Duration = Duration::from_millis(100);
/// Recovery attempts before an agent is left to repopulation.
const MAX_RECOVERY_ATTEMPTS: u32 = 5;
const MAX_RECOVERY_QUEUE: usize = 10_000;

/// Result of registering an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Inserted into the waiting set.
    Scheduled,
    /// Already present in the store; its score was left untouched.
    AlreadyScheduled,
    /// Store not ready; repopulation will insert it.
    Deferred,
}

/// What one `saturate_pool` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaturationReport {
    /// Dispatch capacity at the start of the call.
    pub headroom: usize,
    /// Eligible waiting entries seen.
    pub ready: usize,
    /// Agents moved to working by this call.
    pub acquired: usize,
    /// Acquired agents that got a worker.
    pub dispatched: usize,
    /// Acquired agents requeued for lack of a permit.
    pub rejected: usize,
    /// Whether every store round-trip succeeded.
    pub store_ok: bool,
}

/// Point-in-time copy of a local tracking entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub agent_type: String,
    /// Working-set score recorded at acquisition.
    pub score: String,
    pub run_id: u64,
}

/// Acquisition counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionStats {
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub restored: u64,
    pub recovery_dropped: u64,
}

#[derive(Debug, Default)]
struct SharedAcquisitionStats {
    acquired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    restored: AtomicU64,
    recovery_dropped: AtomicU64,
}

impl SharedAcquisitionStats {
    fn to_stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            restored: self.restored.load(Ordering::SeqCst),
            recovery_dropped: self.recovery_dropped.load(Ordering::SeqCst),
        }
    }
}

/// A permit that can be released exactly once.
#[derive(Debug)]
struct PermitSlot(Mutex<Option<OwnedSemaphorePermit>>);

impl PermitSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self(Mutex::new(Some(permit)))
    }

    /// Returns true if this call released the permit.
    fn release(&self) -> bool {
        lock(&self.0).take().is_some()
    }
}

#[derive(Debug)]
struct ActiveAgent {
    score: String,
    run_id: u64,
    permit: Arc<PermitSlot>,
    abort: Option<AbortHandle>,
}

/// A completion that still has to reach the store.
#[derive(Debug, Clone)]
struct PendingRelease {
    agent_type: String,
    expected: String,
    score: i64,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseOutcome {
    /// Moved from working to waiting by score match.
    Released,
    /// Was gone from both sets and has been re-added.
    Restored,
    /// Someone else owns the entry now.
    Superseded,
}

/// Owns the waiting→working transition and the local view of running agents.
pub struct AcquisitionService {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    collaborators: Collaborators,
    name_filter: AgentNameFilter,
    registered: RwLock<HashMap<String, Arc<dyn AgentExecution>>>,
    active: Mutex<HashMap<String, ActiveAgent>>,
    permits: Arc<Semaphore>,
    max_permits: usize,
    executing: AtomicUsize,
    next_run_id: AtomicU64,
    failure_streaks: Mutex<HashMap<String, u32>>,
    recovery: Mutex<VecDeque<PendingRelease>>,
    shutting_down: AtomicBool,
    repopulation: CadenceGuard,
    stats: SharedAcquisitionStats,
    metrics: MetricsCollector,
}

/// Runs when a worker task ends, including by abort or never being polled.
struct WorkerGuard {
    service: Arc<AcquisitionService>,
    agent_type: String,
    run_id: u64,
    permit: Arc<PermitSlot>,
}

impl WorkerGuard {
    fn new(
        service: Arc<AcquisitionService>,
        agent_type: String,
        run_id: u64,
        permit: Arc<PermitSlot>,
    ) -> Self {
        service.executing.fetch_add(1, Ordering::SeqCst);
        Self {
            service,
            agent_type,
            run_id,
            permit,
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.service.executing.fetch_sub(1, Ordering::SeqCst);
        if !self.permit.release() {
            debug!(agent_type = %self.agent_type, run_id = self.run_id, "Permit already released by cleanup");
        }
        self.service.remove_active(&self.agent_type, self.run_id);
    }
}

impl AcquisitionService {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
        collaborators: Collaborators,
    ) -> Self {
        let max_permits = config.max_concurrent_agents;
        let name_filter = AgentNameFilter::new(&config.enabled_pattern, &config.disabled_pattern);
        Self {
            store,
            clock,
            config,
            collaborators,
            name_filter,
            registered: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            executing: AtomicUsize::new(0),
            next_run_id: AtomicU64::new(1),
            failure_streaks: Mutex::new(HashMap::new()),
            recovery: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            repopulation: CadenceGuard::new(),
            stats: SharedAcquisitionStats::default(),
            metrics: MetricsCollector::new(),
        }
    }

    // ---- registration -------------------------------------------------

    /// Registers an agent for execution on this process.
    ///
    /// If the store is ready the agent is inserted into waiting with the
    /// registration jitter, unless it is already in either set. Otherwise the
    /// insert is left to the next repopulation pass.
    pub async fn register_agent(
        &self,
        agent_type: &str,
        execution: Arc<dyn AgentExecution>,
    ) -> RegistrationOutcome {
        write(&self.registered).insert(agent_type.to_string(), execution);

        if !self.store.is_initialized() {
            debug!(agent_type, "Store not initialized, deferring agent insert to repopulation");
            return RegistrationOutcome::Deferred;
        }

        let score = self.registration_score();
        match self.store.add_agent(agent_type, score).await {
            Ok(true) => {
                debug!(agent_type, score, "Registered agent");
                RegistrationOutcome::Scheduled
            }
            Ok(false) => {
                debug!(agent_type, "Agent already scheduled, keeping existing score");
                RegistrationOutcome::AlreadyScheduled
            }
            Err(e) => {
                warn!(agent_type, error = %e, "Failed to insert registered agent, deferring to repopulation");
                RegistrationOutcome::Deferred
            }
        }
    }

    /// Drops the local registration. Shared state is left to cleanup.
    pub fn unregister_agent(&self, agent_type: &str) -> bool {
        lock(&self.failure_streaks).remove(agent_type);
        write(&self.registered).remove(agent_type).is_some()
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        read(&self.registered).contains_key(agent_type)
    }

    pub fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = read(&self.registered).keys().cloned().collect();
        agents.sort();
        agents
    }

    pub fn registered_count(&self) -> usize {
        read(&self.registered).len()
    }

    /// Whether this process may run the agent: owned and not filtered out.
    pub fn is_allowed(&self, agent_type: &str) -> bool {
        self.collaborators.sharding.owns(agent_type) && self.name_filter.allows(agent_type)
    }

    fn registration_score(&self) -> i64 {
        let mut rng = rand::rng();
        let delay = registration_delay_ms(&mut rng, self.config.jitter.initial_registration_secs);
        millis_to_score(self.clock.now_millis() + delay)
    }

    // ---- repopulation -------------------------------------------------

    /// Repopulates when the refresh period has elapsed. Returns `None` if not due.
    pub async fn repopulate_if_due(&self) -> Option<Result<usize, StoreError>> {
        let now_ms = self.clock.now_millis();
        if !self
            .repopulation
            .try_begin(now_ms, self.config.refresh_period_ms())
        {
            return None;
        }
        Some(self.repopulate().await)
    }

    /// Re-adds registered agents missing from both sets.
    ///
    /// Agents already present keep their score. Returns how many were added.
    pub async fn repopulate(&self) -> Result<usize, StoreError> {
        let entries: Vec<(String, i64)> = self
            .registered_agents()
            .into_iter()
            .filter(|agent| self.is_allowed(agent))
            .map(|agent| {
                let score = self.registration_score();
                (agent, score)
            })
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }

        let mut added = 0;
        if self.config.batch_operations.enabled {
            let chunk = self.config.batch_operations.chunk_size(entries.len());
            for batch in entries.chunks(chunk) {
                added += self.store.add_agents(batch).await?.len();
            }
        } else {
            for (agent, score) in &entries {
                if self.store.add_agent(agent, *score).await? {
                    added += 1;
                }
            }
        }

        if added > 0 {
            info!(added, registered = entries.len(), "Repopulated missing agents");
        }
        Ok(added)
    }

    // ---- acquisition --------------------------------------------------

    /// Free dispatch capacity right now.
    pub fn headroom(&self) -> usize {
        let local = self.max_permits.saturating_sub(self.active_count());
        self.permits.available_permits().min(local)
    }

    fn is_eligible(&self, agent_type: &str) -> bool {
        self.is_registered(agent_type)
            && !self.is_active(agent_type)
            && self.is_allowed(agent_type)
    }

    /// Acquires and dispatches as many eligible agents as there is capacity for.
    ///
    /// Parked reschedules are retried first, even when the pool is full. With
    /// no free capacity and nothing parked this returns without touching the
    /// store.
    pub async fn saturate_pool(self: &Arc<Self>, budget: RunBudget) -> SaturationReport {
        let mut report = SaturationReport {
            store_ok: true,
            ..SaturationReport::default()
        };
        if self.is_shutting_down() {
            return report;
        }

        if !self.process_recovery_queue().await {
            report.store_ok = false;
        }

        report.headroom = self.headroom();
        if report.headroom == 0 {
            debug!("No free permits, skipping acquisition");
            return report;
        }

        let now_ms = self.clock.now_millis();
        let window = report
            .headroom
            .saturating_mul(CANDIDATE_OVERSCAN)
            .max(MIN_CANDIDATE_WINDOW);
        let candidates = match self
            .store
            .range_by_score(SetKind::Waiting, i64::MIN, millis_to_score(now_ms), 0, window)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Failed to read waiting candidates");
                report.store_ok = false;
                return report;
            }
        };
        report.ready = candidates.len();

        let entries: Vec<(String, i64)> = candidates
            .into_iter()
            .filter(|c| self.is_eligible(&c.agent_type))
            .take(report.headroom)
            .map(|c| {
                let timeout = self.collaborators.intervals.interval(&c.agent_type).timeout_ms;
                let deadline = millis_to_score(now_ms.saturating_add(signed_millis(timeout)));
                (c.agent_type, deadline)
            })
            .collect();
        if entries.is_empty() {
            return report;
        }

        let chunk = self.config.batch_operations.chunk_size(entries.len());
        for batch in entries.chunks(chunk) {
            if budget.over_budget() {
                debug!(elapsed_ms = budget.elapsed().as_millis() as u64, "Acquisition budget exhausted");
                break;
            }

            let acquired = match self.store.acquire_agents(batch).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "Failed to acquire agents");
                    report.store_ok = false;
                    break;
                }
            };

            report.acquired += acquired.len();
            for agent in acquired {
                let Some(deadline) = batch.iter().find(|(a, _)| *a == agent).map(|(_, d)| *d)
                else {
                    continue;
                };
                if self.dispatch(agent, deadline).await {
                    report.dispatched += 1;
                } else {
                    report.rejected += 1;
                }
            }
        }

        if report.acquired > 0 {
            self.stats
                .acquired
                .fetch_add(report.acquired as u64, Ordering::SeqCst);
            self.metrics.record_acquired(report.acquired);
            debug!(
                acquired = report.acquired,
                dispatched = report.dispatched,
                ready = report.ready,
                headroom = report.headroom,
                "Acquired agents"
            );
        }
        self.metrics
            .update_capacity(self.active_count(), self.available_permits());
        report
    }

    /// Starts a worker for an acquired agent. Returns false if it was requeued instead.
    async fn dispatch(self: &Arc<Self>, agent_type: String, deadline: i64) -> bool {
        let deadline_score = deadline.to_string();
        let execution = read(&self.registered).get(&agent_type).cloned();
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();

        let (execution, permit) = match (execution, permit) {
            (Some(execution), Some(permit)) => (execution, permit),
            _ => {
                self.requeue_rejected(&agent_type, &deadline_score).await;
                return false;
            }
        };

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(PermitSlot::new(permit));
        lock(&self.active).insert(
            agent_type.clone(),
            ActiveAgent {
                score: deadline_score.clone(),
                run_id,
                permit: Arc::clone(&slot),
                abort: None,
            },
        );

        let guard = WorkerGuard::new(Arc::clone(self), agent_type.clone(), run_id, slot);
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            service.run_worker(guard, execution, deadline_score).await;
        });

        if let Some(entry) = lock(&self.active).get_mut(&agent_type) {
            if entry.run_id == run_id {
                entry.abort = Some(handle.abort_handle());
            }
        }
        true
    }

    async fn requeue_rejected(&self, agent_type: &str, deadline_score: &str) {
        self.stats.rejected.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_rejected();
        let now = millis_to_score(self.clock.now_millis());
        match self
            .store
            .move_agent_conditional(SetKind::Working, agent_type, deadline_score, now)
            .await
        {
            Ok(_) => debug!(agent_type, "Requeued agent that could not be dispatched"),
            Err(e) => warn!(agent_type, error = %e, "Failed to requeue rejected agent"),
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        guard: WorkerGuard,
        execution: Arc<dyn AgentExecution>,
        deadline_score: String,
    ) {
        let agent_type = guard.agent_type.clone();
        let instrumentation = Arc::clone(&self.collaborators.instrumentation);
        instrumentation.execution_started(&agent_type);

        let started = Instant::now();
        let result = match AssertUnwindSafe(execution.execute(&agent_type))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "agent panicked: {}",
                panic_message(panic.as_ref())
            )),
        };
        let elapsed = started.elapsed();

        let success = result.is_ok();
        match &result {
            Ok(()) => {
                self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                instrumentation.execution_completed(&agent_type, elapsed);
            }
            Err(cause) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                instrumentation.execution_failed(&agent_type, cause, elapsed);
            }
        }
        self.metrics.record_execution(success, elapsed.as_secs_f64());

        self.complete_run(&agent_type, &deadline_score, success).await;
        drop(guard);
    }

    // ---- completion ---------------------------------------------------

    /// Offset from now for the next run after a completion.
    ///
    /// Success uses the normal interval with optional ± jitter. Failure uses
    /// the error interval with ± jitter, or 0 while immediate retries remain.
    /// Non-zero offsets are rounded up to whole seconds.
    pub fn compute_reschedule_offset(&self, agent_type: &str, success: bool) -> i64 {
        let interval = self.collaborators.intervals.interval(agent_type);

        let (base_ms, ratio) = if success {
            lock(&self.failure_streaks).remove(agent_type);
            (signed_millis(interval.interval_ms), self.config.jitter.success_ratio)
        } else {
            let streak = {
                let mut streaks = lock(&self.failure_streaks);
                let streak = streaks.entry(agent_type.to_string()).or_insert(0);
                *streak += 1;
                *streak
            };
            let backoff = &self.config.failure_backoff;
            if backoff.enabled && streak <= backoff.max_immediate_retries {
                debug!(agent_type, streak, "Immediate retry after failure");
                return 0;
            }
            (
                signed_millis(interval.error_interval_ms),
                self.config.jitter.failure_backoff_ratio,
            )
        };

        if base_ms <= 0 {
            return 0;
        }
        if ratio <= 0.0 {
            return base_ms;
        }
        let mut rng = rand::rng();
        round_up_to_second(apply_jitter(&mut rng, base_ms, ratio))
    }

    /// Offset used when requeueing during shutdown.
    ///
    /// Keeps the agent's original cadence when its deadline score is known,
    /// otherwise spreads it over the shutdown jitter window.
    pub fn shutdown_offset_ms(&self, agent_type: &str, deadline_score: &str) -> i64 {
        self.cadence_offset_ms(agent_type, deadline_score)
            .unwrap_or_else(|| {
                let mut rng = rand::rng();
                shutdown_delay_ms(&mut rng, self.config.jitter.shutdown_secs)
            })
    }

    /// Offset to the run the agent would have had if its current run ended normally.
    pub fn cadence_offset_ms(&self, agent_type: &str, deadline_score: &str) -> Option<i64> {
        let interval = self.collaborators.intervals.interval(agent_type);
        cadence_preserving_offset_ms(
            deadline_score,
            interval.timeout_ms,
            interval.interval_ms,
            self.clock.now_millis(),
        )
    }

    pub fn failure_streak(&self, agent_type: &str) -> u32 {
        lock(&self.failure_streaks)
            .get(agent_type)
            .copied()
            .unwrap_or(0)
    }

    async fn complete_run(&self, agent_type: &str, deadline_score: &str, success: bool) {
        let offset_ms = if self.is_shutting_down() {
            self.shutdown_offset_ms(agent_type, deadline_score)
        } else {
            self.compute_reschedule_offset(agent_type, success)
        };
        let release = PendingRelease {
            agent_type: agent_type.to_string(),
            expected: deadline_score.to_string(),
            score: millis_to_score(self.clock.now_millis() + offset_ms.max(0)),
            attempts: 0,
        };

        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.release_to_waiting(&release).await {
                Ok(outcome) => {
                    debug!(agent_type, success, score = release.score, ?outcome, "Rescheduled agent");
                    return;
                }
                Err(e) if e.is_transient() && attempt < RELEASE_ATTEMPTS => {
                    debug!(agent_type, attempt, error = %e, "Reschedule failed, retrying");
                    tokio::time::sleep(RELEASE_RETRY_BASE * attempt).await;
                }
                Err(e) => {
                    warn!(agent_type, error = %e, "Reschedule failed, queueing for recovery");
                    self.metrics.record_reschedule_failure();
                    self.enqueue_recovery(release);
                    return;
                }
            }
        }
    }

    /// Ownership-verified move back to waiting, restoring the agent if cleanup removed it.
    async fn release_to_waiting(&self, release: &PendingRelease) -> Result<ReleaseOutcome, StoreError> {
        if self
            .store
            .move_agent_conditional(
                SetKind::Working,
                &release.agent_type,
                &release.expected,
                release.score,
            )
            .await?
        {
            return Ok(ReleaseOutcome::Released);
        }

        if self
            .store
            .add_agent(&release.agent_type, release.score)
            .await?
        {
            self.stats.restored.fetch_add(1, Ordering::SeqCst);
            debug!(agent_type = %release.agent_type, "Working entry was gone, restored to waiting");
            return Ok(ReleaseOutcome::Restored);
        }
        Ok(ReleaseOutcome::Superseded)
    }

    fn enqueue_recovery(&self, release: PendingRelease) {
        let mut queue = lock(&self.recovery);
        if queue.len() >= MAX_RECOVERY_QUEUE {
            error!(agent_type = %release.agent_type, "Recovery queue full, dropping reschedule");
            self.stats.recovery_dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }
        queue.push_back(release);
    }

    pub fn recovery_queue_len(&self) -> usize {
        lock(&self.recovery).len()
    }

    /// Retries parked reschedules. Returns false if any store call failed.
    async fn process_recovery_queue(&self) -> bool {
        let pending: Vec<PendingRelease> = lock(&self.recovery).drain(..).collect();
        if pending.is_empty() {
            return true;
        }

        let mut store_ok = true;
        for mut release in pending {
            match self.release_to_waiting(&release).await {
                Ok(outcome) => {
                    info!(agent_type = %release.agent_type, ?outcome, "Recovered pending reschedule");
                }
                Err(e) => {
                    store_ok = false;
                    release.attempts += 1;
                    if release.attempts >= MAX_RECOVERY_ATTEMPTS {
                        error!(
                            agent_type = %release.agent_type,
                            attempts = release.attempts,
                            error = %e,
                            "Giving up on reschedule, repopulation will restore the agent"
                        );
                        self.stats.recovery_dropped.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.enqueue_recovery(release);
                    }
                }
            }
        }
        store_ok
    }

    // ---- local tracking -----------------------------------------------

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_active(&self, agent_type: &str) -> bool {
        lock(&self.active).contains_key(agent_type)
    }

    pub fn active_snapshot(&self) -> Vec<ActiveSnapshot> {
        let mut snapshot: Vec<ActiveSnapshot> = lock(&self.active)
            .iter()
            .map(|(agent, entry)| ActiveSnapshot {
                agent_type: agent.clone(),
                score: entry.score.clone(),
                run_id: entry.run_id,
            })
            .collect();
        snapshot.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        snapshot
    }

    fn remove_active(&self, agent_type: &str, run_id: u64) -> bool {
        let mut active = lock(&self.active);
        match active.get(agent_type) {
            Some(entry) if entry.run_id == run_id => {
                active.remove(agent_type);
                true
            }
            _ => false,
        }
    }

    /// Cancels a run and clears its local state.
    ///
    /// Aborts the worker task, drops the tracking entry and releases the
    /// permit if the worker has not already. Returns false if the run is no
    /// longer tracked.
    pub fn evict_active(&self, agent_type: &str, run_id: u64) -> bool {
        let entry = {
            let mut active = lock(&self.active);
            match active.get(agent_type) {
                Some(entry) if entry.run_id == run_id => active.remove(agent_type),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        if let Some(handle) = &entry.abort {
            handle.abort();
        }
        if entry.permit.release() {
            debug!(agent_type, run_id, "Permit released by eviction");
        }
        true
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Worker tasks that have been spawned and not yet finished.
    pub fn executing_count(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats.to_stats()
    }

    // ---- shutdown -----------------------------------------------------

    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
        info!(shutting_down, "Acquisition shutdown flag set");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Moves every still-tracked agent back to waiting with a cadence-preserving score.
    ///
    /// Completions parked for recovery are flushed first with the score they
    /// computed when they finished. Returns how many entries were moved.
    pub async fn requeue_active_for_shutdown(&self) -> usize {
        let mut requeued = self.flush_recovery_for_shutdown().await;
        for entry in self.active_snapshot() {
            let offset = self.shutdown_offset_ms(&entry.agent_type, &entry.score);
            let score = millis_to_score(self.clock.now_millis() + offset);
            match self
                .store
                .move_agent_conditional(SetKind::Working, &entry.agent_type, &entry.score, score)
                .await
            {
                Ok(true) => {
                    requeued += 1;
                    debug!(agent_type = %entry.agent_type, score, "Requeued agent for shutdown");
                }
                Ok(false) => {
                    debug!(agent_type = %entry.agent_type, "Shutdown requeue skipped, entry no longer ours");
                }
                Err(e) => {
                    warn!(agent_type = %entry.agent_type, error = %e, "Shutdown requeue failed");
                }
            }
        }
        requeued
    }

    /// Last attempt at parked completions; failures stay parked and are logged.
    async fn flush_recovery_for_shutdown(&self) -> usize {
        let pending: Vec<PendingRelease> = lock(&self.recovery).drain(..).collect();
        let mut flushed = 0;
        for release in pending {
            match self.release_to_waiting(&release).await {
                Ok(ReleaseOutcome::Superseded) => {
                    debug!(agent_type = %release.agent_type, "Parked reschedule superseded at shutdown");
                }
                Ok(outcome) => {
                    flushed += 1;
                    debug!(agent_type = %release.agent_type, score = release.score, ?outcome, "Flushed parked reschedule");
                }
                Err(e) => {
                    warn!(agent_type = %release.agent_type, error = %e, "Parked reschedule lost at shutdown");
                    self.enqueue_recovery(release);
                }
            }
        }
        flushed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{FailureBackoffConfig, JitterConfig};
    use crate::scheduler::agent::{Interval, StaticIntervals};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const START_MS: i64 = 1_700_000_000_000;

    struct NoopAgent;

    #[async_trait]
    impl AgentExecution for NoopAgent {
        async fn execute(&self, _agent_type: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BlockingAgent;

    #[async_trait]
    impl AgentExecution for BlockingAgent {
        async fn execute(&self, _agent_type: &str) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct PanickingAgent;

    #[async_trait]
    impl AgentExecution for PanickingAgent {
        async fn execute(&self, _agent_type: &str) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    fn service_with(
        config: SchedulerConfig,
    ) -> (Arc<AcquisitionService>, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let collaborators = Collaborators {
            intervals: Arc::new(StaticIntervals::new(Interval::new(1_000, 5_000, 5_000))),
            ..Collaborators::default()
        };
        let service = Arc::new(AcquisitionService::new(
            store.clone(),
            clock.clone(),
            Arc::new(config),
            collaborators,
        ));
        (service, store, clock)
    }

    async fn wait_idle(service: &AcquisitionService) {
        for _ in 0..200 {
            if service.active_count() == 0 && service.executing_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workers did not finish");
    }

    #[tokio::test]
    async fn test_register_defers_until_initialized() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        assert_eq!(
            service.register_agent("a", Arc::new(NoopAgent)).await,
            RegistrationOutcome::Deferred
        );
        store.initialize().await.expect("init");
        assert_eq!(service.repopulate().await.expect("repopulate"), 1);
        assert_eq!(store.score(SetKind::Waiting, "a"), Some((START_MS / 1000) as f64));
    }

    #[tokio::test]
    async fn test_register_keeps_existing_score() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        store.insert_raw(SetKind::Waiting, "a", 42.0);

        assert_eq!(
            service.register_agent("a", Arc::new(NoopAgent)).await,
            RegistrationOutcome::AlreadyScheduled
        );
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(42.0));
        assert_eq!(service.repopulate().await.expect("repopulate"), 0);
    }

    #[tokio::test]
    async fn test_acquire_execute_reschedule() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        service.register_agent("a", Arc::new(NoopAgent)).await;

        let report = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(report.acquired, 1);
        assert_eq!(report.dispatched, 1);
        assert!(report.store_ok);

        wait_idle(&service).await;
        let now_secs = (START_MS / 1000) as f64;
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(now_secs + 1.0));
        assert_eq!(store.score(SetKind::Working, "a"), None);
        assert_eq!(service.available_permits(), service.max_permits());
        assert_eq!(service.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_no_headroom_skips_store() {
        let (service, store, _) =
            service_with(SchedulerConfig::default().with_max_concurrent_agents(1));
        store.initialize().await.expect("init");
        service.register_agent("a", Arc::new(BlockingAgent)).await;
        service.register_agent("b", Arc::new(BlockingAgent)).await;

        let first = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(first.dispatched, 1);

        store.set_available(false);
        let second = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(second.headroom, 0);
        // An offline store would have failed any round-trip
        assert!(second.store_ok);
    }

    #[tokio::test]
    async fn test_unregistered_agents_are_not_acquired() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        store.insert_raw(SetKind::Waiting, "foreign", 0.0);

        let report = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(report.ready, 1);
        assert_eq!(report.acquired, 0);
        assert!(store.score(SetKind::Waiting, "foreign").is_some());
    }

    #[tokio::test]
    async fn test_disabled_pattern_filters_acquisition() {
        let config = SchedulerConfig::default().with_agent_patterns("", "skip-.*");
        let (service, store, _) = service_with(config);
        store.initialize().await.expect("init");
        service.register_agent("skip-me", Arc::new(NoopAgent)).await;
        service.register_agent("run-me", Arc::new(NoopAgent)).await;

        let report = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(report.acquired, 1);
        wait_idle(&service).await;
        assert!(store.score(SetKind::Waiting, "skip-me").is_some());
    }

    #[tokio::test]
    async fn test_panicking_agent_is_a_failure() {
        let (service, store, _) = service_with(SchedulerConfig::default().with_jitter(
            JitterConfig {
                failure_backoff_ratio: 0.0,
                ..JitterConfig::default()
            },
        ));
        store.initialize().await.expect("init");
        service.register_agent("p", Arc::new(PanickingAgent)).await;

        service.saturate_pool(RunBudget::unbounded()).await;
        wait_idle(&service).await;

        let now_secs = (START_MS / 1000) as f64;
        assert_eq!(store.score(SetKind::Waiting, "p"), Some(now_secs + 5.0));
        assert_eq!(service.stats().failed, 1);
        assert_eq!(service.failure_streak("p"), 1);
        assert_eq!(service.available_permits(), service.max_permits());
    }

    #[tokio::test]
    async fn test_eviction_releases_permit_once() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        service.register_agent("a", Arc::new(BlockingAgent)).await;
        service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(service.available_permits(), service.max_permits() - 1);

        let entry = service.active_snapshot().pop().expect("active entry");
        assert!(service.evict_active(&entry.agent_type, entry.run_id));
        assert!(!service.evict_active(&entry.agent_type, entry.run_id));

        wait_idle(&service).await;
        assert_eq!(service.available_permits(), service.max_permits());
    }

    #[tokio::test]
    async fn test_failure_offsets_with_immediate_retries() {
        let config = SchedulerConfig::default()
            .with_failure_backoff(FailureBackoffConfig {
                enabled: true,
                max_immediate_retries: 2,
            })
            .with_jitter(JitterConfig {
                failure_backoff_ratio: 0.0,
                ..JitterConfig::default()
            });
        let (service, _, _) = service_with(config);

        assert_eq!(service.compute_reschedule_offset("a", false), 0);
        assert_eq!(service.compute_reschedule_offset("a", false), 0);
        assert_eq!(service.compute_reschedule_offset("a", false), 5_000);
        assert_eq!(service.failure_streak("a"), 3);

        assert_eq!(service.compute_reschedule_offset("a", true), 1_000);
        assert_eq!(service.failure_streak("a"), 0);
        assert_eq!(service.compute_reschedule_offset("a", false), 0);
    }

    #[tokio::test]
    async fn test_success_jitter_bounds() {
        let config = SchedulerConfig::default().with_jitter(JitterConfig {
            success_ratio: 0.5,
            ..JitterConfig::default()
        });
        let (service, _, _) = service_with(config);
        for _ in 0..200 {
            let offset = service.compute_reschedule_offset("a", true);
            assert!((500..=2_000).contains(&offset), "offset {}", offset);
            assert_eq!(offset % 1_000, 0);
        }
    }

    #[tokio::test]
    async fn test_shutdown_offset_preserves_cadence() {
        let (service, _, clock) = service_with(SchedulerConfig::default());
        // Acquired at START with timeout 5s and interval 1s: next run at START + 1s
        let deadline = ((START_MS + 5_000) / 1000).to_string();
        assert_eq!(service.shutdown_offset_ms("a", &deadline), 1_000);

        clock.advance(Duration::from_secs(3));
        assert_eq!(service.shutdown_offset_ms("a", &deadline), 0);
        assert_eq!(service.shutdown_offset_ms("a", "corrupt"), 0);
    }

    #[tokio::test]
    async fn test_completion_restores_removed_entry() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        let release = PendingRelease {
            agent_type: "gone".to_string(),
            expected: "100".to_string(),
            score: 200,
            attempts: 0,
        };
        assert_eq!(
            service.release_to_waiting(&release).await.expect("release"),
            ReleaseOutcome::Restored
        );
        assert_eq!(
            service.release_to_waiting(&release).await.expect("release"),
            ReleaseOutcome::Superseded
        );
    }

    #[tokio::test]
    async fn test_recovery_queue_retries_after_outage() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        store.insert_raw(SetKind::Working, "a", 100.0);
        service.enqueue_recovery(PendingRelease {
            agent_type: "a".to_string(),
            expected: "100".to_string(),
            score: 300,
            attempts: 0,
        });

        store.set_available(false);
        assert!(!service.process_recovery_queue().await);
        assert_eq!(service.recovery_queue_len(), 1);

        store.set_available(true);
        assert!(service.process_recovery_queue().await);
        assert_eq!(service.recovery_queue_len(), 0);
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(300.0));
    }

    #[tokio::test]
    async fn test_recovery_runs_while_pool_is_full() {
        let (service, store, _) =
            service_with(SchedulerConfig::default().with_max_concurrent_agents(1));
        store.initialize().await.expect("init");
        service.register_agent("busy", Arc::new(BlockingAgent)).await;
        assert_eq!(service.saturate_pool(RunBudget::unbounded()).await.dispatched, 1);

        store.insert_raw(SetKind::Working, "parked", 100.0);
        service.enqueue_recovery(PendingRelease {
            agent_type: "parked".to_string(),
            expected: "100".to_string(),
            score: 300,
            attempts: 0,
        });

        let report = service.saturate_pool(RunBudget::unbounded()).await;
        assert_eq!(report.headroom, 0);
        assert!(report.store_ok);
        assert_eq!(service.recovery_queue_len(), 0);
        assert_eq!(store.score(SetKind::Working, "parked"), None);
        assert_eq!(store.score(SetKind::Waiting, "parked"), Some(300.0));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_parked_completions() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        store.insert_raw(SetKind::Working, "a", 100.0);
        store.insert_raw(SetKind::Working, "b", 100.0);
        service.enqueue_recovery(PendingRelease {
            agent_type: "a".to_string(),
            expected: "100".to_string(),
            score: 300,
            attempts: 0,
        });
        service.enqueue_recovery(PendingRelease {
            agent_type: "b".to_string(),
            expected: "99".to_string(),
            score: 300,
            attempts: 0,
        });

        service.set_shutting_down(true);
        assert_eq!(service.requeue_active_for_shutdown().await, 1);
        assert_eq!(service.recovery_queue_len(), 0);
        assert_eq!(store.score(SetKind::Working, "a"), None);
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(300.0));
        // Someone else owns b's working entry now
        assert_eq!(store.score(SetKind::Working, "b"), Some(100.0));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_parked_completion_on_outage() {
        let (service, store, _) = service_with(SchedulerConfig::default());
        store.initialize().await.expect("init");
        store.insert_raw(SetKind::Working, "a", 100.0);
        service.enqueue_recovery(PendingRelease {
            agent_type: "a".to_string(),
            expected: "100".to_string(),
            score: 300,
            attempts: 0,
        });

        store.set_available(false);
        assert_eq!(service.requeue_active_for_shutdown().await, 0);
        assert_eq!(service.recovery_queue_len(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
