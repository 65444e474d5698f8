//! The root scheduler: heartbeat loop, reconcile, health summary and shutdown.
//!
//! One heartbeat is sequential and never overlaps the next. Acquisition runs
//! inline; zombie cleanup, orphan cleanup and reconcile are spawned into
//! single-flight slots so a slow pass cannot stall acquisition.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::acquisition::{
    AcquisitionService, AcquisitionStats, RegistrationOutcome, SaturationReport,
};
use super::agent::{
    AgentExecution, Collaborators, ExecutionInstrumentation, IntervalProvider, NodeStatusProvider,
    ShardingFilter,
};
use super::cadence::{BackgroundSlot, CadenceGuard, Interrupt, RunBudget};
use super::orphan::OrphanCleanupService;
use super::watchdog::{Watchdog, WatchdogConcern, WatchdogSample};
use super::zombie::ZombieCleanupService;
use crate::clock::{signed_millis, Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;
use crate::store::{SchedulerStore, SetKind};
use crate::utils::{lock, read, write};

/// Extra time a budgeted background pass gets before it counts as hung.
const HUNG_GRACE: Duration = Duration::from_secs(30);
/// Hung limit for passes without an explicit budget.
const HUNG_LIMIT_UNBUDGETED: Duration = Duration::from_secs(60);
/// Waiting members checked against working per consistency sample.
const CONSISTENCY_SAMPLE: usize = 50;
const DRAIN_POLL: Duration = Duration::from_millis(50);

fn hung_limit(run_budget_ms: u64) -> Duration {
    if run_budget_ms == 0 {
        HUNG_LIMIT_UNBUDGETED
    } else {
        Duration::from_millis(run_budget_ms) + HUNG_GRACE
    }
}

/// What one heartbeat did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatReport {
    /// The heartbeat returned early (node disabled or shutting down).
    pub skipped: bool,
    pub saturation: SaturationReport,
    /// Watchdog concerns that fired on this heartbeat.
    pub fired: Vec<WatchdogConcern>,
    pub store_ok: bool,
}

/// Outcome of graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// All workers finished within the shutdown timeout.
    pub drained: bool,
    /// Runs still tracked when the wait ended.
    pub remaining: usize,
    /// Entries moved back to waiting with a cadence-preserving score.
    pub requeued: usize,
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: usize,
    pub unregistered: usize,
}

/// Sampled check that no waiting member is also in working.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub sampled: usize,
    pub violations: Vec<String>,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub run_count: u64,
    pub heartbeat_failures: u64,
    /// Agents offered to this process, owned or not.
    pub known_agents: usize,
    pub registered_agents: usize,
    pub active_agents: usize,
    pub available_permits: usize,
    pub max_permits: usize,
    pub zombies_cleaned: u64,
    pub orphans_cleaned: u64,
    pub acquisition: AcquisitionStats,
}

/// Snapshot used by the periodic health line.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub healthy: bool,
    /// Watchdog concerns that fired within the last summary period.
    pub concerns: Vec<String>,
    pub consistency: Option<ConsistencyReport>,
    pub stats: SchedulerStats,
}

/// Builder for [`PriorityScheduler`].
pub struct SchedulerBuilder {
    store: Arc<dyn SchedulerStore>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    owner_id: Option<String>,
}

impl SchedulerBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_intervals(mut self, intervals: Arc<dyn IntervalProvider>) -> Self {
        self.collaborators.intervals = intervals;
        self
    }

    pub fn with_sharding(mut self, sharding: Arc<dyn ShardingFilter>) -> Self {
        self.collaborators.sharding = sharding;
        self
    }

    pub fn with_node_status(mut self, node_status: Arc<dyn NodeStatusProvider>) -> Self {
        self.collaborators.node_status = node_status;
        self
    }

    pub fn with_instrumentation(
        mut self,
        instrumentation: Arc<dyn ExecutionInstrumentation>,
    ) -> Self {
        self.collaborators.instrumentation = instrumentation;
        self
    }

    /// Fixes the leadership owner id instead of generating `host::uuid`.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn build(self) -> PriorityScheduler {
        let config = Arc::new(self.config);
        let acquisition = Arc::new(AcquisitionService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&config),
            self.collaborators.clone(),
        ));
        let zombie = Arc::new(ZombieCleanupService::new(
            Arc::clone(&acquisition),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &config,
        ));
        let orphan = match self.owner_id {
            Some(owner) => OrphanCleanupService::with_owner_id(
                Arc::clone(&acquisition),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                &config,
                owner,
            ),
            None => OrphanCleanupService::new(
                Arc::clone(&acquisition),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                &config,
            ),
        };

        let health_cadence = CadenceGuard::new();
        health_cadence.mark(self.clock.now_millis());
        let (shutdown_tx, _) = broadcast::channel(1);

        PriorityScheduler {
            inner: Arc::new(SchedulerInner {
                watchdog: Mutex::new(Watchdog::new(config.watchdog_streak_threshold)),
                store: self.store,
                clock: self.clock,
                collaborators: self.collaborators,
                acquisition,
                zombie,
                orphan: Arc::new(orphan),
                known: RwLock::new(HashMap::new()),
                interrupt: Interrupt::new(),
                zombie_slot: BackgroundSlot::new("zombie_cleanup"),
                orphan_slot: BackgroundSlot::new("orphan_cleanup"),
                reconcile_slot: BackgroundSlot::new("reconcile"),
                reconcile_cadence: CadenceGuard::new(),
                health_cadence,
                run_count: AtomicU64::new(0),
                heartbeat_failures: AtomicU64::new(0),
                consistency: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                metrics: MetricsCollector::new(),
                config,
            }),
            shutdown_tx,
            loop_handle: Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }
}

struct SchedulerInner {
    config: Arc<SchedulerConfig>,
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    acquisition: Arc<AcquisitionService>,
    zombie: Arc<ZombieCleanupService>,
    orphan: Arc<OrphanCleanupService>,
    watchdog: Mutex<Watchdog>,
    /// Every agent offered via registration, including ones not owned here.
    known: RwLock<HashMap<String, Arc<dyn AgentExecution>>>,
    interrupt: Interrupt,
    zombie_slot: BackgroundSlot,
    orphan_slot: BackgroundSlot,
    reconcile_slot: BackgroundSlot,
    reconcile_cadence: CadenceGuard,
    health_cadence: CadenceGuard,
    run_count: AtomicU64,
    heartbeat_failures: AtomicU64,
    consistency: Mutex<Option<ConsistencyReport>>,
    shut_down: AtomicBool,
    metrics: MetricsCollector,
}

/// Cluster-coordinated scheduler for periodic agents.
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl PriorityScheduler {
    pub fn builder(store: Arc<dyn SchedulerStore>, config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            config,
            clock: Arc::new(SystemClock),
            collaborators: Collaborators::default(),
            owner_id: None,
        }
    }

    /// Loads the script catalogue into the store.
    ///
    /// This is the one fatal path: without scripts nothing can be scheduled.
    pub async fn initialize(&self) -> Result<(), SchedulerError> {
        self.inner.store.initialize().await.map_err(|e| {
            error!(error = %e, "Scheduler store initialization failed");
            SchedulerError::Initialization(e.to_string())
        })?;
        info!(
            max_concurrent_agents = self.inner.config.max_concurrent_agents,
            owner = %self.inner.orphan.owner_id(),
            "Scheduler initialized"
        );
        Ok(())
    }

    /// Offers an agent to this process.
    ///
    /// The agent is registered for execution only if this process owns it
    /// and the name filters allow it; otherwise it is remembered so a later
    /// reconcile can pick it up. Returns `None` when not registered.
    pub async fn register_agent(
        &self,
        agent_type: &str,
        execution: Arc<dyn AgentExecution>,
    ) -> Option<RegistrationOutcome> {
        write(&self.inner.known).insert(agent_type.to_string(), Arc::clone(&execution));
        if !self.inner.acquisition.is_allowed(agent_type) {
            debug!(agent_type, "Agent not owned by this process, remembered for reconcile");
            return None;
        }
        Some(
            self.inner
                .acquisition
                .register_agent(agent_type, execution)
                .await,
        )
    }

    /// Forgets an agent locally. Shared-store state is left to cleanup.
    pub fn unregister_agent(&self, agent_type: &str) -> bool {
        let known = write(&self.inner.known).remove(agent_type).is_some();
        let registered = self.inner.acquisition.unregister_agent(agent_type);
        known || registered
    }

    /// Runs one heartbeat. Never fails; problems show up in the report and stats.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        self.inner.guarded_heartbeat().await
    }

    /// Starts the heartbeat loop.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.inner.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Heartbeat loop received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        inner.guarded_heartbeat().await;
                    }
                }
            }
        });
        *lock(&self.loop_handle) = Some(handle);

        info!(heartbeat_ms = period.as_millis() as u64, "Scheduler started");
        Ok(())
    }

    /// Stops acquiring, waits for in-flight runs and requeues what is left.
    ///
    /// Running agents are not cancelled. Whatever is still tracked when the
    /// timeout expires is moved back to waiting with a cadence-preserving
    /// score.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SchedulerError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        info!("Initiating scheduler shutdown");

        self.inner.acquisition.set_shutting_down(true);
        self.inner.interrupt.trigger();

        // Ignore send error, the loop may never have started
        let _ = self.shutdown_tx.send(());
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Heartbeat loop panicked during shutdown");
            }
        }
        self.is_running.store(false, Ordering::SeqCst);

        let timeout = self.inner.config.shutdown_timeout();
        let acquisition = Arc::clone(&self.inner.acquisition);
        let drained = tokio::time::timeout(timeout, async move {
            while acquisition.executing_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        let remaining = self.inner.acquisition.active_count();
        if !drained {
            warn!(
                remaining,
                timeout_ms = timeout.as_millis() as u64,
                "Agents still running at shutdown timeout"
            );
        }

        let requeued = self.inner.acquisition.requeue_active_for_shutdown().await;
        let report = ShutdownReport {
            drained,
            remaining,
            requeued,
        };
        info!(drained, remaining, requeued, "Scheduler shutdown complete");
        Ok(report)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats(self.is_running())
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.inner.health_summary(self.is_running())
    }

    /// Runs a reconcile pass inline.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile(RunBudget::unbounded()).await
    }

    pub fn acquisition(&self) -> &Arc<AcquisitionService> {
        &self.inner.acquisition
    }

    pub fn zombie_cleanup(&self) -> &Arc<ZombieCleanupService> {
        &self.inner.zombie
    }

    pub fn orphan_cleanup(&self) -> &Arc<OrphanCleanupService> {
        &self.inner.orphan
    }

    pub fn store(&self) -> &Arc<dyn SchedulerStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl SchedulerInner {
    /// A heartbeat with panics turned into a counted failure.
    async fn guarded_heartbeat(self: &Arc<Self>) -> HeartbeatReport {
        let started = Instant::now();
        let report = match AssertUnwindSafe(self.run_heartbeat()).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                error!("Heartbeat panicked");
                HeartbeatReport::default()
            }
        };

        if !report.skipped {
            if !report.store_ok {
                self.heartbeat_failures.fetch_add(1, Ordering::SeqCst);
            }
            self.metrics
                .record_heartbeat(started.elapsed().as_secs_f64(), report.store_ok);
        }
        report
    }

    async fn run_heartbeat(self: &Arc<Self>) -> HeartbeatReport {
        if !self.collaborators.node_status.is_enabled() {
            debug!("Node disabled, skipping heartbeat");
            return HeartbeatReport {
                skipped: true,
                store_ok: true,
                ..HeartbeatReport::default()
            };
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return HeartbeatReport {
                skipped: true,
                store_ok: true,
                ..HeartbeatReport::default()
            };
        }

        self.run_count.fetch_add(1, Ordering::SeqCst);
        let now_ms = self.clock.now_millis();
        let mut store_ok = true;

        self.spawn_reconcile_if_due(now_ms);

        if let Some(Err(e)) = self.acquisition.repopulate_if_due().await {
            warn!(error = %e, "Repopulation failed");
            store_ok = false;
        }

        let budget = RunBudget::from_millis(0, self.config.heartbeat_interval_ms);
        let saturation = self.acquisition.saturate_pool(budget).await;
        store_ok &= saturation.store_ok;

        let sample = WatchdogSample {
            max_permits: self.acquisition.max_permits(),
            available_permits: self.acquisition.available_permits(),
            executing: self.acquisition.executing_count(),
            ready: saturation.ready,
            headroom: saturation.headroom,
            acquired: saturation.acquired,
            store_ok,
        };
        let fired = lock(&self.watchdog).observe(&sample, now_ms);
        for concern in &fired {
            self.metrics.record_watchdog(concern.as_str());
        }

        self.recover_hung_tasks(now_ms);
        self.spawn_cleanups_if_due(now_ms);

        if self
            .health_cadence
            .try_begin(
                now_ms,
                signed_millis(self.config.health_summary_period_secs.saturating_mul(1_000)),
            )
        {
            self.log_health_summary();
        }

        HeartbeatReport {
            skipped: false,
            saturation,
            fired,
            store_ok,
        }
    }

    fn spawn_reconcile_if_due(self: &Arc<Self>, now_ms: i64) {
        if self.reconcile_slot.is_running()
            || !self
                .reconcile_cadence
                .try_begin(now_ms, self.config.refresh_period_ms())
        {
            return;
        }
        let inner = Arc::clone(self);
        let budget_ms = self.config.reconcile.run_budget_ms;
        let default_ms = self.config.refresh_period_ms().max(0) as u64;
        self.reconcile_slot.try_spawn(now_ms, async move {
            inner
                .reconcile(RunBudget::from_millis(budget_ms, default_ms))
                .await;
        });
    }

    fn spawn_cleanups_if_due(&self, now_ms: i64) {
        if self.zombie.is_due(now_ms) {
            let zombie = Arc::clone(&self.zombie);
            let interrupt = self.interrupt.clone();
            if !self.zombie_slot.try_spawn(now_ms, async move {
                zombie.run_if_due(&interrupt).await;
            }) {
                debug!("Zombie cleanup still running, skipping this cycle");
                self.metrics.record_cleanup_skipped("zombie");
            }
        }

        if self.orphan.is_due(now_ms) {
            let orphan = Arc::clone(&self.orphan);
            let interrupt = self.interrupt.clone();
            if !self.orphan_slot.try_spawn(now_ms, async move {
                orphan.run_if_due(&interrupt).await;
            }) {
                debug!("Orphan cleanup still running, skipping this cycle");
                self.metrics.record_cleanup_skipped("orphan");
            }
        }
    }

    fn recover_hung_tasks(&self, now_ms: i64) {
        self.zombie_slot
            .abort_if_hung(now_ms, hung_limit(self.zombie.run_budget_ms()));
        self.orphan_slot
            .abort_if_hung(now_ms, hung_limit(self.orphan.run_budget_ms()));
        self.reconcile_slot
            .abort_if_hung(now_ms, hung_limit(self.config.reconcile.run_budget_ms));
    }

    /// Aligns registrations with ownership and samples set consistency.
    async fn reconcile(&self, budget: RunBudget) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let known: Vec<(String, Arc<dyn AgentExecution>)> = read(&self.known)
            .iter()
            .map(|(agent, execution)| (agent.clone(), Arc::clone(execution)))
            .collect();

        for (agent, execution) in known {
            if self.interrupt.is_triggered() || budget.over_budget() {
                debug!("Reconcile stopped early");
                break;
            }
            let allowed = self.acquisition.is_allowed(&agent);
            let registered = self.acquisition.is_registered(&agent);
            if allowed && !registered {
                self.acquisition.register_agent(&agent, execution).await;
                report.registered += 1;
            } else if !allowed && registered {
                self.acquisition.unregister_agent(&agent);
                report.unregistered += 1;
            }
        }

        if report.registered > 0 || report.unregistered > 0 {
            info!(
                registered = report.registered,
                unregistered = report.unregistered,
                "Reconciled agent ownership"
            );
        }

        if let Some(consistency) = self.sample_consistency().await {
            if !consistency.violations.is_empty() {
                error!(
                    violations = ?consistency.violations,
                    "Agents present in both waiting and working sets"
                );
            }
            *lock(&self.consistency) = Some(consistency);
        }
        report
    }

    async fn sample_consistency(&self) -> Option<ConsistencyReport> {
        let sample = match self
            .store
            .range_by_score(SetKind::Waiting, i64::MIN, i64::MAX, 0, CONSISTENCY_SAMPLE)
            .await
        {
            Ok(sample) => sample,
            Err(e) => {
                debug!(error = %e, "Consistency sample skipped");
                return None;
            }
        };
        if sample.is_empty() {
            return Some(ConsistencyReport::default());
        }

        let agents: Vec<String> = sample.into_iter().map(|s| s.agent_type).collect();
        match self.store.score_agents(&agents).await {
            Ok(scores) => Some(ConsistencyReport {
                sampled: agents.len(),
                violations: scores
                    .into_iter()
                    .filter(|s| s.is_in_both())
                    .map(|s| s.agent_type)
                    .collect(),
            }),
            Err(e) => {
                debug!(error = %e, "Consistency score lookup failed");
                None
            }
        }
    }

    fn stats(&self, running: bool) -> SchedulerStats {
        SchedulerStats {
            running,
            run_count: self.run_count.load(Ordering::SeqCst),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::SeqCst),
            known_agents: read(&self.known).len(),
            registered_agents: self.acquisition.registered_count(),
            active_agents: self.acquisition.active_count(),
            available_permits: self.acquisition.available_permits(),
            max_permits: self.acquisition.max_permits(),
            zombies_cleaned: self.zombie.cleaned_total(),
            orphans_cleaned: self.orphan.cleaned_total(),
            acquisition: self.acquisition.stats(),
        }
    }

    fn health_summary(&self, running: bool) -> HealthSummary {
        let period_ms = signed_millis(self.config.health_summary_period_secs.saturating_mul(1_000));
        let since = self.clock.now_millis().saturating_sub(period_ms);
        let concerns: Vec<String> = lock(&self.watchdog)
            .active_since(since)
            .into_iter()
            .map(|c| c.as_str().to_string())
            .collect();
        let consistency = lock(&self.consistency).clone();
        let consistent = consistency
            .as_ref()
            .map_or(true, |c| c.violations.is_empty());

        HealthSummary {
            healthy: concerns.is_empty() && consistent,
            concerns,
            consistency,
            stats: self.stats(running),
        }
    }

    fn log_health_summary(&self) {
        let summary = self.health_summary(!self.shut_down.load(Ordering::SeqCst));
        let stats = &summary.stats;
        let concerns = summary.concerns.join(",");
        let violations = summary
            .consistency
            .as_ref()
            .map_or(0, |c| c.violations.len());

        if summary.healthy {
            info!(
                health = "HEALTHY",
                runs = stats.run_count,
                registered = stats.registered_agents,
                active = stats.active_agents,
                free_permits = stats.available_permits,
                zombies_cleaned = stats.zombies_cleaned,
                orphans_cleaned = stats.orphans_cleaned,
                heartbeat_failures = stats.heartbeat_failures,
                "Scheduler health"
            );
        } else {
            warn!(
                health = "DEGRADED",
                concerns = %concerns,
                consistency_violations = violations,
                runs = stats.run_count,
                registered = stats.registered_agents,
                active = stats.active_agents,
                free_permits = stats.available_permits,
                zombies_cleaned = stats.zombies_cleaned,
                orphans_cleaned = stats.orphans_cleaned,
                heartbeat_failures = stats.heartbeat_failures,
                "Scheduler health"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::agent::{Interval, StaticIntervals};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const START_MS: i64 = 1_700_000_000_000;

    struct CountingAgent(Arc<AtomicUsize>);

    #[async_trait]
    impl AgentExecution for CountingAgent {
        async fn execute(&self, _agent_type: &str) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Disabled;

    impl NodeStatusProvider for Disabled {
        fn is_enabled(&self) -> bool {
            false
        }
    }

    struct OwnsPrefix(&'static str);

    impl ShardingFilter for OwnsPrefix {
        fn owns(&self, agent_type: &str) -> bool {
            agent_type.starts_with(self.0)
        }
    }

    fn scheduler(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> SchedulerBuilder {
        PriorityScheduler::builder(store, SchedulerConfig::default())
            .with_clock(clock)
            .with_intervals(Arc::new(StaticIntervals::new(Interval::new(
                1_000, 5_000, 5_000,
            ))))
    }

    #[test]
    fn test_hung_limit() {
        assert_eq!(hung_limit(0), Duration::from_secs(60));
        assert_eq!(hung_limit(10_000), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_unavailable() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store.set_available(false);
        let scheduler = scheduler(store, clock).build();
        assert!(matches!(
            scheduler.initialize().await,
            Err(SchedulerError::Initialization(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_node_skips_heartbeat() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scheduler = scheduler(store, clock)
            .with_node_status(Arc::new(Disabled))
            .build();
        scheduler.initialize().await.expect("init");

        let report = scheduler.heartbeat().await;
        assert!(report.skipped);
        assert_eq!(scheduler.stats().run_count, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_runs_registered_agent() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scheduler = scheduler(store.clone(), clock).build();
        scheduler.initialize().await.expect("init");

        let runs = Arc::new(AtomicUsize::new(0));
        let outcome = scheduler
            .register_agent("a", Arc::new(CountingAgent(runs.clone())))
            .await;
        assert_eq!(outcome, Some(RegistrationOutcome::Scheduled));

        let report = scheduler.heartbeat().await;
        assert_eq!(report.saturation.acquired, 1);
        assert!(report.store_ok);

        for _ in 0..100 {
            if scheduler.acquisition().active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.score(SetKind::Waiting, "a"),
            Some((START_MS / 1000 + 1) as f64)
        );
        assert_eq!(scheduler.stats().run_count, 1);
    }

    #[tokio::test]
    async fn test_unowned_agents_wait_for_reconcile() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scheduler = scheduler(store, clock)
            .with_sharding(Arc::new(OwnsPrefix("mine-")))
            .build();
        scheduler.initialize().await.expect("init");

        let runs = Arc::new(AtomicUsize::new(0));
        assert!(scheduler
            .register_agent("theirs-a", Arc::new(CountingAgent(runs.clone())))
            .await
            .is_none());
        assert!(scheduler
            .register_agent("mine-a", Arc::new(CountingAgent(runs)))
            .await
            .is_some());

        let report = scheduler.reconcile().await;
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(scheduler.stats().known_agents, 2);
        assert_eq!(scheduler.stats().registered_agents, 1);
    }

    #[tokio::test]
    async fn test_store_outage_counts_failures() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scheduler = scheduler(store.clone(), clock).build();
        scheduler.initialize().await.expect("init");
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_agent("a", Arc::new(CountingAgent(runs)))
            .await;

        store.set_available(false);
        let report = scheduler.heartbeat().await;
        assert!(!report.store_ok);
        assert_eq!(scheduler.stats().heartbeat_failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_an_error() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let scheduler = scheduler(store, clock).build();
        scheduler.initialize().await.expect("init");
        scheduler.start().expect("start");
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

        let report = scheduler.shutdown().await.expect("shutdown");
        assert!(report.drained);
        assert!(!scheduler.is_running());
        assert!(matches!(
            scheduler.shutdown().await,
            Err(SchedulerError::NotRunning)
        ));
    }
}
