//! Cluster-coordinated scheduling of periodic agents.
//!
//! Every process in the fleet runs one [`PriorityScheduler`]. They share
//! nothing but the store, where each agent lives in exactly one of two
//! sorted sets:
//!
//! ```text
//!        register / repopulate
//!                │
//!                ▼
//!        ┌───────────────┐   acquire (deadline score)   ┌───────────────┐
//!        │   waiting     │ ───────────────────────────▶ │   working     │
//!        │ score = next  │                              │ score = dead- │
//!        │   eligible    │ ◀─────────────────────────── │   line (CAS)  │
//!        └───────────────┘  complete / requeue / orphan └───────┬───────┘
//!                                                               │
//!                                                  zombie / orphan remove
//! ```
//!
//! - **AcquisitionService**: waiting→working moves, permits, workers, reschedule
//! - **ZombieCleanupService**: runs stuck on this process
//! - **OrphanCleanupService**: working entries abandoned by dead processes
//! - **Watchdog**: streak-based health findings
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetsched::scheduler::PriorityScheduler;
//! use fleetsched::store::RedisStore;
//! use fleetsched::SchedulerConfig;
//! use std::sync::Arc;
//!
//! let config = SchedulerConfig::from_env()?;
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379", &config.keys).await?);
//! let scheduler = PriorityScheduler::builder(store, config).build();
//!
//! scheduler.initialize().await?;
//! scheduler.register_agent("prices", Arc::new(PriceAgent)).await;
//! scheduler.start()?;
//!
//! // Graceful shutdown
//! scheduler.shutdown().await?;
//! ```

pub mod acquisition;
pub mod agent;
pub mod cadence;
pub mod jitter;
pub mod orphan;
pub mod priority;
pub mod watchdog;
pub mod zombie;

pub use acquisition::{
    AcquisitionService, AcquisitionStats, ActiveSnapshot, RegistrationOutcome, SaturationReport,
};
pub use agent::{
    AgentExecution, AlwaysEnabled, Collaborators, ExecutionInstrumentation, Interval,
    IntervalProvider, LoggingInstrumentation, NodeStatusProvider, OwnAllAgents, ShardingFilter,
    StaticIntervals,
};
pub use cadence::{BackgroundSlot, CadenceGuard, Interrupt, RunBudget};
pub use orphan::{LeadershipOutcome, OrphanCleanupService, OrphanReport};
pub use priority::{
    ConsistencyReport, HealthSummary, HeartbeatReport, PriorityScheduler, ReconcileReport,
    SchedulerBuilder, SchedulerStats, ShutdownReport,
};
pub use watchdog::{Watchdog, WatchdogConcern, WatchdogSample};
pub use zombie::ZombieCleanupService;
