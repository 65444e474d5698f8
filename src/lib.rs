//! fleetsched: cluster-coordinated scheduling of periodic caching agents.
//!
//! A fleet of identical processes share two Redis sorted sets, `waiting` and
//! `working`, and move agents between them only through atomic scripts. Each
//! process bounds its own concurrency, recovers its own stuck runs and, under
//! a short-lived leadership key, recovers runs abandoned by dead peers.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pattern;
pub mod scheduler;
pub mod store;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{ConfigError, SchedulerError, StoreError};
pub use scheduler::{AgentExecution, PriorityScheduler};
pub use store::{MemoryStore, RedisStore, SchedulerStore};
