//! Agents and the collaborators the scheduler consults about them.
//!
//! The scheduler only knows an agent by its type string. What the agent does,
//! how often it runs, and whether this process owns it are answered by the
//! traits below.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Work performed for one agent run.
///
/// Returning `Err` (or panicking) counts as a failure and schedules the agent
/// with its error interval.
#[async_trait]
pub trait AgentExecution: Send + Sync {
    async fn execute(&self, agent_type: &str) -> anyhow::Result<()>;
}

/// Advisory notifications about agent runs.
pub trait ExecutionInstrumentation: Send + Sync {
    fn execution_started(&self, _agent_type: &str) {}

    fn execution_completed(&self, _agent_type: &str, _elapsed: Duration) {}

    fn execution_failed(&self, _agent_type: &str, _cause: &anyhow::Error, _elapsed: Duration) {}
}

/// Scheduling intervals for an agent, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Delay before the next run after a success.
    pub interval_ms: u64,
    /// Delay before the next run after a failure.
    pub error_interval_ms: u64,
    /// Expected maximum run time; sets the working-set deadline.
    pub timeout_ms: u64,
}

impl Interval {
    pub fn new(interval_ms: u64, error_interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            error_interval_ms,
            timeout_ms,
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::new(60_000, 60_000, 300_000)
    }
}

/// Supplies the intervals of each agent.
pub trait IntervalProvider: Send + Sync {
    fn interval(&self, agent_type: &str) -> Interval;
}

/// Decides whether this process owns an agent.
pub trait ShardingFilter: Send + Sync {
    fn owns(&self, agent_type: &str) -> bool;
}

/// Gate for the whole heartbeat.
pub trait NodeStatusProvider: Send + Sync {
    fn is_enabled(&self) -> bool;
}

/// Instrumentation that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInstrumentation;

impl ExecutionInstrumentation for LoggingInstrumentation {
    fn execution_started(&self, agent_type: &str) {
        debug!(agent_type, "Agent execution started");
    }

    fn execution_completed(&self, agent_type: &str, elapsed: Duration) {
        debug!(agent_type, elapsed_ms = elapsed.as_millis() as u64, "Agent execution completed");
    }

    fn execution_failed(&self, agent_type: &str, cause: &anyhow::Error, elapsed: Duration) {
        warn!(
            agent_type,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %cause,
            "Agent execution failed"
        );
    }
}

/// Owns every agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnAllAgents;

impl ShardingFilter for OwnAllAgents {
    fn owns(&self, _agent_type: &str) -> bool {
        true
    }
}

/// Node that is always enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl NodeStatusProvider for AlwaysEnabled {
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Per-agent intervals with a default for unknown agents.
#[derive(Debug, Clone, Default)]
pub struct StaticIntervals {
    default: Interval,
    overrides: HashMap<String, Interval>,
}

impl StaticIntervals {
    pub fn new(default: Interval) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_agent(mut self, agent_type: impl Into<String>, interval: Interval) -> Self {
        self.overrides.insert(agent_type.into(), interval);
        self
    }

    pub fn insert(&mut self, agent_type: impl Into<String>, interval: Interval) {
        self.overrides.insert(agent_type.into(), interval);
    }
}

impl IntervalProvider for StaticIntervals {
    fn interval(&self, agent_type: &str) -> Interval {
        self.overrides
            .get(agent_type)
            .copied()
            .unwrap_or(self.default)
    }
}

/// External collaborators, bundled so services can share them.
#[derive(Clone)]
pub struct Collaborators {
    pub intervals: Arc<dyn IntervalProvider>,
    pub sharding: Arc<dyn ShardingFilter>,
    pub node_status: Arc<dyn NodeStatusProvider>,
    pub instrumentation: Arc<dyn ExecutionInstrumentation>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            intervals: Arc::new(StaticIntervals::default()),
            sharding: Arc::new(OwnAllAgents),
            node_status: Arc::new(AlwaysEnabled),
            instrumentation: Arc::new(LoggingInstrumentation),
        }
    }
}
