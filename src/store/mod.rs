//! Coordination store access.
//!
//! All scheduling state lives in two sorted sets plus a leadership key:
//!
//! ```text
//!   waiting  (score = epoch seconds when eligible)
//!      │  AcquireBatch                ▲  ConditionalMove / Reschedule
//!      ▼                              │
//!   working  (score = deadline, doubles as ownership token)
//!
//!   cleanup-leader  (owner id, TTL)   gates orphan cleanup
//! ```
//!
//! Every mutation goes through one of the atomic scripts in [`scripts`].
//! [`SchedulerStore`] is the seam between scheduling logic and the store:
//! [`RedisStore`] runs the scripts against Redis, [`MemoryStore`] applies the
//! same transitions in-process.

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod results;
pub mod script_manager;
pub mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;

pub use keys::{KeyResolver, SchedulerKeys};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use script_manager::{ScriptManager, ScriptTransport};
pub use scripts::ScriptName;

/// Which sorted set an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    Waiting,
    Working,
}

impl SetKind {
    /// The other set.
    pub fn opposite(self) -> Self {
        match self {
            SetKind::Waiting => SetKind::Working,
            SetKind::Working => SetKind::Waiting,
        }
    }
}

/// Branch taken by the reschedule script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Moved from working to waiting.
    Moved,
    /// Absent from both sets, added to waiting.
    Added,
    /// Already waiting, left untouched.
    Exists,
}

impl RescheduleOutcome {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "moved" => Some(Self::Moved),
            "added" => Some(Self::Added),
            "exists" => Some(Self::Exists),
            _ => None,
        }
    }
}

/// A sorted-set member with its score as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoredAgent {
    pub agent_type: String,
    pub score: String,
}

impl ScoredAgent {
    pub fn new(agent_type: impl Into<String>, score: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            score: score.into(),
        }
    }

    /// Score as whole epoch seconds, if numeric.
    pub fn score_secs(&self) -> Option<i64> {
        parse_score_secs(&self.score)
    }
}

/// Per-agent scores in both sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentScores {
    pub agent_type: String,
    pub working: Option<String>,
    pub waiting: Option<String>,
}

impl AgentScores {
    /// True when the agent appears in both sets at once.
    pub fn is_in_both(&self) -> bool {
        self.working.is_some() && self.waiting.is_some()
    }
}

/// Parses a score string (`"1700000000"` or `"1700000000.0"`) into whole seconds.
pub fn parse_score_secs(score: &str) -> Option<i64> {
    let trimmed = score.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return Some(secs);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value.floor() as i64),
        _ => None,
    }
}

/// Atomic operations on scheduling state.
///
/// Scores are epoch seconds. Expected scores passed to conditional
/// operations are compared numerically, never as strings.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Loads server-side scripts. Must succeed before mutating calls.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Returns true once [`SchedulerStore::initialize`] has succeeded.
    fn is_initialized(&self) -> bool;

    /// Inserts into waiting unless present in either set. Returns true if inserted.
    async fn add_agent(&self, agent_type: &str, score: i64) -> Result<bool, StoreError>;

    /// Batch form of [`SchedulerStore::add_agent`]. Returns the agents actually inserted.
    async fn add_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError>;

    /// Removes the agent from both sets.
    async fn remove_agent(&self, agent_type: &str) -> Result<(), StoreError>;

    /// Removes each `(agent, expected_score)` from `set` only if its score matches.
    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        entries: &[(String, String)],
    ) -> Result<Vec<String>, StoreError>;

    /// Moves working→waiting, adds if absent, or leaves an already waiting agent alone.
    async fn reschedule_agent(
        &self,
        agent_type: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError>;

    /// Moves each `(agent, deadline)` present in waiting to working. Returns the agents moved.
    async fn acquire_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError>;

    /// Moves `agent_type` out of `from` into the other set if its score equals `expected`.
    async fn move_agent_conditional(
        &self,
        from: SetKind,
        agent_type: &str,
        expected: &str,
        new_score: i64,
    ) -> Result<bool, StoreError>;

    /// Scores of each agent in both sets.
    async fn score_agents(&self, agent_types: &[String]) -> Result<Vec<AgentScores>, StoreError>;

    /// Whether each agent is present in either set.
    async fn presence_agents(&self, agent_types: &[String]) -> Result<Vec<bool>, StoreError>;

    /// Members of `set` with `min <= score <= max`, ascending, paged by `offset`/`limit`.
    async fn range_by_score(
        &self,
        set: SetKind,
        min: i64,
        max: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredAgent>, StoreError>;

    async fn cardinality(&self, set: SetKind) -> Result<u64, StoreError>;

    /// Claims the leadership key if absent. Returns true if this owner now holds it.
    async fn try_acquire_leadership(&self, owner: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Deletes the leadership key only if `owner` holds it.
    async fn release_leadership(&self, owner: &str) -> Result<bool, StoreError>;

    async fn leadership_owner(&self) -> Result<Option<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score_secs() {
        assert_eq!(parse_score_secs("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_score_secs("1700000000.0"), Some(1_700_000_000));
        assert_eq!(parse_score_secs(" 12 "), Some(12));
        assert_eq!(parse_score_secs("not-a-score"), None);
        assert_eq!(parse_score_secs("inf"), None);
    }

    #[test]
    fn test_reschedule_outcome_parse() {
        assert_eq!(RescheduleOutcome::parse("moved"), Some(RescheduleOutcome::Moved));
        assert_eq!(RescheduleOutcome::parse("added"), Some(RescheduleOutcome::Added));
        assert_eq!(RescheduleOutcome::parse("exists"), Some(RescheduleOutcome::Exists));
        assert_eq!(RescheduleOutcome::parse("swapped"), None);
    }

    #[test]
    fn test_set_kind_opposite() {
        assert_eq!(SetKind::Waiting.opposite(), SetKind::Working);
        assert_eq!(SetKind::Working.opposite(), SetKind::Waiting);
    }
}
