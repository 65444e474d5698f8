//! Redis-backed scheduler store.
//!
//! Uses a `ConnectionManager`, which reconnects on its own after a dropped
//! connection or failover; script hashes survive that through the
//! [`ScriptManager`] self-heal.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use tracing::debug;

use super::keys::{KeyResolver, SchedulerKeys};
use super::results::{
    parse_counted_list, parse_int, parse_presence, parse_score_triples, parse_tag,
    value_to_string,
};
use super::script_manager::{ScriptManager, ScriptTransport};
use super::scripts::ScriptName;
use super::{AgentScores, RescheduleOutcome, ScoredAgent, SchedulerStore, SetKind};
use crate::config::KeysConfig;
use crate::error::StoreError;

/// Raw command access over a connection manager.
#[derive(Clone)]
pub struct RedisTransport {
    redis: ConnectionManager,
}

#[async_trait]
impl ScriptTransport for RedisTransport {
    async fn script_load(&self, body: &str) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        let mut conn = self.redis.clone();
        let value = redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, Value>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Result<Value, StoreError> {
        let mut conn = self.redis.clone();
        let value = redis::cmd("EVAL")
            .arg(body)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async::<_, Value>(&mut conn)
            .await?;
        Ok(value)
    }
}

/// Scheduler state in Redis sorted sets.
pub struct RedisStore {
    scripts: ScriptManager<RedisTransport>,
    keys: SchedulerKeys,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `keys` - Key names and namespace
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: &KeysConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, keys))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, keys: &KeysConfig) -> Self {
        Self {
            scripts: ScriptManager::new(RedisTransport { redis }),
            keys: KeyResolver::scheduler_keys(keys),
        }
    }

    pub fn keys(&self) -> &SchedulerKeys {
        &self.keys
    }

    fn connection(&self) -> ConnectionManager {
        self.scripts.transport().redis.clone()
    }

    fn set_key(&self, set: SetKind) -> &str {
        match set {
            SetKind::Waiting => &self.keys.waiting,
            SetKind::Working => &self.keys.working,
        }
    }

    /// `[working, waiting]`, the key order of the two-set scripts.
    fn both_sets(&self) -> Vec<String> {
        vec![self.keys.working.clone(), self.keys.waiting.clone()]
    }

    async fn eval(
        &self,
        script: ScriptName,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value, StoreError> {
        self.scripts.eval(script, &keys, &args).await
    }
}

fn flatten_pairs<S: ToString>(entries: &[(String, S)]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|(agent, score)| [agent.clone(), score.to_string()])
        .collect()
}

#[async_trait]
impl SchedulerStore for RedisStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.scripts.load_all().await
    }

    fn is_initialized(&self) -> bool {
        self.scripts.is_loaded()
    }

    async fn add_agent(&self, agent_type: &str, score: i64) -> Result<bool, StoreError> {
        let value = self
            .eval(
                ScriptName::AddAgent,
                self.both_sets(),
                vec![agent_type.to_string(), score.to_string()],
            )
            .await?;
        Ok(parse_int(ScriptName::AddAgent, &value)? == 1)
    }

    async fn add_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval(ScriptName::AddAgents, self.both_sets(), flatten_pairs(entries))
            .await?;
        parse_counted_list(ScriptName::AddAgents, &value)
    }

    async fn remove_agent(&self, agent_type: &str) -> Result<(), StoreError> {
        self.eval(
            ScriptName::RemoveAgent,
            self.both_sets(),
            vec![agent_type.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        entries: &[(String, String)],
    ) -> Result<Vec<String>, StoreError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval(
                ScriptName::RemoveAgentsConditional,
                vec![self.set_key(set).to_string()],
                flatten_pairs(entries),
            )
            .await?;
        parse_counted_list(ScriptName::RemoveAgentsConditional, &value)
    }

    async fn reschedule_agent(
        &self,
        agent_type: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError> {
        let value = self
            .eval(
                ScriptName::RescheduleAgent,
                self.both_sets(),
                vec![agent_type.to_string(), score.to_string()],
            )
            .await?;
        parse_tag(&value)
            .as_deref()
            .and_then(RescheduleOutcome::parse)
            .ok_or_else(|| {
                StoreError::unexpected(ScriptName::RescheduleAgent.as_str(), format!("{:?}", value))
            })
    }

    async fn acquire_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval(ScriptName::AcquireAgents, self.both_sets(), flatten_pairs(entries))
            .await?;
        parse_counted_list(ScriptName::AcquireAgents, &value)
    }

    async fn move_agent_conditional(
        &self,
        from: SetKind,
        agent_type: &str,
        expected: &str,
        new_score: i64,
    ) -> Result<bool, StoreError> {
        let value = self
            .eval(
                ScriptName::MoveAgentConditional,
                vec![
                    self.set_key(from).to_string(),
                    self.set_key(from.opposite()).to_string(),
                ],
                vec![
                    agent_type.to_string(),
                    expected.to_string(),
                    new_score.to_string(),
                ],
            )
            .await?;
        Ok(parse_tag(&value).as_deref() == Some("swapped"))
    }

    async fn score_agents(&self, agent_types: &[String]) -> Result<Vec<AgentScores>, StoreError> {
        if agent_types.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval(ScriptName::ScoreAgents, self.both_sets(), agent_types.to_vec())
            .await?;
        parse_score_triples(&value)
    }

    async fn presence_agents(&self, agent_types: &[String]) -> Result<Vec<bool>, StoreError> {
        if agent_types.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .eval(ScriptName::PresenceAgents, self.both_sets(), agent_types.to_vec())
            .await?;
        parse_presence(&value)
    }

    async fn range_by_score(
        &self,
        set: SetKind,
        min: i64,
        max: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredAgent>, StoreError> {
        let mut conn = self.connection();
        let pairs: Vec<(String, String)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.set_key(set))
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(pairs
            .into_iter()
            .map(|(agent, score)| ScoredAgent::new(agent, score))
            .collect())
    }

    async fn cardinality(&self, set: SetKind) -> Result<u64, StoreError> {
        let mut conn = self.connection();
        let count: u64 = conn.zcard(self.set_key(set)).await?;
        Ok(count)
    }

    async fn try_acquire_leadership(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let reply: Value = redis::cmd("SET")
            .arg(&self.keys.leader)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        let claimed = matches!(reply, Value::Okay | Value::Status(_));
        debug!(owner, claimed, "Leadership claim attempted");
        Ok(claimed)
    }

    async fn release_leadership(&self, owner: &str) -> Result<bool, StoreError> {
        let value = self
            .eval(
                ScriptName::ReleaseLeadership,
                vec![self.keys.leader.clone()],
                vec![owner.to_string()],
            )
            .await?;
        Ok(parse_int(ScriptName::ReleaseLeadership, &value)? == 1)
    }

    async fn leadership_owner(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Value = conn.get(&self.keys.leader).await?;
        Ok(value_to_string(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_pairs() {
        let entries = vec![("a".to_string(), 10_i64), ("b".to_string(), 20_i64)];
        assert_eq!(flatten_pairs(&entries), vec!["a", "10", "b", "20"]);

        let expected = vec![("c".to_string(), "1700000000".to_string())];
        assert_eq!(flatten_pairs(&expected), vec!["c", "1700000000"]);
    }
}
