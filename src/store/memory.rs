//! In-process scheduler store.
//!
//! Applies exactly the transitions of the Lua scripts, with one mutex
//! standing in for script atomicity. Used by tests and by the CLI's
//! `--in-memory` mode. It can be switched unavailable to exercise the
//! transient-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentScores, RescheduleOutcome, ScoredAgent, SchedulerStore, SetKind};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::utils::lock;

#[derive(Debug, Default)]
struct MemoryState {
    waiting: HashMap<String, f64>,
    working: HashMap<String, f64>,
    leader: Option<(String, i64)>,
}

impl MemoryState {
    fn set(&self, set: SetKind) -> &HashMap<String, f64> {
        match set {
            SetKind::Waiting => &self.waiting,
            SetKind::Working => &self.working,
        }
    }

    fn set_mut(&mut self, set: SetKind) -> &mut HashMap<String, f64> {
        match set {
            SetKind::Waiting => &mut self.waiting,
            SetKind::Working => &mut self.working,
        }
    }

    fn contains(&self, agent_type: &str) -> bool {
        self.waiting.contains_key(agent_type) || self.working.contains_key(agent_type)
    }

    fn expire_leader(&mut self, now_ms: i64) {
        if matches!(&self.leader, Some((_, expires)) if *expires <= now_ms) {
            self.leader = None;
        }
    }
}

/// Scores as Redis would print them.
fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

fn numeric(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Scheduler state in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Uses `clock` for leadership TTL expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            initialized: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every call fail with a transient error while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Writes a raw score into a set, bypassing the transition rules.
    pub fn insert_raw(&self, set: SetKind, agent_type: &str, score: f64) {
        lock(&self.state)
            .set_mut(set)
            .insert(agent_type.to_string(), score);
    }

    /// Score of `agent_type` in `set`.
    pub fn score(&self, set: SetKind, agent_type: &str) -> Option<f64> {
        lock(&self.state).set(set).get(agent_type).copied()
    }

    /// Members of `set`, sorted by score then name.
    pub fn members(&self, set: SetKind) -> Vec<(String, f64)> {
        let state = lock(&self.state);
        let mut members: Vec<(String, f64)> =
            state.set(set).iter().map(|(k, v)| (k.clone(), *v)).collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn check(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn check_scripts(&self) -> Result<(), StoreError> {
        self.check()?;
        if !self.is_initialized() {
            return Err(StoreError::ScriptsNotInitialized);
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.check()?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn add_agent(&self, agent_type: &str, score: i64) -> Result<bool, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        if state.contains(agent_type) {
            return Ok(false);
        }
        state.waiting.insert(agent_type.to_string(), score as f64);
        Ok(true)
    }

    async fn add_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        let mut added = Vec::new();
        for (agent, score) in entries {
            if numeric(agent).is_some() || state.contains(agent) {
                continue;
            }
            state.waiting.insert(agent.clone(), *score as f64);
            added.push(agent.clone());
        }
        Ok(added)
    }

    async fn remove_agent(&self, agent_type: &str) -> Result<(), StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        state.waiting.remove(agent_type);
        state.working.remove(agent_type);
        Ok(())
    }

    async fn remove_agents_conditional(
        &self,
        set: SetKind,
        entries: &[(String, String)],
    ) -> Result<Vec<String>, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        let target = state.set_mut(set);
        let mut removed = Vec::new();
        for (agent, expected) in entries {
            let matches = match (target.get(agent), numeric(expected)) {
                (Some(current), Some(expected)) => *current == expected,
                _ => false,
            };
            if matches {
                target.remove(agent);
                removed.push(agent.clone());
            }
        }
        Ok(removed)
    }

    async fn reschedule_agent(
        &self,
        agent_type: &str,
        score: i64,
    ) -> Result<RescheduleOutcome, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        if state.waiting.contains_key(agent_type) {
            return Ok(RescheduleOutcome::Exists);
        }
        let moved = state.working.remove(agent_type).is_some();
        state.waiting.insert(agent_type.to_string(), score as f64);
        Ok(if moved {
            RescheduleOutcome::Moved
        } else {
            RescheduleOutcome::Added
        })
    }

    async fn acquire_agents(&self, entries: &[(String, i64)]) -> Result<Vec<String>, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        let mut acquired = Vec::new();
        for (agent, deadline) in entries {
            if state.waiting.remove(agent).is_some() {
                state.working.insert(agent.clone(), *deadline as f64);
                acquired.push(agent.clone());
            }
        }
        Ok(acquired)
    }

    async fn move_agent_conditional(
        &self,
        from: SetKind,
        agent_type: &str,
        expected: &str,
        new_score: i64,
    ) -> Result<bool, StoreError> {
        self.check_scripts()?;
        let mut state = lock(&self.state);
        let matches = match (state.set(from).get(agent_type), numeric(expected)) {
            (Some(current), Some(expected)) => *current == expected,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        state.set_mut(from).remove(agent_type);
        state
            .set_mut(from.opposite())
            .insert(agent_type.to_string(), new_score as f64);
        Ok(true)
    }

    async fn score_agents(&self, agent_types: &[String]) -> Result<Vec<AgentScores>, StoreError> {
        self.check_scripts()?;
        let state = lock(&self.state);
        Ok(agent_types
            .iter()
            .map(|agent| AgentScores {
                agent_type: agent.clone(),
                working: state.working.get(agent).copied().map(format_score),
                waiting: state.waiting.get(agent).copied().map(format_score),
            })
            .collect())
    }

    async fn presence_agents(&self, agent_types: &[String]) -> Result<Vec<bool>, StoreError> {
        self.check_scripts()?;
        let state = lock(&self.state);
        Ok(agent_types.iter().map(|a| state.contains(a)).collect())
    }

    async fn range_by_score(
        &self,
        set: SetKind,
        min: i64,
        max: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredAgent>, StoreError> {
        self.check()?;
        let (min, max) = (min as f64, max as f64);
        Ok(self
            .members(set)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .skip(offset)
            .take(limit)
            .map(|(agent, score)| ScoredAgent::new(agent, format_score(score)))
            .collect())
    }

    async fn cardinality(&self, set: SetKind) -> Result<u64, StoreError> {
        self.check()?;
        Ok(lock(&self.state).set(set).len() as u64)
    }

    async fn try_acquire_leadership(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        state.expire_leader(now);
        if state.leader.is_some() {
            return Ok(false);
        }
        state.leader = Some((owner.to_string(), now + ttl.as_millis() as i64));
        Ok(true)
    }

    async fn release_leadership(&self, owner: &str) -> Result<bool, StoreError> {
        self.check_scripts()?;
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        state.expire_leader(now);
        if matches!(&state.leader, Some((holder, _)) if holder == owner) {
            state.leader = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn leadership_owner(&self) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        state.expire_leader(now);
        Ok(state.leader.as_ref().map(|(owner, _)| owner.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.initialize().await.expect("initialize");
        store
    }

    #[tokio::test]
    async fn test_requires_initialization() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_agent("a", 1).await,
            Err(StoreError::ScriptsNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = store().await;
        assert!(store.add_agent("a", 100).await.expect("add"));
        assert!(!store.add_agent("a", 200).await.expect("add"));
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(100.0));

        let added = store
            .add_agents(&[("a".to_string(), 5), ("b".to_string(), 6)])
            .await
            .expect("add batch");
        assert_eq!(added, vec!["b"]);
    }

    #[tokio::test]
    async fn test_presence_spans_both_sets() {
        let store = store().await;
        store.add_agent("queued", 100).await.expect("add");
        store.add_agent("running", 100).await.expect("add");
        store
            .acquire_agents(&[("running".to_string(), 500)])
            .await
            .expect("acquire");

        let presence = store
            .presence_agents(&[
                "queued".to_string(),
                "missing".to_string(),
                "running".to_string(),
            ])
            .await
            .expect("presence");
        assert_eq!(presence, vec![true, false, true]);
        assert!(store.presence_agents(&[]).await.expect("presence").is_empty());
    }

    #[tokio::test]
    async fn test_add_batch_skips_numeric_names() {
        let store = store().await;
        let added = store
            .add_agents(&[("1700000000".to_string(), 5), ("ok".to_string(), 6)])
            .await
            .expect("add batch");
        assert_eq!(added, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_acquire_moves_only_waiting_agents() {
        let store = store().await;
        store.add_agent("a", 100).await.expect("add");

        let acquired = store
            .acquire_agents(&[("a".to_string(), 500), ("missing".to_string(), 500)])
            .await
            .expect("acquire");
        assert_eq!(acquired, vec!["a"]);
        assert_eq!(store.score(SetKind::Working, "a"), Some(500.0));
        assert_eq!(store.score(SetKind::Waiting, "a"), None);

        let again = store
            .acquire_agents(&[("a".to_string(), 600)])
            .await
            .expect("acquire");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_conditional_move_compares_numerically() {
        let store = store().await;
        store.insert_raw(SetKind::Working, "a", 12345.0);

        assert!(!store
            .move_agent_conditional(SetKind::Working, "a", "12344", 1)
            .await
            .expect("move"));
        assert!(store
            .move_agent_conditional(SetKind::Working, "a", "12345.0", 1)
            .await
            .expect("move"));
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(1.0));
        assert!(!store
            .move_agent_conditional(SetKind::Working, "a", "12345", 1)
            .await
            .expect("move"));
    }

    #[tokio::test]
    async fn test_reschedule_branches() {
        let store = store().await;
        store.insert_raw(SetKind::Working, "a", 10.0);
        assert_eq!(
            store.reschedule_agent("a", 20).await.expect("reschedule"),
            RescheduleOutcome::Moved
        );
        assert_eq!(
            store.reschedule_agent("a", 30).await.expect("reschedule"),
            RescheduleOutcome::Exists
        );
        assert_eq!(store.score(SetKind::Waiting, "a"), Some(20.0));
        assert_eq!(
            store.reschedule_agent("b", 30).await.expect("reschedule"),
            RescheduleOutcome::Added
        );
    }

    #[tokio::test]
    async fn test_remove_conditional_batch() {
        let store = store().await;
        store.insert_raw(SetKind::Working, "a", 10.0);
        store.insert_raw(SetKind::Working, "b", 20.0);

        let removed = store
            .remove_agents_conditional(
                SetKind::Working,
                &[
                    ("a".to_string(), "10".to_string()),
                    ("b".to_string(), "21".to_string()),
                    ("c".to_string(), "1".to_string()),
                ],
            )
            .await
            .expect("remove");
        assert_eq!(removed, vec!["a"]);
        assert_eq!(store.cardinality(SetKind::Working).await.expect("card"), 1);
    }

    #[tokio::test]
    async fn test_range_by_score_orders_and_pages() {
        let store = store().await;
        store.insert_raw(SetKind::Waiting, "c", 30.0);
        store.insert_raw(SetKind::Waiting, "a", 10.0);
        store.insert_raw(SetKind::Waiting, "b", 10.0);
        store.insert_raw(SetKind::Waiting, "d", 40.0);

        let page = store
            .range_by_score(SetKind::Waiting, i64::MIN, 30, 0, 10)
            .await
            .expect("range");
        let names: Vec<_> = page.iter().map(|s| s.agent_type.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(page[0].score, "10");

        let second = store
            .range_by_score(SetKind::Waiting, i64::MIN, i64::MAX, 2, 1)
            .await
            .expect("range");
        assert_eq!(second[0].agent_type, "c");
    }

    #[tokio::test]
    async fn test_leadership_owner_checks_and_ttl() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        store.initialize().await.expect("initialize");

        assert!(store
            .try_acquire_leadership("x", Duration::from_secs(10))
            .await
            .expect("claim"));
        assert!(!store
            .try_acquire_leadership("y", Duration::from_secs(10))
            .await
            .expect("claim"));
        assert!(!store.release_leadership("y").await.expect("release"));
        assert_eq!(store.leadership_owner().await.expect("owner").as_deref(), Some("x"));

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.leadership_owner().await.expect("owner"), None);
        assert!(store
            .try_acquire_leadership("y", Duration::from_secs(10))
            .await
            .expect("claim"));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = store().await;
        store.set_available(false);
        let err = store.add_agent("a", 1).await.expect_err("offline");
        assert!(err.is_transient());
        store.set_available(true);
        assert!(store.add_agent("a", 1).await.expect("online"));
    }
}
