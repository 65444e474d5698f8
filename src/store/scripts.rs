//! Lua script catalogue.
//!
//! Each body is defined exactly once here; both the `SCRIPT LOAD` path and the
//! full-body `EVAL` fallback read from [`ScriptName::body`]. Scores are always
//! compared with `tonumber` since the server stores them as doubles.
//!
//! Key conventions: two-set scripts take `KEYS[1]` = working, `KEYS[2]` =
//! waiting. Conditional scripts take the source set first.

use std::fmt;

const ADD_AGENT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) or redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

const ADD_AGENTS: &str = r#"
local added = {}
for i = 1, #ARGV, 2 do
  local agent = ARGV[i]
  local score = ARGV[i + 1]
  if tonumber(score) and not tonumber(agent) then
    if not redis.call('ZSCORE', KEYS[1], agent) and not redis.call('ZSCORE', KEYS[2], agent) then
      redis.call('ZADD', KEYS[2], score, agent)
      table.insert(added, agent)
    end
  end
end
return {#added, added}
"#;

const REMOVE_AGENT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

const REMOVE_AGENTS_CONDITIONAL: &str = r#"
local removed = {}
for i = 1, #ARGV, 2 do
  local agent = ARGV[i]
  local current = redis.call('ZSCORE', KEYS[1], agent)
  if current and tonumber(current) == tonumber(ARGV[i + 1]) then
    redis.call('ZREM', KEYS[1], agent)
    table.insert(removed, agent)
  end
end
return {#removed, removed}
"#;

const RESCHEDULE_AGENT: &str = r#"
if redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 'exists'
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 'moved'
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 'added'
"#;

const ACQUIRE_AGENTS: &str = r#"
local acquired = {}
for i = 1, #ARGV, 2 do
  local agent = ARGV[i]
  local deadline = ARGV[i + 1]
  if tonumber(deadline) and redis.call('ZREM', KEYS[2], agent) == 1 then
    redis.call('ZADD', KEYS[1], deadline, agent)
    table.insert(acquired, agent)
  end
end
return {#acquired, acquired}
"#;

const MOVE_AGENT_CONDITIONAL: &str = r#"
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if current and tonumber(current) == tonumber(ARGV[2]) then
  redis.call('ZREM', KEYS[1], ARGV[1])
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 'swapped'
end
return false
"#;

const SCORE_AGENTS: &str = r#"
local result = {}
for i = 1, #ARGV do
  local agent = ARGV[i]
  table.insert(result, agent)
  table.insert(result, redis.call('ZSCORE', KEYS[1], agent) or 'null')
  table.insert(result, redis.call('ZSCORE', KEYS[2], agent) or 'null')
end
return result
"#;

const PRESENCE_AGENTS: &str = r#"
local result = {}
for i = 1, #ARGV do
  if redis.call('ZSCORE', KEYS[1], ARGV[i]) or redis.call('ZSCORE', KEYS[2], ARGV[i]) then
    table.insert(result, 1)
  else
    table.insert(result, 0)
  end
end
return result
"#;

const RELEASE_LEADERSHIP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Named scripts understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    AddAgent,
    AddAgents,
    RemoveAgent,
    RemoveAgentsConditional,
    RescheduleAgent,
    AcquireAgents,
    MoveAgentConditional,
    ScoreAgents,
    PresenceAgents,
    ReleaseLeadership,
}

impl ScriptName {
    /// Every script, in load order.
    pub const ALL: [ScriptName; 10] = [
        ScriptName::AddAgent,
        ScriptName::AddAgents,
        ScriptName::RemoveAgent,
        ScriptName::RemoveAgentsConditional,
        ScriptName::RescheduleAgent,
        ScriptName::AcquireAgents,
        ScriptName::MoveAgentConditional,
        ScriptName::ScoreAgents,
        ScriptName::PresenceAgents,
        ScriptName::ReleaseLeadership,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::AddAgent => "add_agent",
            ScriptName::AddAgents => "add_agents",
            ScriptName::RemoveAgent => "remove_agent",
            ScriptName::RemoveAgentsConditional => "remove_agents_conditional",
            ScriptName::RescheduleAgent => "reschedule_agent",
            ScriptName::AcquireAgents => "acquire_agents",
            ScriptName::MoveAgentConditional => "move_agent_conditional",
            ScriptName::ScoreAgents => "score_agents",
            ScriptName::PresenceAgents => "presence_agents",
            ScriptName::ReleaseLeadership => "release_leadership",
        }
    }

    /// Lua source of the script.
    pub fn body(&self) -> &'static str {
        match self {
            ScriptName::AddAgent => ADD_AGENT,
            ScriptName::AddAgents => ADD_AGENTS,
            ScriptName::RemoveAgent => REMOVE_AGENT,
            ScriptName::RemoveAgentsConditional => REMOVE_AGENTS_CONDITIONAL,
            ScriptName::RescheduleAgent => RESCHEDULE_AGENT,
            ScriptName::AcquireAgents => ACQUIRE_AGENTS,
            ScriptName::MoveAgentConditional => MOVE_AGENT_CONDITIONAL,
            ScriptName::ScoreAgents => SCORE_AGENTS,
            ScriptName::PresenceAgents => PRESENCE_AGENTS,
            ScriptName::ReleaseLeadership => RELEASE_LEADERSHIP,
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_is_complete_and_unique() {
        let names: HashSet<_> = ScriptName::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), ScriptName::ALL.len());

        let bodies: HashSet<_> = ScriptName::ALL.iter().map(|s| s.body()).collect();
        assert_eq!(bodies.len(), ScriptName::ALL.len());
    }

    #[test]
    fn test_conditional_scripts_compare_numerically() {
        for script in [
            ScriptName::RemoveAgentsConditional,
            ScriptName::MoveAgentConditional,
        ] {
            assert!(
                script.body().contains("tonumber(current) == tonumber("),
                "{} must coerce scores before comparing",
                script
            );
        }
    }

    #[test]
    fn test_release_leadership_checks_owner() {
        let body = ScriptName::ReleaseLeadership.body();
        assert!(body.contains("GET"));
        assert!(body.contains("== ARGV[1]"));
    }
}
