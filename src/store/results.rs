//! Decoding of script replies.

use redis::Value;

use super::scripts::ScriptName;
use super::AgentScores;
use crate::error::StoreError;

/// Renders a scalar reply as a string.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Okay => Some("OK".to_string()),
        Value::Nil | Value::Bulk(_) => None,
    }
}

/// Integer reply (`return 1`).
pub fn parse_int(script: ScriptName, value: &Value) -> Result<i64, StoreError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Data(bytes) => String::from_utf8_lossy(bytes)
            .parse()
            .map_err(|_| StoreError::unexpected(script.as_str(), "non-numeric reply")),
        other => Err(StoreError::unexpected(
            script.as_str(),
            format!("expected integer, got {:?}", other),
        )),
    }
}

/// Tag reply (`return 'moved'`) or nil.
pub fn parse_tag(value: &Value) -> Option<String> {
    value_to_string(value)
}

/// `{count, {agent, ...}}` reply used by the batch scripts.
pub fn parse_counted_list(script: ScriptName, value: &Value) -> Result<Vec<String>, StoreError> {
    let Value::Bulk(parts) = value else {
        return Err(StoreError::unexpected(
            script.as_str(),
            format!("expected array, got {:?}", value),
        ));
    };

    let (count, items): (i64, &[Value]) = match parts.as_slice() {
        [count, Value::Bulk(items)] => (parse_int(script, count)?, items.as_slice()),
        // An empty Lua table inside a table can arrive as nil
        [count, Value::Nil] => (parse_int(script, count)?, &[]),
        _ => {
            return Err(StoreError::unexpected(
                script.as_str(),
                format!("expected {{count, list}}, got {} elements", parts.len()),
            ))
        }
    };

    let agents: Vec<String> = items.iter().filter_map(value_to_string).collect();
    if agents.len() as i64 != count {
        return Err(StoreError::unexpected(
            script.as_str(),
            format!("count {} does not match {} agents", count, agents.len()),
        ));
    }
    Ok(agents)
}

/// Flat `[agent, working|'null', waiting|'null', ...]` reply.
pub fn parse_score_triples(value: &Value) -> Result<Vec<AgentScores>, StoreError> {
    let script = ScriptName::ScoreAgents;
    let items = match value {
        Value::Bulk(items) => items,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(StoreError::unexpected(
                script.as_str(),
                format!("expected array, got {:?}", other),
            ))
        }
    };

    if items.len() % 3 != 0 {
        return Err(StoreError::unexpected(
            script.as_str(),
            format!("{} elements is not a multiple of 3", items.len()),
        ));
    }

    let score = |v: &Value| value_to_string(v).filter(|s| s != "null");
    items
        .chunks(3)
        .map(|chunk| {
            let agent_type = value_to_string(&chunk[0])
                .ok_or_else(|| StoreError::unexpected(script.as_str(), "missing agent name"))?;
            Ok(AgentScores {
                agent_type,
                working: score(&chunk[1]),
                waiting: score(&chunk[2]),
            })
        })
        .collect()
}

/// `[1, 0, ...]` presence reply.
pub fn parse_presence(value: &Value) -> Result<Vec<bool>, StoreError> {
    let script = ScriptName::PresenceAgents;
    match value {
        Value::Bulk(items) => items
            .iter()
            .map(|v| parse_int(script, v).map(|n| n == 1))
            .collect(),
        Value::Nil => Ok(Vec::new()),
        other => Err(StoreError::unexpected(
            script.as_str(),
            format!("expected array, got {:?}", other),
        )),
    }
}
