//! Agent-type pattern matching with graceful degradation.
//!
//! Patterns come from configuration and may be invalid. An invalid pattern is
//! logged once at error level and replaced by a fallback behaviour, so
//! matching never fails on the scheduling hot path.

use regex::Regex;
use tracing::error;

/// What an empty or invalid pattern should match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    MatchAll,
    MatchNone,
}

/// A compiled full-match pattern plus the behaviour used when it is unusable.
#[derive(Debug, Clone)]
pub struct AgentPattern {
    regex: Option<Regex>,
    source: String,
    fallback: Fallback,
}

impl AgentPattern {
    /// Compiles `pattern` anchored at both ends.
    ///
    /// `name` only identifies the setting in the error log.
    pub fn compile(name: &str, pattern: &str, fallback: Fallback) -> Self {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Self {
                regex: None,
                source: String::new(),
                fallback,
            };
        }

        let regex = match Regex::new(&format!("^(?:{})$", trimmed)) {
            Ok(regex) => Some(regex),
            Err(e) => {
                error!(
                    setting = name,
                    pattern = trimmed,
                    error = %e,
                    "Invalid agent pattern, falling back to {:?}",
                    fallback
                );
                None
            }
        };

        Self {
            regex,
            source: trimmed.to_string(),
            fallback,
        }
    }

    pub fn matches(&self, agent_type: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(agent_type),
            None => self.fallback == Fallback::MatchAll,
        }
    }

    /// Returns true when the configured pattern compiled.
    pub fn is_active(&self) -> bool {
        self.regex.is_some()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Enabled/disabled name filter applied before acquisition and at reconcile.
#[derive(Debug, Clone)]
pub struct AgentNameFilter {
    enabled: AgentPattern,
    disabled: AgentPattern,
}

impl AgentNameFilter {
    pub fn new(enabled_pattern: &str, disabled_pattern: &str) -> Self {
        Self {
            enabled: AgentPattern::compile("enabled_pattern", enabled_pattern, Fallback::MatchAll),
            disabled: AgentPattern::compile(
                "disabled_pattern",
                disabled_pattern,
                Fallback::MatchNone,
            ),
        }
    }

    /// Returns true if the agent may run on this process.
    pub fn allows(&self, agent_type: &str) -> bool {
        self.enabled.matches(agent_type) && !self.disabled.matches(agent_type)
    }
}

impl Default for AgentNameFilter {
    fn default() -> Self {
        Self::new("", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_semantics() {
        let pattern = AgentPattern::compile("test", "aws/.*/ec2", Fallback::MatchNone);
        assert!(pattern.is_active());
        assert!(pattern.matches("aws/us-east-1/ec2"));
        assert!(!pattern.matches("aws/us-east-1/ec2-extra"));
        assert!(!pattern.matches("prefix-aws/us-east-1/ec2"));
    }

    #[test]
    fn test_alternation_is_anchored_as_a_whole() {
        let pattern = AgentPattern::compile("test", "a|b", Fallback::MatchNone);
        assert!(pattern.matches("a"));
        assert!(pattern.matches("b"));
        assert!(!pattern.matches("ab"));
    }

    #[test]
    fn test_invalid_pattern_uses_fallback() {
        let none = AgentPattern::compile("test", "([unclosed", Fallback::MatchNone);
        assert!(!none.is_active());
        assert!(!none.matches("anything"));
        assert_eq!(none.source(), "([unclosed");

        let all = AgentPattern::compile("test", "([unclosed", Fallback::MatchAll);
        assert!(all.matches("anything"));
    }

    #[test]
    fn test_name_filter() {
        let filter = AgentNameFilter::new("aws/.*", ".*/legacy");
        assert!(filter.allows("aws/ec2"));
        assert!(!filter.allows("aws/legacy"));
        assert!(!filter.allows("gcp/compute"));

        let open = AgentNameFilter::default();
        assert!(open.allows("anything/at/all"));
    }
}
