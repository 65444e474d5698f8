//! Physical key names.
//!
//! A key is `{prefix}{logical-name}{hash-tag}`, where the hash tag is wrapped
//! in braces only when configured. Prefixes multiplex several scheduling
//! domains over one store; a shared hash tag pins a domain's keys to a single
//! cluster slot, which the multi-key scripts require.

use crate::config::KeysConfig;

/// Resolves logical names to store keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyResolver {
    prefix: String,
    hash_tag: String,
}

/// The resolved keys used by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerKeys {
    pub waiting: String,
    pub working: String,
    pub leader: String,
}

impl KeyResolver {
    pub fn new(prefix: impl Into<String>, hash_tag: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            hash_tag: hash_tag.into(),
        }
    }

    /// Builds the physical key for `logical`.
    pub fn resolve(&self, logical: &str) -> String {
        let tag = self.hash_tag.trim();
        if tag.is_empty() {
            format!("{}{}", self.prefix, logical)
        } else {
            format!("{}{}{{{}}}", self.prefix, logical, tag)
        }
    }

    /// Resolves the waiting, working and leadership keys from configuration.
    pub fn scheduler_keys(config: &KeysConfig) -> SchedulerKeys {
        let resolver = Self::new(config.prefix.clone(), config.hash_tag.clone());
        SchedulerKeys {
            waiting: resolver.resolve(&config.waiting_set),
            working: resolver.resolve(&config.working_set),
            leader: resolver.resolve(&config.cleanup_leader_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_plain() {
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve("waiting"), "waiting");
    }

    #[test]
    fn test_resolve_with_prefix_and_tag() {
        let resolver = KeyResolver::new("tenant-a:", "sched");
        assert_eq!(resolver.resolve("waiting"), "tenant-a:waiting{sched}");
        assert_eq!(resolver.resolve("working"), "tenant-a:working{sched}");
    }

    #[test]
    fn test_blank_tag_adds_no_braces() {
        let resolver = KeyResolver::new("p:", "  ");
        assert_eq!(resolver.resolve("cleanup-leader"), "p:cleanup-leader");
    }

    #[test]
    fn test_scheduler_keys_share_tag() {
        let config = KeysConfig {
            prefix: "x:".to_string(),
            hash_tag: "t".to_string(),
            ..KeysConfig::default()
        };
        let keys = KeyResolver::scheduler_keys(&config);
        assert_eq!(keys.waiting, "x:waiting{t}");
        assert_eq!(keys.working, "x:working{t}");
        assert_eq!(keys.leader, "x:cleanup-leader{t}");
    }
}
