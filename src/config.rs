//! Scheduler configuration.
//!
//! Configuration is loaded from a YAML file, overridden by `SCHEDULER_*`
//! environment variables and then validated. Every section has sensible
//! defaults so an empty file (or no file at all) yields a working setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Store key names and namespacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Logical name of the waiting set.
    pub waiting_set: String,
    /// Logical name of the working set.
    pub working_set: String,
    /// Logical name of the orphan-cleanup leadership key.
    pub cleanup_leader_key: String,
    /// Prefix prepended to every key.
    pub prefix: String,
    /// Hash tag appended as `{tag}` so all keys share one cluster slot.
    pub hash_tag: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            waiting_set: "waiting".to_string(),
            working_set: "working".to_string(),
            cleanup_leader_key: "cleanup-leader".to_string(),
            prefix: String::new(),
            hash_tag: String::new(),
        }
    }
}

/// Batching of multi-agent script calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Use the batch scripts instead of one call per agent.
    pub enabled: bool,
    /// Maximum agents per batch call; 0 means unbounded.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 0,
        }
    }
}

impl BatchConfig {
    /// Chunk size to use when splitting a batch of `total` items.
    pub fn chunk_size(&self, total: usize) -> usize {
        if !self.enabled {
            1
        } else if self.batch_size == 0 {
            total.max(1)
        } else {
            self.batch_size
        }
    }
}

/// Jitter windows and ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Upper bound of the random delay applied to a newly registered agent.
    pub initial_registration_secs: u64,
    /// Window for spreading requeued agents at shutdown when no deadline is known.
    pub shutdown_secs: u64,
    /// Relative ± jitter applied to failure reschedules.
    pub failure_backoff_ratio: f64,
    /// Relative ± jitter applied to success reschedules.
    pub success_ratio: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            initial_registration_secs: 0,
            shutdown_secs: 0,
            failure_backoff_ratio: 0.1,
            success_ratio: 0.0,
        }
    }
}

/// Failure backoff behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureBackoffConfig {
    /// Enables immediate retries before falling back to the error interval.
    pub enabled: bool,
    /// Consecutive failures rescheduled near-now before backing off.
    pub max_immediate_retries: u32,
}

/// Zombie cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieCleanupConfig {
    pub enabled: bool,
    /// Grace period past the deadline before a local run counts as a zombie.
    pub threshold_ms: u64,
    /// How often the cleanup pass runs.
    pub interval_ms: u64,
    /// Regex (full match) selecting agent types with a longer threshold.
    pub exceptional_agents_pattern: String,
    /// Threshold for agent types matching the exceptional pattern.
    pub exceptional_agents_threshold_ms: u64,
    /// Time budget per pass; 0 means bounded by the interval.
    pub run_budget_ms: u64,
}

impl Default for ZombieCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 30_000,
            interval_ms: 300_000,
            exceptional_agents_pattern: String::new(),
            exceptional_agents_threshold_ms: 3_600_000,
            run_budget_ms: 0,
        }
    }
}

/// Orphan cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanCleanupConfig {
    pub enabled: bool,
    /// How far past its deadline a working entry must be to count as orphaned.
    pub threshold_ms: u64,
    /// How often the cleanup pass runs.
    pub interval_ms: u64,
    /// TTL of the leadership key claimed before each pass.
    pub leadership_ttl_ms: u64,
    /// Run on every process without claiming leadership.
    pub force_all_pods: bool,
    /// Time budget per pass; 0 means bounded by the interval.
    pub run_budget_ms: u64,
    /// Remove purely numeric agent names (corrupted entries) from both sets.
    pub remove_numeric_only_agents: bool,
}

impl Default for OrphanCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ms: 600_000,
            interval_ms: 300_000,
            leadership_ttl_ms: 120_000,
            force_all_pods: false,
            run_budget_ms: 0,
            remove_numeric_only_agents: true,
        }
    }
}

/// Periodic reconciliation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Time budget per pass; 0 means bounded by the refresh period.
    pub run_budget_ms: u64,
}

/// Configuration for the priority scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Period of repopulation and reconciliation, in seconds.
    pub refresh_period_secs: u64,
    /// Period of the health summary log line, in seconds.
    pub health_summary_period_secs: u64,
    /// Maximum agents executing concurrently on this process.
    pub max_concurrent_agents: usize,
    /// Regex (full match) of agent types allowed to run here; empty allows all.
    pub enabled_pattern: String,
    /// Regex (full match) of agent types never run here; empty disables none.
    pub disabled_pattern: String,
    /// How long shutdown waits for in-flight agents before requeueing them.
    pub shutdown_timeout_ms: u64,
    /// Consecutive unhealthy samples before a watchdog concern fires.
    pub watchdog_streak_threshold: u32,
    pub keys: KeysConfig,
    pub batch_operations: BatchConfig,
    pub jitter: JitterConfig,
    pub failure_backoff: FailureBackoffConfig,
    pub zombie_cleanup: ZombieCleanupConfig,
    pub orphan_cleanup: OrphanCleanupConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            refresh_period_secs: 30,
            health_summary_period_secs: 600,
            max_concurrent_agents: 100,
            enabled_pattern: String::new(),
            disabled_pattern: String::new(),
            shutdown_timeout_ms: 10_000,
            watchdog_streak_threshold: 3,
            keys: KeysConfig::default(),
            batch_operations: BatchConfig::default(),
            jitter: JitterConfig::default(),
            failure_backoff: FailureBackoffConfig::default(),
            zombie_cleanup: ZombieCleanupConfig::default(),
            orphan_cleanup: OrphanCleanupConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file, applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// environment override is malformed, or validation fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from defaults plus environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `SCHEDULER_*` environment variables on top of this configuration.
    ///
    /// # Environment Variables
    ///
    /// - `SCHEDULER_HEARTBEAT_INTERVAL_MS`
    /// - `SCHEDULER_MAX_CONCURRENT_AGENTS`
    /// - `SCHEDULER_REFRESH_PERIOD_SECS`
    /// - `SCHEDULER_ENABLED_PATTERN` / `SCHEDULER_DISABLED_PATTERN`
    /// - `SCHEDULER_KEY_PREFIX` / `SCHEDULER_HASH_TAG`
    /// - `SCHEDULER_ZOMBIE_ENABLED` / `SCHEDULER_ZOMBIE_THRESHOLD_MS`
    /// - `SCHEDULER_ORPHAN_ENABLED` / `SCHEDULER_ORPHAN_THRESHOLD_MS`
    /// - `SCHEDULER_ORPHAN_LEADERSHIP_TTL_MS`
    /// - `SCHEDULER_BATCH_ENABLED` / `SCHEDULER_BATCH_SIZE`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("SCHEDULER_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_env_value(&val, "SCHEDULER_HEARTBEAT_INTERVAL_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_MAX_CONCURRENT_AGENTS") {
            self.max_concurrent_agents = parse_env_value(&val, "SCHEDULER_MAX_CONCURRENT_AGENTS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_REFRESH_PERIOD_SECS") {
            self.refresh_period_secs = parse_env_value(&val, "SCHEDULER_REFRESH_PERIOD_SECS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ENABLED_PATTERN") {
            self.enabled_pattern = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_DISABLED_PATTERN") {
            self.disabled_pattern = val;
        }

        // Key namespace
        if let Ok(val) = std::env::var("SCHEDULER_KEY_PREFIX") {
            self.keys.prefix = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_HASH_TAG") {
            self.keys.hash_tag = val;
        }

        // Cleanup services
        if let Ok(val) = std::env::var("SCHEDULER_ZOMBIE_ENABLED") {
            self.zombie_cleanup.enabled = parse_env_bool(&val, "SCHEDULER_ZOMBIE_ENABLED")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ZOMBIE_THRESHOLD_MS") {
            self.zombie_cleanup.threshold_ms =
                parse_env_value(&val, "SCHEDULER_ZOMBIE_THRESHOLD_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ORPHAN_ENABLED") {
            self.orphan_cleanup.enabled = parse_env_bool(&val, "SCHEDULER_ORPHAN_ENABLED")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ORPHAN_THRESHOLD_MS") {
            self.orphan_cleanup.threshold_ms =
                parse_env_value(&val, "SCHEDULER_ORPHAN_THRESHOLD_MS")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_ORPHAN_LEADERSHIP_TTL_MS") {
            self.orphan_cleanup.leadership_ttl_ms =
                parse_env_value(&val, "SCHEDULER_ORPHAN_LEADERSHIP_TTL_MS")?;
        }

        // Batching
        if let Ok(val) = std::env::var("SCHEDULER_BATCH_ENABLED") {
            self.batch_operations.enabled = parse_env_bool(&val, "SCHEDULER_BATCH_ENABLED")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_BATCH_SIZE") {
            self.batch_operations.batch_size = parse_env_value(&val, "SCHEDULER_BATCH_SIZE")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// A leadership TTL shorter than the orphan run budget plus a minute is
    /// accepted but logged, since a slow pass could then overlap a new leader.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.refresh_period_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "refresh_period_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_agents must be greater than 0".to_string(),
            ));
        }

        if self.watchdog_streak_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "watchdog_streak_threshold must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("keys.waiting_set", &self.keys.waiting_set),
            ("keys.working_set", &self.keys.working_set),
            ("keys.cleanup_leader_key", &self.keys.cleanup_leader_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be blank",
                    name
                )));
            }
        }

        if self.keys.waiting_set == self.keys.working_set {
            return Err(ConfigError::ValidationFailed(
                "keys.waiting_set and keys.working_set must differ".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter.failure_backoff_ratio) {
            return Err(ConfigError::ValidationFailed(
                "jitter.failure_backoff_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter.success_ratio) {
            return Err(ConfigError::ValidationFailed(
                "jitter.success_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.zombie_cleanup.enabled && self.zombie_cleanup.interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "zombie_cleanup.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.orphan_cleanup.enabled {
            if self.orphan_cleanup.interval_ms == 0 {
                return Err(ConfigError::ValidationFailed(
                    "orphan_cleanup.interval_ms must be greater than 0".to_string(),
                ));
            }
            if self.orphan_cleanup.leadership_ttl_ms < 1_000 && !self.orphan_cleanup.force_all_pods
            {
                return Err(ConfigError::ValidationFailed(
                    "orphan_cleanup.leadership_ttl_ms must be at least 1000".to_string(),
                ));
            }

            let recommended = self.orphan_cleanup.run_budget_ms + 60_000;
            if self.orphan_cleanup.leadership_ttl_ms < recommended {
                warn!(
                    leadership_ttl_ms = self.orphan_cleanup.leadership_ttl_ms,
                    recommended_min_ms = recommended,
                    "Orphan leadership TTL is shorter than run budget plus 60s; a slow pass may overlap a new leader"
                );
            }
        }

        Ok(())
    }

    /// Heartbeat period as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Repopulation/reconcile period in milliseconds.
    pub fn refresh_period_ms(&self) -> i64 {
        i64::try_from(self.refresh_period_secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }

    /// Shutdown drain timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Builder method to set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Builder method to set max concurrent agents.
    pub fn with_max_concurrent_agents(mut self, max: usize) -> Self {
        self.max_concurrent_agents = max;
        self
    }

    /// Builder method to set the key prefix and hash tag.
    pub fn with_key_namespace(mut self, prefix: impl Into<String>, hash_tag: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self.keys.hash_tag = hash_tag.into();
        self
    }

    /// Builder method to set the enabled and disabled agent patterns.
    pub fn with_agent_patterns(
        mut self,
        enabled: impl Into<String>,
        disabled: impl Into<String>,
    ) -> Self {
        self.enabled_pattern = enabled.into();
        self.disabled_pattern = disabled.into();
        self
    }

    /// Builder method to replace the zombie cleanup section.
    pub fn with_zombie_cleanup(mut self, zombie: ZombieCleanupConfig) -> Self {
        self.zombie_cleanup = zombie;
        self
    }

    /// Builder method to replace the orphan cleanup section.
    pub fn with_orphan_cleanup(mut self, orphan: OrphanCleanupConfig) -> Self {
        self.orphan_cleanup = orphan;
        self
    }

    /// Builder method to replace the jitter section.
    pub fn with_jitter(mut self, jitter: JitterConfig) -> Self {
        self.jitter = jitter;
        self
    }

    /// Builder method to replace the failure backoff section.
    pub fn with_failure_backoff(mut self, backoff: FailureBackoffConfig) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Builder method to replace the batch section.
    pub fn with_batch_operations(mut self, batch: BatchConfig) -> Self {
        self.batch_operations = batch;
        self
    }

    /// Builder method to set the shutdown drain timeout.
    pub fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable value.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}
