//! Error types for fleetsched.
//!
//! Each subsystem has its own error enum. Store errors carry enough
//! classification for callers to tell a transient connection problem from a
//! script-cache miss; scheduler errors wrap both store and configuration
//! failures for the few operations that are allowed to fail outright.

use std::time::Duration;

use thiserror::Error;

/// Errors from the coordination store and its script layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A store command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The server no longer has the script cached.
    #[error("Script {script} is not cached on the server")]
    NoScript { script: String },

    /// A script returned a reply of an unexpected shape.
    #[error("Unexpected reply from {script}: {message}")]
    UnexpectedReply { script: String, message: String },

    /// Script hashes have not been loaded yet.
    #[error("Scheduler scripts have not been initialized")]
    ScriptsNotInitialized,

    /// The store was closed and cannot serve requests any more.
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true when the server reported a script-cache miss.
    pub fn is_no_script(&self) -> bool {
        match self {
            StoreError::NoScript { .. } => true,
            StoreError::Redis(e) => e.kind() == redis::ErrorKind::NoScriptError,
            _ => false,
        }
    }

    /// Returns true for connection-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) | StoreError::Unavailable(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            _ => false,
        }
    }

    /// Builds an [`StoreError::UnexpectedReply`] for the given script.
    pub fn unexpected(script: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::UnexpectedReply {
            script: script.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for the expected schema.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors surfaced by the scheduler's lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store failure during an operation that cannot degrade.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Initialization could not complete.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// `start` was called on a scheduler that is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// An operation requiring a running scheduler was called before `start`.
    #[error("Scheduler is not running")]
    NotRunning,

    /// In-flight agents did not drain within the shutdown timeout.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_script_classification() {
        let err = StoreError::NoScript {
            script: "acquire_agents".to_string(),
        };
        assert!(err.is_no_script());
        assert!(!err.is_transient());

        let redis_err = redis::RedisError::from((
            redis::ErrorKind::NoScriptError,
            "NOSCRIPT No matching script",
        ));
        assert!(StoreError::from(redis_err).is_no_script());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(StoreError::Unavailable("closed".to_string()).is_transient());
        assert!(!StoreError::ScriptsNotInitialized.is_transient());

        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(StoreError::from(io).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::unexpected("score_agents", "odd number of elements");
        assert_eq!(
            err.to_string(),
            "Unexpected reply from score_agents: odd number of elements"
        );

        let err = ConfigError::InvalidValue {
            key: "SCHEDULER_MAX_CONCURRENT_AGENTS".to_string(),
            message: "not a number".to_string(),
        };
        assert!(err.to_string().contains("SCHEDULER_MAX_CONCURRENT_AGENTS"));

        let err = SchedulerError::ShutdownTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Shutdown timed out after 10s");
    }
}
