//! Script invocation with cache-miss self-healing.
//!
//! Scripts are invoked by SHA. When the server answers `NOSCRIPT` (failover,
//! `SCRIPT FLUSH`) the manager reloads the whole catalogue once and retries.
//! If the reload itself fails, or the retry still misses, the call falls back
//! to `EVAL` with the full body, which is byte-identical to what was loaded.
//!
//! Reloads are generation-guarded: a burst of concurrent misses triggers a
//! single reload, later callers see the bumped generation and just retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use redis::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::scripts::ScriptName;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::utils::{read, write};

/// Raw script commands against a store connection.
#[async_trait]
pub trait ScriptTransport: Send + Sync {
    /// `SCRIPT LOAD`, returning the SHA1 of the body.
    async fn script_load(&self, body: &str) -> Result<String, StoreError>;

    /// `EVALSHA`.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String])
        -> Result<Value, StoreError>;

    /// `EVAL` with the full body.
    async fn eval(&self, body: &str, keys: &[String], args: &[String])
        -> Result<Value, StoreError>;
}

/// Immutable snapshot of loaded script hashes.
#[derive(Debug)]
struct ScriptCatalogue {
    shas: HashMap<ScriptName, String>,
    generation: u64,
}

/// Loads scripts and evaluates them by SHA with transparent recovery.
pub struct ScriptManager<T> {
    transport: T,
    catalogue: RwLock<Option<Arc<ScriptCatalogue>>>,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
    metrics: MetricsCollector,
}

impl<T: ScriptTransport> ScriptManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            catalogue: RwLock::new(None),
            generation: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns true once the catalogue has been loaded.
    pub fn is_loaded(&self) -> bool {
        read(&self.catalogue).is_some()
    }

    /// Number of successful catalogue loads so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Loads every script and publishes the new hashes.
    ///
    /// # Errors
    ///
    /// Returns the first `SCRIPT LOAD` failure; the previous catalogue stays published.
    pub async fn load_all(&self) -> Result<(), StoreError> {
        let mut shas = HashMap::with_capacity(ScriptName::ALL.len());
        for script in ScriptName::ALL {
            let sha = self.transport.script_load(script.body()).await?;
            debug!(script = %script, sha = %sha, "Loaded script");
            shas.insert(script, sha);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *write(&self.catalogue) = Some(Arc::new(ScriptCatalogue { shas, generation }));
        info!(generation, scripts = ScriptName::ALL.len(), "Scheduler scripts loaded");
        Ok(())
    }

    /// Evaluates `script`, healing a script-cache miss.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ScriptsNotInitialized` before [`ScriptManager::load_all`]
    /// has succeeded, or the underlying store error for anything other than a
    /// cache miss.
    pub async fn eval(
        &self,
        script: ScriptName,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        let catalogue = self.snapshot()?;
        let sha = Self::sha_for(&catalogue, script)?;

        match self.transport.eval_sha(&sha, keys, args).await {
            Ok(value) => {
                self.metrics.record_script_eval(script.as_str(), "ok");
                Ok(value)
            }
            Err(e) if e.is_no_script() => {
                warn!(script = %script, generation = catalogue.generation, "Script missing on server, reloading");
                self.metrics.record_script_eval(script.as_str(), "noscript");
                self.retry_after_miss(script, catalogue.generation, keys, args)
                    .await
            }
            Err(e) => {
                self.metrics.record_script_eval(script.as_str(), "error");
                Err(e)
            }
        }
    }

    async fn retry_after_miss(
        &self,
        script: ScriptName,
        observed_generation: u64,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        if let Err(e) = self.reload_if_stale(observed_generation).await {
            warn!(script = %script, error = %e, "Script reload failed, falling back to EVAL");
            return self.eval_body(script, keys, args).await;
        }

        let catalogue = self.snapshot()?;
        let sha = Self::sha_for(&catalogue, script)?;
        match self.transport.eval_sha(&sha, keys, args).await {
            Ok(value) => {
                self.metrics.record_script_eval(script.as_str(), "ok");
                Ok(value)
            }
            Err(e) if e.is_no_script() => {
                warn!(script = %script, "Script still missing after reload, falling back to EVAL");
                self.eval_body(script, keys, args).await
            }
            Err(e) => {
                self.metrics.record_script_eval(script.as_str(), "error");
                Err(e)
            }
        }
    }

    async fn eval_body(
        &self,
        script: ScriptName,
        keys: &[String],
        args: &[String],
    ) -> Result<Value, StoreError> {
        let result = self.transport.eval(script.body(), keys, args).await;
        let outcome = if result.is_ok() { "fallback" } else { "error" };
        self.metrics.record_script_eval(script.as_str(), outcome);
        result
    }

    /// Reloads unless another caller already did since `observed_generation`.
    async fn reload_if_stale(&self, observed_generation: u64) -> Result<(), StoreError> {
        let _guard = self.reload_lock.lock().await;
        if self.generation() != observed_generation {
            debug!(observed_generation, current = self.generation(), "Scripts already reloaded");
            return Ok(());
        }
        self.load_all().await?;
        self.metrics.record_script_reload();
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<ScriptCatalogue>, StoreError> {
        read(&self.catalogue)
            .clone()
            .ok_or(StoreError::ScriptsNotInitialized)
    }

    fn sha_for(catalogue: &ScriptCatalogue, script: ScriptName) -> Result<String, StoreError> {
        catalogue
            .shas
            .get(&script)
            .cloned()
            .ok_or(StoreError::ScriptsNotInitialized)
    }
}
