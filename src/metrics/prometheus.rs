//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fleetsched and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fleetsched metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Agents moved from waiting to working by this process.
pub static AGENTS_ACQUIRED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Agents acquired but not dispatched for lack of a permit.
pub static AGENTS_REJECTED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Agent executions, labeled by outcome (success/failure).
pub static AGENT_EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agent execution duration in seconds, labeled by outcome.
pub static AGENT_EXECUTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Completion reschedules that could not be written to the store.
pub static RESCHEDULE_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Entries cleaned, labeled by kind (zombie/orphan).
pub static CLEANUP_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Cleanup passes skipped because the previous one was still running.
pub static CLEANUP_SKIPPED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Script evaluations, labeled by script and outcome.
pub static SCRIPT_EVALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Catalogue reloads triggered by NOSCRIPT.
pub static SCRIPT_RELOADS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Leadership claims, labeled by outcome (claimed/contended/error).
pub static LEADERSHIP_CLAIMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Heartbeat duration in seconds.
pub static HEARTBEAT_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Heartbeats that ended with an error.
pub static HEARTBEAT_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Watchdog firings, labeled by concern.
pub static WATCHDOG_FIRED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agents tracked as running on this process.
pub static ACTIVE_AGENTS: OnceLock<Gauge> = OnceLock::new();

/// Free concurrency permits.
pub static FREE_PERMITS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// methods are no-ops until it has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Acquisition and execution
    let agents_acquired = Counter::new(
        "fleetsched_agents_acquired_total",
        "Agents moved from waiting to working by this process",
    )?;

    let agents_rejected = Counter::new(
        "fleetsched_agents_rejected_total",
        "Acquired agents requeued because no permit was free",
    )?;

    let executions = CounterVec::new(
        Opts::new("fleetsched_agent_executions_total", "Agent executions"),
        &["outcome"],
    )?;

    let execution_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "fleetsched_agent_execution_duration_seconds",
            "Agent execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["outcome"],
    )?;

    let reschedule_failures = Counter::new(
        "fleetsched_reschedule_failures_total",
        "Completion reschedules that could not be written",
    )?;

    // Cleanup
    let cleanup = CounterVec::new(
        Opts::new("fleetsched_cleanup_total", "Entries cleaned up"),
        &["kind"],
    )?;

    let cleanup_skipped = CounterVec::new(
        Opts::new(
            "fleetsched_cleanup_skipped_total",
            "Cleanup passes skipped because one was already running",
        ),
        &["kind"],
    )?;

    let leadership_claims = CounterVec::new(
        Opts::new("fleetsched_leadership_claims_total", "Orphan leadership claims"),
        &["outcome"],
    )?;

    // Store scripts
    let script_evals = CounterVec::new(
        Opts::new("fleetsched_script_evals_total", "Script evaluations"),
        &["script", "outcome"],
    )?;

    let script_reloads = Counter::new(
        "fleetsched_script_reloads_total",
        "Script catalogue reloads after NOSCRIPT",
    )?;

    // Heartbeat and health
    let heartbeat_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "fleetsched_heartbeat_duration_seconds",
            "Heartbeat duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    let heartbeat_failures = Counter::new(
        "fleetsched_heartbeat_failures_total",
        "Heartbeats that ended with an error",
    )?;

    let watchdog_fired = CounterVec::new(
        Opts::new("fleetsched_watchdog_fired_total", "Watchdog findings"),
        &["concern"],
    )?;

    let active_agents = Gauge::new("fleetsched_active_agents", "Agents running on this process")?;
    let free_permits = Gauge::new("fleetsched_free_permits", "Free concurrency permits")?;

    registry.register(Box::new(agents_acquired.clone()))?;
    registry.register(Box::new(agents_rejected.clone()))?;
    registry.register(Box::new(executions.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(reschedule_failures.clone()))?;
    registry.register(Box::new(cleanup.clone()))?;
    registry.register(Box::new(cleanup_skipped.clone()))?;
    registry.register(Box::new(leadership_claims.clone()))?;
    registry.register(Box::new(script_evals.clone()))?;
    registry.register(Box::new(script_reloads.clone()))?;
    registry.register(Box::new(heartbeat_duration.clone()))?;
    registry.register(Box::new(heartbeat_failures.clone()))?;
    registry.register(Box::new(watchdog_fired.clone()))?;
    registry.register(Box::new(active_agents.clone()))?;
    registry.register(Box::new(free_permits.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = AGENTS_ACQUIRED_TOTAL.set(agents_acquired);
    let _ = AGENTS_REJECTED_TOTAL.set(agents_rejected);
    let _ = AGENT_EXECUTIONS_TOTAL.set(executions);
    let _ = AGENT_EXECUTION_DURATION.set(execution_duration);
    let _ = RESCHEDULE_FAILURES_TOTAL.set(reschedule_failures);
    let _ = CLEANUP_TOTAL.set(cleanup);
    let _ = CLEANUP_SKIPPED_TOTAL.set(cleanup_skipped);
    let _ = LEADERSHIP_CLAIMS_TOTAL.set(leadership_claims);
    let _ = SCRIPT_EVALS_TOTAL.set(script_evals);
    let _ = SCRIPT_RELOADS_TOTAL.set(script_reloads);
    let _ = HEARTBEAT_DURATION.set(heartbeat_duration);
    let _ = HEARTBEAT_FAILURES_TOTAL.set(heartbeat_failures);
    let _ = WATCHDOG_FIRED_TOTAL.set(watchdog_fired);
    let _ = ACTIVE_AGENTS.set(active_agents);
    let _ = FREE_PERMITS.set(free_permits);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// # Returns
///
/// A string containing all metrics in Prometheus text format. If the registry
/// has not been initialized or encoding fails, returns an error message.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = AGENTS_ACQUIRED_TOTAL.get() {
            counter.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
            assert!(metrics.contains("fleetsched_agents_acquired_total"));
        }
    }
}
