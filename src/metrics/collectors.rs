//! Recording facade over the scheduler's Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has been called, so library
//! users that do not export metrics pay nothing beyond an atomic load.

use super::prometheus::{
    ACTIVE_AGENTS, AGENTS_ACQUIRED_TOTAL, AGENTS_REJECTED_TOTAL, AGENT_EXECUTIONS_TOTAL,
    AGENT_EXECUTION_DURATION, CLEANUP_SKIPPED_TOTAL, CLEANUP_TOTAL, FREE_PERMITS,
    HEARTBEAT_DURATION, HEARTBEAT_FAILURES_TOTAL, LEADERSHIP_CLAIMS_TOTAL,
    RESCHEDULE_FAILURES_TOTAL, SCRIPT_EVALS_TOTAL, SCRIPT_RELOADS_TOTAL, WATCHDOG_FIRED_TOTAL,
};

/// Metrics collector for scheduler operations.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    pub fn record_acquired(&self, count: usize) {
        if let Some(m) = AGENTS_ACQUIRED_TOTAL.get() {
            m.inc_by(count as f64);
        }
    }

    pub fn record_rejected(&self) {
        if let Some(m) = AGENTS_REJECTED_TOTAL.get() {
            m.inc();
        }
    }

    /// Record a finished agent execution.
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the execution returned normally
    /// * `duration_secs` - Execution time in seconds
    pub fn record_execution(&self, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        if let Some(m) = AGENT_EXECUTIONS_TOTAL.get() {
            m.with_label_values(&[outcome]).inc();
        }
        if let Some(m) = AGENT_EXECUTION_DURATION.get() {
            m.with_label_values(&[outcome]).observe(duration_secs);
        }
        tracing::trace!(outcome, duration_secs, "Recorded agent execution");
    }

    pub fn record_reschedule_failure(&self) {
        if let Some(m) = RESCHEDULE_FAILURES_TOTAL.get() {
            m.inc();
        }
    }

    /// Record cleaned entries for `kind` ("zombie" or "orphan").
    pub fn record_cleanup(&self, kind: &str, cleaned: usize) {
        if cleaned == 0 {
            return;
        }
        if let Some(m) = CLEANUP_TOTAL.get() {
            m.with_label_values(&[kind]).inc_by(cleaned as f64);
        }
    }

    pub fn record_cleanup_skipped(&self, kind: &str) {
        if let Some(m) = CLEANUP_SKIPPED_TOTAL.get() {
            m.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_leadership_claim(&self, outcome: &str) {
        if let Some(m) = LEADERSHIP_CLAIMS_TOTAL.get() {
            m.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_script_eval(&self, script: &str, outcome: &str) {
        if let Some(m) = SCRIPT_EVALS_TOTAL.get() {
            m.with_label_values(&[script, outcome]).inc();
        }
    }

    pub fn record_script_reload(&self) {
        if let Some(m) = SCRIPT_RELOADS_TOTAL.get() {
            m.inc();
        }
    }

    /// Record one heartbeat.
    pub fn record_heartbeat(&self, duration_secs: f64, ok: bool) {
        if let Some(m) = HEARTBEAT_DURATION.get() {
            m.observe(duration_secs);
        }
        if !ok {
            if let Some(m) = HEARTBEAT_FAILURES_TOTAL.get() {
                m.inc();
            }
        }
    }

    pub fn record_watchdog(&self, concern: &str) {
        if let Some(m) = WATCHDOG_FIRED_TOTAL.get() {
            m.with_label_values(&[concern]).inc();
        }
    }

    /// Update the active-agent and free-permit gauges.
    pub fn update_capacity(&self, active: usize, free_permits: usize) {
        if let Some(m) = ACTIVE_AGENTS.get() {
            m.set(active as f64);
        }
        if let Some(m) = FREE_PERMITS.get() {
            m.set(free_permits as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_collector_records_without_panicking() {
        let collector = MetricsCollector::new();
        // Before or after init, recording must not panic
        collector.record_execution(true, 0.5);
        let _ = init_metrics();
        collector.record_acquired(3);
        collector.record_execution(false, 1.5);
        collector.record_cleanup("zombie", 2);
        collector.record_cleanup("orphan", 0);
        collector.record_script_eval("acquire_agents", "ok");
        collector.record_heartbeat(0.01, false);
        collector.update_capacity(4, 6);
    }

    #[test]
    fn test_cleanup_counter_increments() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        let before = CLEANUP_TOTAL
            .get()
            .map(|m| m.with_label_values(&["zombie"]).get())
            .unwrap_or(0.0);
        collector.record_cleanup("zombie", 1);
        if let Some(m) = CLEANUP_TOTAL.get() {
            assert!(m.with_label_values(&["zombie"]).get() >= before + 1.0);
        }
    }
}
