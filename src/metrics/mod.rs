//! Prometheus counters and gauges for the scheduler.
//!
//! Registration happens once per process; the heartbeat and workers report
//! through a [`MetricsCollector`] handle.
//!
//! ```ignore
//! use fleetsched::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_acquired(3);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
