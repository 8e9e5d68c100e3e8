//! Observability module
//!
//! Logging initialisation, event-tagged structured logs and Prometheus metrics
//! for the scheduler, the executor pool and the stale-run reaper.

pub mod logging;
pub mod metrics_collector;
pub mod structured_logger;

pub use logging::init_logging;
pub use metrics_collector::{init_metrics, MetricsCollector};
pub use structured_logger::StructuredLogger;
