//! Metrics collector for the discovery engine
//!
//! Handles are registered against the global `metrics` recorder. Without an
//! installed recorder every call is a no-op.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metrics collector for the discovery engine
pub struct MetricsCollector {
    runs_enqueued_total: Counter,
    stale_runs_reclaimed_total: Counter,
    dataset_versions_created_total: Counter,
    scheduler_cycle_failures_total: Counter,
    scheduler_cycle_duration: Histogram,
    run_duration: Histogram,
    queue_depth: Gauge,
    active_runs: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            runs_enqueued_total: counter!("discovery_runs_enqueued_total"),
            stale_runs_reclaimed_total: counter!("discovery_stale_runs_reclaimed_total"),
            dataset_versions_created_total: counter!("discovery_dataset_versions_created_total"),
            scheduler_cycle_failures_total: counter!("discovery_scheduler_cycle_failures_total"),
            scheduler_cycle_duration: histogram!("discovery_scheduler_cycle_duration_seconds"),
            run_duration: histogram!("discovery_run_duration_seconds"),
            queue_depth: gauge!("discovery_queue_depth"),
            active_runs: gauge!("discovery_active_runs"),
        }
    }

    pub fn record_run_enqueued(&self) {
        self.runs_enqueued_total.increment(1);
    }

    /// Record a run reaching a terminal state
    pub fn record_run_finished(&self, state: &str, duration_seconds: Option<f64>) {
        counter!("discovery_runs_finished_total", "state" => state.to_string()).increment(1);
        if let Some(duration) = duration_seconds {
            self.run_duration.record(duration);
        }
    }

    pub fn record_stale_run_reclaimed(&self) {
        self.stale_runs_reclaimed_total.increment(1);
    }

    pub fn record_dataset_version_created(&self) {
        self.dataset_versions_created_total.increment(1);
    }

    pub fn record_scheduler_cycle(&self, duration_seconds: f64) {
        self.scheduler_cycle_duration.record(duration_seconds);
    }

    pub fn record_scheduler_failure(&self, error_kind: &'static str) {
        self.scheduler_cycle_failures_total.increment(1);
        counter!("discovery_errors_total", "kind" => error_kind).increment(1);
    }

    pub fn update_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn update_active_runs(&self, count: usize) {
        self.active_runs.set(count as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus exporter as the global recorder
///
/// Must be called from within a tokio runtime; the HTTP listener is spawned on it.
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}
