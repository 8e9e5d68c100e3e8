//! Structured logging utilities
//!
//! Every record carries an `event` field so log pipelines can follow a run
//! from enqueue to its terminal state.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log a run being enqueued by the scheduler or a manual trigger
    pub fn log_run_enqueued(run_id: i64, job_id: &str, scheduled_for: DateTime<Utc>, manual: bool) {
        info!(
            event = "run_enqueued",
            run.id = run_id,
            job.id = job_id,
            run.scheduled_for = %scheduled_for,
            run.manual = manual,
            "Run enqueued"
        );
    }

    /// Log a job skipped during a scheduling cycle
    pub fn log_job_skipped(job_id: &str, reason: &str) {
        debug!(
            event = "job_skipped",
            job.id = job_id,
            reason = reason,
            "Job skipped in scheduling cycle"
        );
    }

    /// Log a worker claiming a queued run
    pub fn log_run_claimed(run_id: i64, job_id: &str, connector_type: &str) {
        info!(
            event = "run_claimed",
            run.id = run_id,
            job.id = job_id,
            connector.type = connector_type,
            "Run claimed by executor"
        );
    }

    /// Log a run reaching a terminal state
    pub fn log_run_finished(run_id: i64, job_id: &str, state: &str, duration_ms: Option<i64>, error: Option<&str>) {
        match error {
            Some(error) => warn!(
                event = "run_finished",
                run.id = run_id,
                job.id = job_id,
                run.state = state,
                run.duration_ms = ?duration_ms,
                run.error = error,
                "Run finished with error"
            ),
            None => info!(
                event = "run_finished",
                run.id = run_id,
                job.id = job_id,
                run.state = state,
                run.duration_ms = ?duration_ms,
                "Run finished"
            ),
        }
    }

    /// Log a stale run reclaimed by the reaper
    pub fn log_stale_run_reclaimed(run_id: i64, job_id: &str, last_seen_alive: DateTime<Utc>) {
        warn!(
            event = "stale_run_reclaimed",
            run.id = run_id,
            job.id = job_id,
            run.last_seen_alive = %last_seen_alive,
            "Stale run marked as failed"
        );
    }

    /// Log a new dataset version appended to the catalog
    pub fn log_dataset_version_created(data_source_id: &str, version: i32, version_id: i64, run_id: i64) {
        info!(
            event = "dataset_version_created",
            data_source.id = data_source_id,
            dataset.version = version,
            dataset.id = version_id,
            run.id = run_id,
            "Dataset version created"
        );
    }

    /// Log a scheduling cycle that failed and will be retried
    pub fn log_scheduler_cycle_failed(error: &str, consecutive_failures: u32, backoff_ms: u64) {
        error!(
            event = "scheduler_cycle_failed",
            error = error,
            scheduler.consecutive_failures = consecutive_failures,
            scheduler.backoff_ms = backoff_ms,
            "Scheduling cycle failed, backing off"
        );
    }

    /// Log a cancellation request
    pub fn log_cancel_requested(run_id: i64, state: &str) {
        info!(
            event = "cancel_requested",
            run.id = run_id,
            run.state = state,
            "Run cancellation requested"
        );
    }
}
