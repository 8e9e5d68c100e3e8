//! Test doubles for connectors, repositories and the cancellation seam
//!
//! Everything here is in-process; nothing touches the network or a real
//! data source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use discovery_domain::connector::{
    CancellationNotifier, Connector, DiscoveryOutcome, DiscoveryRequest,
};
use chrono::{DateTime, Utc};
use discovery_domain::entities::{
    JobDefinition, JobDefinitionFilter, Run, RunFilter, RunState, RunStateUpdate,
};
use discovery_domain::repositories::{JobDefinitionRepository, RunRepository};
use discovery_errors::{DiscoveryError, DiscoveryResult};

/// One scripted reaction of a [`ScriptedConnector`]
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this snapshot immediately
    Snapshot(serde_json::Value),
    /// Fail with a connector error
    Fail(String),
    /// Return the snapshot after a delay, or a connector error if cancelled first
    Delay(Duration, serde_json::Value),
    /// Block until cancellation, then return a connector error
    WaitForCancel,
    /// Block far longer than any test timeout and ignore cancellation
    IgnoreCancel,
}

/// Connector whose behaviour is scripted step by step
///
/// Steps are consumed in order; once the script is exhausted every call uses
/// the fallback step. Tracks call count and peak concurrency.
pub struct ScriptedConnector {
    connector_type: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(connector_type: &str) -> Self {
        Self {
            connector_type: connector_type.to_string(),
            steps: Mutex::new(VecDeque::new()),
            fallback: ScriptStep::Snapshot(serde_json::json!({"tables": []})),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_steps(self, steps: Vec<ScriptStep>) -> Self {
        *self.steps.lock().unwrap() = steps.into();
        self
    }

    pub fn with_fallback(mut self, fallback: ScriptStep) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn perform(
        &self,
        step: ScriptStep,
        request: &DiscoveryRequest,
    ) -> DiscoveryResult<DiscoveryOutcome> {
        match step {
            ScriptStep::Snapshot(snapshot) => Ok(DiscoveryOutcome::from_snapshot(snapshot)),
            ScriptStep::Fail(message) => Err(DiscoveryError::connector_error(message)),
            ScriptStep::Delay(delay, snapshot) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(DiscoveryOutcome::from_snapshot(snapshot)),
                    _ = request.cancellation.cancelled() => {
                        Err(DiscoveryError::connector_error("discovery cancelled"))
                    }
                }
            }
            ScriptStep::WaitForCancel => {
                request.cancellation.cancelled().await;
                Err(DiscoveryError::connector_error("discovery cancelled"))
            }
            ScriptStep::IgnoreCancel => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(DiscoveryOutcome::from_snapshot(serde_json::json!({})))
            }
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn connector_type(&self) -> &str {
        &self.connector_type
    }

    async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryResult<DiscoveryOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let step = self.next_step();
        let result = self.perform(step, request).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Job definition repository that fails `list` a configurable number of times
///
/// The failure is a retryable persistence error, which is what drives the
/// scheduler's backoff.
pub struct FlakyJobDefinitionRepository {
    inner: Arc<dyn JobDefinitionRepository>,
    failures_remaining: AtomicU32,
    list_calls: AtomicUsize,
}

impl FlakyJobDefinitionRepository {
    pub fn new(inner: Arc<dyn JobDefinitionRepository>) -> Self {
        Self {
            inner,
            failures_remaining: AtomicU32::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobDefinitionRepository for FlakyJobDefinitionRepository {
    async fn create(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        self.inner.create(job).await
    }

    async fn update(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        self.inner.update(job).await
    }

    async fn get_by_id(&self, id: &str) -> DiscoveryResult<Option<JobDefinition>> {
        self.inner.get_by_id(id).await
    }

    async fn list(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DiscoveryError::database_error("simulated store outage"));
        }
        self.inner.list(filter).await
    }
}

/// Run repository whose state transitions fail a configurable number of times
pub struct FlakyRunRepository {
    inner: Arc<dyn RunRepository>,
    failures_remaining: AtomicU32,
}

impl FlakyRunRepository {
    pub fn new(inner: Arc<dyn RunRepository>) -> Self {
        Self {
            inner,
            failures_remaining: AtomicU32::new(0),
        }
    }

    pub fn fail_next_transitions(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunRepository for FlakyRunRepository {
    async fn create_queued(&self, run: &Run) -> DiscoveryResult<Run> {
        self.inner.create_queued(run).await
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<Run>> {
        self.inner.get_by_id(id).await
    }

    async fn list(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>> {
        self.inner.list(filter).await
    }

    async fn compare_and_set(
        &self,
        id: i64,
        from: RunState,
        update: &RunStateUpdate,
    ) -> DiscoveryResult<bool> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DiscoveryError::database_error("simulated store outage"));
        }
        self.inner.compare_and_set(id, from, update).await
    }

    async fn get_active_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.inner.get_active_run(job_id).await
    }

    async fn get_last_terminal_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.inner.get_last_terminal_run(job_id).await
    }

    async fn get_by_state(&self, state: RunState) -> DiscoveryResult<Vec<Run>> {
        self.inner.get_by_state(state).await
    }

    async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<bool> {
        self.inner.record_heartbeat(id, at).await
    }

    async fn request_cancel(&self, id: i64) -> DiscoveryResult<bool> {
        self.inner.request_cancel(id).await
    }
}

/// Cancellation notifier that records the run ids it was asked about
#[derive(Default)]
pub struct RecordingCancellationNotifier {
    notified: Mutex<Vec<i64>>,
}

impl RecordingCancellationNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notified(&self) -> Vec<i64> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl CancellationNotifier for RecordingCancellationNotifier {
    async fn notify_cancel(&self, run_id: i64) -> bool {
        self.notified.lock().unwrap().push(run_id);
        true
    }
}
