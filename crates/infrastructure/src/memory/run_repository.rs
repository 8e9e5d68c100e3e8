use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_domain::{
    entities::{Run, RunFilter, RunState, RunStateUpdate},
    repositories::RunRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub(super) struct RunTable {
    pub(super) runs: BTreeMap<i64, Run>,
    next_id: i64,
}

/// 所有操作在同一把锁内完成，检查与写入之间不会交错
#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    pub(super) table: Mutex<RunTable>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_queued(&self, run: &Run) -> DiscoveryResult<Run> {
        let mut table = self.table.lock().await;
        if table
            .runs
            .values()
            .any(|r| r.job_id == run.job_id && r.is_active())
        {
            return Err(DiscoveryError::ActiveRunExists {
                job_id: run.job_id.clone(),
            });
        }
        table.next_id += 1;
        let mut created = Run::queued(
            run.job_id.clone(),
            run.data_source_id.clone(),
            run.scheduled_for,
            run.queued_at,
        );
        created.id = table.next_id;
        table.runs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<Run>> {
        let table = self.table.lock().await;
        Ok(table.runs.get(&id).cloned())
    }

    async fn list(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>> {
        let table = self.table.lock().await;
        let mut runs: Vec<Run> = table
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn compare_and_set(
        &self,
        id: i64,
        from: RunState,
        update: &RunStateUpdate,
    ) -> DiscoveryResult<bool> {
        let mut table = self.table.lock().await;
        match table.runs.get_mut(&id) {
            Some(run) if run.state == from => {
                run.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_active_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        let table = self.table.lock().await;
        Ok(table
            .runs
            .values()
            .find(|r| r.job_id == job_id && r.is_active())
            .cloned())
    }

    async fn get_last_terminal_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        let table = self.table.lock().await;
        Ok(table
            .runs
            .values()
            .filter(|r| r.job_id == job_id && r.is_terminal() && r.ended_at.is_some())
            .max_by(|a, b| a.ended_at.cmp(&b.ended_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn get_by_state(&self, state: RunState) -> DiscoveryResult<Vec<Run>> {
        let table = self.table.lock().await;
        let mut runs: Vec<Run> = table
            .runs
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<bool> {
        let mut table = self.table.lock().await;
        match table.runs.get_mut(&id) {
            Some(run) if run.state == RunState::Running => {
                run.heartbeat_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, id: i64) -> DiscoveryResult<bool> {
        let mut table = self.table.lock().await;
        match table.runs.get_mut(&id) {
            Some(run) if run.state == RunState::Running => {
                run.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
