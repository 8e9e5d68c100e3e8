use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_domain::{
    entities::{Run, RunErrorDetail, RunFilter, RunState, RunStateUpdate},
    repositories::RunRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::{decode_json, is_unique_violation};

const COLUMNS: &str = "id, job_id, data_source_id, state, scheduled_for, queued_at, started_at, ended_at, heartbeat_at, cancel_requested, error, dataset_version_ids";

/// 运行实例仓储
///
/// `idx_runs_one_active_per_job` 部分唯一索引保证每个作业至多一个 QUEUED/RUNNING 实例，
/// 状态转换使用 `WHERE id = ? AND state = ?` 形式的条件更新。
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> DiscoveryResult<Run> {
        let state: String = row.try_get("state")?;
        let error: Option<String> = row.try_get("error")?;
        let dataset_version_ids: String = row.try_get("dataset_version_ids")?;
        Ok(Run {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            data_source_id: row.try_get("data_source_id")?,
            state: state.parse()?,
            scheduled_for: row.try_get("scheduled_for")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            error: error
                .as_deref()
                .map(|raw| decode_json::<RunErrorDetail>("error", raw))
                .transpose()?,
            dataset_version_ids: decode_json("dataset_version_ids", &dataset_version_ids)?,
        })
    }

    async fn fetch_one_where(&self, clause: &str, bind: &str) -> DiscoveryResult<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM runs WHERE {clause}"))
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_run).transpose()
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    #[instrument(skip(self, run), fields(job_id = %run.job_id, scheduled_for = %run.scheduled_for))]
    async fn create_queued(&self, run: &Run) -> DiscoveryResult<Run> {
        let result = sqlx::query(
            "INSERT INTO runs (job_id, data_source_id, state, scheduled_for, queued_at,
                               cancel_requested, dataset_version_ids)
             VALUES (?, ?, ?, ?, ?, 0, '[]')",
        )
        .bind(&run.job_id)
        .bind(&run.data_source_id)
        .bind(RunState::Queued.as_str())
        .bind(run.scheduled_for)
        .bind(run.queued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DiscoveryError::ActiveRunExists {
                    job_id: run.job_id.clone(),
                }
            } else {
                DiscoveryError::Database(e)
            }
        })?;

        let mut created = Run::queued(
            run.job_id.clone(),
            run.data_source_id.clone(),
            run.scheduled_for,
            run.queued_at,
        );
        created.id = result.last_insert_rowid();
        debug!("创建{}", created.entity_description());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM runs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn list(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM runs WHERE 1 = 1"));
        if let Some(job_id) = &filter.job_id {
            builder.push(" AND job_id = ").push_bind(job_id.clone());
        }
        if let Some(state) = filter.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(range) = filter.time_range {
            builder
                .push(" AND queued_at >= ")
                .push_bind(range.start)
                .push(" AND queued_at < ")
                .push_bind(range.end);
        }
        builder.push(" ORDER BY queued_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_run).collect()
    }

    #[instrument(skip(self, update), fields(run_id = id, from = %from, to = %update.to))]
    async fn compare_and_set(
        &self,
        id: i64,
        from: RunState,
        update: &RunStateUpdate,
    ) -> DiscoveryResult<bool> {
        let started_at = (update.to == RunState::Running).then_some(update.at);
        let ended_at = update.to.is_terminal().then_some(update.at);
        let error = update
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let dataset_version_ids = if update.dataset_version_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&update.dataset_version_ids)?)
        };

        let result = sqlx::query(
            "UPDATE runs
             SET state = ?,
                 started_at = COALESCE(?, started_at),
                 heartbeat_at = COALESCE(?, heartbeat_at),
                 ended_at = COALESCE(?, ended_at),
                 error = COALESCE(?, error),
                 dataset_version_ids = COALESCE(?, dataset_version_ids)
             WHERE id = ? AND state = ?",
        )
        .bind(update.to.as_str())
        .bind(started_at)
        .bind(started_at)
        .bind(ended_at)
        .bind(error)
        .bind(dataset_version_ids)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_active_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.fetch_one_where(
            "job_id = ? AND state IN ('QUEUED', 'RUNNING') LIMIT 1",
            job_id,
        )
        .await
    }

    async fn get_last_terminal_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.fetch_one_where(
            "job_id = ? AND state IN ('SUCCEEDED', 'FAILED', 'CANCELLED') AND ended_at IS NOT NULL
             ORDER BY ended_at DESC, id DESC LIMIT 1",
            job_id,
        )
        .await
    }

    async fn get_by_state(&self, state: RunState) -> DiscoveryResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM runs WHERE state = ? ORDER BY queued_at ASC, id ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET heartbeat_at = ? WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn request_cancel(&self, id: i64) -> DiscoveryResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = 1 WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        Ok(result.rows_affected() == 1)
    }
}
