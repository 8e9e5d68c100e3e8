use async_trait::async_trait;
use discovery_domain::{
    entities::{JobDefinition, JobDefinitionFilter},
    repositories::JobDefinitionRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::{decode_json, is_unique_violation};

const COLUMNS: &str = "id, name, data_source_id, schedule, parameters, enabled, timeout_seconds, created_at, updated_at";

pub struct SqliteJobDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteJobDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> DiscoveryResult<JobDefinition> {
        let parameters: String = row.try_get("parameters")?;
        Ok(JobDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            data_source_id: row.try_get("data_source_id")?,
            schedule: row.try_get("schedule")?,
            parameters: decode_json("parameters", &parameters)?,
            enabled: row.try_get("enabled")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobDefinitionRepository for SqliteJobDefinitionRepository {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn create(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        let parameters = serde_json::to_string(&job.parameters)?;
        sqlx::query(
            "INSERT INTO job_definitions (id, name, data_source_id, schedule, parameters, enabled,
                                          timeout_seconds, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.data_source_id)
        .bind(&job.schedule)
        .bind(parameters)
        .bind(job.enabled)
        .bind(job.timeout_seconds)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DiscoveryError::validation_error(format!("作业定义 {} 已存在", job.id))
            } else {
                DiscoveryError::Database(e)
            }
        })?;

        debug!("创建{}", job.entity_description());
        Ok(job.clone())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        let parameters = serde_json::to_string(&job.parameters)?;
        let result = sqlx::query(
            "UPDATE job_definitions
             SET name = ?, data_source_id = ?, schedule = ?, parameters = ?, enabled = ?,
                 timeout_seconds = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&job.name)
        .bind(&job.data_source_id)
        .bind(&job.schedule)
        .bind(parameters)
        .bind(job.enabled)
        .bind(job.timeout_seconds)
        .bind(job.updated_at)
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DiscoveryError::job_not_found(&job.id));
        }

        debug!("更新{}", job.entity_description());
        Ok(job.clone())
    }

    async fn get_by_id(&self, id: &str) -> DiscoveryResult<Option<JobDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_definitions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM job_definitions WHERE 1 = 1"));
        if let Some(enabled) = filter.enabled {
            builder.push(" AND enabled = ").push_bind(enabled);
        }
        if let Some(data_source_id) = &filter.data_source_id {
            builder.push(" AND data_source_id = ").push_bind(data_source_id.clone());
        }
        builder.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
            if let Some(offset) = filter.offset {
                builder.push(" OFFSET ").push_bind(offset);
            }
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_job).collect()
    }
}
