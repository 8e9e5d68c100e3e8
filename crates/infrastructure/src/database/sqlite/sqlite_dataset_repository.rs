use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_domain::{
    entities::{DatasetVersion, NewDatasetVersion},
    repositories::DatasetRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::{decode_json, is_unique_violation};

const COLUMNS: &str = "id, data_source_id, data_source_version, version, schema_snapshot, fingerprint, run_id, discovered_at";

/// 数据集版本只追加，表上的触发器拒绝 UPDATE 与 DELETE
pub struct SqliteDatasetRepository {
    pool: SqlitePool,
}

impl SqliteDatasetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> DiscoveryResult<DatasetVersion> {
        let snapshot: String = row.try_get("schema_snapshot")?;
        Ok(DatasetVersion {
            id: row.try_get("id")?,
            data_source_id: row.try_get("data_source_id")?,
            data_source_version: row.try_get("data_source_version")?,
            version: row.try_get("version")?,
            schema_snapshot: decode_json("schema_snapshot", &snapshot)?,
            fingerprint: row.try_get("fingerprint")?,
            run_id: row.try_get("run_id")?,
            discovered_at: row.try_get("discovered_at")?,
        })
    }
}

#[async_trait]
impl DatasetRepository for SqliteDatasetRepository {
    #[instrument(skip(self, version), fields(
        data_source_id = %version.data_source_id,
        version = version.version,
        run_id = ?version.run_id,
    ))]
    async fn append(&self, version: &NewDatasetVersion) -> DiscoveryResult<DatasetVersion> {
        let snapshot = serde_json::to_string(&version.schema_snapshot)?;
        let result = sqlx::query(
            "INSERT INTO dataset_versions (data_source_id, data_source_version, version,
                                           schema_snapshot, fingerprint, run_id, discovered_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&version.data_source_id)
        .bind(version.data_source_version)
        .bind(version.version)
        .bind(snapshot)
        .bind(&version.fingerprint)
        .bind(version.run_id)
        .bind(version.discovered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DiscoveryError::validation_error(format!(
                    "数据源 {} 的数据集版本 {} 已存在",
                    version.data_source_id, version.version
                ))
            } else {
                DiscoveryError::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        debug!("追加数据集版本 ID {}", id);
        Ok(DatasetVersion {
            id,
            data_source_id: version.data_source_id.clone(),
            data_source_version: version.data_source_version,
            version: version.version,
            schema_snapshot: version.schema_snapshot.clone(),
            fingerprint: version.fingerprint.clone(),
            run_id: version.run_id,
            discovered_at: version.discovered_at,
        })
    }

    #[instrument(skip(self, version), fields(
        data_source_id = %version.data_source_id,
        version = version.version,
        run_id = ?version.run_id,
    ))]
    async fn append_completing_run(
        &self,
        version: &NewDatasetVersion,
        completed_at: DateTime<Utc>,
    ) -> DiscoveryResult<Option<DatasetVersion>> {
        let run_id = version
            .run_id
            .ok_or_else(|| DiscoveryError::validation_error("数据集版本缺少运行实例 ID"))?;
        let snapshot = serde_json::to_string(&version.schema_snapshot)?;

        let mut tx = self.pool.begin().await.map_err(DiscoveryError::Database)?;

        // INSERT 先取得写锁，之后实例状态不会再被其他连接修改
        let inserted = sqlx::query(
            "INSERT INTO dataset_versions (data_source_id, data_source_version, version,
                                           schema_snapshot, fingerprint, run_id, discovered_at)
             SELECT ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM runs WHERE id = ? AND state = 'RUNNING')",
        )
        .bind(&version.data_source_id)
        .bind(version.data_source_version)
        .bind(version.version)
        .bind(snapshot)
        .bind(&version.fingerprint)
        .bind(run_id)
        .bind(version.discovered_at)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DiscoveryError::validation_error(format!(
                    "数据源 {} 的数据集版本 {} 已存在",
                    version.data_source_id, version.version
                ))
            } else {
                DiscoveryError::Database(e)
            }
        })?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(DiscoveryError::Database)?;
            debug!("运行实例 {} 已不在运行状态，未追加版本", run_id);
            return Ok(None);
        }

        let id = inserted.last_insert_rowid();
        let completed = sqlx::query(
            "UPDATE runs
             SET state = 'SUCCEEDED', ended_at = ?, dataset_version_ids = ?
             WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(completed_at)
        .bind(serde_json::to_string(&[id])?)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(DiscoveryError::Database)?;
        if completed.rows_affected() != 1 {
            tx.rollback().await.map_err(DiscoveryError::Database)?;
            return Ok(None);
        }

        tx.commit().await.map_err(DiscoveryError::Database)?;
        debug!("追加数据集版本 ID {} 并完成运行实例 {}", id, run_id);
        Ok(Some(DatasetVersion {
            id,
            data_source_id: version.data_source_id.clone(),
            data_source_version: version.data_source_version,
            version: version.version,
            schema_snapshot: version.schema_snapshot.clone(),
            fingerprint: version.fingerprint.clone(),
            run_id: version.run_id,
            discovered_at: version.discovered_at,
        }))
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<DatasetVersion>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM dataset_versions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn get_latest(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dataset_versions WHERE data_source_id = ?
             ORDER BY version DESC LIMIT 1"
        ))
        .bind(data_source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn get_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dataset_versions WHERE data_source_id = ? ORDER BY version ASC"
        ))
        .bind(data_source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_version).collect()
    }

    async fn references_source_version(
        &self,
        data_source_id: &str,
        data_source_version: i32,
    ) -> DiscoveryResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM dataset_versions
                 WHERE data_source_id = ? AND data_source_version = ?
             ) AS referenced",
        )
        .bind(data_source_id)
        .bind(data_source_version)
        .fetch_one(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        let referenced: i64 = row.try_get("referenced")?;
        Ok(referenced != 0)
    }
}
