use async_trait::async_trait;
use discovery_domain::{
    entities::{DataSource, DataSourceFilter},
    repositories::DataSourceRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::{decode_json, is_unique_violation};

const COLUMNS: &str =
    "id, version, name, connector_type, connection_params, enabled, created_at";

pub struct SqliteDataSourceRepository {
    pool: SqlitePool,
}

impl SqliteDataSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_data_source(row: &sqlx::sqlite::SqliteRow) -> DiscoveryResult<DataSource> {
        let params: String = row.try_get("connection_params")?;
        Ok(DataSource {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            connector_type: row.try_get("connector_type")?,
            connection_params: decode_json("connection_params", &params)?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl DataSourceRepository for SqliteDataSourceRepository {
    #[instrument(skip(self, source), fields(data_source_id = %source.id, version = source.version))]
    async fn insert(&self, source: &DataSource) -> DiscoveryResult<DataSource> {
        let params = serde_json::to_string(&source.connection_params)?;
        sqlx::query(
            "INSERT INTO data_sources (id, version, name, connector_type, connection_params, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&source.id)
        .bind(source.version)
        .bind(&source.name)
        .bind(&source.connector_type)
        .bind(params)
        .bind(source.enabled)
        .bind(source.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DiscoveryError::validation_error(format!(
                    "数据源 {} 版本 {} 已存在",
                    source.id, source.version
                ))
            } else {
                DiscoveryError::Database(e)
            }
        })?;

        debug!("创建{}", source.entity_description());
        Ok(source.clone())
    }

    async fn replace(&self, source: &DataSource) -> DiscoveryResult<DataSource> {
        let params = serde_json::to_string(&source.connection_params)?;
        let result = sqlx::query(
            "UPDATE data_sources
             SET name = ?, connector_type = ?, connection_params = ?, enabled = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&source.name)
        .bind(&source.connector_type)
        .bind(params)
        .bind(source.enabled)
        .bind(&source.id)
        .bind(source.version)
        .execute(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DiscoveryError::data_source_not_found(&source.id));
        }
        Ok(source.clone())
    }

    async fn get_latest(&self, id: &str) -> DiscoveryResult<Option<DataSource>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM data_sources WHERE id = ? ORDER BY version DESC LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        row.as_ref().map(Self::row_to_data_source).transpose()
    }

    async fn get_versions(&self, id: &str) -> DiscoveryResult<Vec<DataSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM data_sources WHERE id = ? ORDER BY version ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_data_source).collect()
    }

    async fn list(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM data_sources d \
             WHERE d.version = (SELECT MAX(version) FROM data_sources WHERE id = d.id)"
        ));
        if let Some(connector_type) = &filter.connector_type {
            builder.push(" AND d.connector_type = ").push_bind(connector_type.clone());
        }
        if let Some(enabled) = filter.enabled {
            builder.push(" AND d.enabled = ").push_bind(enabled);
        }
        builder.push(" ORDER BY d.id ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(DiscoveryError::Database)?;

        rows.iter().map(Self::row_to_data_source).collect()
    }
}
