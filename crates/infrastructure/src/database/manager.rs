use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use discovery_domain::repositories::{
    DataSourceRepository, DatasetRepository, JobDefinitionRepository, RunRepository,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::schema::SCHEMA_STATEMENTS;
use super::sqlite::{
    SqliteDataSourceRepository, SqliteDatasetRepository, SqliteJobDefinitionRepository,
    SqliteRunRepository,
};

/// SQLite 连接池设置
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

impl DatabaseOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 创建连接池并执行建表
    ///
    /// `sqlite::memory:` 的每个连接都是独立的库，因此固定为单连接且不回收。
    pub async fn new(options: &DatabaseOptions) -> Result<Self> {
        info!("创建SQLite数据库连接池: {}", options.url);

        let connect_options = SqliteConnectOptions::from_str(&options.url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool_options = if options.url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(options.max_connections)
                .min_connections(options.min_connections)
                .idle_timeout(options.idle_timeout)
        };

        let pool = pool_options
            .acquire_timeout(options.connection_timeout)
            .connect_with(connect_options)
            .await
            .context("创建数据库连接池失败")?;

        let manager = Self { pool };
        manager.migrate().await.context("运行数据库迁移失败")?;
        info!("✅ 数据库初始化完成");
        Ok(manager)
    }

    /// 单连接内存库
    pub async fn in_memory() -> Result<Self> {
        Self::new(&DatabaseOptions::new("sqlite::memory:")).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("运行SQLite数据库迁移");
        for (description, statement) in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("{description}失败"))?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn data_source_repository(&self) -> Arc<dyn DataSourceRepository> {
        Arc::new(SqliteDataSourceRepository::new(self.pool.clone()))
    }

    pub fn job_definition_repository(&self) -> Arc<dyn JobDefinitionRepository> {
        Arc::new(SqliteJobDefinitionRepository::new(self.pool.clone()))
    }

    pub fn run_repository(&self) -> Arc<dyn RunRepository> {
        Arc::new(SqliteRunRepository::new(self.pool.clone()))
    }

    pub fn dataset_repository(&self) -> Arc<dyn DatasetRepository> {
        Arc::new(SqliteDatasetRepository::new(self.pool.clone()))
    }
}
