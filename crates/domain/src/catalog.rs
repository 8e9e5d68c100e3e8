//! 目录存储：数据源及其发现得到的数据集版本历史
//!
//! 数据集版本只追加。同一数据源的版本写入经由进程内互斥锁串行化，
//! 保证版本号与发现时间同步严格递增。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use discovery_errors::{DiscoveryError, DiscoveryResult};

use crate::entities::{
    DataSource, DataSourceFilter, DataSourceSpec, DatasetVersion, NewDatasetVersion,
};
use crate::repositories::{DataSourceRepository, DatasetRepository};

/// `put_version` 的结果；指纹未变化时 `created` 为 false，返回现有最新版本
#[derive(Debug, Clone, PartialEq)]
pub struct PutVersionOutcome {
    pub version: DatasetVersion,
    pub created: bool,
}

/// `complete_run_with_version` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunVersionOutcome {
    /// 追加了新版本，实例已转为 SUCCEEDED
    Completed(DatasetVersion),
    /// 指纹未变化，未写入
    Unchanged(DatasetVersion),
    /// 实例已不在 RUNNING，未写入
    RunNotRunning,
}

enum NextVersion {
    Unchanged(DatasetVersion),
    New(NewDatasetVersion),
}

pub struct CatalogStore {
    source_repo: Arc<dyn DataSourceRepository>,
    dataset_repo: Arc<dyn DatasetRepository>,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(
        source_repo: Arc<dyn DataSourceRepository>,
        dataset_repo: Arc<dyn DatasetRepository>,
    ) -> Self {
        Self {
            source_repo,
            dataset_repo,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn register_source(&self, spec: DataSourceSpec) -> DiscoveryResult<DataSource> {
        validate_source_spec(&spec)?;
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let _guard = self.write_lock.lock().await;
        if self.source_repo.get_latest(&id).await?.is_some() {
            return Err(DiscoveryError::validation_error(format!(
                "数据源 {id} 已存在"
            )));
        }
        let source = DataSource {
            id,
            version: 1,
            name: spec.name,
            connector_type: spec.connector_type,
            connection_params: spec.connection_params,
            enabled: spec.enabled,
            created_at: Utc::now(),
        };
        let created = self.source_repo.insert(&source).await?;
        info!("注册{}", created.entity_description());
        Ok(created)
    }

    /// 修改数据源
    ///
    /// 当前版本已被数据集引用时保持不变，写入一个新版本；否则原地替换。
    pub async fn update_source(
        &self,
        id: &str,
        spec: DataSourceSpec,
    ) -> DiscoveryResult<DataSource> {
        validate_source_spec(&spec)?;

        let _guard = self.write_lock.lock().await;
        let current = self
            .source_repo
            .get_latest(id)
            .await?
            .ok_or_else(|| DiscoveryError::data_source_not_found(id))?;

        let referenced = self
            .dataset_repo
            .references_source_version(id, current.version)
            .await?;

        let mut next = DataSource {
            id: current.id.clone(),
            version: current.version,
            name: spec.name,
            connector_type: spec.connector_type,
            connection_params: spec.connection_params,
            enabled: spec.enabled,
            created_at: current.created_at,
        };

        if referenced {
            next.version = current.version + 1;
            next.created_at = Utc::now();
            let created = self.source_repo.insert(&next).await?;
            info!(
                "数据源 {} 版本 {} 已被引用，创建新版本 {}",
                id, current.version, created.version
            );
            Ok(created)
        } else {
            let replaced = self.source_repo.replace(&next).await?;
            debug!("数据源 {} 版本 {} 原地更新", id, replaced.version);
            Ok(replaced)
        }
    }

    pub async fn get_source(&self, id: &str) -> DiscoveryResult<DataSource> {
        self.source_repo
            .get_latest(id)
            .await?
            .ok_or_else(|| DiscoveryError::data_source_not_found(id))
    }

    pub async fn source_versions(&self, id: &str) -> DiscoveryResult<Vec<DataSource>> {
        let versions = self.source_repo.get_versions(id).await?;
        if versions.is_empty() {
            return Err(DiscoveryError::data_source_not_found(id));
        }
        Ok(versions)
    }

    pub async fn list_sources(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>> {
        self.source_repo.list(filter).await
    }

    pub async fn put_version(
        &self,
        source_id: &str,
        schema_snapshot: serde_json::Value,
        fingerprint: &str,
        run_id: Option<i64>,
    ) -> DiscoveryResult<PutVersionOutcome> {
        self.put_version_at(source_id, schema_snapshot, fingerprint, run_id, Utc::now())
            .await
    }

    /// 指纹与最新版本相同时不写入；否则追加新版本
    ///
    /// 发现时间不早于上一版本加 1 毫秒，时钟回拨时仍保持严格递增。
    pub async fn put_version_at(
        &self,
        source_id: &str,
        schema_snapshot: serde_json::Value,
        fingerprint: &str,
        run_id: Option<i64>,
        discovered_at: DateTime<Utc>,
    ) -> DiscoveryResult<PutVersionOutcome> {
        let _guard = self.write_lock.lock().await;
        let new_version = match self
            .next_version(source_id, schema_snapshot, fingerprint, run_id, discovered_at)
            .await?
        {
            NextVersion::Unchanged(latest) => {
                return Ok(PutVersionOutcome {
                    version: latest,
                    created: false,
                })
            }
            NextVersion::New(new_version) => new_version,
        };

        let created = self.dataset_repo.append(&new_version).await?;
        info!(
            "数据源 {} 新增数据集版本 {} (ID: {})",
            source_id, created.version, created.id
        );
        Ok(PutVersionOutcome {
            version: created,
            created: true,
        })
    }

    /// 写入运行实例的发现结果
    ///
    /// 产生新版本时，版本追加与实例 RUNNING→SUCCEEDED 在同一次存储操作中完成；
    /// 指纹未变化时不写入，实例状态由调用方转换；实例已不在 RUNNING 时不留下任何版本。
    pub async fn complete_run_with_version(
        &self,
        run_id: i64,
        source_id: &str,
        schema_snapshot: serde_json::Value,
        fingerprint: &str,
    ) -> DiscoveryResult<RunVersionOutcome> {
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;
        let new_version = match self
            .next_version(source_id, schema_snapshot, fingerprint, Some(run_id), now)
            .await?
        {
            NextVersion::Unchanged(latest) => return Ok(RunVersionOutcome::Unchanged(latest)),
            NextVersion::New(new_version) => new_version,
        };

        match self.dataset_repo.append_completing_run(&new_version, now).await? {
            Some(created) => {
                info!(
                    "数据源 {} 新增数据集版本 {} (ID: {})，运行实例 {} 完成",
                    source_id, created.version, created.id, run_id
                );
                Ok(RunVersionOutcome::Completed(created))
            }
            None => {
                debug!("运行实例 {} 已不在运行状态，丢弃发现结果", run_id);
                Ok(RunVersionOutcome::RunNotRunning)
            }
        }
    }

    /// 计算下一个版本；调用方需持有写锁
    async fn next_version(
        &self,
        source_id: &str,
        schema_snapshot: serde_json::Value,
        fingerprint: &str,
        run_id: Option<i64>,
        discovered_at: DateTime<Utc>,
    ) -> DiscoveryResult<NextVersion> {
        if fingerprint.trim().is_empty() {
            return Err(DiscoveryError::validation_error("指纹不能为空"));
        }

        let source = self
            .source_repo
            .get_latest(source_id)
            .await?
            .ok_or_else(|| DiscoveryError::data_source_not_found(source_id))?;

        let latest = self.dataset_repo.get_latest(source_id).await?;
        if let Some(latest) = latest.as_ref().filter(|latest| latest.fingerprint == fingerprint) {
            debug!(
                "数据源 {} 指纹未变化，沿用版本 {}",
                source_id, latest.version
            );
            return Ok(NextVersion::Unchanged(latest.clone()));
        }

        let (version, discovered_at) = match &latest {
            Some(latest) => (
                latest.version + 1,
                discovered_at.max(latest.discovered_at + Duration::milliseconds(1)),
            ),
            None => (1, discovered_at),
        };

        Ok(NextVersion::New(NewDatasetVersion {
            data_source_id: source_id.to_string(),
            data_source_version: source.version,
            version,
            schema_snapshot,
            fingerprint: fingerprint.to_string(),
            run_id,
            discovered_at,
        }))
    }

    pub async fn latest_version(&self, source_id: &str) -> DiscoveryResult<Option<DatasetVersion>> {
        self.get_source(source_id).await?;
        self.dataset_repo.get_latest(source_id).await
    }

    /// 按版本号升序返回全部版本
    pub async fn history(&self, source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>> {
        self.get_source(source_id).await?;
        self.dataset_repo.get_history(source_id).await
    }

    pub async fn get_version(&self, id: i64) -> DiscoveryResult<DatasetVersion> {
        self.dataset_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::NotFound {
                entity: "数据集版本",
                id: id.to_string(),
            })
    }
}

fn validate_source_spec(spec: &DataSourceSpec) -> DiscoveryResult<()> {
    if spec.name.trim().is_empty() {
        return Err(DiscoveryError::validation_error("数据源名称不能为空"));
    }
    if spec.connector_type.trim().is_empty() {
        return Err(DiscoveryError::validation_error("连接器类型不能为空"));
    }
    if !(spec.connection_params.is_object() || spec.connection_params.is_null()) {
        return Err(DiscoveryError::validation_error("连接参数必须是 JSON 对象"));
    }
    Ok(())
}
