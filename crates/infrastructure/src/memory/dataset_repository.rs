use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_domain::{
    entities::{DatasetVersion, NewDatasetVersion, RunState, RunStateUpdate},
    repositories::DatasetRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use tokio::sync::RwLock;

use super::InMemoryRunRepository;

/// 只追加的版本列表，ID 即下标加一
///
/// 持有运行实例仓储，用于在同一临界区内追加版本并完成实例。
/// 加锁顺序固定为先版本列表后运行实例表。
#[derive(Debug)]
pub struct InMemoryDatasetRepository {
    versions: RwLock<Vec<DatasetVersion>>,
    runs: Arc<InMemoryRunRepository>,
}

impl InMemoryDatasetRepository {
    pub fn new(runs: Arc<InMemoryRunRepository>) -> Self {
        Self {
            versions: RwLock::new(Vec::new()),
            runs,
        }
    }

    fn ensure_unique(versions: &[DatasetVersion], version: &NewDatasetVersion) -> DiscoveryResult<()> {
        if versions.iter().any(|v| {
            v.data_source_id == version.data_source_id && v.version == version.version
        }) {
            return Err(DiscoveryError::validation_error(format!(
                "数据源 {} 的数据集版本 {} 已存在",
                version.data_source_id, version.version
            )));
        }
        Ok(())
    }

    fn build(id: i64, version: &NewDatasetVersion) -> DatasetVersion {
        DatasetVersion {
            id,
            data_source_id: version.data_source_id.clone(),
            data_source_version: version.data_source_version,
            version: version.version,
            schema_snapshot: version.schema_snapshot.clone(),
            fingerprint: version.fingerprint.clone(),
            run_id: version.run_id,
            discovered_at: version.discovered_at,
        }
    }
}

#[async_trait]
impl DatasetRepository for InMemoryDatasetRepository {
    async fn append(&self, version: &NewDatasetVersion) -> DiscoveryResult<DatasetVersion> {
        let mut versions = self.versions.write().await;
        Self::ensure_unique(&versions, version)?;
        let created = Self::build(versions.len() as i64 + 1, version);
        versions.push(created.clone());
        Ok(created)
    }

    async fn append_completing_run(
        &self,
        version: &NewDatasetVersion,
        completed_at: DateTime<Utc>,
    ) -> DiscoveryResult<Option<DatasetVersion>> {
        let run_id = version
            .run_id
            .ok_or_else(|| DiscoveryError::validation_error("数据集版本缺少运行实例 ID"))?;

        let mut versions = self.versions.write().await;
        let mut table = self.runs.table.lock().await;
        let run = match table.runs.get_mut(&run_id) {
            Some(run) if run.state == RunState::Running => run,
            _ => return Ok(None),
        };
        Self::ensure_unique(&versions, version)?;

        let created = Self::build(versions.len() as i64 + 1, version);
        run.apply(&RunStateUpdate {
            to: RunState::Succeeded,
            at: completed_at,
            error: None,
            dataset_version_ids: vec![created.id],
        });
        versions.push(created.clone());
        Ok(Some(created))
    }

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<DatasetVersion>> {
        let versions = self.versions.read().await;
        Ok(versions.iter().find(|v| v.id == id).cloned())
    }

    async fn get_latest(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>> {
        let versions = self.versions.read().await;
        Ok(versions
            .iter()
            .filter(|v| v.data_source_id == data_source_id)
            .max_by_key(|v| v.version)
            .cloned())
    }

    async fn get_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>> {
        let versions = self.versions.read().await;
        let mut history: Vec<DatasetVersion> = versions
            .iter()
            .filter(|v| v.data_source_id == data_source_id)
            .cloned()
            .collect();
        history.sort_by_key(|v| v.version);
        Ok(history)
    }

    async fn references_source_version(
        &self,
        data_source_id: &str,
        data_source_version: i32,
    ) -> DiscoveryResult<bool> {
        let versions = self.versions.read().await;
        Ok(versions.iter().any(|v| {
            v.data_source_id == data_source_id && v.data_source_version == data_source_version
        }))
    }
}
