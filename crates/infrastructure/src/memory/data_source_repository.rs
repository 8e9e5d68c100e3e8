use std::collections::BTreeMap;

use async_trait::async_trait;
use discovery_domain::{
    entities::{DataSource, DataSourceFilter},
    repositories::DataSourceRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use tokio::sync::RwLock;

/// 键为 (id, version)
#[derive(Debug, Default)]
pub struct InMemoryDataSourceRepository {
    sources: RwLock<BTreeMap<(String, i32), DataSource>>,
}

impl InMemoryDataSourceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn latest_of<'a>(
    sources: &'a BTreeMap<(String, i32), DataSource>,
    id: &str,
) -> Option<&'a DataSource> {
    sources
        .range((id.to_string(), i32::MIN)..=(id.to_string(), i32::MAX))
        .next_back()
        .map(|(_, source)| source)
}

#[async_trait]
impl DataSourceRepository for InMemoryDataSourceRepository {
    async fn insert(&self, source: &DataSource) -> DiscoveryResult<DataSource> {
        let mut sources = self.sources.write().await;
        let key = (source.id.clone(), source.version);
        if sources.contains_key(&key) {
            return Err(DiscoveryError::validation_error(format!(
                "数据源 {} 版本 {} 已存在",
                source.id, source.version
            )));
        }
        sources.insert(key, source.clone());
        Ok(source.clone())
    }

    async fn replace(&self, source: &DataSource) -> DiscoveryResult<DataSource> {
        let mut sources = self.sources.write().await;
        match sources.get_mut(&(source.id.clone(), source.version)) {
            Some(existing) => {
                existing.name = source.name.clone();
                existing.connector_type = source.connector_type.clone();
                existing.connection_params = source.connection_params.clone();
                existing.enabled = source.enabled;
                Ok(existing.clone())
            }
            None => Err(DiscoveryError::data_source_not_found(&source.id)),
        }
    }

    async fn get_latest(&self, id: &str) -> DiscoveryResult<Option<DataSource>> {
        let sources = self.sources.read().await;
        Ok(latest_of(&sources, id).cloned())
    }

    async fn get_versions(&self, id: &str) -> DiscoveryResult<Vec<DataSource>> {
        let sources = self.sources.read().await;
        Ok(sources
            .range((id.to_string(), i32::MIN)..=(id.to_string(), i32::MAX))
            .map(|(_, source)| source.clone())
            .collect())
    }

    async fn list(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>> {
        let sources = self.sources.read().await;
        let mut latest: BTreeMap<&str, &DataSource> = BTreeMap::new();
        for ((id, _), source) in sources.iter() {
            // BTreeMap 按版本升序遍历，后写入的覆盖先前版本
            latest.insert(id.as_str(), source);
        }
        Ok(latest
            .into_values()
            .filter(|source| {
                filter
                    .connector_type
                    .as_ref()
                    .map_or(true, |t| &source.connector_type == t)
                    && filter.enabled.map_or(true, |e| source.enabled == e)
            })
            .cloned()
            .collect())
    }
}
