use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use discovery_errors::{DiscoveryError, DiscoveryResult};

use crate::entities::DataSource;
use crate::fingerprint::fingerprint;

/// 一次发现调用的输入
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub run_id: i64,
    pub job_id: String,
    pub data_source: DataSource,
    pub parameters: serde_json::Value,
    /// 取消请求到达时被触发，连接器应尽快返回
    pub cancellation: CancellationToken,
}

impl DiscoveryRequest {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// 连接器返回的快照与指纹
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryOutcome {
    pub schema_snapshot: serde_json::Value,
    pub fingerprint: String,
}

impl DiscoveryOutcome {
    /// 使用默认的规范化 SHA-256 指纹
    pub fn from_snapshot(schema_snapshot: serde_json::Value) -> Self {
        let fingerprint = fingerprint(&schema_snapshot);
        Self {
            schema_snapshot,
            fingerprint,
        }
    }
}

/// 数据源连接器插件
///
/// 连接器失败以 `ConnectorError` 返回，执行器只记录详情，不会因此退出。
#[async_trait]
pub trait Connector: Send + Sync {
    /// 连接器类型，与 `DataSource::connector_type` 匹配
    fn connector_type(&self) -> &str;

    async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryResult<DiscoveryOutcome>;
}

/// 按连接器类型查找连接器的注册表
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: Arc<RwLock<HashMap<String, Arc<dyn Connector>>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connector: Arc<dyn Connector>) -> DiscoveryResult<()> {
        let connector_type = connector.connector_type().to_string();
        if connector_type.trim().is_empty() {
            return Err(DiscoveryError::validation_error("连接器类型不能为空"));
        }
        let mut connectors = self.connectors.write().await;
        connectors.insert(connector_type, connector);
        Ok(())
    }

    pub async fn get(&self, connector_type: &str) -> Option<Arc<dyn Connector>> {
        let connectors = self.connectors.read().await;
        connectors.get(connector_type).cloned()
    }

    pub async fn contains(&self, connector_type: &str) -> bool {
        let connectors = self.connectors.read().await;
        connectors.contains_key(connector_type)
    }

    pub async fn connector_types(&self) -> Vec<String> {
        let connectors = self.connectors.read().await;
        let mut types: Vec<String> = connectors.keys().cloned().collect();
        types.sort();
        types
    }
}

/// 将取消请求通知给正在执行该运行实例的进程内执行器
#[async_trait]
pub trait CancellationNotifier: Send + Sync {
    /// 找到对应执行中的运行实例时返回 true
    async fn notify_cancel(&self, run_id: i64) -> bool;
}
