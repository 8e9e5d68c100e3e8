//! 数据仓储层接口定义
//!
//! 持久层只需要提供：按主键读写、针对运行状态的比较并交换（CAS）更新，
//! 以及按时间范围查询。SQLite 与内存两种实现位于 infrastructure crate。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_errors::DiscoveryResult;

use crate::entities::{
    DataSource, DataSourceFilter, DatasetVersion, JobDefinition, JobDefinitionFilter,
    NewDatasetVersion, Run, RunFilter, RunState, RunStateUpdate,
};

/// 数据源仓储接口
///
/// 每个数据源以 (id, version) 为键保存所有版本，读取默认返回最新版本。
#[async_trait]
pub trait DataSourceRepository: Send + Sync {
    /// 插入一个新版本；(id, version) 已存在时返回 `ValidationError`
    async fn insert(&self, source: &DataSource) -> DiscoveryResult<DataSource>;

    /// 原地替换尚未被任何数据集引用的版本
    async fn replace(&self, source: &DataSource) -> DiscoveryResult<DataSource>;

    /// 获取最新版本
    async fn get_latest(&self, id: &str) -> DiscoveryResult<Option<DataSource>>;

    /// 获取所有版本，按版本号升序
    async fn get_versions(&self, id: &str) -> DiscoveryResult<Vec<DataSource>>;

    /// 列出各数据源的最新版本
    async fn list(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>>;
}

/// 作业定义仓储接口
#[async_trait]
pub trait JobDefinitionRepository: Send + Sync {
    /// ID 已存在时返回 `ValidationError`
    async fn create(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition>;

    /// ID 不存在时返回 `NotFound`
    async fn update(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition>;

    async fn get_by_id(&self, id: &str) -> DiscoveryResult<Option<JobDefinition>>;

    async fn list(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>>;
}

/// 运行实例仓储接口
///
/// 所有状态变更都经过 `compare_and_set`，这是调度器、执行器与取消请求之间
/// 唯一的并发协调点。
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// 原子地创建排队实例；同一作业已有 QUEUED/RUNNING 实例时返回 `ActiveRunExists`
    async fn create_queued(&self, run: &Run) -> DiscoveryResult<Run>;

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<Run>>;

    /// 按入队时间倒序返回
    async fn list(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>>;

    /// 当前状态等于 `from` 时应用更新并返回 true，否则不做任何修改并返回 false
    async fn compare_and_set(
        &self,
        id: i64,
        from: RunState,
        update: &RunStateUpdate,
    ) -> DiscoveryResult<bool>;

    /// 作业当前处于 QUEUED/RUNNING 的实例
    async fn get_active_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>>;

    /// 作业最近结束的终态实例（按结束时间）
    async fn get_last_terminal_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>>;

    /// 按入队时间升序返回指定状态的实例
    async fn get_by_state(&self, state: RunState) -> DiscoveryResult<Vec<Run>>;

    /// 仅对 RUNNING 实例刷新心跳
    async fn record_heartbeat(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<bool>;

    /// 仅对 RUNNING 实例设置协作式取消标记
    async fn request_cancel(&self, id: i64) -> DiscoveryResult<bool>;
}

/// 数据集版本仓储接口，只追加
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// (data_source_id, version) 已存在时返回 `ValidationError`
    async fn append(&self, version: &NewDatasetVersion) -> DiscoveryResult<DatasetVersion>;

    /// 在同一事务中追加版本并把 `version.run_id` 对应的实例从 RUNNING 转为 SUCCEEDED
    ///
    /// 实例已不在 RUNNING 时不写入任何内容并返回 `None`。
    async fn append_completing_run(
        &self,
        version: &NewDatasetVersion,
        completed_at: DateTime<Utc>,
    ) -> DiscoveryResult<Option<DatasetVersion>>;

    async fn get_by_id(&self, id: i64) -> DiscoveryResult<Option<DatasetVersion>>;

    async fn get_latest(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>>;

    /// 按版本号升序
    async fn get_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>>;

    /// 数据源的某个版本是否已被数据集引用
    async fn references_source_version(
        &self,
        data_source_id: &str,
        data_source_version: i32,
    ) -> DiscoveryResult<bool>;
}
