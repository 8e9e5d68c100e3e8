use async_trait::async_trait;

use discovery_domain::entities::{
    DataSource, DataSourceFilter, DataSourceSpec, DatasetVersion, JobDefinition,
    JobDefinitionFilter, JobDefinitionSpec, Run, RunFilter,
};
use discovery_errors::DiscoveryResult;

pub mod catalog_services {
    use super::*;

    #[async_trait]
    pub trait CatalogService: Send + Sync {
        async fn register_data_source(&self, spec: DataSourceSpec) -> DiscoveryResult<DataSource>;
        async fn update_data_source(&self, id: &str, spec: DataSourceSpec) -> DiscoveryResult<DataSource>;
        async fn get_data_source(&self, id: &str) -> DiscoveryResult<DataSource>;
        async fn list_data_sources(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>>;
        /// 数据源尚未产生任何版本时返回 None
        async fn get_latest_dataset(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>>;
        /// 按版本号升序
        async fn get_dataset_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>>;
    }
}

pub mod job_services {
    use super::*;

    #[async_trait]
    pub trait JobService: Send + Sync {
        async fn submit_job_definition(&self, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition>;
        async fn update_job_definition(&self, id: &str, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition>;
        async fn get_job_definition(&self, id: &str) -> DiscoveryResult<JobDefinition>;
        async fn list_job_definitions(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>>;
        /// 立即为作业创建一个运行实例，同样受单活动实例约束
        async fn trigger_job(&self, job_id: &str) -> DiscoveryResult<Run>;
    }
}

pub mod run_services {
    use super::*;

    #[async_trait]
    pub trait RunService: Send + Sync {
        async fn get_run(&self, run_id: i64) -> DiscoveryResult<Run>;
        async fn list_runs(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>>;
        /// 排队实例立即取消；运行中实例返回时仍为 RUNNING，并带有取消标记
        async fn cancel_run(&self, run_id: i64) -> DiscoveryResult<Run>;
    }
}

pub use catalog_services::CatalogService;
pub use job_services::JobService;
pub use run_services::RunService;
