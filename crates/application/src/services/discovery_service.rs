use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use discovery_dispatcher::DiscoveryScheduler;
use discovery_domain::{
    connector::{CancellationNotifier, ConnectorRegistry},
    entities::{
        DataSource, DataSourceFilter, DataSourceSpec, DatasetVersion, JobDefinition,
        JobDefinitionFilter, JobDefinitionSpec, Run, RunFilter, RunState,
    },
    CatalogStore, JobDefinitionRegistry, RunStateTracker,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use discovery_infrastructure::{MetricsCollector, StructuredLogger};

use crate::interfaces::{CatalogService, JobService, RunService};

/// 数据发现服务门面
pub struct DiscoveryService {
    catalog: Arc<CatalogStore>,
    registry: Arc<JobDefinitionRegistry>,
    tracker: Arc<RunStateTracker>,
    connectors: ConnectorRegistry,
    scheduler: Arc<DiscoveryScheduler>,
    metrics: Arc<MetricsCollector>,
    /// 未启用执行器时为空，运行中实例的取消只经由心跳传达
    notifier: Option<Arc<dyn CancellationNotifier>>,
}

impl DiscoveryService {
    pub fn new(
        catalog: Arc<CatalogStore>,
        registry: Arc<JobDefinitionRegistry>,
        tracker: Arc<RunStateTracker>,
        connectors: ConnectorRegistry,
        scheduler: Arc<DiscoveryScheduler>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            catalog,
            registry,
            tracker,
            connectors,
            scheduler,
            metrics,
            notifier: None,
        }
    }

    pub fn with_cancellation_notifier(mut self, notifier: Arc<dyn CancellationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn ensure_connector(&self, connector_type: &str) -> DiscoveryResult<()> {
        if self.connectors.contains(connector_type).await {
            return Ok(());
        }
        Err(DiscoveryError::validation_error(format!(
            "未知的连接器类型 {connector_type}，可用类型: {}",
            self.connectors.connector_types().await.join(", ")
        )))
    }
}

#[async_trait]
impl CatalogService for DiscoveryService {
    async fn register_data_source(&self, spec: DataSourceSpec) -> DiscoveryResult<DataSource> {
        self.ensure_connector(&spec.connector_type).await?;
        self.catalog.register_source(spec).await
    }

    async fn update_data_source(&self, id: &str, spec: DataSourceSpec) -> DiscoveryResult<DataSource> {
        self.ensure_connector(&spec.connector_type).await?;
        self.catalog.update_source(id, spec).await
    }

    async fn get_data_source(&self, id: &str) -> DiscoveryResult<DataSource> {
        self.catalog.get_source(id).await
    }

    async fn list_data_sources(&self, filter: &DataSourceFilter) -> DiscoveryResult<Vec<DataSource>> {
        self.catalog.list_sources(filter).await
    }

    async fn get_latest_dataset(&self, data_source_id: &str) -> DiscoveryResult<Option<DatasetVersion>> {
        self.catalog.latest_version(data_source_id).await
    }

    async fn get_dataset_history(&self, data_source_id: &str) -> DiscoveryResult<Vec<DatasetVersion>> {
        self.catalog.history(data_source_id).await
    }
}

#[async_trait]
impl JobService for DiscoveryService {
    async fn submit_job_definition(&self, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition> {
        self.registry.create(spec).await
    }

    async fn update_job_definition(&self, id: &str, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition> {
        self.registry.update(id, spec).await
    }

    async fn get_job_definition(&self, id: &str) -> DiscoveryResult<JobDefinition> {
        self.registry.get(id).await
    }

    async fn list_job_definitions(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>> {
        self.registry.list(filter).await
    }

    async fn trigger_job(&self, job_id: &str) -> DiscoveryResult<Run> {
        let job = self.registry.get(job_id).await?;
        let now = Utc::now();
        let run = self.tracker.enqueue(&job, now, now).await?;
        StructuredLogger::log_run_enqueued(run.id, &job.id, now, true);
        self.metrics.record_run_enqueued();

        if !self.scheduler.dispatch(&run).await? {
            return Err(DiscoveryError::Queue(format!(
                "运行实例 {} 无法放入调度队列",
                run.id
            )));
        }
        info!("手动触发作业 {}，运行实例 {}", job.id, run.id);
        Ok(run)
    }
}

#[async_trait]
impl RunService for DiscoveryService {
    async fn get_run(&self, run_id: i64) -> DiscoveryResult<Run> {
        self.tracker.get_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>> {
        self.tracker.list_runs(filter).await
    }

    async fn cancel_run(&self, run_id: i64) -> DiscoveryResult<Run> {
        let run = self.tracker.cancel(run_id, Utc::now()).await?;
        StructuredLogger::log_cancel_requested(run.id, run.state.as_str());

        if run.state == RunState::Cancelled {
            StructuredLogger::log_run_finished(run.id, &run.job_id, run.state.as_str(), None, None);
            self.metrics.record_run_finished(run.state.as_str(), None);
        } else if run.state == RunState::Running {
            let notified = match &self.notifier {
                Some(notifier) => notifier.notify_cancel(run.id).await,
                None => false,
            };
            if !notified {
                debug!("运行实例 {} 不在本进程执行，取消标记由心跳传达", run.id);
            }
        }
        Ok(run)
    }
}
