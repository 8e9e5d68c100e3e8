//! Test helper utilities and a wired-up harness
//!
//! `TestHarness` assembles the domain services over either the in-memory
//! repositories or a throwaway SQLite database, so scheduler and executor tests
//! only add the component under test.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use discovery_domain::connector::{Connector, ConnectorRegistry};
use discovery_domain::entities::{DataSource, JobDefinition, Run, RunState};
use discovery_domain::queue::RunQueue;
use discovery_domain::repositories::{
    DataSourceRepository, DatasetRepository, JobDefinitionRepository, RunRepository,
};
use discovery_domain::{CatalogStore, JobDefinitionRegistry, RunStateTracker};
use discovery_errors::DiscoveryResult;
use discovery_infrastructure::{
    DatabaseManager, InMemoryDataSourceRepository, InMemoryDatasetRepository,
    InMemoryJobDefinitionRepository, InMemoryRunQueue, InMemoryRunRepository, MetricsCollector,
};
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Poll a condition until it holds or the timeout elapses
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }
}

/// Domain services wired over one set of repositories
pub struct TestHarness {
    pub sources: Arc<dyn DataSourceRepository>,
    pub jobs: Arc<dyn JobDefinitionRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub datasets: Arc<dyn DatasetRepository>,
    pub catalog: Arc<CatalogStore>,
    pub registry: Arc<JobDefinitionRegistry>,
    pub tracker: Arc<RunStateTracker>,
    pub queue: Arc<InMemoryRunQueue>,
    pub connectors: ConnectorRegistry,
    pub metrics: Arc<MetricsCollector>,
    database: Option<DatabaseManager>,
}

impl TestHarness {
    pub fn in_memory() -> Self {
        let runs = Arc::new(InMemoryRunRepository::new());
        Self::assemble(
            Arc::new(InMemoryDataSourceRepository::new()),
            Arc::new(InMemoryJobDefinitionRepository::new()),
            runs.clone(),
            Arc::new(InMemoryDatasetRepository::new(runs)),
            None,
        )
    }

    pub async fn sqlite() -> anyhow::Result<Self> {
        let manager = DatabaseManager::in_memory().await?;
        Ok(Self::assemble(
            manager.data_source_repository(),
            manager.job_definition_repository(),
            manager.run_repository(),
            manager.dataset_repository(),
            Some(manager),
        ))
    }

    /// Same services, but job definitions are read through `jobs`
    pub fn with_job_repository(mut self, jobs: Arc<dyn JobDefinitionRepository>) -> Self {
        self.registry = Arc::new(JobDefinitionRegistry::new(jobs.clone(), self.sources.clone()));
        self.jobs = jobs;
        self
    }

    /// Same services, but run state is read and written through `runs`
    pub fn with_run_repository(mut self, runs: Arc<dyn RunRepository>) -> Self {
        self.tracker = Arc::new(RunStateTracker::new(runs.clone()));
        self.runs = runs;
        self
    }

    /// Same services, but dataset versions are written through `datasets`
    pub fn with_dataset_repository(mut self, datasets: Arc<dyn DatasetRepository>) -> Self {
        self.catalog = Arc::new(CatalogStore::new(self.sources.clone(), datasets.clone()));
        self.datasets = datasets;
        self
    }

    fn assemble(
        sources: Arc<dyn DataSourceRepository>,
        jobs: Arc<dyn JobDefinitionRepository>,
        runs: Arc<dyn RunRepository>,
        datasets: Arc<dyn DatasetRepository>,
        database: Option<DatabaseManager>,
    ) -> Self {
        Self {
            catalog: Arc::new(CatalogStore::new(sources.clone(), datasets.clone())),
            registry: Arc::new(JobDefinitionRegistry::new(jobs.clone(), sources.clone())),
            tracker: Arc::new(RunStateTracker::new(runs.clone())),
            queue: Arc::new(InMemoryRunQueue::new(64)),
            connectors: ConnectorRegistry::new(),
            metrics: Arc::new(MetricsCollector::new()),
            sources,
            jobs,
            runs,
            datasets,
            database,
        }
    }

    pub fn run_queue(&self) -> Arc<dyn RunQueue> {
        self.queue.clone()
    }

    pub fn database(&self) -> Option<&DatabaseManager> {
        self.database.as_ref()
    }

    pub async fn register_connector(&self, connector: Arc<dyn Connector>) -> DiscoveryResult<()> {
        self.connectors.register(connector).await
    }

    pub async fn insert_source(&self, source: DataSource) -> DiscoveryResult<DataSource> {
        self.sources.insert(&source).await
    }

    /// Inserts the job directly so tests control `created_at`
    pub async fn insert_job(&self, job: JobDefinition) -> DiscoveryResult<JobDefinition> {
        self.jobs.create(&job).await
    }

    pub async fn run_state(&self, run_id: i64) -> DiscoveryResult<RunState> {
        Ok(self.tracker.get_run(run_id).await?.state)
    }

    /// Waits until the run reaches a terminal state and returns it
    pub async fn wait_for_terminal(&self, run_id: i64, timeout: Duration) -> Option<Run> {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(run) = self.tracker.get_run(run_id).await {
                if run.is_terminal() {
                    return Some(run);
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }
}
