use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use discovery_application::DiscoveryService;
use discovery_config::AppConfig;
use discovery_dispatcher::{BackoffPolicy, DiscoveryScheduler, StaleRunReaper, StaleRunReaperConfig};
use discovery_domain::{
    connector::{Connector, ConnectorRegistry},
    queue::RunQueue,
    repositories::{DataSourceRepository, DatasetRepository, JobDefinitionRepository, RunRepository},
    CatalogStore, JobDefinitionRegistry, RunStateTracker,
};
use discovery_infrastructure::{
    DatabaseManager, DatabaseOptions, InMemoryDataSourceRepository, InMemoryDatasetRepository,
    InMemoryJobDefinitionRepository, InMemoryRunQueue, InMemoryRunRepository, MetricsCollector,
};
use discovery_worker::{ExecutorPool, ExecutorPoolConfig, FileSystemConnector, StaticConnector};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

struct Repositories {
    sources: Arc<dyn DataSourceRepository>,
    jobs: Arc<dyn JobDefinitionRepository>,
    runs: Arc<dyn RunRepository>,
    datasets: Arc<dyn DatasetRepository>,
}

/// 主应用程序
///
/// 组装存储、领域服务、调度器、过期回收器和执行器池，并负责它们的启停。
pub struct Application {
    config: AppConfig,
    database: Option<DatabaseManager>,
    tracker: Arc<RunStateTracker>,
    queue: Arc<InMemoryRunQueue>,
    connectors: ConnectorRegistry,
    metrics: Arc<MetricsCollector>,
    scheduler: Arc<DiscoveryScheduler>,
    reaper: Arc<StaleRunReaper>,
    pool: Option<Arc<ExecutorPool>>,
    service: Arc<DiscoveryService>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化数据发现引擎");

        let (database, repos) = create_repositories(&config).await?;

        let catalog = Arc::new(CatalogStore::new(repos.sources.clone(), repos.datasets.clone()));
        let registry = Arc::new(JobDefinitionRegistry::new(repos.jobs.clone(), repos.sources.clone()));
        let tracker = Arc::new(RunStateTracker::new(repos.runs.clone()));
        let metrics = Arc::new(MetricsCollector::new());

        let connectors = ConnectorRegistry::new();
        register_builtin_connectors(&connectors, &config.executor.connectors).await?;

        let queue = Arc::new(InMemoryRunQueue::new(config.scheduler.queue_capacity));
        let run_queue: Arc<dyn RunQueue> = queue.clone();

        let scheduler = Arc::new(
            DiscoveryScheduler::new(
                repos.jobs.clone(),
                repos.sources.clone(),
                tracker.clone(),
                run_queue.clone(),
                metrics.clone(),
            )
            .with_poll_interval(config.scheduler.poll_interval())
            .with_backoff(BackoffPolicy::new(
                Duration::from_secs(config.scheduler.backoff_base_seconds),
                Duration::from_secs(config.scheduler.backoff_max_seconds),
                config.scheduler.backoff_jitter,
            )),
        );

        let reaper = Arc::new(StaleRunReaper::new(
            tracker.clone(),
            metrics.clone(),
            StaleRunReaperConfig {
                stale_threshold: config.scheduler.stale_run_threshold(),
                sweep_interval: config.scheduler.reaper_interval(),
            },
        ));

        let pool = config.executor.enabled.then(|| {
            Arc::new(ExecutorPool::new(
                tracker.clone(),
                catalog.clone(),
                registry.clone(),
                connectors.clone(),
                run_queue.clone(),
                metrics.clone(),
                ExecutorPoolConfig {
                    max_concurrency: config.executor.max_concurrency,
                    default_run_timeout: config.executor.default_run_timeout(),
                    cancel_grace: config.executor.cancel_grace(),
                    heartbeat_interval: config.executor.heartbeat_interval(),
                    ..Default::default()
                },
            ))
        });

        let mut service = DiscoveryService::new(
            catalog,
            registry,
            tracker.clone(),
            connectors.clone(),
            scheduler.clone(),
            metrics.clone(),
        );
        if let Some(pool) = &pool {
            service = service.with_cancellation_notifier(pool.clone());
        }

        Ok(Self {
            config,
            database,
            tracker,
            queue,
            connectors,
            metrics,
            scheduler,
            reaper,
            pool,
            service: Arc::new(service),
        })
    }

    pub fn service(&self) -> Arc<DiscoveryService> {
        Arc::clone(&self.service)
    }

    pub fn tracker(&self) -> Arc<RunStateTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动数据发现引擎");

        if let Some(pool) = &self.pool {
            pool.start().await;
            let recovered = self
                .scheduler
                .recover_queued_runs()
                .await
                .context("恢复排队中的运行实例失败")?;
            if recovered > 0 {
                info!("重新投递了 {} 个排队中的运行实例", recovered);
            }
        } else {
            warn!("执行器已禁用，运行实例只会排队不会执行");
        }

        let mut handles = Vec::new();
        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let scheduler_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                scheduler.run(scheduler_rx).await;
            }));
        } else {
            warn!("调度器已禁用，只能手动触发作业");
        }

        // 手动触发模式下也要回收孤儿实例
        let reaper = Arc::clone(&self.reaper);
        let reaper_rx = shutdown_rx.resubscribe();
        handles.push(tokio::spawn(async move {
            reaper.run(reaper_rx).await;
        }));

        let _ = shutdown_rx.recv().await;
        info!("数据发现引擎收到关闭信号");

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {}", e);
            }
        }

        if let Some(pool) = &self.pool {
            pool.shutdown(self.config.executor.cancel_grace()).await;
        }
        self.queue.close().await;
        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("数据发现引擎已停止");
        Ok(())
    }
}

async fn create_repositories(config: &AppConfig) -> Result<(Option<DatabaseManager>, Repositories)> {
    if config.database.is_memory() {
        info!("使用进程内存储，数据不会持久化");
        let runs = Arc::new(InMemoryRunRepository::new());
        return Ok((
            None,
            Repositories {
                sources: Arc::new(InMemoryDataSourceRepository::new()),
                jobs: Arc::new(InMemoryJobDefinitionRepository::new()),
                datasets: Arc::new(InMemoryDatasetRepository::new(runs.clone())),
                runs,
            },
        ));
    }

    let options = DatabaseOptions {
        url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        min_connections: config.database.min_connections,
        connection_timeout: Duration::from_secs(config.database.connection_timeout_seconds),
        idle_timeout: Duration::from_secs(config.database.idle_timeout_seconds),
    };
    let manager = DatabaseManager::new(&options)
        .await
        .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
    let repos = Repositories {
        sources: manager.data_source_repository(),
        jobs: manager.job_definition_repository(),
        runs: manager.run_repository(),
        datasets: manager.dataset_repository(),
    };
    Ok((Some(manager), repos))
}

/// 按配置注册内置连接器
async fn register_builtin_connectors(registry: &ConnectorRegistry, types: &[String]) -> Result<()> {
    for connector_type in types {
        let connector: Arc<dyn Connector> = match connector_type.as_str() {
            FileSystemConnector::CONNECTOR_TYPE => Arc::new(FileSystemConnector::new()),
            StaticConnector::CONNECTOR_TYPE => Arc::new(StaticConnector::new()),
            other => return Err(anyhow::anyhow!("未知的内置连接器: {other}")),
        };
        registry
            .register(connector)
            .await
            .with_context(|| format!("注册连接器 {connector_type} 失败"))?;
        info!("注册连接器: {}", connector_type);
    }
    Ok(())
}
