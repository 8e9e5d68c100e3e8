use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use discovery_domain::{
    connector::{CancellationNotifier, Connector, ConnectorRegistry, DiscoveryOutcome, DiscoveryRequest},
    entities::{DataSource, JobDefinition, Run, RunErrorDetail, RunErrorKind, RunState},
    queue::{QueuedRun, RunQueue},
    CatalogStore, JobDefinitionRegistry, RunStateTracker, RunVersionOutcome, TransitionDetail,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use discovery_infrastructure::{MetricsCollector, StructuredLogger};

/// 执行器池配置
#[derive(Debug, Clone)]
pub struct ExecutorPoolConfig {
    /// 同时执行的运行实例上限
    pub max_concurrency: usize,
    /// 作业未设置超时时使用
    pub default_run_timeout: Duration,
    /// 取消请求发出后等待连接器返回的时长
    pub cancel_grace: Duration,
    pub heartbeat_interval: Duration,
    /// 领取遇到可重试错误时重新入队前的等待
    pub claim_retry_delay: Duration,
}

impl Default for ExecutorPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_run_timeout: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            claim_retry_delay: Duration::from_secs(1),
        }
    }
}

/// 一次连接器调用的结局
enum DriveResult {
    Discovered(DiscoveryOutcome),
    ConnectorFailed(DiscoveryError),
    Cancelled,
    CancelUnacknowledged,
    TimedOut(Duration),
}

/// 目录写入之后的去向
enum Recorded {
    /// 版本已追加，实例已转为 SUCCEEDED
    Completed,
    /// 实例已被回收或已结束
    Superseded,
    /// 仍需把实例从 RUNNING 转到给定状态
    Pending(RunState, TransitionDetail),
}

/// 执行器池
///
/// 固定数量的工作协程从运行队列领取条目，以 QUEUED→RUNNING 的 CAS 认领实例，
/// 调用连接器并把结果写入目录。执行期间定期写心跳，同时检查取消标记。
pub struct ExecutorPool {
    tracker: Arc<RunStateTracker>,
    catalog: Arc<CatalogStore>,
    registry: Arc<JobDefinitionRegistry>,
    connectors: ConnectorRegistry,
    queue: Arc<dyn RunQueue>,
    metrics: Arc<MetricsCollector>,
    config: ExecutorPoolConfig,
    /// 执行中的实例及其取消令牌
    running: RwLock<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorPool {
    pub fn new(
        tracker: Arc<RunStateTracker>,
        catalog: Arc<CatalogStore>,
        registry: Arc<JobDefinitionRegistry>,
        connectors: ConnectorRegistry,
        queue: Arc<dyn RunQueue>,
        metrics: Arc<MetricsCollector>,
        config: ExecutorPoolConfig,
    ) -> Self {
        Self {
            tracker,
            catalog,
            registry,
            connectors,
            queue,
            metrics,
            config,
            running: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ExecutorPoolConfig {
        &self.config
    }

    /// 启动工作协程，重复调用无效
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("执行器池已经启动");
            return;
        }

        let workers = self.config.max_concurrency.max(1);
        info!("启动执行器池，并发上限 {}", workers);
        for worker_index in 0..workers {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_index).await;
            }));
        }
    }

    async fn worker_loop(&self, worker_index: usize) {
        debug!("执行器工作协程 {} 已启动", worker_index);

        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = self.queue.pop() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match self.process(item.clone()).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!("领取运行实例 {} 失败，稍后重试: {}", item.run_id, e);
                    tokio::select! {
                        _ = sleep(self.config.claim_retry_delay) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    if let Err(e) = self.queue.push(item.clone()).await {
                        error!("运行实例 {} 重新入队失败: {}", item.run_id, e);
                    }
                }
                Err(e) => error!("处理运行实例 {} 失败: {}", item.run_id, e),
            }
        }

        debug!("执行器工作协程 {} 已退出", worker_index);
    }

    /// 认领并执行一个排队条目
    ///
    /// 条目对应的实例已不在 QUEUED（重复投递、已取消或已被其他执行器领取）时返回 `Ok(None)`。
    pub async fn process(&self, item: QueuedRun) -> DiscoveryResult<Option<Run>> {
        let run = match self
            .tracker
            .transition(item.run_id, RunState::Queued, RunState::Running, TransitionDetail::default())
            .await
        {
            Ok(run) => run,
            Err(e) if e.is_invalid_transition() || e.is_not_found() => {
                debug!("运行实例 {} 无需领取: {}", item.run_id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let span = info_span!("discovery_run", run_id = run.id, job_id = %run.job_id);
        self.execute_claimed(run).instrument(span).await.map(Some)
    }

    async fn execute_claimed(&self, run: Run) -> DiscoveryResult<Run> {
        let started = Instant::now();
        let (job, source, connector) = match self.prepare(&run).await {
            Ok(prepared) => prepared,
            Err(detail) => {
                warn!("运行实例 {} 无法执行: {}", run.id, detail);
                return self
                    .finish(&run, started, RunState::Failed, TransitionDetail::error(detail))
                    .await;
            }
        };

        StructuredLogger::log_run_claimed(run.id, &run.job_id, &source.connector_type);

        let token = CancellationToken::new();
        let active = {
            let mut running = self.running.write().await;
            running.insert(run.id, token.clone());
            running.len()
        };
        self.metrics.update_active_runs(active);

        let result = self.drive(&run, &job, source, connector, token).await;

        let active = {
            let mut running = self.running.write().await;
            running.remove(&run.id);
            running.len()
        };
        self.metrics.update_active_runs(active);

        let (to, detail) = match result {
            DriveResult::Discovered(outcome) => match self.record_outcome(&run, outcome).await {
                Recorded::Completed => {
                    let finished = self.tracker.get_run(run.id).await?;
                    self.report_finished(&finished, started, None);
                    return Ok(finished);
                }
                Recorded::Superseded => {
                    return self.superseded(&run, "实例在写入目录前已离开运行状态").await
                }
                Recorded::Pending(to, detail) => (to, detail),
            },
            DriveResult::ConnectorFailed(e) => (
                RunState::Failed,
                TransitionDetail::error(RunErrorDetail::new(RunErrorKind::Connector, e.to_string())),
            ),
            DriveResult::Cancelled => (RunState::Cancelled, TransitionDetail::default()),
            DriveResult::CancelUnacknowledged => (
                RunState::Failed,
                TransitionDetail::error(RunErrorDetail::new(
                    RunErrorKind::CancelUnacknowledged,
                    format!("连接器在 {:?} 宽限期内未响应取消", self.config.cancel_grace),
                )),
            ),
            DriveResult::TimedOut(timeout) => (
                RunState::Failed,
                TransitionDetail::error(RunErrorDetail::new(
                    RunErrorKind::Timeout,
                    format!("发现超时 ({}s)", timeout.as_secs()),
                )),
            ),
        };

        self.finish(&run, started, to, detail).await
    }

    /// 解析作业、数据源和连接器；任何一项不可用都作为配置错误记录在实例上
    async fn prepare(
        &self,
        run: &Run,
    ) -> Result<(JobDefinition, DataSource, Arc<dyn Connector>), RunErrorDetail> {
        let job = self.registry.get(&run.job_id).await.map_err(|e| {
            if e.is_not_found() {
                RunErrorDetail::new(RunErrorKind::Configuration, e.to_string())
            } else {
                RunErrorDetail::new(RunErrorKind::Internal, format!("读取作业定义失败: {e}"))
            }
        })?;

        let source = self.catalog.get_source(&run.data_source_id).await.map_err(|e| {
            if e.is_not_found() {
                RunErrorDetail::new(RunErrorKind::Configuration, e.to_string())
            } else {
                RunErrorDetail::new(RunErrorKind::Internal, format!("读取数据源失败: {e}"))
            }
        })?;
        if !source.enabled {
            return Err(RunErrorDetail::new(
                RunErrorKind::Configuration,
                format!("数据源 {} 已禁用", source.id),
            ));
        }

        let connector = self.connectors.get(&source.connector_type).await.ok_or_else(|| {
            RunErrorDetail::new(
                RunErrorKind::Configuration,
                format!("连接器 {} 未注册", source.connector_type),
            )
        })?;

        Ok((job, source, connector))
    }

    async fn drive(
        &self,
        run: &Run,
        job: &JobDefinition,
        source: DataSource,
        connector: Arc<dyn Connector>,
        token: CancellationToken,
    ) -> DriveResult {
        let timeout = job
            .timeout_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.config.default_run_timeout);

        let request = DiscoveryRequest {
            run_id: run.id,
            job_id: run.job_id.clone(),
            data_source: source,
            parameters: job.parameters.clone(),
            cancellation: token.clone(),
        };

        let discover = connector.discover(&request);
        tokio::pin!(discover);
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let grace = sleep(self.config.cancel_grace);
        tokio::pin!(grace);
        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut cancel_seen = false;

        loop {
            tokio::select! {
                biased;
                result = &mut discover => {
                    return match result {
                        _ if cancel_seen => {
                            info!("运行实例 {} 的连接器已响应取消，丢弃结果", run.id);
                            DriveResult::Cancelled
                        }
                        Ok(outcome) => DriveResult::Discovered(outcome),
                        Err(e) => {
                            warn!("运行实例 {} 连接器失败: {}", run.id, e);
                            DriveResult::ConnectorFailed(e)
                        }
                    };
                }
                _ = &mut deadline => {
                    warn!("运行实例 {} 超过超时时间 {:?}", run.id, timeout);
                    token.cancel();
                    return DriveResult::TimedOut(timeout);
                }
                _ = &mut grace, if cancel_seen => {
                    warn!("运行实例 {} 的连接器未在宽限期内响应取消", run.id);
                    return DriveResult::CancelUnacknowledged;
                }
                _ = token.cancelled(), if !cancel_seen => {
                    info!("运行实例 {} 收到取消请求", run.id);
                    cancel_seen = true;
                    grace.as_mut().reset(Instant::now() + self.config.cancel_grace);
                }
                _ = heartbeat.tick() => {
                    if self.beat(run.id).await {
                        token.cancel();
                    }
                }
            }
        }
    }

    /// 写入心跳并检查取消标记，需要停止执行时返回 true
    async fn beat(&self, run_id: i64) -> bool {
        match self.tracker.heartbeat(run_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("运行实例 {} 已不在运行状态，停止执行", run_id);
                return true;
            }
            Err(e) => {
                warn!("运行实例 {} 心跳写入失败: {}", run_id, e);
                return false;
            }
        }

        match self.tracker.get_run(run_id).await {
            Ok(run) => run.cancel_requested,
            Err(e) => {
                warn!("读取运行实例 {} 失败: {}", run_id, e);
                false
            }
        }
    }

    /// 把快照写入目录，指纹未变化时不产生新版本
    async fn record_outcome(&self, run: &Run, outcome: DiscoveryOutcome) -> Recorded {
        match self
            .catalog
            .complete_run_with_version(
                run.id,
                &run.data_source_id,
                outcome.schema_snapshot,
                &outcome.fingerprint,
            )
            .await
        {
            Ok(RunVersionOutcome::Completed(version)) => {
                StructuredLogger::log_dataset_version_created(
                    &version.data_source_id,
                    version.version,
                    version.id,
                    run.id,
                );
                self.metrics.record_dataset_version_created();
                Recorded::Completed
            }
            Ok(RunVersionOutcome::Unchanged(latest)) => {
                debug!(
                    "运行实例 {} 的指纹与版本 {} 相同",
                    run.id, latest.version
                );
                Recorded::Pending(RunState::Succeeded, TransitionDetail::default())
            }
            Ok(RunVersionOutcome::RunNotRunning) => Recorded::Superseded,
            Err(e) => {
                error!("运行实例 {} 写入目录失败: {}", run.id, e);
                Recorded::Pending(
                    RunState::Failed,
                    TransitionDetail::error(RunErrorDetail::new(
                        RunErrorKind::Internal,
                        format!("写入目录失败: {e}"),
                    )),
                )
            }
        }
    }

    async fn finish(
        &self,
        run: &Run,
        started: Instant,
        to: RunState,
        detail: TransitionDetail,
    ) -> DiscoveryResult<Run> {
        let error_message = detail.error.as_ref().map(|e| e.to_string());
        match self
            .tracker
            .transition(run.id, RunState::Running, to, detail)
            .await
        {
            Ok(finished) => {
                self.report_finished(&finished, started, error_message.as_deref());
                Ok(finished)
            }
            // 执行期间实例被回收，结果作废
            Err(e) if e.is_invalid_transition() => self.superseded(run, &e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    fn report_finished(&self, finished: &Run, started: Instant, error_message: Option<&str>) {
        StructuredLogger::log_run_finished(
            finished.id,
            &finished.job_id,
            finished.state.as_str(),
            finished.execution_duration_ms(),
            error_message,
        );
        self.metrics.record_run_finished(
            finished.state.as_str(),
            Some(started.elapsed().as_secs_f64()),
        );
    }

    async fn superseded(&self, run: &Run, detail: &str) -> DiscoveryResult<Run> {
        let stale = DiscoveryError::StaleRunError {
            run_id: run.id,
            detail: detail.to_string(),
        };
        warn!("{}", stale);
        self.tracker.get_run(run.id).await
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn is_running(&self, run_id: i64) -> bool {
        self.running.read().await.contains_key(&run_id)
    }

    /// 停止领取新条目，等待执行中的实例在超时内结束，超时后中止剩余协程
    ///
    /// 被中止的实例保持 RUNNING，由过期回收器处理。
    pub async fn shutdown(&self, timeout: Duration) {
        info!("执行器池开始关闭");
        self.shutdown.cancel();

        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("执行器工作协程异常退出: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("执行器池在 {:?} 内未能结束，中止剩余工作协程", timeout);
            for handle in &handles {
                handle.abort();
            }
        }
        info!("执行器池已关闭");
    }
}

#[async_trait]
impl CancellationNotifier for ExecutorPool {
    async fn notify_cancel(&self, run_id: i64) -> bool {
        let running = self.running.read().await;
        match running.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
