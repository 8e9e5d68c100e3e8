use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn, Instrument};

use discovery_domain::{
    due_fire_time, fire_anchor,
    entities::{JobDefinition, JobDefinitionFilter, Run, RunErrorDetail, RunErrorKind, RunState},
    queue::{QueuedRun, RunQueue},
    repositories::{DataSourceRepository, JobDefinitionRepository},
    RunStateTracker, ScheduleExpression, TransitionDetail,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use discovery_infrastructure::{MetricsCollector, StructuredLogger};

use crate::backoff::BackoffPolicy;

/// 一个调度周期的结果
#[derive(Debug, Default)]
pub struct CycleReport {
    pub enqueued: Vec<Run>,
    pub skipped: usize,
}

/// 到期作业：触发时间与作业定义
struct DueJob {
    fire_time: DateTime<Utc>,
    job: JobDefinition,
}

/// 发现作业调度器
///
/// 单一逻辑循环：按轮询间隔扫描启用的作业，为到期且没有活动实例的作业创建 QUEUED
/// 运行实例并放入调度队列。持久化不可用时按退避策略重试整个周期。
pub struct DiscoveryScheduler {
    job_repo: Arc<dyn JobDefinitionRepository>,
    source_repo: Arc<dyn DataSourceRepository>,
    tracker: Arc<RunStateTracker>,
    queue: Arc<dyn RunQueue>,
    metrics: Arc<MetricsCollector>,
    poll_interval: Duration,
    backoff: BackoffPolicy,
    /// 入队失败且未能标记为 FAILED 的实例，下个周期重新投递
    undelivered: Mutex<Vec<Run>>,
}

impl DiscoveryScheduler {
    pub fn new(
        job_repo: Arc<dyn JobDefinitionRepository>,
        source_repo: Arc<dyn DataSourceRepository>,
        tracker: Arc<RunStateTracker>,
        queue: Arc<dyn RunQueue>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            job_repo,
            source_repo,
            tracker,
            queue,
            metrics,
            poll_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            undelivered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// 执行一次调度周期
    ///
    /// 单个作业的错误只记录日志；可重试的持久化错误中止本周期并返回给调用方。
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> DiscoveryResult<CycleReport> {
        let span = tracing::info_span!("scheduler_cycle", now = %now);
        self.scan_and_enqueue(now).instrument(span).await
    }

    async fn scan_and_enqueue(&self, now: DateTime<Utc>) -> DiscoveryResult<CycleReport> {
        let start_time = Instant::now();
        let mut report = CycleReport::default();
        report.enqueued.extend(self.redeliver().await?);

        let jobs = self.job_repo.list(&JobDefinitionFilter::enabled_only()).await?;
        let mut due = Vec::new();

        for job in jobs {
            match self.evaluate_job(&job, now).await {
                Ok(Some(fire_time)) => due.push(DueJob { fire_time, job }),
                Ok(None) => report.skipped += 1,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("评估{}失败: {}", job.entity_description(), e);
                    report.skipped += 1;
                }
            }
        }

        // 最早到期的作业优先
        due.sort_by(|a, b| {
            a.fire_time
                .cmp(&b.fire_time)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });

        for DueJob { fire_time, job } in due {
            match self.tracker.enqueue(&job, fire_time, now).await {
                Ok(run) => {
                    StructuredLogger::log_run_enqueued(run.id, &job.id, fire_time, false);
                    self.metrics.record_run_enqueued();
                    if self.dispatch(&run).await? {
                        report.enqueued.push(run);
                    }
                }
                Err(DiscoveryError::ActiveRunExists { .. }) => {
                    StructuredLogger::log_job_skipped(&job.id, "active_run");
                    report.skipped += 1;
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("为{}创建运行实例失败: {}", job.entity_description(), e);
                    report.skipped += 1;
                }
            }
        }

        self.metrics.update_queue_depth(self.queue.len().await);
        self.metrics
            .record_scheduler_cycle(start_time.elapsed().as_secs_f64());

        if !report.enqueued.is_empty() {
            info!("本次调度完成，共创建 {} 个运行实例", report.enqueued.len());
        } else {
            debug!("本次调度没有到期的作业");
        }
        Ok(report)
    }

    /// 判断作业在 `now` 是否到期，到期时返回合并后的触发时间
    async fn evaluate_job(
        &self,
        job: &JobDefinition,
        now: DateTime<Utc>,
    ) -> DiscoveryResult<Option<DateTime<Utc>>> {
        let schedule = match ScheduleExpression::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("{}的调度表达式无效，跳过: {}", job.entity_description(), e);
                StructuredLogger::log_job_skipped(&job.id, "invalid_schedule");
                return Ok(None);
            }
        };

        match self.source_repo.get_latest(&job.data_source_id).await? {
            Some(source) if source.enabled => {}
            Some(_) => {
                StructuredLogger::log_job_skipped(&job.id, "data_source_disabled");
                return Ok(None);
            }
            None => {
                warn!("{}引用的数据源不存在", job.entity_description());
                StructuredLogger::log_job_skipped(&job.id, "data_source_missing");
                return Ok(None);
            }
        }

        if self.tracker.active_run(&job.id).await?.is_some() {
            StructuredLogger::log_job_skipped(&job.id, "active_run");
            return Ok(None);
        }

        let last_terminal = self.tracker.last_terminal_run(&job.id).await?;
        let anchor = fire_anchor(job, last_terminal.as_ref());
        Ok(due_fire_time(&schedule, anchor, now))
    }

    /// 将运行实例放入调度队列
    ///
    /// 入队失败时实例被标记为 FAILED 并返回 false，不会永久占用作业的活动名额。
    pub async fn dispatch(&self, run: &Run) -> DiscoveryResult<bool> {
        let item = QueuedRun {
            run_id: run.id,
            job_id: run.job_id.clone(),
            scheduled_for: run.scheduled_for,
        };
        let Err(e) = self.queue.push(item).await else {
            return Ok(true);
        };

        error!("运行实例 {} 入队失败: {}", run.id, e);
        let detail = RunErrorDetail::new(RunErrorKind::Internal, format!("无法放入调度队列: {e}"));
        match self
            .tracker
            .transition(
                run.id,
                RunState::Queued,
                RunState::Failed,
                TransitionDetail::error(detail.clone()),
            )
            .await
        {
            Ok(failed) => {
                StructuredLogger::log_run_finished(
                    failed.id,
                    &failed.job_id,
                    failed.state.as_str(),
                    None,
                    Some(&detail.message),
                );
                self.metrics.record_run_finished(failed.state.as_str(), None);
                Ok(false)
            }
            Err(e) if e.is_invalid_transition() => Ok(false),
            Err(e) => {
                warn!("运行实例 {} 无法标记为失败，下个周期重新投递", run.id);
                self.undelivered.lock().await.push(run.clone());
                Err(e)
            }
        }
    }

    /// 重新投递上个周期遗留的实例，已离开 QUEUED 的直接丢弃
    async fn redeliver(&self) -> DiscoveryResult<Vec<Run>> {
        let pending = std::mem::take(&mut *self.undelivered.lock().await);
        let mut delivered = Vec::new();
        let mut remaining = pending.into_iter();

        while let Some(run) = remaining.next() {
            let result = match self.tracker.get_run(run.id).await {
                Ok(current) if current.state == RunState::Queued => {
                    self.dispatch(&current).await.map(|ok| ok.then_some(current))
                }
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => {
                    self.undelivered.lock().await.push(run);
                    Err(e)
                }
            };
            match result {
                Ok(Some(run)) => {
                    info!("重新投递运行实例 {}", run.id);
                    delivered.push(run);
                }
                Ok(None) => {}
                Err(e) => {
                    self.undelivered.lock().await.extend(remaining);
                    return Err(e);
                }
            }
        }
        Ok(delivered)
    }

    /// 启动时把持久化为 QUEUED 的实例重新放入队列
    ///
    /// 这些实例的连接器从未启动过，重新投递不构成重复执行。
    pub async fn recover_queued_runs(&self) -> DiscoveryResult<usize> {
        let queued = self.tracker.runs_in_state(RunState::Queued).await?;
        if queued.is_empty() {
            return Ok(0);
        }

        info!("恢复 {} 个排队中的运行实例", queued.len());
        let mut recovered = 0;
        for run in &queued {
            if self.dispatch(run).await? {
                recovered += 1;
            }
        }
        self.metrics.update_queue_depth(self.queue.len().await);
        Ok(recovered)
    }

    /// 调度主循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("调度器启动，轮询间隔 {:?}", self.poll_interval);
        let mut consecutive_failures: u32 = 0;

        loop {
            let wait = match self.run_cycle(Utc::now()).await {
                Ok(_) => {
                    if consecutive_failures > 0 {
                        info!("调度周期在 {} 次失败后恢复", consecutive_failures);
                    }
                    consecutive_failures = 0;
                    self.poll_interval
                }
                Err(e) if e.is_retryable() => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.backoff.delay(consecutive_failures);
                    StructuredLogger::log_scheduler_cycle_failed(
                        &e.to_string(),
                        consecutive_failures,
                        delay.as_millis() as u64,
                    );
                    self.metrics.record_scheduler_failure(e.kind());
                    delay
                }
                Err(e) => {
                    error!("调度周期失败: {}", e);
                    self.metrics.record_scheduler_failure(e.kind());
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => {
                    info!("调度器循环收到关闭信号");
                    break;
                }
            }
        }
    }
}
