use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use discovery_domain::{
    entities::{Run, RunErrorDetail, RunState},
    RunStateTracker, TransitionDetail,
};
use discovery_errors::DiscoveryResult;
use discovery_infrastructure::{MetricsCollector, StructuredLogger};

/// 过期运行实例回收配置
#[derive(Debug, Clone)]
pub struct StaleRunReaperConfig {
    /// 超过该时长没有存活证明的 RUNNING 实例视为孤儿
    pub stale_threshold: Duration,
    /// 扫描间隔
    pub sweep_interval: Duration,
}

impl Default for StaleRunReaperConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(900), // 15分钟
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// 过期运行实例回收器
///
/// 周期性扫描 RUNNING 实例，把心跳停止超过阈值的实例标记为 FAILED "stale/orphaned"。
/// 回收的实例不会重新排队，作业的下一次触发由调度器正常计算。
pub struct StaleRunReaper {
    tracker: Arc<RunStateTracker>,
    metrics: Arc<MetricsCollector>,
    config: StaleRunReaperConfig,
}

impl StaleRunReaper {
    pub fn new(
        tracker: Arc<RunStateTracker>,
        metrics: Arc<MetricsCollector>,
        config: StaleRunReaperConfig,
    ) -> Self {
        Self {
            tracker,
            metrics,
            config,
        }
    }

    fn is_stale(&self, run: &Run, now: DateTime<Utc>) -> bool {
        let silent_for = now - run.last_seen_alive();
        silent_for
            .to_std()
            .map(|silent| silent > self.config.stale_threshold)
            .unwrap_or(false)
    }

    /// 扫描一次，返回被回收的实例
    pub async fn sweep(&self, now: DateTime<Utc>) -> DiscoveryResult<Vec<Run>> {
        debug!("开始扫描过期的运行实例");
        let running = self.tracker.runs_in_state(RunState::Running).await?;
        let mut reclaimed = Vec::new();

        for run in running.iter().filter(|run| self.is_stale(run, now)) {
            let last_seen_alive = run.last_seen_alive();
            match self
                .tracker
                .transition_at(
                    run.id,
                    RunState::Running,
                    RunState::Failed,
                    TransitionDetail::error(RunErrorDetail::stale_orphaned()),
                    now,
                )
                .await
            {
                Ok(failed) => {
                    StructuredLogger::log_stale_run_reclaimed(failed.id, &failed.job_id, last_seen_alive);
                    self.metrics.record_stale_run_reclaimed();
                    self.metrics.record_run_finished(
                        failed.state.as_str(),
                        failed.execution_duration_ms().map(|ms| ms as f64 / 1000.0),
                    );
                    reclaimed.push(failed);
                }
                // 执行器恰好在扫描期间完成了该实例
                Err(e) if e.is_invalid_transition() => {
                    debug!("运行实例 {} 已不在运行状态，跳过回收", run.id);
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => warn!("回收运行实例 {} 失败: {}", run.id, e),
            }
        }

        if !reclaimed.is_empty() {
            info!("回收了 {} 个过期的运行实例", reclaimed.len());
        }
        Ok(reclaimed)
    }

    /// 回收循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动过期运行实例回收，阈值 {:?}，间隔 {:?}",
            self.config.stale_threshold, self.config.sweep_interval
        );

        loop {
            if let Err(e) = self.sweep(Utc::now()).await {
                error!("过期运行实例扫描失败: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("回收循环收到关闭信号");
                    break;
                }
            }
        }
    }
}
