//! 运行状态跟踪器
//!
//! 运行实例生命周期的唯一写入口。所有转换都是针对期望旧状态的 CAS，
//! 调度器、执行器、取消请求和过期回收之间的竞争由存储层裁决。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use discovery_errors::{DiscoveryError, DiscoveryResult};

use crate::entities::{
    JobDefinition, Run, RunFilter, RunState, RunStateUpdate, TransitionDetail,
};
use crate::repositories::RunRepository;

pub struct RunStateTracker {
    run_repo: Arc<dyn RunRepository>,
}

impl RunStateTracker {
    pub fn new(run_repo: Arc<dyn RunRepository>) -> Self {
        Self { run_repo }
    }

    pub async fn get_run(&self, id: i64) -> DiscoveryResult<Run> {
        self.run_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::run_not_found(id))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> DiscoveryResult<Vec<Run>> {
        self.run_repo.list(filter).await
    }

    /// 以当前时间执行受保护的状态转换
    pub async fn transition(
        &self,
        id: i64,
        from: RunState,
        to: RunState,
        detail: TransitionDetail,
    ) -> DiscoveryResult<Run> {
        self.transition_at(id, from, to, detail, Utc::now()).await
    }

    /// 当前状态不等于 `from` 时返回 `InvalidTransition` 且不做任何修改
    pub async fn transition_at(
        &self,
        id: i64,
        from: RunState,
        to: RunState,
        detail: TransitionDetail,
        at: DateTime<Utc>,
    ) -> DiscoveryResult<Run> {
        if !from.can_transition_to(to) {
            return Err(DiscoveryError::validation_error(format!(
                "生命周期不允许的状态转换: {from} -> {to}"
            )));
        }

        let update = RunStateUpdate {
            to,
            at,
            error: detail.error,
            dataset_version_ids: detail.dataset_version_ids,
        };
        if self.run_repo.compare_and_set(id, from, &update).await? {
            debug!("运行实例 {} 状态转换: {} -> {}", id, from, to);
            return self.get_run(id).await;
        }

        let current = self.get_run(id).await?;
        Err(DiscoveryError::invalid_transition(id, from, current.state))
    }

    /// 为作业创建排队实例，同一作业已有活动实例时返回 `ActiveRunExists`
    pub async fn enqueue(
        &self,
        job: &JobDefinition,
        scheduled_for: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> DiscoveryResult<Run> {
        let run = Run::queued(
            job.id.clone(),
            job.data_source_id.clone(),
            scheduled_for,
            queued_at,
        );
        let run = self.run_repo.create_queued(&run).await?;
        info!(
            "作业 {} 创建运行实例 {}，计划时间 {}",
            job.id,
            run.id,
            scheduled_for.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(run)
    }

    pub async fn heartbeat(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<bool> {
        self.run_repo.record_heartbeat(id, at).await
    }

    /// 取消运行实例
    ///
    /// QUEUED 直接转为 CANCELLED；RUNNING 只设置协作式取消标记，返回的实例仍为
    /// RUNNING，调用方负责通知执行器；终态返回 `InvalidTransition`。
    pub async fn cancel(&self, id: i64, at: DateTime<Utc>) -> DiscoveryResult<Run> {
        // 排队实例可能在读取后被领取，此时按运行中实例重试一次
        for _ in 0..2 {
            let run = self.get_run(id).await?;
            match run.state {
                RunState::Queued => {
                    let update = RunStateUpdate {
                        to: RunState::Cancelled,
                        at,
                        error: None,
                        dataset_version_ids: Vec::new(),
                    };
                    if self
                        .run_repo
                        .compare_and_set(id, RunState::Queued, &update)
                        .await?
                    {
                        info!("排队中的运行实例 {} 已取消", id);
                        return self.get_run(id).await;
                    }
                }
                RunState::Running => {
                    if self.run_repo.request_cancel(id).await? {
                        info!("已请求取消运行中的实例 {}", id);
                        return self.get_run(id).await;
                    }
                }
                state => {
                    return Err(DiscoveryError::invalid_transition(
                        id,
                        "QUEUED|RUNNING",
                        state,
                    ));
                }
            }
        }

        let run = self.get_run(id).await?;
        Err(DiscoveryError::invalid_transition(
            id,
            "QUEUED|RUNNING",
            run.state,
        ))
    }

    pub async fn active_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.run_repo.get_active_run(job_id).await
    }

    pub async fn last_terminal_run(&self, job_id: &str) -> DiscoveryResult<Option<Run>> {
        self.run_repo.get_last_terminal_run(job_id).await
    }

    pub async fn runs_in_state(&self, state: RunState) -> DiscoveryResult<Vec<Run>> {
        self.run_repo.get_by_state(state).await
    }
}
