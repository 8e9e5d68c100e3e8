use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use discovery_errors::DiscoveryResult;

/// 调度队列中的条目，只携带定位运行实例所需的信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRun {
    pub run_id: i64,
    pub job_id: String,
    pub scheduled_for: DateTime<Utc>,
}

/// 调度器与执行器之间共享的运行队列
///
/// 队列只是分发提示：执行器领取时仍以 QUEUED→RUNNING 的 CAS 为准，
/// 重复投递的条目会在领取时被丢弃。
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// 队列已满或已关闭时返回 `Queue` 错误
    async fn push(&self, item: QueuedRun) -> DiscoveryResult<()>;

    /// 等待下一个条目；队列关闭且为空时返回 None
    async fn pop(&self) -> Option<QueuedRun>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 关闭后不再接受新条目，等待中的 `pop` 在取完剩余条目后返回 None
    async fn close(&self);
}
