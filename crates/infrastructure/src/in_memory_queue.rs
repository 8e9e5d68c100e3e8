use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use discovery_domain::queue::{QueuedRun, RunQueue};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// 内存运行队列
///
/// 基于有界 Tokio channel，多个执行器共享同一个接收端。
#[derive(Debug, Clone)]
pub struct InMemoryRunQueue {
    sender: Arc<Mutex<Option<mpsc::Sender<QueuedRun>>>>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedRun>>>,
    size: Arc<AtomicUsize>,
    capacity: usize,
}

impl InMemoryRunQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        info!("创建内存运行队列，容量 {}", capacity);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver: Arc::new(Mutex::new(receiver)),
            size: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl RunQueue for InMemoryRunQueue {
    async fn push(&self, item: QueuedRun) -> DiscoveryResult<()> {
        let sender = self.sender.lock().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| DiscoveryError::Queue("运行队列已关闭".to_string()))?;
        let run_id = item.run_id;
        sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DiscoveryError::Queue(format!("运行队列已满，容量 {}", self.capacity))
            }
            mpsc::error::TrySendError::Closed(_) => {
                DiscoveryError::Queue("运行队列已关闭".to_string())
            }
        })?;
        self.size.fetch_add(1, Ordering::Relaxed);
        debug!("运行实例 {} 已入队", run_id);
        Ok(())
    }

    async fn pop(&self) -> Option<QueuedRun> {
        let mut receiver = self.receiver.lock().await;
        let item = receiver.recv().await;
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    async fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        let mut sender = self.sender.lock().await;
        if sender.take().is_some() {
            info!("运行队列已关闭");
        }
    }
}
