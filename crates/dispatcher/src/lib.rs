//! 调度端组件
//!
//! 发现作业调度循环、周期失败退避，以及过期运行实例回收。

pub mod backoff;
pub mod scheduler;
pub mod stale_run_reaper;

pub use backoff::BackoffPolicy;
pub use scheduler::{CycleReport, DiscoveryScheduler};
pub use stale_run_reaper::{StaleRunReaper, StaleRunReaperConfig};
