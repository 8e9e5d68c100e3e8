//! 执行端组件
//!
//! 有界并发的执行器池，以及内置的 `filesystem` 与 `static` 连接器。

pub mod connectors;
pub mod pool;

pub use connectors::{FileSystemConnector, FileSystemParams, StaticConnector};
pub use pool::{ExecutorPool, ExecutorPoolConfig};
