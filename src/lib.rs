//! 数据发现作业编排与数据集目录引擎
//!
//! 二进制入口之外的组装代码，供 `main` 与端到端测试共用。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
