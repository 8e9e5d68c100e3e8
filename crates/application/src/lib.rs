//! 对外接口层
//!
//! `DiscoveryService` 把目录存储、作业注册表、运行状态跟踪器和调度器组合成
//! 一组面向调用方的操作。

pub mod interfaces;
pub mod services;

pub use interfaces::*;
pub use services::*;
