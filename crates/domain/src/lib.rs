//! 数据发现编排引擎的领域层：实体、仓储接口、调度计算、连接器契约，
//! 以及目录存储、作业注册表和运行状态跟踪器三个领域服务。

pub mod catalog;
pub mod connector;
pub mod entities;
pub mod fingerprint;
pub mod queue;
pub mod registry;
pub mod repositories;
pub mod run_tracker;
pub mod schedule;

pub use catalog::*;
pub use connector::*;
pub use entities::*;
pub use fingerprint::fingerprint;
pub use queue::*;
pub use registry::*;
pub use repositories::*;
pub use run_tracker::*;
pub use schedule::*;

pub use discovery_errors::{DiscoveryError, DiscoveryResult};
