use thiserror::Error;

#[cfg(test)]
mod tests;

/// 发现平台统一错误类型
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("{entity}未找到: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("无效的状态转换: 运行实例 {run_id} 期望状态 {expected}, 实际状态 {actual}")]
    InvalidTransition {
        run_id: i64,
        expected: String,
        actual: String,
    },
    #[error("连接器错误: {0}")]
    ConnectorError(String),
    #[error("运行实例 {run_id} 已过期: {detail}")]
    StaleRunError { run_id: i64, detail: String },
    #[error("无效的调度表达式: {expr} - {message}")]
    InvalidSchedule { expr: String, message: String },
    #[error("作业 {job_id} 已有排队或运行中的实例")]
    ActiveRunExists { job_id: String },
    #[error("调度队列错误: {0}")]
    Queue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

impl DiscoveryError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn connector_error<S: Into<String>>(msg: S) -> Self {
        Self::ConnectorError(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn data_source_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            entity: "数据源",
            id: id.into(),
        }
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            entity: "作业定义",
            id: id.into(),
        }
    }
    pub fn run_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "运行实例",
            id: id.to_string(),
        }
    }
    pub fn invalid_transition<E: ToString, A: ToString>(run_id: i64, expected: E, actual: A) -> Self {
        Self::InvalidTransition {
            run_id,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// 持久层或队列不可用，调用方应退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Database(_)
                | DiscoveryError::DatabaseOperation(_)
                | DiscoveryError::Queue(_)
        )
    }

    /// 输入在任何状态变更之前被拒绝
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DiscoveryError::ValidationError(_) | DiscoveryError::InvalidSchedule { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoveryError::NotFound { .. })
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, DiscoveryError::InvalidTransition { .. })
    }

    /// 日志与指标使用的稳定标签
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::Database(_) | DiscoveryError::DatabaseOperation(_) => "database",
            DiscoveryError::ValidationError(_) | DiscoveryError::InvalidSchedule { .. } => {
                "validation_error"
            }
            DiscoveryError::NotFound { .. } => "not_found",
            DiscoveryError::InvalidTransition { .. } => "invalid_transition",
            DiscoveryError::ConnectorError(_) => "connector_error",
            DiscoveryError::StaleRunError { .. } => "stale_run",
            DiscoveryError::ActiveRunExists { .. } => "active_run_exists",
            DiscoveryError::Queue(_) => "queue",
            DiscoveryError::Serialization(_) => "serialization",
            DiscoveryError::Configuration(_) => "configuration",
            DiscoveryError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        DiscoveryError::Serialization(err.to_string())
    }
}
