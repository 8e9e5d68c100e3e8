use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub enabled: bool,
    pub max_concurrency: usize,
    pub default_run_timeout_seconds: u64,
    /// 取消请求发出后等待连接器返回的时间
    pub cancel_grace_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// 启动时注册的内置连接器类型
    pub connectors: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 4,
            default_run_timeout_seconds: 1800,
            cancel_grace_seconds: 30,
            heartbeat_interval_seconds: 15,
            connectors: vec!["filesystem".to_string(), "static".to_string()],
        }
    }
}

impl ExecutorConfig {
    pub fn default_run_timeout(&self) -> Duration {
        Duration::from_secs(self.default_run_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

impl ConfigValidator for ExecutorConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_concurrency, "executor.max_concurrency")?;
        ValidationUtils::validate_seconds(
            self.default_run_timeout_seconds,
            7 * 86400,
            "executor.default_run_timeout_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.cancel_grace_seconds,
            3600,
            "executor.cancel_grace_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.heartbeat_interval_seconds,
            3600,
            "executor.heartbeat_interval_seconds",
        )?;
        for connector in &self.connectors {
            ValidationUtils::validate_not_empty(connector, "executor.connectors[]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_validation() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.max_concurrency = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.connectors.push(" ".to_string());
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.heartbeat_interval_seconds = 0;
        assert!(invalid.validate().is_err());
    }
}
