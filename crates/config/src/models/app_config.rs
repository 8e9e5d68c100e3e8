use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig, executor::ExecutorConfig, observability::ObservabilityConfig,
    scheduler::SchedulerConfig,
};
use crate::validation::ConfigValidator;

/// 环境变量前缀，例如 `DISCOVERY__SCHEDULER__POLL_INTERVAL_SECONDS=10`
pub const ENV_PREFIX: &str = "DISCOVERY";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/discovery.toml",
    "discovery.toml",
    "/etc/discovery/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 依次合并默认值、配置文件与环境变量，然后校验
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("executor.connectors"),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.executor.validate()?;
        self.observability.validate()?;

        // 过期阈值必须覆盖至少两次心跳，否则健康的运行实例也会被回收
        if self.scheduler.stale_run_threshold_seconds
            <= 2 * self.executor.heartbeat_interval_seconds
        {
            return Err(crate::ConfigError::Validation(
                "scheduler.stale_run_threshold_seconds must be greater than 2 * executor.heartbeat_interval_seconds"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.poll_interval_seconds, 30);
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.database.url, "sqlite:discovery.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_threshold_must_cover_heartbeats() {
        let mut config = AppConfig::default();
        config.scheduler.stale_run_threshold_seconds = 30;
        config.executor.heartbeat_interval_seconds = 15;
        assert!(config.validate().is_err());

        config.scheduler.stale_run_threshold_seconds = 31;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_partial_toml() {
        let toml_str = r#"
[database]
url = "memory://"

[scheduler]
poll_interval_seconds = 5

[executor]
max_concurrency = 8
connectors = ["static"]

[observability]
log_format = "json"
"#;

        let config = AppConfig::from_toml(toml_str).expect("Failed to parse TOML");
        assert!(config.database.is_memory());
        assert_eq!(config.scheduler.poll_interval_seconds, 5);
        assert_eq!(config.scheduler.backoff_max_seconds, 300);
        assert_eq!(config.executor.max_concurrency, 8);
        assert_eq!(config.executor.connectors, vec!["static".to_string()]);
        assert_eq!(config.observability.log_format, super::super::LogFormat::Json);
    }

    #[test]
    fn test_app_config_toml_round_trip() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&rendered).unwrap();
        assert_eq!(
            parsed.scheduler.stale_run_threshold_seconds,
            config.scheduler.stale_run_threshold_seconds
        );
    }
}
