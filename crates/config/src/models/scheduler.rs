use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    /// 退避延迟的随机抖动比例，0.0 ~ 1.0
    pub backoff_jitter: f64,
    pub stale_run_threshold_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 30,
            backoff_base_seconds: 1,
            backoff_max_seconds: 300,
            backoff_jitter: 0.1,
            stale_run_threshold_seconds: 900,
            reaper_interval_seconds: 60,
            queue_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn stale_run_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_run_threshold_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.poll_interval_seconds,
            86400,
            "scheduler.poll_interval_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.backoff_base_seconds,
            3600,
            "scheduler.backoff_base_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.backoff_max_seconds,
            86400,
            "scheduler.backoff_max_seconds",
        )?;
        if self.backoff_base_seconds > self.backoff_max_seconds {
            return Err(crate::ConfigError::Validation(
                "scheduler.backoff_base_seconds must be less than or equal to backoff_max_seconds"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.backoff_jitter, "scheduler.backoff_jitter")?;
        ValidationUtils::validate_seconds(
            self.stale_run_threshold_seconds,
            7 * 86400,
            "scheduler.stale_run_threshold_seconds",
        )?;
        ValidationUtils::validate_seconds(
            self.reaper_interval_seconds,
            86400,
            "scheduler.reaper_interval_seconds",
        )?;
        ValidationUtils::validate_count(self.queue_capacity, "scheduler.queue_capacity")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_scheduler_config_validation() {
        let mut config = SchedulerConfig::default();
        config.backoff_base_seconds = 600;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.backoff_jitter = 2.0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.poll_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
