use std::time::Duration;

/// 调度周期失败后的退避策略
///
/// 第 n 次连续失败等待 `base * 2^(n-1)`，不超过 `max`，再叠加 ±`jitter` 比例的随机抖动。
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// 抖动比例，0.1 表示 ±10%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    /// 不带抖动的退避时间
    pub fn capped_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31) as i32;
        let exponential = self.base.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(exponential.min(self.max.as_secs_f64()))
    }

    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let capped = self.capped_delay(consecutive_failures).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(capped);
        }

        // 避免多个实例同时重试
        let jitter = capped * self.jitter * (rand::random::<f64>() - 0.5) * 2.0;
        let delayed = (capped + jitter).clamp(0.0, self.max.as_secs_f64());
        Duration::from_secs_f64(delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(4), Duration::from_secs(300), 0.1);
        for _ in 0..100 {
            let delay = policy.delay(1).as_secs_f64();
            assert!((3.6..=4.4).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 0.5);
        for failures in 1..20 {
            assert!(policy.delay(failures) <= Duration::from_secs(5));
        }
    }
}
