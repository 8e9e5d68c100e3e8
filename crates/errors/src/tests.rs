#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_discovery_error_display() {
        let db_op_error = DiscoveryError::DatabaseOperation("Connection failed".to_string());
        assert_eq!(db_op_error.to_string(), "数据库操作错误: Connection failed");

        let not_found = DiscoveryError::job_not_found("nightly-scan");
        assert_eq!(not_found.to_string(), "作业定义未找到: nightly-scan");

        let run_not_found = DiscoveryError::run_not_found(42);
        assert_eq!(run_not_found.to_string(), "运行实例未找到: 42");

        let transition = DiscoveryError::invalid_transition(7, "QUEUED", "SUCCEEDED");
        assert_eq!(
            transition.to_string(),
            "无效的状态转换: 运行实例 7 期望状态 QUEUED, 实际状态 SUCCEEDED"
        );

        let stale = DiscoveryError::StaleRunError {
            run_id: 3,
            detail: "stale/orphaned".to_string(),
        };
        assert_eq!(stale.to_string(), "运行实例 3 已过期: stale/orphaned");

        let schedule = DiscoveryError::InvalidSchedule {
            expr: "every hour".to_string(),
            message: "bad field".to_string(),
        };
        assert_eq!(
            schedule.to_string(),
            "无效的调度表达式: every hour - bad field"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DiscoveryError::database_error("pool timed out").is_retryable());
        assert!(DiscoveryError::Queue("closed".to_string()).is_retryable());
        assert!(DiscoveryError::Database(sqlx::Error::PoolTimedOut).is_retryable());

        assert!(!DiscoveryError::validation_error("bad").is_retryable());
        assert!(!DiscoveryError::run_not_found(1).is_retryable());
        assert!(!DiscoveryError::invalid_transition(1, "RUNNING", "FAILED").is_retryable());
        assert!(!DiscoveryError::connector_error("boom").is_retryable());
    }

    #[test]
    fn test_predicates_and_kind() {
        let schedule = DiscoveryError::InvalidSchedule {
            expr: "x".to_string(),
            message: "y".to_string(),
        };
        assert!(schedule.is_validation());
        assert_eq!(schedule.kind(), "validation_error");

        let missing = DiscoveryError::data_source_not_found("warehouse");
        assert!(missing.is_not_found());
        assert_eq!(missing.kind(), "not_found");

        let lost_race = DiscoveryError::invalid_transition(9, "QUEUED", "RUNNING");
        assert!(lost_race.is_invalid_transition());
        assert_eq!(lost_race.kind(), "invalid_transition");

        let active = DiscoveryError::ActiveRunExists {
            job_id: "j1".to_string(),
        };
        assert_eq!(active.kind(), "active_run_exists");
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: DiscoveryError = err.into();
        assert!(matches!(converted, DiscoveryError::Serialization(_)));
    }
}
