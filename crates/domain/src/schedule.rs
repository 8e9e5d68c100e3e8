use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use discovery_errors::{DiscoveryError, DiscoveryResult};

use crate::entities::{JobDefinition, Run};

/// CRON 调度表达式
///
/// 接受 cron crate 的 6/7 字段格式（秒在最前）、`@hourly` 一类的别名，
/// 以及常见的 5 字段格式（自动补齐秒字段为 0）。
#[derive(Debug, Clone)]
pub struct ScheduleExpression {
    expr: String,
    schedule: Schedule,
}

impl ScheduleExpression {
    pub fn parse(expr: &str) -> DiscoveryResult<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(DiscoveryError::InvalidSchedule {
                expr: expr.to_string(),
                message: "调度表达式不能为空".to_string(),
            });
        }
        let normalized = normalize(trimmed);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| DiscoveryError::InvalidSchedule {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    /// 严格晚于 `anchor` 的第一个触发时间
    pub fn next_after(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&anchor).next()
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

fn normalize(expr: &str) -> String {
    if expr.starts_with('@') {
        return expr.to_string();
    }
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// 计算下次触发时间的锚点：最近一次终态运行的结束时间，从未运行过时取作业创建时间
pub fn fire_anchor(job: &JobDefinition, last_terminal: Option<&Run>) -> DateTime<Utc> {
    last_terminal
        .and_then(|run| run.ended_at)
        .unwrap_or(job.created_at)
}

/// 锚点之后的下一个触发时间已到达时返回该时间
///
/// 只看锚点之后的第一个触发点，因此错过的多次触发合并为一次，不做补跑。
pub fn due_fire_time(
    schedule: &ScheduleExpression,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.next_after(anchor).filter(|next| *next <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{JobDefinitionSpec, RunState};
    use chrono::{Duration, TimeZone, Timelike};

    fn hourly_job(created_at: DateTime<Utc>) -> JobDefinition {
        JobDefinition::from_spec(
            JobDefinitionSpec {
                id: Some("hourly".into()),
                name: "hourly scan".into(),
                data_source_id: "src".into(),
                schedule: "0 0 * * * *".into(),
                parameters: serde_json::Value::Null,
                enabled: true,
                timeout_seconds: None,
            },
            created_at,
        )
    }

    #[test]
    fn test_parse_accepts_five_field_and_aliases() {
        assert!(ScheduleExpression::parse("*/5 * * * *").is_ok());
        assert!(ScheduleExpression::parse("0 0 * * * *").is_ok());
        assert!(ScheduleExpression::parse("@hourly").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = ScheduleExpression::parse("every hour").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidSchedule { .. }));
        assert!(ScheduleExpression::parse("   ").is_err());
        assert!(ScheduleExpression::parse("61 * * * *").is_err());
    }

    #[test]
    fn test_five_field_fires_on_minute_boundary() {
        let schedule = ScheduleExpression::parse("30 * * * *").unwrap();
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(anchor).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap());
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_anchor_prefers_last_terminal_end() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = hourly_job(created);
        assert_eq!(fire_anchor(&job, None), created);

        let ended = created + Duration::hours(5);
        let mut run = Run::queued(job.id.clone(), "src".into(), created, created);
        run.state = RunState::Succeeded;
        run.ended_at = Some(ended);
        assert_eq!(fire_anchor(&job, Some(&run)), ended);
    }

    #[test]
    fn test_missed_fires_coalesce_into_one() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap();
        let schedule = ScheduleExpression::parse("@hourly").unwrap();
        // 上次运行两小时前结束，期间错过了两个触发点
        let anchor = now - Duration::hours(2);

        let due = due_fire_time(&schedule, anchor, now).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());

        // 新运行结束后，锚点前移，下一次触发在未来
        let after_run = now + Duration::minutes(1);
        assert!(due_fire_time(&schedule, after_run, after_run).is_none());
    }

    #[test]
    fn test_not_due_before_next_fire() {
        let schedule = ScheduleExpression::parse("0 0 * * * *").unwrap();
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 59, 59).unwrap();
        assert!(due_fire_time(&schedule, anchor, now).is_none());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        assert_eq!(due_fire_time(&schedule, anchor, now), Some(now));
    }
}
