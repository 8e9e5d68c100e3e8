use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 已注册的数据源（数据库、文件共享、API 等）
///
/// 被数据集版本引用后即不可变，后续修改会生成新的 `version`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSource {
    pub id: String,
    pub version: i32,
    pub name: String,
    pub connector_type: String, // "filesystem", "static", etc.
    pub connection_params: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl DataSource {
    pub fn new(
        id: String,
        name: String,
        connector_type: String,
        connection_params: serde_json::Value,
    ) -> Self {
        Self {
            id,
            version: 1,
            name,
            connector_type,
            connection_params,
            enabled: true,
            created_at: Utc::now(),
        }
    }
    pub fn entity_description(&self) -> String {
        format!(
            "数据源 '{}' (ID: {}, 版本: {}, 连接器: {})",
            self.name, self.id, self.version, self.connector_type
        )
    }
}

/// 注册或修改数据源时由调用方提供的字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSpec {
    pub id: Option<String>,
    pub name: String,
    pub connector_type: String,
    #[serde(default)]
    pub connection_params: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DataSourceFilter {
    pub connector_type: Option<String>,
    pub enabled: Option<bool>,
}

/// 一次发现得到的数据集快照，只追加不修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetVersion {
    pub id: i64,
    pub data_source_id: String,
    pub data_source_version: i32,
    pub version: i32,
    pub schema_snapshot: serde_json::Value,
    pub fingerprint: String,
    pub run_id: Option<i64>,
    pub discovered_at: DateTime<Utc>,
}

/// 待写入的数据集版本，`version` 由目录存储分配
#[derive(Debug, Clone)]
pub struct NewDatasetVersion {
    pub data_source_id: String,
    pub data_source_version: i32,
    pub version: i32,
    pub schema_snapshot: serde_json::Value,
    pub fingerprint: String,
    pub run_id: Option<i64>,
    pub discovered_at: DateTime<Utc>,
}

/// 发现作业模板
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub data_source_id: String,
    pub schedule: String, // cron 表达式
    pub parameters: serde_json::Value,
    pub enabled: bool,
    pub timeout_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    /// 由调用方提供的字段构建作业定义，未指定 ID 时生成 UUID
    pub fn from_spec(spec: JobDefinitionSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: spec.name,
            data_source_id: spec.data_source_id,
            schedule: spec.schedule,
            parameters: spec.parameters,
            enabled: spec.enabled,
            timeout_seconds: spec.timeout_seconds,
            created_at: now,
            updated_at: now,
        }
    }
    pub fn entity_description(&self) -> String {
        format!(
            "作业 '{}' (ID: {}, 数据源: {})",
            self.name, self.id, self.data_source_id
        )
    }
}

/// 提交或更新作业定义时由调用方提供的字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinitionSpec {
    pub id: Option<String>,
    pub name: String,
    pub data_source_id: String,
    pub schedule: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub timeout_seconds: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct JobDefinitionFilter {
    pub enabled: Option<bool>,
    pub data_source_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl JobDefinitionFilter {
    pub fn enabled_only() -> Self {
        Self {
            enabled: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunState {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "QUEUED",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Queued | RunState::Running)
    }
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }
    /// 生命周期允许的边；终态没有出边
    pub fn can_transition_to(&self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Queued, RunState::Running)
                | (RunState::Queued, RunState::Cancelled)
                | (RunState::Queued, RunState::Failed)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> DiscoveryResult<Self> {
        match s {
            "QUEUED" => Ok(RunState::Queued),
            "RUNNING" => Ok(RunState::Running),
            "SUCCEEDED" => Ok(RunState::Succeeded),
            "FAILED" => Ok(RunState::Failed),
            "CANCELLED" => Ok(RunState::Cancelled),
            _ => Err(DiscoveryError::Serialization(format!(
                "Invalid run state: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// 连接器返回错误
    Connector,
    /// 运行中实例超过过期阈值被回收
    StaleOrphaned,
    /// 超过作业超时时间
    Timeout,
    /// 取消请求未在宽限期内得到连接器确认
    CancelUnacknowledged,
    /// 数据源被禁用或连接器未注册
    Configuration,
    /// 写入目录或调度队列失败
    Internal,
}

/// 记录在运行实例上的错误详情
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunErrorDetail {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunErrorDetail {
    pub const STALE_ORPHANED: &'static str = "stale/orphaned";

    pub fn new<S: Into<String>>(kind: RunErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
    pub fn stale_orphaned() -> Self {
        Self::new(RunErrorKind::StaleOrphaned, Self::STALE_ORPHANED)
    }
}

impl fmt::Display for RunErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// 作业定义的一次执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub job_id: String,
    pub data_source_id: String,
    pub state: RunState,
    pub scheduled_for: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub error: Option<RunErrorDetail>,
    pub dataset_version_ids: Vec<i64>,
}

impl Run {
    pub fn queued(
        job_id: String,
        data_source_id: String,
        scheduled_for: DateTime<Utc>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0, // 将由存储生成
            job_id,
            data_source_id,
            state: RunState::Queued,
            scheduled_for,
            queued_at,
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            cancel_requested: false,
            error: None,
            dataset_version_ids: Vec::new(),
        }
    }
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
    /// 最近一次存活证明：心跳、开始时间或入队时间
    pub fn last_seen_alive(&self) -> DateTime<Utc> {
        self.heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.queued_at)
    }
    pub fn execution_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some((ended - started).num_milliseconds()),
            _ => None,
        }
    }
    /// 将一次状态转换作用到内存中的实例上，存储实现共用此逻辑
    pub fn apply(&mut self, update: &RunStateUpdate) {
        self.state = update.to;
        match update.to {
            RunState::Running => {
                self.started_at = Some(update.at);
                self.heartbeat_at = Some(update.at);
            }
            to if to.is_terminal() => {
                self.ended_at = Some(update.at);
            }
            _ => {}
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if !update.dataset_version_ids.is_empty() {
            self.dataset_version_ids = update.dataset_version_ids.clone();
        }
    }
    pub fn entity_description(&self) -> String {
        format!(
            "运行实例 {} (作业: {}, 状态: {})",
            self.id, self.job_id, self.state
        )
    }
}

/// 一次受保护状态转换要写入的内容
#[derive(Debug, Clone, PartialEq)]
pub struct RunStateUpdate {
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub error: Option<RunErrorDetail>,
    pub dataset_version_ids: Vec<i64>,
}

/// 转换附带的可选详情
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionDetail {
    pub error: Option<RunErrorDetail>,
    pub dataset_version_ids: Vec<i64>,
}

impl TransitionDetail {
    pub fn error(error: RunErrorDetail) -> Self {
        Self {
            error: Some(error),
            dataset_version_ids: Vec::new(),
        }
    }
    pub fn produced(dataset_version_ids: Vec<i64>) -> Self {
        Self {
            error: None,
            dataset_version_ids,
        }
    }
}

/// 左闭右开的时间范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub state: Option<RunState>,
    /// 按入队时间过滤
    pub time_range: Option<TimeRange>,
    pub limit: Option<i64>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.job_id
            .as_ref()
            .map_or(true, |job_id| &run.job_id == job_id)
            && self.state.map_or(true, |state| run.state == state)
            && self
                .time_range
                .map_or(true, |range| range.contains(run.queued_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_run_state_transitions() {
        assert!(RunState::Queued.can_transition_to(RunState::Running));
        assert!(RunState::Queued.can_transition_to(RunState::Cancelled));
        assert!(RunState::Running.can_transition_to(RunState::Succeeded));
        assert!(RunState::Running.can_transition_to(RunState::Failed));
        assert!(RunState::Running.can_transition_to(RunState::Cancelled));

        assert!(!RunState::Running.can_transition_to(RunState::Queued));
        for terminal in [RunState::Succeeded, RunState::Failed, RunState::Cancelled] {
            for to in [
                RunState::Queued,
                RunState::Running,
                RunState::Succeeded,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_run_state_string_round_trip() {
        for state in [
            RunState::Queued,
            RunState::Running,
            RunState::Succeeded,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("PENDING".parse::<RunState>().is_err());
    }

    #[test]
    fn test_apply_sets_timestamps() {
        let now = Utc::now();
        let mut run = Run::queued("job".into(), "src".into(), now, now);

        run.apply(&RunStateUpdate {
            to: RunState::Running,
            at: now + Duration::seconds(1),
            error: None,
            dataset_version_ids: vec![],
        });
        assert_eq!(run.started_at, Some(now + Duration::seconds(1)));
        assert_eq!(run.heartbeat_at, run.started_at);
        assert!(run.ended_at.is_none());

        run.apply(&RunStateUpdate {
            to: RunState::Succeeded,
            at: now + Duration::seconds(5),
            error: None,
            dataset_version_ids: vec![11],
        });
        assert_eq!(run.ended_at, Some(now + Duration::seconds(5)));
        assert_eq!(run.dataset_version_ids, vec![11]);
        assert_eq!(run.execution_duration_ms(), Some(4000));
    }

    #[test]
    fn test_job_definition_from_spec_generates_id() {
        let spec = JobDefinitionSpec {
            id: None,
            name: "scan".into(),
            data_source_id: "src".into(),
            schedule: "@hourly".into(),
            parameters: serde_json::json!({}),
            enabled: true,
            timeout_seconds: None,
        };
        let job = JobDefinition::from_spec(spec, Utc::now());
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_run_filter_matches() {
        let now = Utc::now();
        let run = Run::queued("job-a".into(), "src".into(), now, now);

        assert!(RunFilter::default().matches(&run));
        assert!(RunFilter {
            job_id: Some("job-a".into()),
            state: Some(RunState::Queued),
            ..Default::default()
        }
        .matches(&run));
        assert!(!RunFilter {
            job_id: Some("job-b".into()),
            ..Default::default()
        }
        .matches(&run));
        assert!(!RunFilter {
            time_range: Some(TimeRange::new(now + Duration::hours(1), now + Duration::hours(2))),
            ..Default::default()
        }
        .matches(&run));
    }
}
