use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use discovery_errors::{DiscoveryError, DiscoveryResult};

use crate::entities::{JobDefinition, JobDefinitionFilter, JobDefinitionSpec};
use crate::repositories::{DataSourceRepository, JobDefinitionRepository};
use crate::schedule::ScheduleExpression;

/// 作业定义注册表
///
/// 只负责校验与持久化，不会触发任何执行。
pub struct JobDefinitionRegistry {
    job_repo: Arc<dyn JobDefinitionRepository>,
    source_repo: Arc<dyn DataSourceRepository>,
}

impl JobDefinitionRegistry {
    pub fn new(
        job_repo: Arc<dyn JobDefinitionRepository>,
        source_repo: Arc<dyn DataSourceRepository>,
    ) -> Self {
        Self {
            job_repo,
            source_repo,
        }
    }

    pub async fn create(&self, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition> {
        self.validate(&spec).await?;
        let job = JobDefinition::from_spec(spec, Utc::now());
        let created = self.job_repo.create(&job).await?;
        info!("注册{}，调度: {}", created.entity_description(), created.schedule);
        Ok(created)
    }

    /// 整体替换可变字段，保留 ID 和创建时间
    pub async fn update(&self, id: &str, spec: JobDefinitionSpec) -> DiscoveryResult<JobDefinition> {
        if let Some(spec_id) = spec.id.as_deref() {
            if !spec_id.is_empty() && spec_id != id {
                return Err(DiscoveryError::validation_error(format!(
                    "作业定义 ID 不可修改: {id} -> {spec_id}"
                )));
            }
        }
        let current = self.get(id).await?;
        self.validate(&spec).await?;

        let updated = JobDefinition {
            id: current.id,
            name: spec.name,
            data_source_id: spec.data_source_id,
            schedule: spec.schedule,
            parameters: spec.parameters,
            enabled: spec.enabled,
            timeout_seconds: spec.timeout_seconds,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };
        let updated = self.job_repo.update(&updated).await?;
        info!("更新{}", updated.entity_description());
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> DiscoveryResult<JobDefinition> {
        self.job_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::job_not_found(id))
    }

    pub async fn list(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>> {
        self.job_repo.list(filter).await
    }

    async fn validate(&self, spec: &JobDefinitionSpec) -> DiscoveryResult<()> {
        if spec.name.trim().is_empty() {
            return Err(DiscoveryError::validation_error("作业名称不能为空"));
        }
        ScheduleExpression::parse(&spec.schedule)?;
        if let Some(timeout) = spec.timeout_seconds {
            if timeout <= 0 {
                return Err(DiscoveryError::validation_error(format!(
                    "超时时间必须大于0: {timeout}"
                )));
            }
        }
        if !(spec.parameters.is_object() || spec.parameters.is_null()) {
            return Err(DiscoveryError::validation_error("作业参数必须是 JSON 对象"));
        }
        if self
            .source_repo
            .get_latest(&spec.data_source_id)
            .await?
            .is_none()
        {
            return Err(DiscoveryError::validation_error(format!(
                "数据源不存在: {}",
                spec.data_source_id
            )));
        }
        Ok(())
    }
}
