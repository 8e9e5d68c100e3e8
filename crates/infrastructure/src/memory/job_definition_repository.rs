use std::collections::HashMap;

use async_trait::async_trait;
use discovery_domain::{
    entities::{JobDefinition, JobDefinitionFilter},
    repositories::JobDefinitionRepository,
};
use discovery_errors::{DiscoveryError, DiscoveryResult};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryJobDefinitionRepository {
    jobs: RwLock<HashMap<String, JobDefinition>>,
}

impl InMemoryJobDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobDefinitionRepository for InMemoryJobDefinitionRepository {
    async fn create(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DiscoveryError::validation_error(format!(
                "作业定义 {} 已存在",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job.clone())
    }

    async fn update(&self, job: &JobDefinition) -> DiscoveryResult<JobDefinition> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(job.clone())
            }
            None => Err(DiscoveryError::job_not_found(&job.id)),
        }
    }

    async fn get_by_id(&self, id: &str) -> DiscoveryResult<Option<JobDefinition>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(id).cloned())
    }

    async fn list(&self, filter: &JobDefinitionFilter) -> DiscoveryResult<Vec<JobDefinition>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<JobDefinition> = jobs
            .values()
            .filter(|job| {
                filter.enabled.map_or(true, |e| job.enabled == e)
                    && filter
                        .data_source_id
                        .as_ref()
                        .map_or(true, |id| &job.data_source_id == id)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }
}
