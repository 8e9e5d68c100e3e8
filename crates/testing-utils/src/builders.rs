//! Test data builders for creating test entities
//!
//! Builders start from sensible defaults so tests only spell out the fields
//! they care about.

use chrono::{DateTime, Utc};
use discovery_domain::entities::{DataSource, JobDefinition};

/// Builder for creating test DataSource entities
pub struct DataSourceBuilder {
    source: DataSource,
}

impl DataSourceBuilder {
    pub fn new() -> Self {
        Self {
            source: DataSource::new(
                "test_source".to_string(),
                "Test Source".to_string(),
                "static".to_string(),
                serde_json::json!({"snapshot": {"tables": []}}),
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.source.id = id.to_string();
        self
    }

    pub fn with_connector_type(mut self, connector_type: &str) -> Self {
        self.source.connector_type = connector_type.to_string();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.source.connection_params = params;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.source.enabled = false;
        self
    }

    pub fn build(self) -> DataSource {
        self.source
    }
}

impl Default for DataSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test JobDefinition entities
pub struct JobDefinitionBuilder {
    job: JobDefinition,
}

impl JobDefinitionBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            job: JobDefinition {
                id: "test_job".to_string(),
                name: "test job".to_string(),
                data_source_id: "test_source".to_string(),
                schedule: "0 0 * * * *".to_string(),
                parameters: serde_json::json!({}),
                enabled: true,
                timeout_seconds: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.job.id = id.to_string();
        self
    }

    pub fn with_data_source(mut self, data_source_id: &str) -> Self {
        self.job.data_source_id = data_source_id.to_string();
        self
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.job.schedule = schedule.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: i64) -> Self {
        self.job.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.job.created_at = created_at;
        self.job.updated_at = created_at;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.job.enabled = false;
        self
    }

    pub fn build(self) -> JobDefinition {
        self.job
    }
}

impl Default for JobDefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
