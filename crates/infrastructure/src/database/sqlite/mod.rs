pub mod sqlite_data_source_repository;
pub mod sqlite_dataset_repository;
pub mod sqlite_job_definition_repository;
pub mod sqlite_run_repository;

pub use sqlite_data_source_repository::SqliteDataSourceRepository;
pub use sqlite_dataset_repository::SqliteDatasetRepository;
pub use sqlite_job_definition_repository::SqliteJobDefinitionRepository;
pub use sqlite_run_repository::SqliteRunRepository;

use discovery_errors::{DiscoveryError, DiscoveryResult};

/// JSON 列以 TEXT 存储
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> DiscoveryResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| DiscoveryError::Serialization(format!("列 {column} 解析失败: {e}")))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
