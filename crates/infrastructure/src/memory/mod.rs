//! 进程内存储实现，对应 `memory://` 数据库地址，进程退出后数据丢失

mod data_source_repository;
mod dataset_repository;
mod job_definition_repository;
mod run_repository;

pub use data_source_repository::InMemoryDataSourceRepository;
pub use dataset_repository::InMemoryDatasetRepository;
pub use job_definition_repository::InMemoryJobDefinitionRepository;
pub use run_repository::InMemoryRunRepository;
