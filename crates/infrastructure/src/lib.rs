pub mod database;
pub mod in_memory_queue;
pub mod memory;
pub mod observability;

pub use database::{DatabaseManager, DatabaseOptions};
pub use in_memory_queue::InMemoryRunQueue;
pub use memory::{
    InMemoryDataSourceRepository, InMemoryDatasetRepository, InMemoryJobDefinitionRepository,
    InMemoryRunRepository,
};
pub use observability::{init_logging, init_metrics, MetricsCollector, StructuredLogger};
