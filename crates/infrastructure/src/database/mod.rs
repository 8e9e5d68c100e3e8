pub mod manager;
pub mod schema;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabaseOptions};
pub use sqlite::{
    SqliteDataSourceRepository, SqliteDatasetRepository, SqliteJobDefinitionRepository,
    SqliteRunRepository,
};
