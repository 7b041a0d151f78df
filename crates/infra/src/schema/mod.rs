//! Database schema and query catalog.

pub mod queries;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::connector::{Connector, ConnectorError};

/// Full DDL: enums, tables, indexes, functions and triggers.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Reads and installs the schema.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    connector: Arc<dyn Connector>,
}

impl SchemaManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn get_schema() -> &'static str {
        SCHEMA
    }

    /// Directory holding the SQL scripts of this build.
    pub fn get_migrations_path() -> &'static Path {
        Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/src/schema"))
    }

    /// Apply the schema in a single transaction. Fails if it is already
    /// installed.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), ConnectorError> {
        self.connector.execute_script(SCHEMA).await?;
        info!(action = "apply_schema", "schema applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::InMemoryConnector;

    #[test]
    fn schema_declares_lock_indexes() {
        let schema = SchemaManager::get_schema();
        assert!(schema.contains("CREATE UNIQUE INDEX procrastinate_jobs_queueing_lock_idx_v1"));
        assert!(schema.contains("CREATE UNIQUE INDEX procrastinate_jobs_lock_idx_v1"));
    }

    #[tokio::test]
    async fn apply_schema_runs_the_script() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.open().await.unwrap();
        let manager = SchemaManager::new(connector.clone());

        manager.apply_schema().await.unwrap();
        assert_eq!(connector.scripts_executed(), 1);
    }
}
