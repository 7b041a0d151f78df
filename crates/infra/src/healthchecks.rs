//! Database health checks.

use serde::Serialize;

use crate::manager::JobManager;

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl HealthCheck {
    fn ok(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn failed(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Every check, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|check| check.ok)
    }
}

/// Check that the database answers and that the schema is installed.
pub async fn run_healthchecks(manager: &JobManager) -> HealthReport {
    let checks = match manager.check_connection().await {
        Ok(schema_present) => vec![
            HealthCheck::ok("connection", "database connection OK"),
            if schema_present {
                HealthCheck::ok("schema", "found procrastinate_jobs table")
            } else {
                HealthCheck::failed("schema", "procrastinate_jobs table not found")
            },
        ],
        Err(e) => vec![
            HealthCheck::failed("connection", e.to_string()),
            HealthCheck::failed("schema", "not checked"),
        ],
    };
    HealthReport { checks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::connector::{Connector, InMemoryConnector};

    #[tokio::test]
    async fn healthy_database() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.open().await.unwrap();
        let report = run_healthchecks(&JobManager::new(connector)).await;
        assert!(report.is_healthy());
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_database() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.open().await.unwrap();
        connector.set_unavailable(true);
        let report = run_healthchecks(&JobManager::new(connector)).await;
        assert!(!report.is_healthy());
        assert!(!report.checks[0].ok);
        assert_eq!(report.checks[0].name, "connection");
    }
}
