//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type Result<T> = core::result::Result<T, Error>;

/// Domain-level error.
///
/// Deterministic failures that do not involve the database: bad input,
/// registry conflicts, scheduling mistakes. Connector and query failures
/// live in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A task name (or alias) is already present in the registry.
    #[error("task already registered: {0}")]
    TaskAlreadyRegistered(String),

    /// No task is registered under this name.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task belongs to a blueprint that was never added to an app.
    #[error("task {0} is not bound to an app; add its blueprint with add_tasks_from")]
    UnboundTask(String),

    /// A periodic defer was attempted with a `timestamp` argument that does
    /// not match the defer timestamp.
    #[error("periodic job timestamp argument does not match defer timestamp {0}")]
    InvalidTimestamp(i64),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn task_already_registered(name: impl Into<String>) -> Self {
        Self::TaskAlreadyRegistered(name.into())
    }

    pub fn task_not_found(name: impl Into<String>) -> Self {
        Self::TaskNotFound(name.into())
    }

    pub fn unbound_task(name: impl Into<String>) -> Self {
        Self::UnboundTask(name.into())
    }

    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}
