//! Errors produced while running a task.

use thiserror::Error;

/// Outcome of a task that did not return normally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task honoured an abort request.
    #[error("job aborted")]
    Aborted,

    /// No task is registered under the job's task name.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task failed. `kind` classifies the failure for retry filtering.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
}

impl TaskError {
    pub const DEFAULT_KIND: &'static str = "Error";

    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::failed(Self::DEFAULT_KIND, message)
    }

    /// Failure kind used by `retry_exceptions`.
    pub fn kind(&self) -> &str {
        match self {
            TaskError::Aborted => "JobAborted",
            TaskError::NotFound(_) => "TaskNotFound",
            TaskError::Failed { kind, .. } => kind,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Aborted)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => TaskError::message(format!("{err:#}")),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::failed("InvalidArguments", err.to_string())
    }
}
