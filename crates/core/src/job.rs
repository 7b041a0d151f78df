//! Job types and the status state machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::id::{JobId, WorkerId};

/// Task arguments. Always a JSON object.
pub type JobArgs = serde_json::Map<String, serde_json::Value>;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: i32 = 0;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a queue
    Todo,
    /// A worker is running the job
    Doing,
    Succeeded,
    Failed,
    /// Cancelled before a worker picked it up
    Cancelled,
    /// Stopped by the task after an abort request
    Aborted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Todo,
        JobStatus::Doing,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Aborted => "aborted",
        }
    }

    /// Terminal statuses are absorbing: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Aborted
        )
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Todo, JobStatus::Doing) => true,
            (JobStatus::Todo, JobStatus::Cancelled) => true,
            // retry and stalled-worker requeue
            (JobStatus::Doing, JobStatus::Todo) => true,
            (JobStatus::Doing, JobStatus::Succeeded)
            | (JobStatus::Doing, JobStatus::Failed)
            | (JobStatus::Doing, JobStatus::Aborted) => true,
            _ => false,
        }
    }

    /// Event written when a job enters this status through `finish_job`.
    pub fn finish_event(&self) -> Option<EventType> {
        match self {
            JobStatus::Succeeded => Some(EventType::Succeeded),
            JobStatus::Failed => Some(EventType::Failed),
            JobStatus::Cancelled => Some(EventType::Cancelled),
            JobStatus::Aborted => Some(EventType::Aborted),
            JobStatus::Todo | JobStatus::Doing => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown job status: {s}")))
    }
}

/// Audit event types, one per status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Deferred,
    Started,
    DeferredForRetry,
    Failed,
    Succeeded,
    Cancelled,
    AbortRequested,
    Aborted,
    Scheduled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Deferred => "deferred",
            EventType::Started => "started",
            EventType::DeferredForRetry => "deferred_for_retry",
            EventType::Failed => "failed",
            EventType::Succeeded => "succeeded",
            EventType::Cancelled => "cancelled",
            EventType::AbortRequested => "abort_requested",
            EventType::Aborted => "aborted",
            EventType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When finished jobs are removed from the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteJobCondition {
    /// Keep jobs after completion
    #[default]
    Never,
    /// Delete only jobs that succeeded
    Successful,
    /// Delete every job at completion
    Always,
}

impl DeleteJobCondition {
    pub fn should_delete(&self, status: JobStatus) -> bool {
        match self {
            DeleteJobCondition::Never => false,
            DeleteJobCondition::Successful => status == JobStatus::Succeeded,
            DeleteJobCondition::Always => true,
        }
    }
}

impl FromStr for DeleteJobCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "successful" => Ok(Self::Successful),
            "always" => Ok(Self::Always),
            other => Err(Error::validation(format!(
                "unknown delete condition {other:?} (expected never, successful or always)"
            ))),
        }
    }
}

/// A job that has not been deferred yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    pub queue: String,
    pub priority: i32,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub task_kwargs: JobArgs,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            lock: None,
            queueing_lock: None,
            task_kwargs: JobArgs::new(),
            scheduled_at: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.queueing_lock = Some(queueing_lock.into());
        self
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.task_kwargs = args;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.task_kwargs.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn call_string(&self) -> String {
        call_string(&self.task_name, None, &self.task_kwargs)
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub queue: String,
    pub priority: i32,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub task_name: String,
    pub task_kwargs: JobArgs,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub abort_requested: bool,
    pub worker_id: Option<WorkerId>,
}

impl Job {
    /// `task_name[id](key=value, ...)`, used in log messages.
    pub fn call_string(&self) -> String {
        call_string(&self.task_name, Some(self.id), &self.task_kwargs)
    }

    /// Structured fields for logs.
    pub fn log_context(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "queue": self.queue,
            "priority": self.priority,
            "lock": self.lock,
            "queueing_lock": self.queueing_lock,
            "task_name": self.task_name,
            "task_kwargs": self.task_kwargs,
            "scheduled_at": self.scheduled_at.map(|at| at.to_rfc3339()),
            "attempts": self.attempts,
            "call_string": self.call_string(),
        })
    }
}

fn call_string(task_name: &str, id: Option<JobId>, kwargs: &JobArgs) -> String {
    let args = kwargs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ");
    let id = id.map(|id| id.to_string()).unwrap_or_else(|| "None".to_string());
    format!("{task_name}[{id}]({args})")
}

/// Payload of every `NOTIFY` sent by the job procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    JobInserted { job_id: JobId },
    AbortJobRequested { job_id: JobId },
}

impl Notification {
    pub fn job_id(&self) -> JobId {
        match self {
            Notification::JobInserted { job_id } | Notification::AbortJobRequested { job_id } => {
                *job_id
            }
        }
    }
}

/// Per-status job counts for one queue, task or lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub name: String,
    pub jobs_count: i64,
    pub todo: i64,
    pub doing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub aborted: i64,
}

impl JobCounts {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, status: JobStatus, count: i64) {
        self.jobs_count += count;
        let slot = match status {
            JobStatus::Todo => &mut self.todo,
            JobStatus::Doing => &mut self.doing,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
            JobStatus::Aborted => &mut self.aborted,
        };
        *slot += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("aborting".parse::<JobStatus>().is_err());
    }

    #[test]
    fn delete_condition() {
        let cond: DeleteJobCondition = "successful".parse().unwrap();
        assert!(cond.should_delete(JobStatus::Succeeded));
        assert!(!cond.should_delete(JobStatus::Failed));
        assert!(DeleteJobCondition::Always.should_delete(JobStatus::Aborted));
        assert!(!DeleteJobCondition::default().should_delete(JobStatus::Succeeded));
        assert!("sometimes".parse::<DeleteJobCondition>().is_err());
    }

    #[test]
    fn call_string_lists_kwargs() {
        let job = NewJob::new("sums.add").with_arg("a", 5).with_arg("b", "x");
        assert_eq!(job.call_string(), r#"sums.add[None](a=5, b="x")"#);
    }

    #[test]
    fn notification_wire_format() {
        let n = Notification::AbortJobRequested { job_id: JobId::from_i64(7) };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"type":"abort_job_requested","job_id":7}"#);

        let parsed: Notification =
            serde_json::from_str(r#"{"type":"job_inserted","job_id":3}"#).unwrap();
        assert_eq!(parsed, Notification::JobInserted { job_id: JobId::from_i64(3) });
    }

    #[test]
    fn counts_accumulate() {
        let mut counts = JobCounts::new("default");
        counts.add(JobStatus::Todo, 2);
        counts.add(JobStatus::Failed, 1);
        assert_eq!(counts.jobs_count, 3);
        assert_eq!(counts.todo, 2);
        assert_eq!(counts.failed, 1);
    }
}
