//! Per-job execution context.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use procrastinate_core::{Job, JobArgs, TaskError, WorkerId};
use tokio_util::sync::CancellationToken;

/// Why a running job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// `cancel --abort` on the job.
    UserRequest,
    /// The worker is shutting down and stopped waiting.
    Shutdown,
}

/// Shared abort flag of one running job. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: AbortReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once an abort is requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }
}

/// What a task sees of the job it runs and of the worker running it.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    worker_name: String,
    worker_id: Option<WorkerId>,
    worker_queues: Option<Vec<String>>,
    additional_context: Arc<JobArgs>,
    start_timestamp: DateTime<Utc>,
    abort: AbortSignal,
}

impl JobContext {
    pub fn new(job: Job, start_timestamp: DateTime<Utc>) -> Self {
        Self {
            job,
            worker_name: "worker".to_string(),
            worker_id: None,
            worker_queues: None,
            additional_context: Arc::new(JobArgs::new()),
            start_timestamp,
            abort: AbortSignal::new(),
        }
    }

    pub fn with_worker(
        mut self,
        name: impl Into<String>,
        id: Option<WorkerId>,
        queues: Option<Vec<String>>,
    ) -> Self {
        self.worker_name = name.into();
        self.worker_id = id;
        self.worker_queues = queues;
        self
    }

    pub fn with_additional_context(mut self, context: Arc<JobArgs>) -> Self {
        self.additional_context = context;
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    /// Queues the worker listens to (`None` = all).
    pub fn worker_queues(&self) -> Option<&[String]> {
        self.worker_queues.as_deref()
    }

    /// User-supplied values shared by every job of the worker.
    pub fn additional_context(&self) -> &JobArgs {
        &self.additional_context
    }

    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.start_timestamp
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// True once an abort was requested for this job, by a user or by the
    /// worker shutting down.
    pub fn should_abort(&self) -> bool {
        self.abort.is_requested()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort.reason()
    }

    /// `Err(TaskError::Aborted)` if the task should stop. Blocking tasks call
    /// this between units of work.
    pub fn check_abort(&self) -> Result<(), TaskError> {
        if self.should_abort() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("task_name", &self.job.task_name)
            .field("worker_name", &self.worker_name)
            .field("worker_id", &self.worker_id)
            .field("abort_reason", &self.abort.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procrastinate_core::{JobId, JobStatus};

    fn job() -> Job {
        Job {
            id: JobId::from_i64(4),
            status: JobStatus::Doing,
            queue: "default".into(),
            priority: 0,
            lock: None,
            queueing_lock: None,
            task_name: "t".into(),
            task_kwargs: JobArgs::new(),
            scheduled_at: None,
            attempts: 0,
            abort_requested: false,
            worker_id: None,
        }
    }

    #[test]
    fn first_abort_reason_wins() {
        let signal = AbortSignal::new();
        assert!(!signal.is_requested());
        signal.request(AbortReason::UserRequest);
        signal.request(AbortReason::Shutdown);
        assert!(signal.is_requested());
        assert_eq!(signal.reason(), Some(AbortReason::UserRequest));
    }

    #[tokio::test]
    async fn context_observes_shared_signal() {
        let signal = AbortSignal::new();
        let ctx = JobContext::new(job(), Utc::now()).with_abort_signal(signal.clone());
        assert!(ctx.check_abort().is_ok());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.abort_signal().requested().await })
        };
        signal.request(AbortReason::Shutdown);
        waiter.await.unwrap();

        assert!(ctx.should_abort());
        assert_eq!(ctx.abort_reason(), Some(AbortReason::Shutdown));
        assert_eq!(ctx.check_abort(), Err(TaskError::Aborted));
    }
}
