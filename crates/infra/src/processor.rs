//! Job processor: runs one job and records its outcome.
//!
//! ## Outcome Mapping
//!
//! | Task result | Retry policy says | Persisted as |
//! |---|---|---|
//! | `Ok(_)` | - | `finish_job(succeeded)` |
//! | `Err(Aborted)`, user request | - | `finish_job(aborted)` |
//! | `Err(Aborted)`, worker shutdown | retry | `retry_job` |
//! | `Err(Aborted)`, worker shutdown | stop | `finish_job(aborted)` |
//! | `Err(NotFound)` | - | `finish_job(failed)` |
//! | `Err(Failed)` | retry | `retry_job` |
//! | `Err(Failed)` | stop | `finish_job(failed)` |
//!
//! A retry refused because another job took the queueing lock leaves the
//! job `failed`, and the outcome becomes `Failed`.
//!
//! The outcome is written by a spawned task, so it still lands when the
//! processing future is dropped half-way.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use procrastinate_core::{
    Clock, DeleteJobCondition, Job, JobArgs, JobStatus, RetryDecision, TaskError, WorkerId,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::manager::{JobManager, ManagerError};
use crate::tasks::{AbortReason, AbortSignal, Blueprint, JobContext, Task, TaskResult};

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(TaskError),
    Aborted,
    /// Back to `todo`, to run again at `decision.retry_at`.
    Retried {
        error: TaskError,
        decision: RetryDecision,
    },
}

impl JobOutcome {
    /// Terminal status written, `None` when the job was retried.
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            JobOutcome::Succeeded(_) => Some(JobStatus::Succeeded),
            JobOutcome::Failed(_) => Some(JobStatus::Failed),
            JobOutcome::Aborted => Some(JobStatus::Aborted),
            JobOutcome::Retried { .. } => None,
        }
    }
}

/// Runs jobs against the task registry and persists their outcome.
#[derive(Debug, Clone)]
pub struct JobProcessor {
    manager: JobManager,
    registry: Arc<Blueprint>,
    clock: Arc<dyn Clock>,
    worker_name: String,
    worker_id: Option<WorkerId>,
    queues: Option<Vec<String>>,
    additional_context: Arc<JobArgs>,
    delete_jobs: DeleteJobCondition,
    unknown_tasks: Arc<Mutex<HashSet<String>>>,
}

impl JobProcessor {
    pub fn new(manager: JobManager, registry: Arc<Blueprint>, clock: Arc<dyn Clock>) -> Self {
        Self {
            manager,
            registry,
            clock,
            worker_name: "worker".to_string(),
            worker_id: None,
            queues: None,
            additional_context: Arc::new(JobArgs::new()),
            delete_jobs: DeleteJobCondition::Never,
            unknown_tasks: Arc::default(),
        }
    }

    pub fn with_worker(
        mut self,
        name: impl Into<String>,
        worker_id: Option<WorkerId>,
        queues: Option<Vec<String>>,
    ) -> Self {
        self.worker_name = name.into();
        self.worker_id = worker_id;
        self.queues = queues;
        self
    }

    pub fn with_additional_context(mut self, context: Arc<JobArgs>) -> Self {
        self.additional_context = context;
        self
    }

    pub fn with_delete_jobs(mut self, delete_jobs: DeleteJobCondition) -> Self {
        self.delete_jobs = delete_jobs;
        self
    }

    pub fn find_task(&self, name: &str) -> Option<&Task> {
        self.registry.get(name)
    }

    /// Run `job` (already `doing`) to completion and persist the outcome.
    pub async fn process(&self, job: Job, abort: AbortSignal) -> Result<JobOutcome, ManagerError> {
        let ctx = JobContext::new(job.clone(), self.clock.now())
            .with_worker(self.worker_name.clone(), self.worker_id, self.queues.clone())
            .with_additional_context(self.additional_context.clone())
            .with_abort_signal(abort.clone());
        let call_string = job.call_string();
        debug!(
            action = "loaded_job_info",
            job_id = %job.id,
            task_name = %job.task_name,
            queue = %job.queue,
            attempts = job.attempts,
            worker = %self.worker_name,
            "loaded job info, about to start job {call_string}"
        );

        let started = Instant::now();
        let task = self.find_task(&job.task_name).cloned();
        let result = match &task {
            Some(task) => {
                info!(
                    action = "start_job",
                    job_id = %job.id,
                    task_name = %job.task_name,
                    queue = %job.queue,
                    worker = %self.worker_name,
                    "starting job {call_string}"
                );
                run_task(task, ctx, job.task_kwargs.clone(), &abort).await
            }
            None => {
                self.log_task_not_found(&job);
                Err(TaskError::NotFound(job.task_name.clone()))
            }
        };
        let duration = started.elapsed().as_secs_f64();

        let outcome = self.classify(result, task.as_ref(), &job, abort.reason());
        log_outcome(&job, &outcome, duration);
        self.persist(&job, outcome).await
    }

    fn classify(
        &self,
        result: TaskResult,
        task: Option<&Task>,
        job: &Job,
        abort_reason: Option<AbortReason>,
    ) -> JobOutcome {
        let error = match result {
            Ok(value) => return JobOutcome::Succeeded(value),
            Err(error) => error,
        };
        let retryable = match &error {
            TaskError::NotFound(_) => false,
            TaskError::Aborted => abort_reason == Some(AbortReason::Shutdown),
            TaskError::Failed { .. } => true,
        };
        let decision = task
            .filter(|_| retryable)
            .and_then(Task::retry_policy)
            .and_then(|policy| policy.retry_decision(&error, job, self.clock.now()));
        match (error, decision) {
            (error, Some(decision)) => JobOutcome::Retried { error, decision },
            (TaskError::Aborted, None) => JobOutcome::Aborted,
            (error, None) => JobOutcome::Failed(error),
        }
    }

    async fn persist(&self, job: &Job, outcome: JobOutcome) -> Result<JobOutcome, ManagerError> {
        let manager = self.manager.clone();
        let job_id = job.id;
        let retry = match &outcome {
            JobOutcome::Retried { decision, .. } => Some(decision.clone()),
            _ => None,
        };
        let status = outcome.status();
        let delete_job = status.is_some_and(|status| self.delete_jobs.should_delete(status));

        let persisted = tokio::spawn(async move {
            match (retry, status) {
                (Some(decision), _) => manager.retry_job_by_id(job_id, decision).await.map(Some),
                (None, Some(status)) => manager
                    .finish_job_by_id(job_id, status, delete_job)
                    .await
                    .map(|()| None),
                (None, None) => Ok(None),
            }
        });
        let retried_as = match persisted.await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!(
                    action = "persist_job_status",
                    job_id = %job_id,
                    error = %e,
                    "job status persistence interrupted by runtime shutdown"
                );
                None
            }
        };
        Ok(match (outcome, retried_as) {
            (JobOutcome::Retried { error, .. }, Some(status)) if status != JobStatus::Todo => {
                JobOutcome::Failed(error)
            }
            (outcome, _) => outcome,
        })
    }

    fn log_task_not_found(&self, job: &Job) {
        let first_time = self
            .unknown_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.task_name.clone());
        if first_time {
            error!(
                action = "task_not_found",
                job_id = %job.id,
                task_name = %job.task_name,
                "task was not found: {}",
                job.task_name
            );
        } else {
            debug!(
                action = "task_not_found",
                job_id = %job.id,
                task_name = %job.task_name,
                "task was not found (already reported)"
            );
        }
    }
}

/// Async tasks are dropped at their next await point when an abort is
/// requested; blocking tasks keep running until they return.
async fn run_task(task: &Task, ctx: JobContext, args: JobArgs, abort: &AbortSignal) -> TaskResult {
    let run = task.run(ctx, args);
    if !task.is_async() {
        return run.await;
    }
    tokio::select! {
        biased;
        result = run => result,
        _ = abort.requested() => Err(TaskError::Aborted),
    }
}

fn log_outcome(job: &Job, outcome: &JobOutcome, duration: f64) {
    let call_string = job.call_string();
    match outcome {
        JobOutcome::Succeeded(result) => {
            let mut result = result.to_string();
            result.truncate(250);
            info!(
                action = "job_success",
                job_id = %job.id,
                task_name = %job.task_name,
                duration_secs = duration,
                result = %result,
                "job {call_string} ended with status: Success, lasted {duration:.3} s"
            );
        }
        JobOutcome::Aborted => info!(
            action = "job_aborted",
            job_id = %job.id,
            task_name = %job.task_name,
            duration_secs = duration,
            "job {call_string} ended with status: Aborted, lasted {duration:.3} s"
        ),
        JobOutcome::Retried {
            error: TaskError::Aborted,
            decision,
        } => info!(
            action = "job_aborted_retry",
            job_id = %job.id,
            task_name = %job.task_name,
            duration_secs = duration,
            retry_at = %decision.retry_at,
            "job {call_string} ended with status: Aborted, to retry, lasted {duration:.3} s"
        ),
        JobOutcome::Retried { error, decision } => info!(
            action = "job_error_retry",
            job_id = %job.id,
            task_name = %job.task_name,
            duration_secs = duration,
            error = %error,
            retry_at = %decision.retry_at,
            "job {call_string} ended with status: Error, to retry, lasted {duration:.3} s"
        ),
        JobOutcome::Failed(error) => error!(
            action = "job_error",
            job_id = %job.id,
            task_name = %job.task_name,
            duration_secs = duration,
            error = %error,
            error_kind = %error.kind(),
            "job {call_string} ended with status: Error, lasted {duration:.3} s"
        ),
    }
}
