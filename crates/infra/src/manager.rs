//! Job manager: typed operations over the query catalog.
//!
//! ## Design
//!
//! - Every operation is a single statement (or stored procedure call), so
//!   concurrent workers observe serialisable outcomes
//! - Rows are decoded into `procrastinate_core` types here; nothing above
//!   this layer sees SQL or raw rows
//! - Database errors with a meaning for callers are classified:
//!   - unique violation on the queueing lock index -> `AlreadyEnqueued`
//!   - unique violation on the lock index during fetch -> fetch again
//!   - `P0002` from finish/retry -> `JobNotFound`

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use procrastinate_core::{
    Error as DomainError, Job, JobArgs, JobCounts, JobId, JobStatus, NewJob, Notification,
    RetryDecision, WorkerId,
};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::connector::{
    Connector, ConnectorError, NO_DATA_FOUND, NotificationHandler, Row, SqlValue,
    channels_for_queues,
};
use crate::schema::queries;

/// Unique index guaranteeing one waiting job per queueing lock.
pub const QUEUEING_LOCK_CONSTRAINT: &str = "procrastinate_jobs_queueing_lock_idx_v1";

/// Unique index guaranteeing one running job per lock.
pub const LOCK_CONSTRAINT: &str = "procrastinate_jobs_lock_idx_v1";

/// Job manager error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Another job with the same queueing lock is already waiting.
    #[error("job cannot be deferred: a job with queueing lock {queueing_lock:?} is already waiting")]
    AlreadyEnqueued { queueing_lock: Option<String> },

    /// The job does not exist, or is not in the status the operation needs.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A statement that always returns a row returned none.
    #[error("{0} returned no row")]
    NoResult(&'static str),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl ManagerError {
    pub fn is_already_enqueued(&self) -> bool {
        matches!(self, ManagerError::AlreadyEnqueued { .. })
    }
}

/// Filters for the listing operations. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub queue: Option<String>,
    pub task: Option<String>,
    pub status: Option<JobStatus>,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
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

    fn count_params(&self) -> Vec<SqlValue> {
        vec![
            self.queue.clone().into(),
            self.task.clone().into(),
            self.status.map(|s| s.as_str()).into(),
            self.lock.clone().into(),
        ]
    }
}

/// Which finished jobs `delete_old_jobs` removes. Succeeded jobs always
/// qualify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OldJobs {
    pub include_failed: bool,
    pub include_cancelled: bool,
    pub include_aborted: bool,
}

impl OldJobs {
    fn statuses(&self) -> Vec<String> {
        [
            (true, JobStatus::Succeeded),
            (self.include_failed, JobStatus::Failed),
            (self.include_cancelled, JobStatus::Cancelled),
            (self.include_aborted, JobStatus::Aborted),
        ]
        .into_iter()
        .filter(|(included, _)| *included)
        .map(|(_, status)| status.as_str().to_string())
        .collect()
    }
}

/// Typed access to the job tables.
#[derive(Debug, Clone)]
pub struct JobManager {
    connector: Arc<dyn Connector>,
}

impl JobManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Insert a `todo` job. Fails with `AlreadyEnqueued` when its queueing
    /// lock is held by another waiting job.
    #[instrument(skip(self, job), fields(task_name = %job.task_name, queue = %job.queue), err)]
    pub async fn defer_job(&self, job: &NewJob) -> Result<JobId, ManagerError> {
        let params: Vec<SqlValue> = vec![
            job.queue.as_str().into(),
            job.task_name.as_str().into(),
            job.priority.into(),
            job.lock.clone().into(),
            job.queueing_lock.clone().into(),
            Value::Object(job.task_kwargs.clone()).into(),
            job.scheduled_at.into(),
        ];
        let row = self
            .connector
            .fetch_one(&queries::DEFER_JOB, &params)
            .await
            .map_err(|e| already_enqueued(e, job))?
            .ok_or(ManagerError::NoResult(queries::DEFER_JOB.name))?;
        let id = JobId::from_i64(row.get("id")?);
        info!(
            action = "defer_job",
            job_id = %id,
            call_string = %job.call_string(),
            "job deferred"
        );
        Ok(id)
    }

    /// Defer one tick of a periodic task. Returns `None` when this
    /// `(task, periodic_id, defer_timestamp)` was already deferred.
    ///
    /// The job's `timestamp` argument must equal `defer_timestamp`.
    #[instrument(skip(self, job), fields(task_name = %job.task_name), err)]
    pub async fn defer_periodic_job(
        &self,
        job: &NewJob,
        periodic_id: &str,
        defer_timestamp: i64,
    ) -> Result<Option<JobId>, ManagerError> {
        if job.task_kwargs.get("timestamp").and_then(Value::as_i64) != Some(defer_timestamp) {
            return Err(DomainError::InvalidTimestamp(defer_timestamp).into());
        }
        let params: Vec<SqlValue> = vec![
            job.queue.as_str().into(),
            job.lock.clone().into(),
            job.queueing_lock.clone().into(),
            job.task_name.as_str().into(),
            job.priority.into(),
            periodic_id.into(),
            defer_timestamp.into(),
            Value::Object(job.task_kwargs.clone()).into(),
        ];
        let row = self
            .connector
            .fetch_one(&queries::DEFER_PERIODIC_JOB, &params)
            .await
            .map_err(|e| already_enqueued(e, job))?
            .ok_or(ManagerError::NoResult(queries::DEFER_PERIODIC_JOB.name))?;
        let id: Option<i64> = row.get("id")?;
        Ok(id.map(JobId::from_i64))
    }

    /// Claim the next eligible job, moving it to `doing`.
    ///
    /// A lost race for a lock (the lock index rejecting the update) means
    /// another worker just claimed a job with that lock; the fetch runs
    /// again, which now skips that lock.
    #[instrument(skip(self), err)]
    pub async fn fetch_job(
        &self,
        queues: Option<&[String]>,
        worker_id: Option<WorkerId>,
    ) -> Result<Option<Job>, ManagerError> {
        let params: Vec<SqlValue> = vec![
            queues.map(<[String]>::to_vec).into(),
            worker_id.map(|id| id.as_i64()).into(),
        ];
        let row = loop {
            match self.connector.fetch_one(&queries::FETCH_JOB, &params).await {
                Ok(row) => break row,
                Err(e) if e.constraint_name() == Some(LOCK_CONSTRAINT) => {
                    debug!(action = "fetch_job_lock_conflict", "lost a lock race, fetching again");
                }
                Err(e) => return Err(e.into()),
            }
        };
        match row {
            Some(row) if !row.is_null("id") => Ok(Some(job_from_row(&row)?)),
            _ => Ok(None),
        }
    }

    pub async fn finish_job(
        &self,
        job: &Job,
        status: JobStatus,
        delete_job: bool,
    ) -> Result<(), ManagerError> {
        self.finish_job_by_id(job.id, status, delete_job).await
    }

    /// Move a running job to a terminal status, optionally deleting it.
    #[instrument(skip(self), fields(job_id = %job_id, status = %status), err)]
    pub async fn finish_job_by_id(
        &self,
        job_id: JobId,
        status: JobStatus,
        delete_job: bool,
    ) -> Result<(), ManagerError> {
        let params: Vec<SqlValue> = vec![job_id.as_i64().into(), status.as_str().into(), delete_job.into()];
        self.connector
            .execute(&queries::FINISH_JOB, &params)
            .await
            .map_err(|e| not_found(e, job_id))?;
        Ok(())
    }

    pub async fn retry_job(
        &self,
        job: &Job,
        decision: RetryDecision,
    ) -> Result<JobStatus, ManagerError> {
        self.retry_job_by_id(job.id, decision).await
    }

    /// Put a running job back in `todo`, scheduled at `decision.retry_at`,
    /// and return its new status.
    ///
    /// When another job took the queueing lock while this one ran, the job
    /// cannot wait again: it ends `failed` instead.
    #[instrument(skip(self, decision), fields(job_id = %job_id, retry_at = %decision.retry_at), err)]
    pub async fn retry_job_by_id(
        &self,
        job_id: JobId,
        decision: RetryDecision,
    ) -> Result<JobStatus, ManagerError> {
        let params: Vec<SqlValue> = vec![
            job_id.as_i64().into(),
            decision.retry_at.into(),
            decision.priority.into(),
            decision.queue.into(),
            decision.lock.into(),
        ];
        let row = self
            .connector
            .fetch_one(&queries::RETRY_JOB, &params)
            .await
            .map_err(|e| not_found(e, job_id))?
            .ok_or(ManagerError::NoResult(queries::RETRY_JOB.name))?;
        let status = parse_status(&row)?;
        if status != JobStatus::Todo {
            warn!(
                action = "retry_job_queueing_lock_taken",
                job_id = %job_id,
                status = %status,
                "job not retried, its queueing lock is taken by a waiting job"
            );
        }
        Ok(status)
    }

    /// Cancel a waiting job (or delete it), or request abort of a running
    /// one. Returns whether anything changed.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn cancel_job_by_id(
        &self,
        job_id: JobId,
        abort: bool,
        delete_job: bool,
    ) -> Result<bool, ManagerError> {
        let params: Vec<SqlValue> = vec![job_id.as_i64().into(), abort.into(), delete_job.into()];
        let row = self
            .connector
            .fetch_one(&queries::CANCEL_JOB, &params)
            .await?
            .ok_or(ManagerError::NoResult(queries::CANCEL_JOB.name))?;
        let cancelled = !row.is_null("id");
        if cancelled {
            info!(action = "cancel_job", job_id = %job_id, abort, "job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatus, ManagerError> {
        let row = self
            .connector
            .fetch_one(&queries::GET_JOB_STATUS, &[job_id.as_i64().into()])
            .await?
            .ok_or(ManagerError::JobNotFound(job_id))?;
        parse_status(&row)
    }

    /// Whether the database is reachable and the schema is installed.
    pub async fn check_connection(&self) -> Result<bool, ManagerError> {
        let row = self
            .connector
            .fetch_one(&queries::CHECK_CONNECTION, &[])
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, ManagerError> {
        let params: Vec<SqlValue> = vec![
            filter.id.map(|id| id.as_i64()).into(),
            filter.queue.clone().into(),
            filter.task.clone().into(),
            filter.status.map(|s| s.as_str()).into(),
            filter.lock.clone().into(),
            filter.queueing_lock.clone().into(),
        ];
        let rows = self.connector.fetch_all(&queries::LIST_JOBS, &params).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn list_queues(&self, filter: &JobFilter) -> Result<Vec<JobCounts>, ManagerError> {
        self.list_counts(&queries::LIST_QUEUES, filter).await
    }

    pub async fn list_tasks(&self, filter: &JobFilter) -> Result<Vec<JobCounts>, ManagerError> {
        self.list_counts(&queries::LIST_TASKS, filter).await
    }

    pub async fn list_locks(&self, filter: &JobFilter) -> Result<Vec<JobCounts>, ManagerError> {
        self.list_counts(&queries::LIST_LOCKS, filter).await
    }

    async fn list_counts(
        &self,
        query: &queries::Query,
        filter: &JobFilter,
    ) -> Result<Vec<JobCounts>, ManagerError> {
        let rows = self.connector.fetch_all(query, &filter.count_params()).await?;
        let mut counts: BTreeMap<String, JobCounts> = BTreeMap::new();
        for row in rows {
            let name: String = row.get("name")?;
            let status = parse_status(&row)?;
            let count: i64 = row.get("count")?;
            counts
                .entry(name.clone())
                .or_insert_with(|| JobCounts::new(name))
                .add(status, count);
        }
        Ok(counts.into_values().collect())
    }

    /// Running jobs with a pending abort request.
    pub async fn list_jobs_to_abort(&self, queue: Option<&str>) -> Result<Vec<JobId>, ManagerError> {
        let rows = self
            .connector
            .fetch_all(&queries::LIST_JOBS_TO_ABORT, &[queue.into()])
            .await?;
        rows.iter()
            .map(|row| Ok(JobId::from_i64(row.get("id")?)))
            .collect()
    }

    /// Delete finished jobs whose last event is older than `nb_hours`.
    #[instrument(skip(self), err)]
    pub async fn delete_old_jobs(
        &self,
        nb_hours: i32,
        queue: Option<&str>,
        which: OldJobs,
    ) -> Result<u64, ManagerError> {
        let params: Vec<SqlValue> = vec![nb_hours.into(), queue.into(), which.statuses().into()];
        let row = self
            .connector
            .fetch_one(&queries::DELETE_OLD_JOBS, &params)
            .await?
            .ok_or(ManagerError::NoResult(queries::DELETE_OLD_JOBS.name))?;
        let deleted: i64 = row.get("deleted")?;
        info!(action = "delete_old_jobs", deleted, nb_hours, "old jobs deleted");
        Ok(u64::try_from(deleted).unwrap_or_default())
    }

    /// Running jobs whose `started` event is older than `seconds`.
    pub async fn get_stalled_jobs_by_started(
        &self,
        seconds: f64,
        queue: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<Vec<Job>, ManagerError> {
        self.stalled_jobs(&queries::SELECT_STALLED_JOBS_BY_STARTED, seconds, queue, task_name)
            .await
    }

    /// Running jobs whose heartbeat is older than `seconds`.
    pub async fn get_stalled_jobs_by_heartbeat(
        &self,
        seconds: f64,
        queue: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<Vec<Job>, ManagerError> {
        self.stalled_jobs(&queries::SELECT_STALLED_JOBS_BY_HEARTBEAT, seconds, queue, task_name)
            .await
    }

    async fn stalled_jobs(
        &self,
        query: &queries::Query,
        seconds: f64,
        queue: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<Vec<Job>, ManagerError> {
        let params: Vec<SqlValue> = vec![seconds.into(), queue.into(), task_name.into()];
        let rows = self.connector.fetch_all(query, &params).await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn register_worker(&self) -> Result<WorkerId, ManagerError> {
        let row = self
            .connector
            .fetch_one(&queries::REGISTER_WORKER, &[])
            .await?
            .ok_or(ManagerError::NoResult(queries::REGISTER_WORKER.name))?;
        Ok(WorkerId::from_i64(row.get("worker_id")?))
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    pub async fn unregister_worker(&self, worker_id: WorkerId) -> Result<(), ManagerError> {
        self.connector
            .execute(&queries::UNREGISTER_WORKER, &[worker_id.as_i64().into()])
            .await?;
        Ok(())
    }

    pub async fn update_heartbeat(&self, worker_id: WorkerId) -> Result<(), ManagerError> {
        self.connector
            .execute(&queries::UPDATE_HEARTBEAT, &[worker_id.as_i64().into()])
            .await?;
        Ok(())
    }

    /// Delete workers silent for more than `seconds` and requeue their
    /// running jobs without consuming an attempt.
    ///
    /// Orphans that cannot wait again end instead: `aborted` when an abort
    /// was requested, `failed` when their queueing lock is taken.
    #[instrument(skip(self), err)]
    pub async fn prune_stalled_workers(&self, seconds: f64) -> Result<Vec<WorkerId>, ManagerError> {
        let rows = self
            .connector
            .fetch_all(&queries::PRUNE_STALLED_WORKERS, &[seconds.into()])
            .await?;
        let pruned = rows
            .iter()
            .map(|row| Ok(WorkerId::from_i64(row.get("worker_id")?)))
            .collect::<Result<Vec<_>, ManagerError>>()?;
        if !pruned.is_empty() {
            warn!(action = "prune_stalled_workers", pruned = ?pruned, "pruned stalled workers");
        }
        Ok(pruned)
    }

    /// Listen on the channels of `queues` and set `event` on every
    /// notification. Runs until dropped.
    pub async fn listen_for_jobs(
        &self,
        queues: Option<&[String]>,
        event: Arc<Notify>,
    ) -> Result<(), ManagerError> {
        self.listen_for_notifications(
            queues,
            Arc::new(move |_: Notification| {
                event.notify_one();
            }),
        )
        .await
    }

    /// Listen on the channels of `queues` and pass each decoded notification
    /// to `on_notification`. Undecodable payloads are logged and dropped.
    pub async fn listen_for_notifications(
        &self,
        queues: Option<&[String]>,
        on_notification: Arc<dyn Fn(Notification) + Send + Sync>,
    ) -> Result<(), ManagerError> {
        let channels = channels_for_queues(queues);
        let handler: NotificationHandler = Arc::new(move |channel: String, payload: String| {
            match serde_json::from_str::<Notification>(&payload) {
                Ok(notification) => on_notification(notification),
                Err(e) => warn!(
                    action = "invalid_notification",
                    channel = %channel,
                    payload = %payload,
                    error = %e,
                    "ignoring notification with unexpected payload"
                ),
            }
            async {}.boxed()
        });
        self.connector.listen(&channels, handler).await?;
        Ok(())
    }
}

fn already_enqueued(err: ConnectorError, job: &NewJob) -> ManagerError {
    if err.constraint_name() == Some(QUEUEING_LOCK_CONSTRAINT) {
        ManagerError::AlreadyEnqueued {
            queueing_lock: job.queueing_lock.clone(),
        }
    } else {
        err.into()
    }
}

fn not_found(err: ConnectorError, job_id: JobId) -> ManagerError {
    if err.code() == Some(NO_DATA_FOUND) {
        ManagerError::JobNotFound(job_id)
    } else {
        err.into()
    }
}

fn parse_status(row: &Row) -> Result<JobStatus, ManagerError> {
    let status: String = row.get("status")?;
    Ok(status.parse::<JobStatus>()?)
}

fn job_from_row(row: &Row) -> Result<Job, ManagerError> {
    let task_kwargs = match row.get::<Option<Value>>("args")? {
        None => JobArgs::new(),
        Some(Value::Object(args)) => args,
        Some(other) => {
            return Err(DomainError::validation(format!("job args must be an object, got {other}")).into());
        }
    };
    Ok(Job {
        id: JobId::from_i64(row.get("id")?),
        status: parse_status(row)?,
        queue: row.get("queue_name")?,
        priority: row.get("priority")?,
        lock: row.get("lock")?,
        queueing_lock: row.get("queueing_lock")?,
        task_name: row.get("task_name")?,
        task_kwargs,
        scheduled_at: row.get::<Option<DateTime<Utc>>>("scheduled_at")?,
        attempts: row.get("attempts")?,
        abort_requested: row.get("abort_requested")?,
        worker_id: row.get::<Option<i64>>("worker_id")?.map(WorkerId::from_i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::InMemoryConnector;
    use chrono::{Duration, TimeZone};
    use procrastinate_core::{Clock, EventType, ManualClock};
    use proptest::prelude::*;
    use std::collections::HashMap;

    async fn manager() -> (JobManager, InMemoryConnector) {
        let connector = InMemoryConnector::new();
        connector.open().await.unwrap();
        (JobManager::new(Arc::new(connector.clone())), connector)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn defer_then_fetch_then_finish() {
        let (manager, connector) = manager().await;
        let id = manager
            .defer_job(&NewJob::new("sum").with_arg("a", 5).with_arg("b", 7))
            .await
            .unwrap();

        let worker = manager.register_worker().await.unwrap();
        let job = manager.fetch_job(None, Some(worker)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Doing);
        assert_eq!(job.worker_id, Some(worker));
        assert_eq!(job.task_kwargs["a"], 5);

        manager.finish_job(&job, JobStatus::Succeeded, false).await.unwrap();
        assert_eq!(manager.get_job_status(id).await.unwrap(), JobStatus::Succeeded);
        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(
            connector.events(id.as_i64()),
            vec![EventType::Deferred, EventType::Started, EventType::Succeeded]
        );
    }

    #[tokio::test]
    async fn fetch_on_empty_queue_returns_none() {
        let (manager, _) = manager().await;
        assert!(manager.fetch_job(None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_filters_by_queue() {
        let (manager, _) = manager().await;
        manager.defer_job(&NewJob::new("a").with_queue("emails")).await.unwrap();
        let other = vec!["reports".to_string()];
        assert!(manager.fetch_job(Some(&other), None).await.unwrap().is_none());
        let emails = vec!["emails".to_string()];
        assert!(manager.fetch_job(Some(&emails), None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduled_jobs_wait_for_their_time() {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));

        let id = manager
            .defer_job(&NewJob::new("later").scheduled_at(start() + Duration::minutes(5)))
            .await
            .unwrap();
        assert!(manager.fetch_job(None, None).await.unwrap().is_none());
        assert_eq!(
            connector.events(id.as_i64()),
            vec![EventType::Deferred, EventType::Scheduled]
        );

        clock.advance(Duration::minutes(5));
        assert_eq!(manager.fetch_job(None, None).await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn queueing_lock_collision_is_already_enqueued() {
        let (manager, _) = manager().await;
        let job = NewJob::new("report").with_queueing_lock("q1");
        manager.defer_job(&job).await.unwrap();

        let err = manager.defer_job(&job).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::AlreadyEnqueued { queueing_lock: Some(ref q) } if q == "q1"
        ));

        // once the first one runs, the lock is free again
        let running = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager.finish_job(&running, JobStatus::Succeeded, false).await.unwrap();
        manager.defer_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn lock_serialises_running_jobs() {
        let (manager, _) = manager().await;
        let first = manager.defer_job(&NewJob::new("a").with_lock("L")).await.unwrap();
        let second = manager.defer_job(&NewJob::new("b").with_lock("L")).await.unwrap();

        let running = manager.fetch_job(None, None).await.unwrap().unwrap();
        assert_eq!(running.id, first);
        assert!(manager.fetch_job(None, None).await.unwrap().is_none());

        manager.finish_job(&running, JobStatus::Failed, false).await.unwrap();
        assert_eq!(manager.fetch_job(None, None).await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn retry_requeues_with_more_attempts() {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));

        let id = manager.defer_job(&NewJob::new("flaky")).await.unwrap();
        let job = manager.fetch_job(None, None).await.unwrap().unwrap();
        let retry_at = start() + Duration::seconds(30);
        manager
            .retry_job(&job, RetryDecision::at(retry_at).with_queue("slow").with_priority(3))
            .await
            .unwrap();

        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.status, JobStatus::Todo);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.scheduled_at, Some(retry_at));
        assert_eq!(stored.queue_name, "slow");
        assert_eq!(stored.priority, 3);
        assert!(connector.events(id.as_i64()).contains(&EventType::DeferredForRetry));
        assert!(
            connector
                .notifications()
                .iter()
                .any(|(channel, _)| channel == "procrastinate_queue#slow")
        );
    }

    #[tokio::test]
    async fn finishing_a_job_that_is_not_running_is_not_found() {
        let (manager, _) = manager().await;
        let id = manager.defer_job(&NewJob::new("a")).await.unwrap();
        let err = manager
            .finish_job_by_id(id, JobStatus::Succeeded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::JobNotFound(found) if found == id));

        let err = manager
            .retry_job_by_id(JobId::from_i64(999), RetryDecision::at(start()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn finish_with_delete_removes_the_row() {
        let (manager, connector) = manager().await;
        let id = manager.defer_job(&NewJob::new("a")).await.unwrap();
        let job = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager.finish_job(&job, JobStatus::Succeeded, true).await.unwrap();
        assert!(connector.job(id.as_i64()).is_none());
        assert!(matches!(
            manager.get_job_status(id).await,
            Err(ManagerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_todo_and_abort_doing() {
        let (manager, connector) = manager().await;
        let waiting = manager.defer_job(&NewJob::new("a")).await.unwrap();
        let running_id = manager.defer_job(&NewJob::new("b")).await.unwrap();

        assert!(manager.cancel_job_by_id(waiting, false, false).await.unwrap());
        assert_eq!(manager.get_job_status(waiting).await.unwrap(), JobStatus::Cancelled);

        let running = manager.fetch_job(None, None).await.unwrap().unwrap();
        assert_eq!(running.id, running_id);
        // a running job can only be aborted, not cancelled
        assert!(!manager.cancel_job_by_id(running_id, false, false).await.unwrap());
        assert!(manager.cancel_job_by_id(running_id, true, false).await.unwrap());

        assert_eq!(manager.list_jobs_to_abort(None).await.unwrap(), vec![running_id]);
        let abort_payload = r#"{"type":"abort_job_requested","job_id":2}"#;
        assert!(
            connector
                .notifications()
                .iter()
                .any(|(channel, payload)| channel == "procrastinate_any_queue"
                    && payload == abort_payload)
        );

        // cancelled jobs stay cancelled
        assert!(!manager.cancel_job_by_id(waiting, true, false).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_with_delete_removes_waiting_job() {
        let (manager, connector) = manager().await;
        let id = manager.defer_job(&NewJob::new("a")).await.unwrap();
        assert!(manager.cancel_job_by_id(id, false, true).await.unwrap());
        assert!(connector.job(id.as_i64()).is_none());
    }

    #[tokio::test]
    async fn periodic_defer_is_idempotent_per_tick() {
        let (manager, connector) = manager().await;
        let job = NewJob::new("tick").with_arg("timestamp", 1_700_000_000);

        let first = manager.defer_periodic_job(&job, "", 1_700_000_000).await.unwrap();
        assert!(first.is_some());
        let again = manager.defer_periodic_job(&job, "", 1_700_000_000).await.unwrap();
        assert!(again.is_none());

        // another periodic id is an independent schedule
        assert!(manager
            .defer_periodic_job(&job, "other", 1_700_000_000)
            .await
            .unwrap()
            .is_some());
        assert_eq!(connector.periodic_defers().len(), 2);
    }

    #[tokio::test]
    async fn periodic_defer_checks_timestamp_argument() {
        let (manager, _) = manager().await;
        let job = NewJob::new("tick").with_arg("timestamp", 1);
        let err = manager.defer_periodic_job(&job, "", 2).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Domain(DomainError::InvalidTimestamp(2))
        ));
    }

    #[tokio::test]
    async fn counts_group_by_name() {
        let (manager, _) = manager().await;
        manager.defer_job(&NewJob::new("a").with_queue("q1").with_lock("L")).await.unwrap();
        manager.defer_job(&NewJob::new("a").with_queue("q1")).await.unwrap();
        manager.defer_job(&NewJob::new("b").with_queue("q2")).await.unwrap();
        let job = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager.finish_job(&job, JobStatus::Failed, false).await.unwrap();

        let queues = manager.list_queues(&JobFilter::new()).await.unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].name, "q1");
        assert_eq!((queues[0].jobs_count, queues[0].todo, queues[0].failed), (2, 1, 1));

        let tasks = manager
            .list_tasks(&JobFilter::new().with_status(JobStatus::Todo))
            .await
            .unwrap();
        assert_eq!(
            tasks.iter().map(|t| (t.name.as_str(), t.todo)).collect::<Vec<_>>(),
            vec![("a", 1), ("b", 1)]
        );

        let locks = manager.list_locks(&JobFilter::new()).await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].name, "L");

        let jobs = manager
            .list_jobs(&JobFilter::new().with_task("a").with_status(JobStatus::Todo))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, "q1");
    }

    #[tokio::test]
    async fn delete_old_jobs_respects_age_and_status() {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));

        for task in ["ok", "ko"] {
            manager.defer_job(&NewJob::new(task)).await.unwrap();
        }
        let ok = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager.finish_job(&ok, JobStatus::Succeeded, false).await.unwrap();
        let ko = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager.finish_job(&ko, JobStatus::Failed, false).await.unwrap();

        assert_eq!(manager.delete_old_jobs(1, None, OldJobs::default()).await.unwrap(), 0);
        clock.advance(Duration::hours(2));
        assert_eq!(manager.delete_old_jobs(1, None, OldJobs::default()).await.unwrap(), 1);
        let which = OldJobs {
            include_failed: true,
            ..OldJobs::default()
        };
        assert_eq!(manager.delete_old_jobs(1, None, which).await.unwrap(), 1);
        assert!(connector.jobs().is_empty());
    }

    #[tokio::test]
    async fn stalled_jobs_by_started_and_heartbeat() {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));

        let worker = manager.register_worker().await.unwrap();
        manager.defer_job(&NewJob::new("slow")).await.unwrap();
        manager.fetch_job(None, Some(worker)).await.unwrap().unwrap();

        clock.advance(Duration::seconds(60));
        assert_eq!(manager.get_stalled_jobs_by_started(30.0, None, None).await.unwrap().len(), 1);
        assert!(manager
            .get_stalled_jobs_by_started(30.0, None, Some("other"))
            .await
            .unwrap()
            .is_empty());

        manager.update_heartbeat(worker).await.unwrap();
        assert!(manager
            .get_stalled_jobs_by_heartbeat(30.0, None, None)
            .await
            .unwrap()
            .is_empty());
        clock.advance(Duration::seconds(60));
        assert_eq!(manager.get_stalled_jobs_by_heartbeat(30.0, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pruning_stalled_workers_requeues_their_jobs() {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));

        let dead = manager.register_worker().await.unwrap();
        let id = manager.defer_job(&NewJob::new("orphan")).await.unwrap();
        manager.fetch_job(None, Some(dead)).await.unwrap().unwrap();

        clock.advance(Duration::seconds(120));
        let alive = manager.register_worker().await.unwrap();

        let pruned = manager.prune_stalled_workers(30.0).await.unwrap();
        assert_eq!(pruned, vec![dead]);
        assert_eq!(connector.worker_ids(), vec![alive.as_i64()]);

        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.status, JobStatus::Todo);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.worker_id, None);
        assert_eq!(
            connector.events(id.as_i64()).last(),
            Some(&EventType::DeferredForRetry)
        );
    }

    async fn stalled_worker_with_running_jobs(
        jobs: &[NewJob],
    ) -> (JobManager, InMemoryConnector, ManualClock, WorkerId, Vec<JobId>) {
        let clock = ManualClock::new(start());
        let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
        connector.open().await.unwrap();
        let manager = JobManager::new(Arc::new(connector.clone()));
        let dead = manager.register_worker().await.unwrap();
        let mut ids = Vec::new();
        for job in jobs {
            ids.push(manager.defer_job(job).await.unwrap());
            manager.fetch_job(None, Some(dead)).await.unwrap().unwrap();
        }
        (manager, connector, clock, dead, ids)
    }

    #[tokio::test]
    async fn pruning_ends_orphans_with_abort_requested_as_aborted() {
        let (manager, connector, clock, dead, ids) =
            stalled_worker_with_running_jobs(&[NewJob::new("orphan")]).await;
        assert!(manager.cancel_job_by_id(ids[0], true, false).await.unwrap());

        clock.advance(Duration::seconds(120));
        let pruned = manager.prune_stalled_workers(30.0).await.unwrap();

        assert_eq!(pruned, vec![dead]);
        assert!(connector.worker_ids().is_empty());
        let stored = connector.job(ids[0].as_i64()).unwrap();
        assert_eq!(stored.status, JobStatus::Aborted);
        assert!(!stored.abort_requested);
        assert_eq!(stored.attempts, 1);
        assert_eq!(connector.events(ids[0].as_i64()).last(), Some(&EventType::Aborted));
        assert!(manager.fetch_job(None, None).await.unwrap().is_none());
        assert!(manager.list_jobs_to_abort(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pruning_fails_orphans_whose_queueing_lock_is_taken() {
        let (manager, connector, clock, dead, ids) = stalled_worker_with_running_jobs(&[
            NewJob::new("orphan").with_queueing_lock("q"),
            NewJob::new("free"),
        ])
        .await;
        let waiting = manager
            .defer_job(&NewJob::new("orphan").with_queueing_lock("q"))
            .await
            .unwrap();

        clock.advance(Duration::seconds(120));
        let pruned = manager.prune_stalled_workers(30.0).await.unwrap();

        assert_eq!(pruned, vec![dead]);
        assert!(connector.worker_ids().is_empty());
        assert_eq!(connector.job(ids[0].as_i64()).unwrap().status, JobStatus::Failed);
        assert_eq!(connector.job(ids[1].as_i64()).unwrap().status, JobStatus::Todo);
        assert_eq!(connector.job(waiting.as_i64()).unwrap().status, JobStatus::Todo);
    }

    #[tokio::test]
    async fn pruning_requeues_one_orphan_per_queueing_lock() {
        let (manager, connector, clock, _, ids) = stalled_worker_with_running_jobs(&[
            NewJob::new("orphan").with_queueing_lock("q"),
            NewJob::new("orphan").with_queueing_lock("q"),
        ])
        .await;

        clock.advance(Duration::seconds(120));
        manager.prune_stalled_workers(30.0).await.unwrap();

        assert_eq!(connector.job(ids[0].as_i64()).unwrap().status, JobStatus::Todo);
        assert_eq!(connector.job(ids[1].as_i64()).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn retry_fails_job_whose_queueing_lock_is_taken() {
        let (manager, connector) = manager().await;
        let id = manager
            .defer_job(&NewJob::new("a").with_queueing_lock("q"))
            .await
            .unwrap();
        let job = manager.fetch_job(None, None).await.unwrap().unwrap();
        manager
            .defer_job(&NewJob::new("a").with_queueing_lock("q"))
            .await
            .unwrap();

        let status = manager.retry_job(&job, RetryDecision::at(start())).await.unwrap();

        assert_eq!(status, JobStatus::Failed);
        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(connector.events(id.as_i64()).last(), Some(&EventType::Failed));
    }

    #[tokio::test]
    async fn fetch_runs_again_after_losing_a_lock_race() {
        let (manager, connector) = manager().await;
        let id = manager.defer_job(&NewJob::new("a").with_lock("l")).await.unwrap();
        connector.fail_next(
            queries::FETCH_JOB.name,
            ConnectorError::unique_violation(
                queries::FETCH_JOB.name,
                LOCK_CONSTRAINT,
                "duplicate key value violates unique constraint",
            ),
        );

        let job = manager.fetch_job(None, None).await.unwrap().unwrap();

        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn unregister_releases_worker_reference() {
        let (manager, connector) = manager().await;
        let worker = manager.register_worker().await.unwrap();
        let id = manager.defer_job(&NewJob::new("a")).await.unwrap();
        manager.fetch_job(None, Some(worker)).await.unwrap();
        manager.unregister_worker(worker).await.unwrap();
        assert!(connector.worker_ids().is_empty());
        assert_eq!(connector.job(id.as_i64()).unwrap().worker_id, None);
    }

    #[tokio::test]
    async fn check_connection_reports_schema() {
        let (manager, connector) = manager().await;
        assert!(manager.check_connection().await.unwrap());
        connector.set_unavailable(true);
        assert!(matches!(
            manager.check_connection().await,
            Err(ManagerError::Connector(ConnectorError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn listen_for_jobs_sets_the_event() {
        let (manager, _) = manager().await;
        let event = Arc::new(Notify::new());
        let listener = {
            let manager = manager.clone();
            let event = event.clone();
            tokio::spawn(async move { manager.listen_for_jobs(None, event).await })
        };

        // keep deferring until the listener is subscribed and wakes us
        let woken = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                manager.defer_job(&NewJob::new("ping")).await.unwrap();
                if tokio::time::timeout(std::time::Duration::from_millis(20), event.notified())
                    .await
                    .is_ok()
                {
                    break;
                }
            }
        })
        .await;
        assert!(woken.is_ok());
        listener.abort();
    }

    #[test]
    fn old_jobs_statuses() {
        assert_eq!(OldJobs::default().statuses(), vec!["succeeded"]);
        let all = OldJobs {
            include_failed: true,
            include_cancelled: true,
            include_aborted: true,
        };
        assert_eq!(all.statuses(), vec!["succeeded", "failed", "cancelled", "aborted"]);
    }

    // Property tests over random operation sequences against the in-memory
    // state machine.

    #[derive(Debug, Clone)]
    enum Op {
        Defer {
            lock: Option<u8>,
            queueing_lock: Option<u8>,
            priority: i32,
        },
        Fetch,
        Finish(usize, JobStatus),
        Retry(usize),
        Cancel(usize, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (
                proptest::option::of(0u8..3),
                proptest::option::of(0u8..3),
                -2i32..3
            )
                .prop_map(|(lock, queueing_lock, priority)| Op::Defer {
                    lock,
                    queueing_lock,
                    priority
                }),
            Just(Op::Fetch),
            Just(Op::Fetch),
            (
                0usize..16,
                prop_oneof![
                    Just(JobStatus::Succeeded),
                    Just(JobStatus::Failed),
                    Just(JobStatus::Aborted)
                ]
            )
                .prop_map(|(i, s)| Op::Finish(i, s)),
            (0usize..16).prop_map(Op::Retry),
            (0usize..16, any::<bool>()).prop_map(|(i, abort)| Op::Cancel(i, abort)),
        ]
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn apply(manager: &JobManager, ids: &mut Vec<JobId>, op: &Op, now: DateTime<Utc>) {
        let pick = |i: &usize| ids.get(i % ids.len().max(1)).copied();
        match op {
            Op::Defer {
                lock,
                queueing_lock,
                priority,
            } => {
                let mut job = NewJob::new("t").with_priority(*priority);
                job.lock = lock.map(|l| format!("lock-{l}"));
                job.queueing_lock = queueing_lock.map(|q| format!("q-{q}"));
                match manager.defer_job(&job).await {
                    Ok(id) => ids.push(id),
                    Err(e) => assert!(e.is_already_enqueued(), "{e}"),
                }
            }
            Op::Fetch => {
                manager.fetch_job(None, None).await.unwrap();
            }
            Op::Finish(i, status) => {
                if let Some(id) = pick(i) {
                    let _ = manager.finish_job_by_id(id, *status, false).await;
                }
            }
            Op::Retry(i) => {
                if let Some(id) = pick(i) {
                    let _ = manager.retry_job_by_id(id, RetryDecision::at(now)).await;
                }
            }
            Op::Cancel(i, abort) => {
                if let Some(id) = pick(i) {
                    manager.cancel_job_by_id(id, *abort, false).await.unwrap();
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        #[test]
        fn state_machine_invariants_hold(ops in proptest::collection::vec(op(), 1..60)) {
            runtime().block_on(async {
                let clock = ManualClock::new(start());
                let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
                connector.open().await.unwrap();
                let manager = JobManager::new(Arc::new(connector.clone()));
                let mut ids = Vec::new();
                let mut seen: HashMap<i64, (i32, JobStatus)> = HashMap::new();

                for op in &ops {
                    apply(&manager, &mut ids, op, clock.now()).await;
                    let jobs = connector.jobs();

                    // lock exclusion
                    let mut running_locks = HashMap::new();
                    for job in jobs.iter().filter(|j| j.status == JobStatus::Doing) {
                        if let Some(lock) = &job.lock {
                            assert!(running_locks.insert(lock.clone(), job.id).is_none(), "lock {lock} twice in doing");
                        }
                    }
                    // queueing lock uniqueness
                    let mut waiting_qlocks = HashMap::new();
                    for job in jobs.iter().filter(|j| j.status == JobStatus::Todo) {
                        if let Some(q) = &job.queueing_lock {
                            assert!(waiting_qlocks.insert(q.clone(), job.id).is_none(), "queueing lock {q} twice in todo");
                        }
                    }
                    for job in &jobs {
                        if let Some((attempts, status)) = seen.get(&job.id) {
                            // monotonic attempts
                            assert!(job.attempts >= *attempts);
                            // terminal absorbing
                            if status.is_terminal() {
                                assert_eq!(job.status, *status);
                            }
                        }
                        seen.insert(job.id, (job.attempts, job.status));
                    }
                }
            });
        }

        #[test]
        fn fetch_order_is_priority_then_schedule_then_id(
            jobs in proptest::collection::vec((-3i32..3, proptest::option::of(0i64..5)), 1..20)
        ) {
            runtime().block_on(async {
                let clock = ManualClock::new(start());
                let connector = InMemoryConnector::with_clock(Arc::new(clock.clone()));
                connector.open().await.unwrap();
                let manager = JobManager::new(Arc::new(connector.clone()));

                let mut expected = Vec::new();
                for (priority, minutes_ago) in &jobs {
                    let mut job = NewJob::new("t").with_priority(*priority);
                    let scheduled_at = minutes_ago.map(|m| start() - Duration::minutes(m));
                    job.scheduled_at = scheduled_at;
                    let id = manager.defer_job(&job).await.unwrap();
                    expected.push((-priority, scheduled_at, id));
                }
                expected.sort();

                for (_, _, id) in expected {
                    let job = manager.fetch_job(None, None).await.unwrap().unwrap();
                    assert_eq!(job.id, id);
                }
                assert!(manager.fetch_job(None, None).await.unwrap().is_none());
            });
        }

        #[test]
        fn periodic_defers_are_unique_per_tick(
            ticks in proptest::collection::vec((0u8..2, 0i64..4), 1..30)
        ) {
            runtime().block_on(async {
                let connector = InMemoryConnector::new();
                connector.open().await.unwrap();
                let manager = JobManager::new(Arc::new(connector.clone()));

                for (periodic_id, timestamp) in &ticks {
                    let job = NewJob::new("tick").with_arg("timestamp", *timestamp);
                    manager
                        .defer_periodic_job(&job, &periodic_id.to_string(), *timestamp)
                        .await
                        .unwrap();
                }

                let defers = connector.periodic_defers();
                let mut triples: Vec<_> = defers
                    .iter()
                    .map(|d| (d.task_name.clone(), d.periodic_id.clone(), d.defer_timestamp))
                    .collect();
                let total = triples.len();
                triples.sort();
                triples.dedup();
                assert_eq!(triples.len(), total);
                assert_eq!(connector.jobs().len(), total);
            });
        }
    }
}
