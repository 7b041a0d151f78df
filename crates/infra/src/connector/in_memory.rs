//! In-memory connector.
//!
//! ## Design
//!
//! - Implements every statement of the query catalog against plain maps,
//!   dispatching on `Query::name`
//! - Reproduces the database-side rules: status machine, lock and queueing
//!   lock indexes (same constraint names), periodic defer uniqueness, events
//!   and notifications
//! - Every statement runs under one mutex, which makes each call atomic the
//!   way the stored procedures are
//! - "now" comes from an injectable [`Clock`]
//!
//! Used by the unit tests of the manager, processor, worker and deferrer, and
//! by the benchmarks.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use procrastinate_core::{Clock, EventType, JobArgs, JobStatus, Notification, SystemClock};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    ANY_QUEUE_CHANNEL, Connector, ConnectorError, NO_DATA_FOUND, NotificationHandler,
    QUEUE_CHANNEL_PREFIX, Row, SqlValue,
};
use crate::manager::QUEUEING_LOCK_CONSTRAINT;
use crate::schema::queries::Query;

const RAISE_EXCEPTION: &str = "P0001";

/// A job row as stored by the in-memory connector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub id: i64,
    pub queue_name: String,
    pub task_name: String,
    pub priority: i32,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub args: JobArgs,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub abort_requested: bool,
    pub worker_id: Option<i64>,
    pub heartbeat_updated_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id)
            .with("queue_name", self.queue_name.clone())
            .with("task_name", self.task_name.clone())
            .with("priority", self.priority)
            .with("lock", self.lock.clone())
            .with("queueing_lock", self.queueing_lock.clone())
            .with("args", Value::Object(self.args.clone()))
            .with("status", self.status.as_str())
            .with("scheduled_at", self.scheduled_at.map(|at| at.to_rfc3339()))
            .with("attempts", self.attempts)
            .with("abort_requested", self.abort_requested)
            .with("worker_id", self.worker_id)
    }

    fn matches_queue(&self, queue: Option<&str>) -> bool {
        queue.is_none_or(|queue| self.queue_name == queue)
    }

    fn matches_task(&self, task: Option<&str>) -> bool {
        task.is_none_or(|task| self.task_name == task)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub job_id: i64,
    pub event_type: EventType,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPeriodicDefer {
    pub task_name: String,
    pub periodic_id: String,
    pub defer_timestamp: i64,
    pub job_id: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    unavailable: bool,
    next_job_id: i64,
    next_worker_id: i64,
    jobs: BTreeMap<i64, StoredJob>,
    events: Vec<StoredEvent>,
    periodic_defers: Vec<StoredPeriodicDefer>,
    workers: BTreeMap<i64, DateTime<Utc>>,
    listeners: Vec<(HashSet<String>, mpsc::UnboundedSender<(String, String)>)>,
    notifications: Vec<(String, String)>,
    scripts_executed: usize,
    injected_errors: Vec<(&'static str, ConnectorError)>,
}

impl State {
    fn event(&mut self, job_id: i64, event_type: EventType, at: DateTime<Utc>) {
        self.events.push(StoredEvent {
            job_id,
            event_type,
            at,
        });
    }

    fn notify(&mut self, queue: &str, notification: Notification) {
        let payload = serde_json::to_string(&notification).unwrap_or_default();
        for channel in [format!("{QUEUE_CHANNEL_PREFIX}{queue}"), ANY_QUEUE_CHANNEL.to_string()] {
            self.listeners.retain(|(channels, tx)| {
                !channels.contains(&channel) || tx.send((channel.clone(), payload.clone())).is_ok()
            });
            self.notifications.push((channel, payload.clone()));
        }
    }

    /// Whether a waiting job other than `exclude` holds `queueing_lock`.
    fn queueing_lock_taken(&self, queueing_lock: Option<&str>, exclude: Option<i64>) -> bool {
        queueing_lock.is_some_and(|queueing_lock| {
            self.jobs.values().any(|job| {
                Some(job.id) != exclude
                    && job.status == JobStatus::Todo
                    && job.queueing_lock.as_deref() == Some(queueing_lock)
            })
        })
    }

    fn check_queueing_lock(
        &self,
        operation: &str,
        queueing_lock: Option<&str>,
        exclude: Option<i64>,
    ) -> Result<(), ConnectorError> {
        if self.queueing_lock_taken(queueing_lock, exclude) {
            return Err(ConnectorError::unique_violation(
                operation,
                QUEUEING_LOCK_CONSTRAINT,
                format!("duplicate key value violates unique constraint \"{QUEUEING_LOCK_CONSTRAINT}\""),
            ));
        }
        Ok(())
    }

    fn lock_is_running(&self, lock: Option<&str>) -> bool {
        lock.is_some_and(|lock| {
            self.jobs
                .values()
                .any(|job| job.status == JobStatus::Doing && job.lock.as_deref() == Some(lock))
        })
    }

    fn last_event_at(&self, job_id: i64, event_type: Option<EventType>) -> Option<DateTime<Utc>> {
        self.events
            .iter()
            .filter(|e| e.job_id == job_id && event_type.is_none_or(|t| t == e.event_type))
            .map(|e| e.at)
            .max()
    }

    fn delete_job(&mut self, job_id: i64) {
        self.jobs.remove(&job_id);
        self.events.retain(|e| e.job_id != job_id);
        for defer in &mut self.periodic_defers {
            if defer.job_id == Some(job_id) {
                defer.job_id = None;
            }
        }
    }

    /// Release a running job of a stalled worker: back to `todo` without
    /// touching attempts, unless an abort was requested (`aborted`) or a
    /// waiting job holds its queueing lock (`failed`).
    fn release_orphan(&mut self, job_id: i64, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let status = if job.abort_requested {
            JobStatus::Aborted
        } else if self.queueing_lock_taken(job.queueing_lock.as_deref(), Some(job_id)) {
            JobStatus::Failed
        } else {
            JobStatus::Todo
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.status = status;
        job.worker_id = None;
        job.heartbeat_updated_at = None;
        let queue = job.queue_name.clone();
        match status.finish_event() {
            Some(event_type) => {
                job.attempts += 1;
                job.abort_requested = false;
                self.event(job_id, event_type, now);
            }
            None => {
                self.event(job_id, EventType::DeferredForRetry, now);
                self.notify(&queue, Notification::JobInserted { job_id: job_id.into() });
            }
        }
    }
}

/// In-process connector implementing the whole query catalog.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_job_id: 1,
                next_worker_id: 1,
                ..State::default()
            })),
            clock,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a database outage: every statement fails with a connection
    /// error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn job(&self, id: i64) -> Option<StoredJob> {
        self.state().jobs.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<StoredJob> {
        self.state().jobs.values().cloned().collect()
    }

    /// Event types of one job, in insertion order.
    pub fn events(&self, job_id: i64) -> Vec<EventType> {
        self.state()
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.event_type)
            .collect()
    }

    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.state().events.clone()
    }

    pub fn periodic_defers(&self) -> Vec<StoredPeriodicDefer> {
        self.state().periodic_defers.clone()
    }

    pub fn worker_ids(&self) -> Vec<i64> {
        self.state().workers.keys().copied().collect()
    }

    pub fn set_worker_heartbeat(&self, worker_id: i64, at: DateTime<Utc>) {
        if let Some(heartbeat) = self.state().workers.get_mut(&worker_id) {
            *heartbeat = at;
        }
    }

    /// Every `(channel, payload)` sent so far.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.state().notifications.clone()
    }

    pub fn scripts_executed(&self) -> usize {
        self.state().scripts_executed
    }

    /// Make the next run of the `operation` statement fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ConnectorError) {
        self.state().injected_errors.push((operation, error));
    }

    fn run(&self, query: &Query, params: &[SqlValue]) -> Result<Vec<Row>, ConnectorError> {
        let now = self.clock.now();
        let mut state = self.state();
        if !state.open {
            return Err(ConnectorError::NotOpen);
        }
        if state.unavailable {
            return Err(ConnectorError::Connection(format!(
                "database unavailable in {}",
                query.name
            )));
        }
        if let Some(index) = state
            .injected_errors
            .iter()
            .position(|(operation, _)| *operation == query.name)
        {
            return Err(state.injected_errors.remove(index).1);
        }
        let p = Params {
            operation: query.name,
            values: params,
        };

        match query.name {
            "defer_job" => {
                let id = defer_job(
                    &mut state,
                    now,
                    NewRow {
                        queue: p.required_text(0)?,
                        task_name: p.required_text(1)?,
                        priority: p.int(2)?.unwrap_or_default(),
                        lock: p.text(3)?,
                        queueing_lock: p.text(4)?,
                        args: p.json(5)?,
                        scheduled_at: p.timestamp(6)?,
                    },
                )?;
                Ok(vec![Row::new().with("id", id)])
            }
            "defer_periodic_job" => {
                let task_name = p.required_text(3)?;
                let periodic_id = p.text(5)?.unwrap_or_default();
                let defer_timestamp = p.required_big_int(6)?;
                let exists = state.periodic_defers.iter().any(|d| {
                    d.task_name == task_name
                        && d.periodic_id == periodic_id
                        && d.defer_timestamp == defer_timestamp
                });
                if exists {
                    return Ok(vec![Row::new().with("id", Value::Null)]);
                }
                let id = defer_job(
                    &mut state,
                    now,
                    NewRow {
                        queue: p.required_text(0)?,
                        task_name: task_name.clone(),
                        priority: p.int(4)?.unwrap_or_default(),
                        lock: p.text(1)?,
                        queueing_lock: p.text(2)?,
                        args: p.json(7)?,
                        scheduled_at: None,
                    },
                )?;
                state.periodic_defers.push(StoredPeriodicDefer {
                    task_name,
                    periodic_id,
                    defer_timestamp,
                    job_id: Some(id),
                });
                Ok(vec![Row::new().with("id", id)])
            }
            "fetch_job" => {
                let queues = p.text_array(0)?;
                let worker_id = p.big_int(1)?;
                let mut candidates: Vec<&StoredJob> = state
                    .jobs
                    .values()
                    .filter(|job| job.status == JobStatus::Todo)
                    .filter(|job| {
                        queues
                            .as_ref()
                            .is_none_or(|queues| queues.contains(&job.queue_name))
                    })
                    .filter(|job| job.scheduled_at.is_none_or(|at| at <= now))
                    .filter(|job| !state.lock_is_running(job.lock.as_deref()))
                    .collect();
                candidates.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        // None sorts first: NULLS FIRST
                        .then(a.scheduled_at.cmp(&b.scheduled_at))
                        .then(a.id.cmp(&b.id))
                });
                let Some(id) = candidates.first().map(|job| job.id) else {
                    return Ok(vec![Row::new().with("id", Value::Null)]);
                };
                let row = {
                    let Some(job) = state.jobs.get_mut(&id) else {
                        return Ok(vec![Row::new().with("id", Value::Null)]);
                    };
                    job.status = JobStatus::Doing;
                    job.worker_id = worker_id;
                    job.heartbeat_updated_at = Some(now);
                    job.to_row()
                };
                state.event(id, EventType::Started, now);
                Ok(vec![row])
            }
            "finish_job" => {
                let id = p.required_big_int(0)?;
                let status = p
                    .required_text(1)?
                    .parse::<JobStatus>()
                    .map_err(|e| ConnectorError::database(query.name, None, e.to_string()))?;
                let delete = p.bool(2)?.unwrap_or(false);
                if !matches!(
                    status,
                    JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted
                ) {
                    return Err(ConnectorError::database(
                        query.name,
                        Some(RAISE_EXCEPTION.to_string()),
                        format!(
                            "End status should be either \"succeeded\", \"failed\" or \"aborted\" (job id: {id})"
                        ),
                    ));
                }
                let job = state
                    .jobs
                    .get_mut(&id)
                    .filter(|job| job.status == JobStatus::Doing)
                    .ok_or_else(|| not_running(query.name, id))?;
                job.status = status;
                job.abort_requested = false;
                job.attempts += 1;
                job.heartbeat_updated_at = None;
                if let Some(event_type) = status.finish_event() {
                    state.event(id, event_type, now);
                }
                if delete {
                    state.delete_job(id);
                }
                Ok(vec![Row::new()])
            }
            "retry_job" => {
                let id = p.required_big_int(0)?;
                let retry_at = p.timestamp(1)?;
                let priority = p.int(2)?;
                let queue = p.text(3)?;
                let lock = p.text(4)?;
                let queueing_lock = state
                    .jobs
                    .get(&id)
                    .filter(|job| job.status == JobStatus::Doing)
                    .ok_or_else(|| not_running(query.name, id))?
                    .queueing_lock
                    .clone();
                if state.queueing_lock_taken(queueing_lock.as_deref(), Some(id)) {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.status = JobStatus::Failed;
                        job.attempts += 1;
                        job.abort_requested = false;
                        job.heartbeat_updated_at = None;
                    }
                    state.event(id, EventType::Failed, now);
                    return Ok(vec![Row::new().with("status", JobStatus::Failed.as_str())]);
                }
                let queue_name = {
                    let Some(job) = state.jobs.get_mut(&id) else {
                        return Err(not_running(query.name, id));
                    };
                    job.status = JobStatus::Todo;
                    job.attempts += 1;
                    job.scheduled_at = retry_at;
                    if let Some(priority) = priority {
                        job.priority = priority;
                    }
                    if let Some(queue) = queue {
                        job.queue_name = queue;
                    }
                    if lock.is_some() {
                        job.lock = lock;
                    }
                    job.abort_requested = false;
                    job.worker_id = None;
                    job.heartbeat_updated_at = None;
                    job.queue_name.clone()
                };
                state.event(id, EventType::DeferredForRetry, now);
                state.notify(&queue_name, Notification::JobInserted { job_id: id.into() });
                Ok(vec![Row::new().with("status", JobStatus::Todo.as_str())])
            }
            "cancel_job" => {
                let id = p.required_big_int(0)?;
                let abort = p.bool(1)?.unwrap_or(false);
                let delete = p.bool(2)?.unwrap_or(false);
                let Some(status) = state.jobs.get(&id).map(|job| job.status) else {
                    return Ok(vec![Row::new().with("id", Value::Null)]);
                };
                let cancelled = match status {
                    JobStatus::Todo if delete => {
                        state.delete_job(id);
                        true
                    }
                    JobStatus::Todo => {
                        if let Some(job) = state.jobs.get_mut(&id) {
                            job.status = JobStatus::Cancelled;
                            job.abort_requested = abort;
                        }
                        state.event(id, EventType::Cancelled, now);
                        true
                    }
                    JobStatus::Doing if abort => {
                        let newly_requested = state
                            .jobs
                            .get_mut(&id)
                            .map(|job| !std::mem::replace(&mut job.abort_requested, true))
                            .unwrap_or(false);
                        if newly_requested {
                            state.event(id, EventType::AbortRequested, now);
                            let queue = state.jobs.get(&id).map(|job| job.queue_name.clone());
                            if let Some(queue) = queue {
                                state.notify(
                                    &queue,
                                    Notification::AbortJobRequested { job_id: id.into() },
                                );
                            }
                        }
                        true
                    }
                    _ => false,
                };
                let id = if cancelled { Value::from(id) } else { Value::Null };
                Ok(vec![Row::new().with("id", id)])
            }
            "get_job_status" => {
                let id = p.required_big_int(0)?;
                Ok(state
                    .jobs
                    .get(&id)
                    .map(|job| Row::new().with("status", job.status.as_str()))
                    .into_iter()
                    .collect())
            }
            "check_connection" => Ok(vec![Row::new().with("check", true)]),
            "list_jobs" => {
                let id = p.big_int(0)?;
                let queue = p.text(1)?;
                let task = p.text(2)?;
                let status = p.text(3)?;
                let lock = p.text(4)?;
                let queueing_lock = p.text(5)?;
                Ok(state
                    .jobs
                    .values()
                    .filter(|job| id.is_none_or(|id| job.id == id))
                    .filter(|job| job.matches_queue(queue.as_deref()))
                    .filter(|job| job.matches_task(task.as_deref()))
                    .filter(|job| status.as_deref().is_none_or(|s| job.status.as_str() == s))
                    .filter(|job| lock.is_none() || job.lock == lock)
                    .filter(|job| queueing_lock.is_none() || job.queueing_lock == queueing_lock)
                    .map(StoredJob::to_row)
                    .collect())
            }
            "list_queues" | "list_tasks" | "list_locks" => {
                let queue = p.text(0)?;
                let task = p.text(1)?;
                let status = p.text(2)?;
                let lock = p.text(3)?;
                let mut counts: BTreeMap<(String, &'static str), i64> = BTreeMap::new();
                for job in state.jobs.values() {
                    if !job.matches_queue(queue.as_deref())
                        || !job.matches_task(task.as_deref())
                        || status.as_deref().is_some_and(|s| job.status.as_str() != s)
                        || (lock.is_some() && job.lock != lock)
                    {
                        continue;
                    }
                    let name = match query.name {
                        "list_queues" => job.queue_name.clone(),
                        "list_tasks" => job.task_name.clone(),
                        _ => match &job.lock {
                            Some(lock) => lock.clone(),
                            None => continue,
                        },
                    };
                    *counts.entry((name, job.status.as_str())).or_default() += 1;
                }
                Ok(counts
                    .into_iter()
                    .map(|((name, status), count)| {
                        Row::new()
                            .with("name", name)
                            .with("status", status)
                            .with("count", count)
                    })
                    .collect())
            }
            "list_jobs_to_abort" => {
                let queue = p.text(0)?;
                Ok(state
                    .jobs
                    .values()
                    .filter(|job| job.status == JobStatus::Doing && job.abort_requested)
                    .filter(|job| job.matches_queue(queue.as_deref()))
                    .map(|job| Row::new().with("id", job.id))
                    .collect())
            }
            "delete_old_jobs" => {
                let hours = p.int(0)?.unwrap_or_default();
                let queue = p.text(1)?;
                let statuses = p.text_array(2)?.unwrap_or_default();
                let cutoff = now - Duration::hours(i64::from(hours));
                let doomed: Vec<i64> = state
                    .jobs
                    .values()
                    .filter(|job| statuses.iter().any(|s| s == job.status.as_str()))
                    .filter(|job| job.matches_queue(queue.as_deref()))
                    .filter(|job| state.last_event_at(job.id, None).is_some_and(|at| at < cutoff))
                    .map(|job| job.id)
                    .collect();
                for id in &doomed {
                    state.delete_job(*id);
                }
                Ok(vec![Row::new().with("deleted", doomed.len() as i64)])
            }
            "select_stalled_jobs_by_started" | "select_stalled_jobs_by_heartbeat" => {
                let cutoff = now - seconds(p.float(0)?.unwrap_or_default());
                let queue = p.text(1)?;
                let task = p.text(2)?;
                let by_started = query.name == "select_stalled_jobs_by_started";
                Ok(state
                    .jobs
                    .values()
                    .filter(|job| job.status == JobStatus::Doing)
                    .filter(|job| job.matches_queue(queue.as_deref()))
                    .filter(|job| job.matches_task(task.as_deref()))
                    .filter(|job| {
                        let reference = if by_started {
                            state.last_event_at(job.id, Some(EventType::Started))
                        } else {
                            job.heartbeat_updated_at
                        };
                        reference.is_some_and(|at| at < cutoff)
                    })
                    .map(StoredJob::to_row)
                    .collect())
            }
            "register_worker" => {
                let id = state.next_worker_id;
                state.next_worker_id += 1;
                state.workers.insert(id, now);
                Ok(vec![Row::new().with("worker_id", id)])
            }
            "unregister_worker" => {
                let id = p.required_big_int(0)?;
                state.workers.remove(&id);
                for job in state.jobs.values_mut() {
                    if job.worker_id == Some(id) {
                        job.worker_id = None;
                    }
                }
                Ok(vec![Row::new()])
            }
            "update_heartbeat" => {
                let id = p.required_big_int(0)?;
                if let Some(heartbeat) = state.workers.get_mut(&id) {
                    *heartbeat = now;
                }
                for job in state.jobs.values_mut() {
                    if job.worker_id == Some(id) && job.status == JobStatus::Doing {
                        job.heartbeat_updated_at = Some(now);
                    }
                }
                Ok(vec![Row::new()])
            }
            "prune_stalled_workers" => {
                let cutoff = now - seconds(p.float(0)?.unwrap_or_default());
                let stalled: Vec<i64> = state
                    .workers
                    .iter()
                    .filter(|(_, heartbeat)| **heartbeat < cutoff)
                    .map(|(id, _)| *id)
                    .collect();
                let orphaned: Vec<i64> = state
                    .jobs
                    .values()
                    .filter(|job| job.status == JobStatus::Doing)
                    .filter(|job| job.worker_id.is_some_and(|w| stalled.contains(&w)))
                    .map(|job| job.id)
                    .collect();
                for id in orphaned {
                    state.release_orphan(id, now);
                }
                for id in &stalled {
                    state.workers.remove(id);
                }
                Ok(stalled
                    .into_iter()
                    .map(|id| Row::new().with("worker_id", id))
                    .collect())
            }
            other => Err(ConnectorError::UnsupportedQuery(other.to_string())),
        }
    }
}

struct NewRow {
    queue: String,
    task_name: String,
    priority: i32,
    lock: Option<String>,
    queueing_lock: Option<String>,
    args: Option<Value>,
    scheduled_at: Option<DateTime<Utc>>,
}

fn defer_job(state: &mut State, now: DateTime<Utc>, new: NewRow) -> Result<i64, ConnectorError> {
    let args = match new.args {
        None => JobArgs::new(),
        Some(Value::Object(args)) => args,
        Some(_) => {
            return Err(ConnectorError::database(
                "defer_job",
                Some("23514".to_string()),
                "new row violates check constraint \"check_args_is_object\"",
            ));
        }
    };
    state.check_queueing_lock("defer_job", new.queueing_lock.as_deref(), None)?;

    let id = state.next_job_id;
    state.next_job_id += 1;
    state.jobs.insert(
        id,
        StoredJob {
            id,
            queue_name: new.queue.clone(),
            task_name: new.task_name,
            priority: new.priority,
            lock: new.lock,
            queueing_lock: new.queueing_lock,
            args,
            status: JobStatus::Todo,
            scheduled_at: new.scheduled_at,
            attempts: 0,
            abort_requested: false,
            worker_id: None,
            heartbeat_updated_at: None,
        },
    );
    state.event(id, EventType::Deferred, now);
    if let Some(at) = new.scheduled_at {
        state.event(id, EventType::Scheduled, at);
    }
    state.notify(&new.queue, Notification::JobInserted { job_id: id.into() });
    Ok(id)
}

fn not_running(operation: &str, id: i64) -> ConnectorError {
    ConnectorError::database(
        operation,
        Some(NO_DATA_FOUND.to_string()),
        format!("Job was not found or not in \"doing\" status (job id: {id})"),
    )
}

fn seconds(value: f64) -> Duration {
    Duration::milliseconds((value * 1000.0) as i64)
}

/// Positional parameter accessors with type checking.
struct Params<'a> {
    operation: &'static str,
    values: &'a [SqlValue],
}

macro_rules! param_accessor {
    ($name:ident, $variant:ident, $t:ty) => {
        fn $name(&self, index: usize) -> Result<Option<$t>, ConnectorError> {
            match self.values.get(index) {
                None => Ok(None),
                Some(SqlValue::$variant(value)) => Ok(value.clone()),
                Some(other) => Err(self.mismatch(index, stringify!($variant), other)),
            }
        }
    };
}

impl Params<'_> {
    param_accessor!(bool, Bool, bool);
    param_accessor!(int, Int, i32);
    param_accessor!(big_int, BigInt, i64);
    param_accessor!(float, Float, f64);
    param_accessor!(text, Text, String);
    param_accessor!(text_array, TextArray, Vec<String>);
    param_accessor!(json, Json, Value);
    param_accessor!(timestamp, Timestamp, DateTime<Utc>);

    fn required_text(&self, index: usize) -> Result<String, ConnectorError> {
        self.text(index)?.ok_or_else(|| self.null(index))
    }

    fn required_big_int(&self, index: usize) -> Result<i64, ConnectorError> {
        self.big_int(index)?.ok_or_else(|| self.null(index))
    }

    fn mismatch(&self, index: usize, expected: &str, got: &SqlValue) -> ConnectorError {
        ConnectorError::database(
            self.operation,
            Some("42804".to_string()),
            format!("parameter ${} expected {expected}, got {got:?}", index + 1),
        )
    }

    fn null(&self, index: usize) -> ConnectorError {
        ConnectorError::database(
            self.operation,
            Some("23502".to_string()),
            format!("parameter ${} must not be null", index + 1),
        )
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryConnector {
    async fn open(&self) -> Result<(), ConnectorError> {
        self.state().open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let mut state = self.state();
        state.open = false;
        state.listeners.clear();
        Ok(())
    }

    async fn execute(&self, query: &Query, params: &[SqlValue]) -> Result<u64, ConnectorError> {
        self.run(query, params).map(|rows| rows.len() as u64)
    }

    async fn fetch_one(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Option<Row>, ConnectorError> {
        self.run(query, params).map(|rows| rows.into_iter().next())
    }

    async fn fetch_all(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, ConnectorError> {
        self.run(query, params)
    }

    async fn execute_script(&self, _script: &str) -> Result<(), ConnectorError> {
        let mut state = self.state();
        if !state.open {
            return Err(ConnectorError::NotOpen);
        }
        state.scripts_executed += 1;
        Ok(())
    }

    async fn listen(
        &self,
        channels: &[String],
        on_notification: NotificationHandler,
    ) -> Result<(), ConnectorError> {
        let mut rx = {
            let mut state = self.state();
            if !state.open {
                return Err(ConnectorError::NotOpen);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.listeners.push((channels.iter().cloned().collect(), tx));
            rx
        };
        while let Some((channel, payload)) = rx.recv().await {
            on_notification(channel, payload).await;
        }
        // closed: behave like a listener that never hears anything again
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LOCK_CONSTRAINT;
    use crate::schema::queries;
    use futures::FutureExt;

    async fn open() -> InMemoryConnector {
        let connector = InMemoryConnector::new();
        connector.open().await.unwrap();
        connector
    }

    fn defer_params(queueing_lock: Option<&str>) -> Vec<SqlValue> {
        vec![
            "default".into(),
            "sum".into(),
            0i32.into(),
            SqlValue::Text(None),
            queueing_lock.into(),
            serde_json::json!({"a": 1}).into(),
            SqlValue::Timestamp(None),
        ]
    }

    #[tokio::test]
    async fn closed_connector_rejects_queries() {
        let connector = InMemoryConnector::new();
        let err = connector.fetch_one(&queries::CHECK_CONNECTION, &[]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotOpen));
    }

    #[tokio::test]
    async fn defer_writes_event_and_notifies_both_channels() {
        let connector = open().await;
        let row = connector
            .fetch_one(&queries::DEFER_JOB, &defer_params(None))
            .await
            .unwrap()
            .unwrap();
        let id: i64 = row.get("id").unwrap();

        assert_eq!(connector.events(id), vec![EventType::Deferred]);
        let channels: Vec<_> = connector.notifications().into_iter().map(|(c, _)| c).collect();
        assert_eq!(channels, vec!["procrastinate_queue#default", "procrastinate_any_queue"]);
    }

    #[tokio::test]
    async fn queueing_lock_violation_names_the_index() {
        let connector = open().await;
        connector
            .execute(&queries::DEFER_JOB, &defer_params(Some("q1")))
            .await
            .unwrap();
        let err = connector
            .execute(&queries::DEFER_JOB, &defer_params(Some("q1")))
            .await
            .unwrap_err();
        assert_eq!(err.constraint_name(), Some(QUEUEING_LOCK_CONSTRAINT));
    }

    #[tokio::test]
    async fn non_object_args_are_rejected() {
        let connector = open().await;
        let mut params = defer_params(None);
        params[5] = serde_json::json!([1, 2]).into();
        let err = connector.execute(&queries::DEFER_JOB, &params).await.unwrap_err();
        assert_eq!(err.code(), Some("23514"));
    }

    #[tokio::test]
    async fn finish_requires_a_running_job() {
        let connector = open().await;
        connector
            .execute(&queries::DEFER_JOB, &defer_params(None))
            .await
            .unwrap();
        let err = connector
            .execute(&queries::FINISH_JOB, &[1i64.into(), "succeeded".into(), false.into()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(NO_DATA_FOUND));
    }

    #[tokio::test]
    async fn unavailable_database_is_a_connection_error() {
        let connector = open().await;
        connector.set_unavailable(true);
        let err = connector.execute(&queries::CHECK_CONNECTION, &[]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Connection(_)));
    }

    #[tokio::test]
    async fn listen_forwards_matching_channels_only() {
        let connector = open().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: NotificationHandler = Arc::new(move |channel, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((channel, payload));
            }
            .boxed()
        });
        let listener = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connector
                    .listen(&["procrastinate_queue#emails".to_string()], handler)
                    .await
            })
        };
        tokio::task::yield_now().await;
        while connector.state().listeners.is_empty() {
            tokio::task::yield_now().await;
        }

        connector
            .execute(&queries::DEFER_JOB, &defer_params(None))
            .await
            .unwrap();
        let mut params = defer_params(None);
        params[0] = "emails".into();
        connector.execute(&queries::DEFER_JOB, &params).await.unwrap();

        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "procrastinate_queue#emails");
        assert_eq!(payload, r#"{"type":"job_inserted","job_id":2}"#);
        assert!(rx.try_recv().is_err());
        listener.abort();
    }

    #[tokio::test]
    async fn unknown_query_is_unsupported() {
        let connector = open().await;
        let query = Query {
            name: "vacuum",
            sql: "VACUUM",
        };
        assert!(matches!(
            connector.execute(&query, &[]).await,
            Err(ConnectorError::UnsupportedQuery(name)) if name == "vacuum"
        ));
    }

    #[test]
    fn lock_constraint_name_matches_schema() {
        assert!(crate::schema::SCHEMA.contains(LOCK_CONSTRAINT));
        assert!(crate::schema::SCHEMA.contains("procrastinate_periodic_defers_unique"));
    }
}
