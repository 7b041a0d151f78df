//! Periodic (cron) task deferral.
//!
//! ## Design
//!
//! - Each registration is keyed by `(task_name, periodic_id)` so one task can
//!   carry several schedules
//! - Every cron tick becomes one `defer_periodic_job` call whose
//!   `defer_timestamp` is the tick's UNIX timestamp; the database rejects a
//!   second defer of the same tick, so any number of deferrers can run
//! - On startup only the latest past tick is considered, and only when it is
//!   at most `max_delay` old; afterwards every tick since the last one seen is
//!   deferred
//! - Cron expressions take 5 fields (minute precision) or 6 fields (leading
//!   seconds). Day-of-week numbers follow the usual crontab convention
//!   (`0` or `7` = Sunday)

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use procrastinate_core::{Clock, Error as DomainError, JobArgs, JobId, NewJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::manager::{JobManager, ManagerError};
use crate::tasks::Task;

/// Ticks older than this at startup are not deferred.
pub const MAX_DELAY: Duration = Duration::from_secs(600);

/// Added to every sleep so the deferrer never wakes just before a tick.
pub const MARGIN: Duration = Duration::from_millis(500);

/// Periodic deferrer configuration.
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Oldest missed tick still deferred at startup
    pub max_delay: Duration,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            max_delay: MAX_DELAY,
        }
    }
}

impl PeriodicConfig {
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// A task scheduled by a cron expression.
///
/// Jobs receive the tick's UNIX timestamp as their `timestamp` argument, on
/// top of the static `task_kwargs`.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    task: Task,
    cron: String,
    schedule: Schedule,
    periodic_id: String,
    queue: Option<String>,
    lock: Option<String>,
    queueing_lock: Option<String>,
    priority: Option<i32>,
    task_kwargs: JobArgs,
}

impl PeriodicTask {
    pub fn new(task: &Task, cron: &str) -> Result<Self, DomainError> {
        Ok(Self {
            task: task.clone(),
            cron: cron.to_string(),
            schedule: parse_cron(cron)?,
            periodic_id: String::new(),
            queue: None,
            lock: None,
            queueing_lock: None,
            priority: None,
            task_kwargs: JobArgs::new(),
        })
    }

    pub fn with_periodic_id(mut self, periodic_id: impl Into<String>) -> Self {
        self.periodic_id = periodic_id.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
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

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_task_kwargs(mut self, task_kwargs: JobArgs) -> Self {
        self.task_kwargs = task_kwargs;
        self
    }

    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    pub fn periodic_id(&self) -> &str {
        &self.periodic_id
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    /// Latest tick at or before `now` (whole seconds).
    pub fn previous_tick(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&(now + TimeDelta::seconds(1))).next_back()
    }

    /// Ticks in `(since, until]`.
    pub fn ticks_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&since)
            .take_while(|tick| *tick <= until)
            .collect()
    }

    pub fn next_tick(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    pub(crate) fn namespaced(&self, namespace: &str) -> Self {
        Self {
            task: self.task.namespaced(namespace),
            ..self.clone()
        }
    }

    fn key(&self) -> (String, String) {
        (self.task_name().to_string(), self.periodic_id.clone())
    }

    fn new_job(&self, timestamp: i64) -> NewJob {
        let task = &self.task;
        let mut job = NewJob::new(task.name())
            .with_queue(self.queue.as_deref().unwrap_or(task.queue()))
            .with_priority(self.priority.unwrap_or(task.priority()))
            .with_args(self.task_kwargs.clone())
            .with_arg("timestamp", timestamp);
        job.lock = self.lock.clone().or_else(|| task.lock().map(str::to_string));
        job.queueing_lock = self
            .queueing_lock
            .clone()
            .or_else(|| task.queueing_lock().map(str::to_string));
        job
    }
}

/// Periodic registrations keyed by `(task_name, periodic_id)`.
#[derive(Debug, Clone, Default)]
pub struct PeriodicRegistry {
    tasks: BTreeMap<(String, String), PeriodicTask>,
}

impl PeriodicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, periodic_task: PeriodicTask) -> Result<(), DomainError> {
        let key = periodic_task.key();
        if self.tasks.contains_key(&key) {
            return Err(DomainError::task_already_registered(format!(
                "{} (periodic id {:?})",
                key.0, key.1
            )));
        }
        info!(
            action = "registering_periodic_task",
            task = %periodic_task.task_name(),
            cron = %periodic_task.cron,
            periodic_id = %periodic_task.periodic_id,
            "periodic task registered"
        );
        self.tasks.insert(key, periodic_task);
        Ok(())
    }

    /// Whether every registration of `other` could be added.
    pub(crate) fn check_conflicts(&self, other: &PeriodicRegistry) -> Result<(), DomainError> {
        match other.tasks.keys().find(|key| self.tasks.contains_key(*key)) {
            Some((task, periodic_id)) => Err(DomainError::task_already_registered(format!(
                "{task} (periodic id {periodic_id:?})"
            ))),
            None => Ok(()),
        }
    }

    pub fn get(&self, task_name: &str, periodic_id: &str) -> Option<&PeriodicTask> {
        self.tasks
            .get(&(task_name.to_string(), periodic_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeriodicTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Defers the jobs of every periodic registration when their ticks come.
#[derive(Debug)]
pub struct PeriodicDeferrer {
    manager: JobManager,
    registry: PeriodicRegistry,
    clock: Arc<dyn Clock>,
    config: PeriodicConfig,
    last_defers: HashMap<(String, String), i64>,
}

impl PeriodicDeferrer {
    pub fn new(
        manager: JobManager,
        registry: PeriodicRegistry,
        clock: Arc<dyn Clock>,
        config: PeriodicConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            clock,
            config,
            last_defers: HashMap::new(),
        }
    }

    /// Defer due jobs then sleep until the next tick, until `shutdown`.
    /// Returns at once when nothing is registered.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.registry.is_empty() {
            info!(
                action = "periodic_deferrer_no_task",
                "no periodic task registered, periodic deferrer not started"
            );
            return;
        }

        loop {
            let now = self.clock.now();
            if let Err(e) = self.defer_due_jobs(now).await {
                error!(action = "periodic_deferrer_error", error = %e, "failed to defer periodic jobs");
            }
            let wait = self.time_until_next_tick(now);
            debug!(
                action = "wait_next_tick",
                next_tick_secs = wait.as_secs_f64(),
                "periodic deferrer waiting for next tick"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait + MARGIN) => {}
            }
        }
    }

    /// Defer every tick due at `now` that was not handled yet. Returns the
    /// ids of newly deferred jobs.
    pub async fn defer_due_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<JobId>, ManagerError> {
        let mut deferred = Vec::new();
        for (key, periodic_task, timestamp) in self.due_ticks(now) {
            let job = periodic_task.new_job(timestamp);
            match self
                .manager
                .defer_periodic_job(&job, &periodic_task.periodic_id, timestamp)
                .await
            {
                Ok(Some(job_id)) => {
                    info!(
                        action = "periodic_task_deferred",
                        task_name = %job.task_name,
                        periodic_id = %periodic_task.periodic_id,
                        defer_timestamp = timestamp,
                        job_id = %job_id,
                        "periodic job {} deferred",
                        job.call_string()
                    );
                    deferred.push(job_id);
                }
                Ok(None) => debug!(
                    action = "periodic_task_already_deferred",
                    task_name = %job.task_name,
                    periodic_id = %periodic_task.periodic_id,
                    defer_timestamp = timestamp,
                    "periodic job already deferred"
                ),
                Err(e) if e.is_already_enqueued() => debug!(
                    action = "skip_periodic_task_queueing_lock",
                    task_name = %job.task_name,
                    periodic_id = %periodic_task.periodic_id,
                    queueing_lock = ?job.queueing_lock,
                    defer_timestamp = timestamp,
                    "periodic job skipped, a job with the same queueing lock is waiting"
                ),
                Err(e) => return Err(e),
            }
            // Only handled ticks count: a failed defer is attempted again on
            // the next pass.
            self.last_defers.insert(key, timestamp);
        }
        Ok(deferred)
    }

    /// Time from `now` to the nearest tick of any registration.
    pub fn time_until_next_tick(&self, now: DateTime<Utc>) -> Duration {
        self.registry
            .iter()
            .filter_map(|periodic_task| periodic_task.next_tick(now))
            .min()
            .map(|tick| (tick - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.config.max_delay)
    }

    fn due_ticks(&self, now: DateTime<Utc>) -> Vec<((String, String), PeriodicTask, i64)> {
        let now = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let max_delay = TimeDelta::from_std(self.config.max_delay).unwrap_or(TimeDelta::MAX);
        let mut due = Vec::new();

        for (key, periodic_task) in &self.registry.tasks {
            let ticks = match self
                .last_defers
                .get(key)
                .and_then(|since| DateTime::from_timestamp(*since, 0))
            {
                Some(since) => periodic_task.ticks_between(since, now),
                None => match periodic_task.previous_tick(now) {
                    Some(tick) if now - tick > max_delay => {
                        debug!(
                            action = "ignore_periodic_task",
                            task_name = %periodic_task.task_name(),
                            periodic_id = %periodic_task.periodic_id,
                            delay_secs = (now - tick).num_seconds(),
                            max_delay_secs = self.config.max_delay.as_secs(),
                            "ignoring periodic task scheduled too long ago"
                        );
                        Vec::new()
                    }
                    Some(tick) => vec![tick],
                    None => Vec::new(),
                },
            };
            for tick in ticks {
                due.push((key.clone(), periodic_task.clone(), tick.timestamp()));
            }
        }
        due
    }
}

/// Parse a 5-field (`min hour dom month dow`) or 6-field (leading seconds)
/// cron expression, or a `@hourly`-style shortcut.
pub fn parse_cron(expression: &str) -> Result<Schedule, DomainError> {
    let invalid = |reason: String| DomainError::invalid_cron(expression, reason);
    let trimmed = expression.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        match fields.len() {
            5 => fields.insert(0, "0".to_string()),
            6 => {}
            n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
        }
        fields[5] = day_of_week(&fields[5]).map_err(invalid)?;
        fields.join(" ")
    };
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Crontab day numbers (`0`-`7`, Sunday first and last) to the `1`-`7`
/// numbering of the `cron` crate.
fn day_of_week(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                Some((start, "7")) if step.is_none() => format!("{}-7,1", shift_day(start)?),
                Some((_, "7")) => return Err(format!("unsupported day-of-week range {item:?}")),
                Some((start, end)) => format!("{}-{}", shift_day(start)?, shift_day(end)?),
                None => shift_day(range)?,
            };
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(items.join(","))
}

fn shift_day(day: &str) -> Result<String, String> {
    match day.parse::<u8>() {
        Ok(n @ 0..=6) => Ok((n + 1).to_string()),
        Ok(7) => Ok("1".to_string()),
        Ok(n) => Err(format!("day of week {n} out of range")),
        Err(_) => Ok(day.to_string()),
    }
}
