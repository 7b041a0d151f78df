//! Worker: fetches jobs and feeds them to a pool of processors.
//!
//! ## Design
//!
//! - A semaphore of `concurrency` permits bounds claimed jobs: the fetch
//!   loop takes a permit before `fetch_job` and the processor releases it
//!   once the outcome is persisted
//! - Claimed jobs go through a bounded channel to `concurrency` processor
//!   tasks; the fetch loop is the only producer
//! - The fetch loop wakes on a job notification, on the polling interval or
//!   on stop; notifications are only a shortcut, polling alone is correct
//! - Side tasks: heartbeat (plus stalled-worker pruning), abort polling,
//!   notification listener and periodic deferrer
//!
//! ## Shutdown
//!
//! | Trigger | Effect |
//! |---|---|
//! | first SIGINT/SIGTERM, [`Worker::stop`] | stop fetching, wait for running jobs |
//! | `shutdown_timeout` elapsed | abort running jobs (reason `Shutdown`) |
//! | second signal, [`Worker::stop_now`] | abort running jobs (reason `Shutdown`) |
//!
//! Outcomes of aborted jobs are still persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use procrastinate_core::{Clock, DeleteJobCondition, Job, JobArgs, JobId, Notification, WorkerId};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::{JobManager, ManagerError};
use crate::periodic::{PeriodicConfig, PeriodicDeferrer};
use crate::processor::{JobOutcome, JobProcessor};
use crate::signals::install_stop_handler;
use crate::tasks::{AbortReason, AbortSignal, Blueprint};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used in logs and job contexts
    pub name: String,
    /// Queues to fetch from (`None` = all)
    pub queues: Option<Vec<String>>,
    /// Number of jobs processed at the same time
    pub concurrency: usize,
    /// Keep waiting for jobs once the queues are empty
    pub wait: bool,
    /// Fallback wake-up when no notification arrives
    pub fetch_job_polling_interval: Duration,
    /// How often running jobs are checked for abort requests
    pub abort_job_polling_interval: Duration,
    /// How long a graceful stop waits for running jobs (`None` = forever)
    pub shutdown_timeout: Option<Duration>,
    pub listen_notify: bool,
    pub delete_jobs: DeleteJobCondition,
    /// Passed to every job context
    pub additional_context: JobArgs,
    pub install_signal_handlers: bool,
    pub heartbeat_interval: Duration,
    /// Workers silent for longer are pruned and their jobs requeued
    pub stalled_worker_timeout: Duration,
    pub periodic: PeriodicConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            queues: None,
            concurrency: 1,
            wait: true,
            fetch_job_polling_interval: Duration::from_secs(5),
            abort_job_polling_interval: Duration::from_secs(5),
            shutdown_timeout: None,
            listen_notify: true,
            delete_jobs: DeleteJobCondition::Never,
            additional_context: JobArgs::new(),
            install_signal_handlers: true,
            heartbeat_interval: Duration::from_secs(10),
            stalled_worker_timeout: Duration::from_secs(30),
            periodic: PeriodicConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_fetch_job_polling_interval(mut self, interval: Duration) -> Self {
        self.fetch_job_polling_interval = interval;
        self
    }

    pub fn with_abort_job_polling_interval(mut self, interval: Duration) -> Self {
        self.abort_job_polling_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_listen_notify(mut self, listen_notify: bool) -> Self {
        self.listen_notify = listen_notify;
        self
    }

    pub fn with_delete_jobs(mut self, delete_jobs: DeleteJobCondition) -> Self {
        self.delete_jobs = delete_jobs;
        self
    }

    pub fn with_additional_context(mut self, context: JobArgs) -> Self {
        self.additional_context = context;
        self
    }

    pub fn with_install_signal_handlers(mut self, install: bool) -> Self {
        self.install_signal_handlers = install;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stalled_worker_timeout(mut self, timeout: Duration) -> Self {
        self.stalled_worker_timeout = timeout;
        self
    }

    pub fn with_periodic(mut self, periodic: PeriodicConfig) -> Self {
        self.periodic = periodic;
        self
    }

    fn queues_display(&self) -> String {
        match &self.queues {
            Some(queues) => format!("queues {}", queues.join(", ")),
            None => "all queues".to_string(),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_aborted: u64,
    pub jobs_retried: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Succeeded(_) => self.jobs_succeeded += 1,
            JobOutcome::Failed(_) => self.jobs_failed += 1,
            JobOutcome::Aborted => self.jobs_aborted += 1,
            JobOutcome::Retried { .. } => self.jobs_retried += 1,
        }
    }
}

type RunningJobs = Arc<Mutex<HashMap<JobId, AbortSignal>>>;

/// A claimed job on its way to a processor, with the permit it holds.
type Claimed = (Job, AbortSignal, OwnedSemaphorePermit);

/// Fetches and processes jobs until stopped.
#[derive(Debug)]
pub struct Worker {
    manager: JobManager,
    registry: Arc<Blueprint>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stop: CancellationToken,
    force: CancellationToken,
    running: RunningJobs,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(
        manager: JobManager,
        registry: Arc<Blueprint>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            clock,
            config,
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
            running: Arc::default(),
            stats: Arc::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Stop fetching and wait for running jobs.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop fetching and abort running jobs.
    pub fn stop_now(&self) {
        self.stop.cancel();
        self.force.cancel();
    }

    /// Token cancelled when the worker is asked to stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.current_running = lock(&self.running).len();
        stats
    }

    /// Ids of the jobs being processed.
    pub fn running_job_ids(&self) -> Vec<JobId> {
        lock(&self.running).keys().copied().collect()
    }

    /// Run until stopped, or until the queues are empty when `wait` is off.
    ///
    /// Fails only when the worker cannot start (e.g. the database is
    /// unreachable); task failures are recorded on their jobs.
    pub async fn run(&self) -> Result<WorkerStats, ManagerError> {
        let started = Instant::now();
        let worker_id = self.manager.register_worker().await?;
        info!(
            action = "start_worker",
            worker = %self.config.name,
            worker_id = %worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "starting worker on {}",
            self.config.queues_display()
        );

        let new_job = Arc::new(Notify::new());
        let side = CancellationToken::new();
        let mut side_tasks = self.start_side_tasks(worker_id, new_job.clone(), &side);

        let (tx, rx) = mpsc::channel::<Claimed>(self.config.concurrency);
        let mut processors = self.start_processors(worker_id, rx);

        self.fetch_loop(worker_id, &tx, &new_job).await;
        drop(tx);

        self.shutdown(&mut processors).await;
        side.cancel();
        while side_tasks.join_next().await.is_some() {}

        if let Err(e) = self.manager.unregister_worker(worker_id).await {
            warn!(action = "unregister_worker", worker_id = %worker_id, error = %e, "failed to unregister worker");
        }

        let mut stats = self.stats();
        stats.uptime_secs = started.elapsed().as_secs();
        info!(
            action = "stop_worker",
            worker = %self.config.name,
            worker_id = %worker_id,
            jobs_processed = stats.jobs_processed,
            "stopped worker on {}",
            self.config.queues_display()
        );
        Ok(stats)
    }

    async fn fetch_loop(&self, worker_id: WorkerId, tx: &mpsc::Sender<Claimed>, new_job: &Notify) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let queues = self.config.queues.as_deref();

        'fetching: loop {
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break 'fetching,
                    permit = permits.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break 'fetching };

                let job = match self.manager.fetch_job(queues, Some(worker_id)).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        error!(action = "fetch_job_error", worker = %self.config.name, error = %e, "failed to fetch job");
                        break;
                    }
                };
                let abort = AbortSignal::new();
                lock(&self.running).insert(job.id, abort.clone());
                if tx.send((job, abort, permit)).await.is_err() {
                    break 'fetching;
                }
            }

            if !self.config.wait {
                info!(
                    action = "stop_worker",
                    worker = %self.config.name,
                    "no job found, stopping worker because wait is disabled"
                );
                break;
            }

            debug!(
                action = "waiting_for_jobs",
                worker = %self.config.name,
                "waiting for new jobs"
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = new_job.notified() => {}
                _ = tokio::time::sleep(self.config.fetch_job_polling_interval) => {}
            }
        }
    }

    fn start_processors(&self, worker_id: WorkerId, rx: mpsc::Receiver<Claimed>) -> JoinSet<()> {
        let processor = JobProcessor::new(self.manager.clone(), self.registry.clone(), self.clock.clone())
            .with_worker(self.config.name.clone(), Some(worker_id), self.config.queues.clone())
            .with_additional_context(Arc::new(self.config.additional_context.clone()))
            .with_delete_jobs(self.config.delete_jobs);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut processors = JoinSet::new();
        for _ in 0..self.config.concurrency {
            let processor = processor.clone();
            let rx = rx.clone();
            let running = self.running.clone();
            let stats = self.stats.clone();
            processors.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((job, abort, permit)) = next else { break };
                    let job_id = job.id;
                    match processor.process(job, abort).await {
                        Ok(outcome) => lock(&stats).record(&outcome),
                        Err(e) => error!(
                            action = "persist_job_status",
                            job_id = %job_id,
                            error = %e,
                            "failed to persist job outcome"
                        ),
                    }
                    lock(&running).remove(&job_id);
                    drop(permit);
                }
            });
        }
        processors
    }

    async fn shutdown(&self, processors: &mut JoinSet<()>) {
        let running = lock(&self.running).len();
        if running > 0 {
            info!(
                action = "ending_jobs",
                worker = %self.config.name,
                running,
                "waiting for {running} running job(s) to finish"
            );
        }

        let timeout = async {
            match self.config.shutdown_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let forced = tokio::select! {
            _ = join_all(processors) => false,
            _ = timeout => true,
            _ = self.force.cancelled() => true,
        };
        if forced {
            let ids = self.running_job_ids();
            info!(
                action = "stop_worker",
                worker = %self.config.name,
                running = ids.len(),
                "jobs still running, aborting them"
            );
            abort_jobs(&self.running, &ids, AbortReason::Shutdown);
            join_all(processors).await;
        }
    }

    fn start_side_tasks(
        &self,
        worker_id: WorkerId,
        new_job: Arc<Notify>,
        side: &CancellationToken,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        tasks.spawn(heartbeat(
            self.manager.clone(),
            worker_id,
            self.config.heartbeat_interval,
            self.config.stalled_worker_timeout,
            side.clone(),
        ));

        tasks.spawn(poll_jobs_to_abort(
            self.manager.clone(),
            self.running.clone(),
            self.config.abort_job_polling_interval,
            side.clone(),
        ));

        if self.config.listen_notify {
            tasks.spawn(listen(
                self.manager.clone(),
                self.config.queues.clone(),
                new_job,
                self.running.clone(),
                side.clone(),
            ));
        }

        let deferrer = PeriodicDeferrer::new(
            self.manager.clone(),
            self.registry.periodic_registry().clone(),
            self.clock.clone(),
            self.config.periodic.clone(),
        );
        tasks.spawn(deferrer.run(side.clone()));

        if self.config.install_signal_handlers {
            match install_stop_handler(self.stop.clone(), self.force.clone()) {
                Ok(handle) => {
                    let side = side.clone();
                    tasks.spawn(async move {
                        side.cancelled().await;
                        handle.abort();
                    });
                }
                Err(e) => warn!(
                    action = "install_signal_handlers",
                    error = %e,
                    "could not install signal handlers, stop the worker through its handle"
                ),
            }
        }

        tasks
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(action = "processor_crashed", error = %e, "job processor task failed");
        }
    }
}

fn abort_jobs(running: &RunningJobs, ids: &[JobId], reason: AbortReason) {
    let running = lock(running);
    for id in ids {
        if let Some(signal) = running.get(id) {
            if !signal.is_requested() {
                debug!(action = "abort_job", job_id = %id, reason = ?reason, "requesting job abort");
                signal.request(reason);
            }
        }
    }
}

async fn heartbeat(
    manager: JobManager,
    worker_id: WorkerId,
    interval: Duration,
    stalled_after: Duration,
    side: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = side.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = manager.update_heartbeat(worker_id).await {
            warn!(action = "update_heartbeat", worker_id = %worker_id, error = %e, "heartbeat failed");
        }
        if let Err(e) = manager.prune_stalled_workers(stalled_after.as_secs_f64()).await {
            warn!(action = "prune_stalled_workers", error = %e, "failed to prune stalled workers");
        }
    }
}

async fn poll_jobs_to_abort(
    manager: JobManager,
    running: RunningJobs,
    interval: Duration,
    side: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = side.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if lock(&running).is_empty() {
            continue;
        }
        match manager.list_jobs_to_abort(None).await {
            Ok(ids) => abort_jobs(&running, &ids, AbortReason::UserRequest),
            Err(e) => error!(action = "poll_jobs_to_abort_error", error = %e, "failed to poll jobs to abort"),
        }
    }
}

async fn listen(
    manager: JobManager,
    queues: Option<Vec<String>>,
    new_job: Arc<Notify>,
    running: RunningJobs,
    side: CancellationToken,
) {
    let on_notification = Arc::new(move |notification: Notification| match notification {
        Notification::JobInserted { .. } => new_job.notify_one(),
        Notification::AbortJobRequested { job_id } => {
            abort_jobs(&running, &[job_id], AbortReason::UserRequest)
        }
    });
    tokio::select! {
        _ = side.cancelled() => {}
        result = manager.listen_for_notifications(queues.as_deref(), on_notification) => {
            if let Err(e) = result {
                error!(
                    action = "listen_error",
                    error = %e,
                    "notification listener stopped, relying on polling"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
