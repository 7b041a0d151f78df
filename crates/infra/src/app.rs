//! The application object tying a connector to a task registry.
//!
//! Tasks added to an [`App`] are bound to its job manager, so
//! `task.defer(..)` works on the returned copy. Workers and the periodic
//! deferrer run against a snapshot of the registry taken when they are
//! created.

use std::sync::Arc;

use procrastinate_core::{Clock, Error as DomainError, NewJob, SystemClock};
use tracing::info;

use crate::builtin_tasks;
use crate::connector::{Connector, ConnectorError};
use crate::manager::{JobManager, ManagerError};
use crate::periodic::{PeriodicConfig, PeriodicDeferrer, PeriodicTask};
use crate::schema::SchemaManager;
use crate::tasks::{Blueprint, JobDeferrer, Task};
use crate::worker::{Worker, WorkerConfig, WorkerStats};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl AppError {
    /// The job was refused because its queueing lock is taken.
    pub fn is_already_enqueued(&self) -> bool {
        matches!(self, AppError::Manager(e) if e.is_already_enqueued())
    }
}

/// Connector, job manager and task registry.
#[derive(Debug, Clone)]
pub struct App {
    manager: JobManager,
    registry: Blueprint,
    clock: Arc<dyn Clock>,
    worker_defaults: WorkerConfig,
}

impl App {
    /// New app; the builtin tasks are registered.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let manager = JobManager::new(connector);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Blueprint::with_task(
            builtin_tasks::remove_old_jobs(manager.clone()).bind(manager.clone(), clock.clone()),
        );
        Self {
            manager,
            registry,
            clock,
            worker_defaults: WorkerConfig::default(),
        }
    }

    /// Use `clock` for scheduling; tasks already added are rebound.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebind();
        self
    }

    /// Defaults for [`App::worker_with_defaults`] and the CLI.
    pub fn with_worker_defaults(mut self, config: WorkerConfig) -> Self {
        self.worker_defaults = config;
        self
    }

    pub fn worker_defaults(&self) -> &WorkerConfig {
        &self.worker_defaults
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        self.manager.connector()
    }

    pub fn job_manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn schema_manager(&self) -> SchemaManager {
        SchemaManager::new(self.connector().clone())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn open(&self) -> Result<(), AppError> {
        self.connector().open().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), AppError> {
        self.connector().close().await?;
        Ok(())
    }

    /// Register `task` and return the copy bound to this app.
    pub fn add_task(&mut self, task: Task) -> Result<Task, AppError> {
        let task = self.bind(task);
        self.registry.add_task(task.clone())?;
        Ok(task)
    }

    /// Register `task` (if needed) with a periodic schedule.
    pub fn add_periodic_task(
        &mut self,
        task: Task,
        periodic_task: PeriodicTask,
    ) -> Result<Task, AppError> {
        let task = self.bind(task);
        self.registry.add_periodic_task(task.clone(), periodic_task)?;
        Ok(self.registry.get(task.name()).cloned().unwrap_or(task))
    }

    /// Copy the tasks of `blueprint` in, as `<namespace>:<name>`.
    pub fn add_tasks_from(&mut self, blueprint: &Blueprint, namespace: &str) -> Result<(), AppError> {
        self.registry.add_tasks_from(blueprint, namespace)?;
        self.rebind();
        info!(
            action = "add_tasks_from",
            namespace,
            tasks = blueprint.len(),
            "added blueprint tasks"
        );
        Ok(())
    }

    /// Registered task, by name or alias.
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &Blueprint {
        &self.registry
    }

    /// Deferral of `name` with per-call overrides. The task does not need to
    /// be registered here: another process may run it.
    pub fn configure_task(&self, name: &str) -> JobDeferrer {
        match self.registry.get(name) {
            Some(task) => task.configure(),
            None => JobDeferrer::new(self.manager.clone(), NewJob::new(name), self.clock.clone()),
        }
    }

    pub fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            self.manager.clone(),
            Arc::new(self.registry.clone()),
            self.clock.clone(),
            config,
        )
    }

    pub fn worker_with_defaults(&self) -> Worker {
        self.worker(self.worker_defaults.clone())
    }

    /// Run a worker until it stops.
    pub async fn run_worker(&self, config: WorkerConfig) -> Result<WorkerStats, AppError> {
        Ok(self.worker(config).run().await?)
    }

    /// A deferrer for the periodic tasks, for running without a worker.
    pub fn periodic_deferrer(&self, config: PeriodicConfig) -> PeriodicDeferrer {
        PeriodicDeferrer::new(
            self.manager.clone(),
            self.registry.periodic_registry().clone(),
            self.clock.clone(),
            config,
        )
    }

    fn bind(&self, task: Task) -> Task {
        task.bind(self.manager.clone(), self.clock.clone())
    }

    fn rebind(&mut self) {
        let (manager, clock) = (self.manager.clone(), self.clock.clone());
        self.registry
            .map_tasks(|task| task.bind(manager.clone(), clock.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use procrastinate_core::{JobStatus, ManualClock, TaskError};
    use serde::Deserialize;
    use serde_json::json;

    use crate::builtin_tasks::REMOVE_OLD_JOBS;
    use crate::connector::InMemoryConnector;

    #[derive(Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }

    fn sum() -> Task {
        Task::new("sum", |args: Sum| async move { Ok::<_, TaskError>(args.a + args.b) })
    }

    async fn app() -> (Arc<InMemoryConnector>, App) {
        let connector = Arc::new(InMemoryConnector::new());
        let app = App::new(connector.clone());
        app.open().await.unwrap();
        (connector, app)
    }

    #[tokio::test]
    async fn builtin_tasks_are_registered() {
        let (_, app) = app().await;
        assert!(app.task(REMOVE_OLD_JOBS).is_some());
        assert!(app.task(REMOVE_OLD_JOBS).unwrap().is_bound());
    }

    #[tokio::test]
    async fn added_task_is_bound_and_defers() {
        let (connector, mut app) = app().await;
        let task = app.add_task(sum()).unwrap();
        assert!(task.is_bound());

        let id = task.defer(&json!({"a": 5, "b": 7})).await.unwrap();

        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.status, JobStatus::Todo);
        assert_eq!(stored.args.get("a"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn unbound_task_cannot_defer() {
        let err = sum().defer(&json!({"a": 1, "b": 2})).await.unwrap_err();
        assert!(matches!(err, ManagerError::Domain(DomainError::UnboundTask(_))));
    }

    #[tokio::test]
    async fn duplicate_task_is_rejected() {
        let (_, mut app) = app().await;
        app.add_task(sum()).unwrap();
        let err = app.add_task(sum()).unwrap_err();
        assert!(matches!(err, AppError::Domain(DomainError::TaskAlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn configure_unknown_task_defers_by_name() {
        let (connector, app) = app().await;
        let id = app
            .configure_task("elsewhere")
            .with_queue("remote")
            .defer(&json!({}))
            .await
            .unwrap();
        let stored = connector.job(id.as_i64()).unwrap();
        assert_eq!(stored.queue_name, "remote");
    }

    #[tokio::test]
    async fn blueprint_tasks_are_namespaced_and_bound() {
        let (connector, mut app) = app().await;
        let mut blueprint = Blueprint::new();
        blueprint.add_task(sum()).unwrap();

        app.add_tasks_from(&blueprint, "math").unwrap();

        let task = app.task("math:sum").unwrap();
        let id = task.defer(&json!({"a": 1, "b": 1})).await.unwrap();
        assert_eq!(connector.job(id.as_i64()).unwrap().status, JobStatus::Todo);
        assert!(app.task("sum").is_none());
    }

    #[tokio::test]
    async fn queueing_lock_conflict_is_reported() {
        let (_, mut app) = app().await;
        let task = app.add_task(sum().with_queueing_lock("only-one")).unwrap();
        task.defer(&json!({"a": 1, "b": 1})).await.unwrap();

        let err: AppError = task.defer(&json!({"a": 1, "b": 1})).await.unwrap_err().into();
        assert!(err.is_already_enqueued());
    }

    #[tokio::test]
    async fn clock_drives_schedule_in() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let connector = Arc::new(InMemoryConnector::new());
        let mut app = App::new(connector.clone()).with_clock(Arc::new(ManualClock::new(start)));
        app.open().await.unwrap();
        let task = app.add_task(sum()).unwrap();

        let id = task
            .configure()
            .schedule_in(chrono::Duration::minutes(10))
            .defer(&json!({"a": 1, "b": 1}))
            .await
            .unwrap();

        assert_eq!(
            connector.job(id.as_i64()).unwrap().scheduled_at,
            Some(start + chrono::Duration::minutes(10))
        );
    }

    #[tokio::test]
    async fn run_worker_processes_deferred_jobs() {
        let (connector, mut app) = app().await;
        let task = app.add_task(sum()).unwrap();
        let id = task.defer(&json!({"a": 5, "b": 7})).await.unwrap();

        let stats = app
            .run_worker(
                WorkerConfig::default()
                    .with_wait(false)
                    .with_install_signal_handlers(false),
            )
            .await
            .unwrap();

        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(connector.job(id.as_i64()).unwrap().status, JobStatus::Succeeded);
    }
}
