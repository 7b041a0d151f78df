//! Demo tasks and the client that defers them.

use std::sync::Arc;
use std::time::Duration;

use procrastinate_core::{JobId, RetryStrategy, TaskError};
use procrastinate_infra::{App, AppError, Connector, JobContext, PeriodicTask, Task};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SumArgs {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    i: u64,
}

#[derive(Debug, Deserialize)]
struct TickArgs {
    timestamp: i64,
}

/// An app with the demo tasks registered.
pub fn demo_app(connector: Arc<dyn Connector>) -> Result<App, AppError> {
    let mut app = App::new(connector);

    app.add_task(
        Task::new("sum", |args: SumArgs| async move {
            let result = args.a + args.b;
            info!(action = "demo_sum", a = args.a, b = args.b, result, "sum computed");
            Ok::<_, TaskError>(result)
        })
        .with_queue("sums"),
    )?;

    app.add_task(
        Task::blocking("sum_plus_one", |args: SumArgs| Ok::<_, TaskError>(args.a + args.b + 1))
            .with_queue("sums"),
    )?;

    app.add_task(
        Task::new("sleep", |args: SleepArgs| async move {
            tokio::time::sleep(Duration::from_secs(args.i)).await;
            Ok::<_, TaskError>(())
        })
        .with_queue("sleep"),
    )?;

    // Fails on its first two attempts.
    app.add_task(
        Task::with_context("flaky", |ctx: JobContext, _: serde_json::Value| async move {
            if ctx.job().attempts < 2 {
                return Err(TaskError::message("flaky failure"));
            }
            Ok(())
        })
        .with_queue("retry")
        .with_retry(RetryStrategy::new().with_max_attempts(100)),
    )?;

    let tick = Task::new("tick", |args: TickArgs| async move { Ok::<_, TaskError>(args.timestamp) });
    let every_second = PeriodicTask::new(&tick, "* * * * * *")?;
    app.add_periodic_task(tick, every_second)?;

    Ok(app)
}

/// Defer a batch of demo jobs, one of them with invalid arguments.
pub async fn defer_demo_jobs(app: &App) -> Result<Vec<JobId>, AppError> {
    let mut ids = vec![
        app.configure_task("sum").defer(&json!({"a": 3, "b": 5})).await?,
        app.configure_task("sum").defer(&json!({"a": 5, "b": 7})).await?,
        app.configure_task("sum").defer(&json!({"a": 5, "b": "a"})).await?,
        app.configure_task("sum_plus_one").defer(&json!({"a": 4, "b": 7})).await?,
    ];
    for i in [2, 3, 4] {
        ids.push(
            app.configure_task("sleep")
                .with_lock("a")
                .defer(&json!({ "i": i }))
                .await?,
        );
    }
    ids.push(app.configure_task("flaky").defer(&json!({})).await?);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use procrastinate_core::JobStatus;
    use procrastinate_infra::{InMemoryConnector, WorkerConfig};

    #[tokio::test]
    async fn demo_jobs_run_to_completion() {
        let connector = Arc::new(InMemoryConnector::new());
        let app = demo_app(connector.clone()).unwrap();
        app.open().await.unwrap();

        let ids = defer_demo_jobs(&app).await.unwrap();
        assert_eq!(ids.len(), 8);

        app.run_worker(
            WorkerConfig::default()
                .with_queues(["sums", "retry"])
                .with_wait(false)
                .with_install_signal_handlers(false),
        )
        .await
        .unwrap();

        let status = |id: JobId| connector.job(id.as_i64()).map(|job| job.status);
        assert_eq!(status(ids[0]), Some(JobStatus::Succeeded));
        assert_eq!(status(ids[1]), Some(JobStatus::Succeeded));
        assert_eq!(status(ids[2]), Some(JobStatus::Failed));
        assert_eq!(status(ids[3]), Some(JobStatus::Succeeded));
        assert_eq!(status(ids[4]), Some(JobStatus::Todo));
        assert_eq!(status(ids[7]), Some(JobStatus::Succeeded));
        assert_eq!(connector.job(ids[7].as_i64()).unwrap().attempts, 3);
    }

    #[test]
    fn tick_is_scheduled() {
        let app = demo_app(Arc::new(InMemoryConnector::new())).unwrap();
        assert_eq!(app.registry().periodic_registry().len(), 1);
        assert!(app.task("tick").is_some());
    }
}
