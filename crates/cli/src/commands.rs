//! Argument parsing and the subcommands.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use procrastinate_core::{DeleteJobCondition, JobArgs};
use procrastinate_infra::{
    App, AppError, ConnectorConfig, PgConnector, SchemaManager, WorkerConfig, run_healthchecks,
};
use procrastinate_observability::LogFormat;
use serde_json::Value;

use crate::shell::Shell;

/// Exit status of `defer` when the queueing lock is taken.
pub const EXIT_ALREADY_ENQUEUED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "procrastinate")]
#[command(about = "Interact with a Procrastinate app. See subcommands for details.")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Use multiple times to increase verbosity
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text, global = true)]
    pub log_format: LogFormatArg,

    /// PostgreSQL URL (libpq PG* variables are used when unset)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,
}

impl GlobalArgs {
    /// `-v` count, or `PROCRASTINATE_VERBOSE` when no flag is given.
    pub fn verbosity(&self) -> u8 {
        if self.verbose > 0 {
            return self.verbose;
        }
        std::env::var("PROCRASTINATE_VERBOSE")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        match &self.database_url {
            Some(url) => ConnectorConfig::default().with_database_url(url.clone()),
            None => ConnectorConfig::default(),
        }
    }

    /// An app on PostgreSQL with only the builtin tasks.
    pub fn app(&self) -> App {
        App::new(Arc::new(PgConnector::new(self.connector_config())))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Launch a worker, listening on the given queues (or all queues)
    Worker(WorkerArgs),
    /// Create a job from the given task, to be executed by a worker
    Defer(DeferArgs),
    /// Apply the SQL schema to an empty database, or print it
    Schema(SchemaArgs),
    /// Check the state of procrastinate
    Healthchecks,
    /// Administration shell
    Shell {
        /// Run this shell command and exit
        args: Vec<String>,
    },
}

impl Command {
    fn needs_database(&self) -> bool {
        match self {
            Command::Schema(args) => args.action() == SchemaAction::Apply,
            _ => true,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct WorkerArgs {
    /// Queues to listen to, comma-separated or repeated (all queues if empty)
    #[arg(value_delimiter = ',', env = "PROCRASTINATE_WORKER_QUEUES")]
    pub queues: Vec<String>,

    /// Name of the worker
    #[arg(short, long, env = "PROCRASTINATE_WORKER_NAME")]
    pub name: Option<String>,

    /// Number of jobs processed at once
    #[arg(short, long, env = "PROCRASTINATE_WORKER_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Seconds between two polls when no notification arrives
    #[arg(short = 't', long = "timeout", value_parser = parse_seconds)]
    pub fetch_job_polling_interval: Option<Duration>,

    /// Seconds between two checks for abort requests
    #[arg(long, value_parser = parse_seconds)]
    pub abort_job_polling_interval: Option<Duration>,

    /// Exit once every eligible job has been processed
    #[arg(long)]
    pub one_shot: bool,

    /// Only poll, never LISTEN for new jobs
    #[arg(long)]
    pub no_listen_notify: bool,

    /// Seconds to wait for running jobs on stop before aborting them
    #[arg(long, value_parser = parse_seconds)]
    pub shutdown_timeout: Option<Duration>,

    /// Delete jobs on completion: never, successful or always
    #[arg(long, env = "PROCRASTINATE_WORKER_DELETE_JOBS")]
    pub delete_jobs: Option<DeleteJobCondition>,
}

impl WorkerArgs {
    /// `defaults` overridden by the flags that were given.
    pub fn to_config(&self, defaults: &WorkerConfig) -> WorkerConfig {
        let mut config = defaults.clone();
        if !self.queues.is_empty() {
            config = config.with_queues(self.queues.iter().filter(|queue| !queue.is_empty()));
        }
        if let Some(name) = &self.name {
            config = config.with_name(name.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(interval) = self.fetch_job_polling_interval {
            config = config.with_fetch_job_polling_interval(interval);
        }
        if let Some(interval) = self.abort_job_polling_interval {
            config = config.with_abort_job_polling_interval(interval);
        }
        if self.one_shot {
            config = config.with_wait(false);
        }
        if self.no_listen_notify {
            config = config.with_listen_notify(false);
        }
        if let Some(timeout) = self.shutdown_timeout {
            config = config.with_shutdown_timeout(timeout);
        }
        if let Some(delete_jobs) = self.delete_jobs {
            config = config.with_delete_jobs(delete_jobs);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeferArgs {
    /// Name of the task to defer
    pub task: String,

    /// JSON object with the job parameters
    pub json_args: Option<String>,

    /// Queue of the job (defaults to the task's queue)
    #[arg(long)]
    pub queue: Option<String>,

    /// Jobs sharing a lock never run concurrently
    #[arg(long)]
    pub lock: Option<String>,

    /// Refuse the job if one with this queueing lock is already waiting
    #[arg(long)]
    pub queueing_lock: Option<String>,

    /// Higher values run first
    #[arg(long)]
    pub priority: Option<i32>,

    /// RFC 3339 datetime after which to launch the job
    #[arg(long = "at", value_parser = parse_datetime, conflicts_with = "schedule_in")]
    pub schedule_at: Option<DateTime<Utc>>,

    /// Number of seconds after which to launch the job
    #[arg(long = "in")]
    pub schedule_in: Option<i64>,

    /// Exit with code 0 even if the queueing lock is taken
    #[arg(short, long)]
    pub ignore_already_enqueued: bool,

    /// Allow deferring tasks this app does not know
    #[arg(long)]
    pub unknown: bool,
}

#[derive(Args, Debug, Clone, Default)]
#[group(multiple = false)]
pub struct SchemaArgs {
    /// Apply the schema to the database (default)
    #[arg(long)]
    pub apply: bool,

    /// Print the schema SQL
    #[arg(long)]
    pub read: bool,

    /// Print the directory holding the SQL scripts
    #[arg(long)]
    pub migrations_path: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaAction {
    Apply,
    Read,
    MigrationsPath,
}

impl SchemaArgs {
    fn action(&self) -> SchemaAction {
        if self.read {
            SchemaAction::Read
        } else if self.migrations_path {
            SchemaAction::MigrationsPath
        } else {
            SchemaAction::Apply
        }
    }
}

/// How a command ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Unhealthy,
    AlreadyEnqueued,
}

impl Outcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Unhealthy => ExitCode::FAILURE,
            Outcome::AlreadyEnqueued => ExitCode::from(EXIT_ALREADY_ENQUEUED),
        }
    }
}

/// Run `command` against `app`, writing results to `out`.
///
/// The app is opened when the command needs the database and closed
/// afterwards.
pub async fn run<W: Write>(command: &Command, app: &App, out: &mut W) -> anyhow::Result<Outcome> {
    if !command.needs_database() {
        return execute(command, app, out).await;
    }
    app.open().await.context("could not connect to the database")?;
    let outcome = execute(command, app, out).await;
    if let Err(e) = app.close().await {
        tracing::warn!(action = "close_app", error = %e, "failed to close connector");
    }
    outcome
}

async fn execute<W: Write>(command: &Command, app: &App, out: &mut W) -> anyhow::Result<Outcome> {
    match command {
        Command::Worker(args) => worker(app, args).await,
        Command::Defer(args) => defer(app, args).await,
        Command::Schema(args) => schema(app, args, out).await,
        Command::Healthchecks => healthchecks(app, out).await,
        Command::Shell { args } => {
            let shell = Shell::new(app.job_manager().clone());
            if args.is_empty() {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                shell.run(stdin, out).await?;
            } else {
                shell.execute(&args.join(" "), out).await?;
            }
            Ok(Outcome::Success)
        }
    }
}

async fn worker(app: &App, args: &WorkerArgs) -> anyhow::Result<Outcome> {
    let config = args.to_config(app.worker_defaults());
    match &config.queues {
        Some(queues) => eprintln!("Launching a worker on {}", queues.join(", ")),
        None => eprintln!("Launching a worker on all queues"),
    }
    let stats = app.run_worker(config).await?;
    tracing::debug!(action = "worker_stats", stats = ?stats, "worker finished");
    Ok(Outcome::Success)
}

async fn defer(app: &App, args: &DeferArgs) -> anyhow::Result<Outcome> {
    let job_args = load_json_args(args.json_args.as_deref())?;
    if !args.unknown && app.task(&args.task).is_none() {
        bail!(
            "task {:?} is not registered on this app (use --unknown to defer it anyway)",
            args.task
        );
    }

    let mut deferrer = app.configure_task(&args.task);
    if let Some(queue) = &args.queue {
        deferrer = deferrer.with_queue(queue.clone());
    }
    if let Some(lock) = &args.lock {
        deferrer = deferrer.with_lock(lock.clone());
    }
    if let Some(queueing_lock) = &args.queueing_lock {
        deferrer = deferrer.with_queueing_lock(queueing_lock.clone());
    }
    if let Some(priority) = args.priority {
        deferrer = deferrer.with_priority(priority);
    }
    if let Some(at) = args.schedule_at {
        deferrer = deferrer.schedule_at(at);
    }
    if let Some(seconds) = args.schedule_in {
        deferrer = deferrer.schedule_in(chrono::Duration::seconds(seconds));
    }

    let rendered = job_args
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ");
    eprintln!("Launching a job: {}({rendered})", args.task);

    match deferrer.defer(&job_args).await.map_err(AppError::from) {
        Ok(job_id) => {
            eprintln!("Job {job_id} deferred");
            Ok(Outcome::Success)
        }
        Err(e) if e.is_already_enqueued() => {
            if args.ignore_already_enqueued {
                eprintln!("{e} (ignored)");
                Ok(Outcome::Success)
            } else {
                eprintln!("{e}");
                Ok(Outcome::AlreadyEnqueued)
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse the `defer` JSON argument, which must be an object.
pub fn load_json_args(json_args: Option<&str>) -> anyhow::Result<JobArgs> {
    let Some(json_args) = json_args else {
        return Ok(JobArgs::new());
    };
    match serde_json::from_str(json_args) {
        Ok(Value::Object(args)) => Ok(args),
        _ => bail!("incorrect JSON_ARGS value, expecting a valid JSON object"),
    }
}

async fn schema<W: Write>(app: &App, args: &SchemaArgs, out: &mut W) -> anyhow::Result<Outcome> {
    match args.action() {
        SchemaAction::Apply => {
            eprintln!("Applying schema");
            app.schema_manager()
                .apply_schema()
                .await
                .context("failed to apply the schema")?;
            eprintln!("Done");
        }
        SchemaAction::Read => writeln!(out, "{}", SchemaManager::get_schema().trim())?,
        SchemaAction::MigrationsPath => {
            writeln!(out, "{}", SchemaManager::get_migrations_path().display())?
        }
    }
    Ok(Outcome::Success)
}

async fn healthchecks<W: Write>(app: &App, out: &mut W) -> anyhow::Result<Outcome> {
    let report = run_healthchecks(app.job_manager()).await;
    for check in &report.checks {
        let status = if check.ok { "OK" } else { "FAILED" };
        writeln!(out, "{}: {status} ({})", check.name, check.detail)?;
    }
    if report.is_healthy() {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::Unhealthy)
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds {value:?}: {e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {value:?}: {e}"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 datetime {value:?}: {e}"))
}
