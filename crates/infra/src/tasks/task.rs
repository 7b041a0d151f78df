//! Task definitions and per-call deferral.
//!
//! A [`Task`] pairs a name with a callable and its deferral defaults
//! (queue, lock, priority, retry). Callables are either `async` (awaited on
//! the worker's runtime) or blocking (run on the blocking thread pool).
//! Arguments arrive as a JSON object and are deserialized into the
//! callable's own argument type; return values are serialized back to JSON
//! for logging.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use procrastinate_core::{
    Clock, DEFAULT_PRIORITY, DEFAULT_QUEUE, Error as DomainError, JobArgs, JobId, NewJob,
    RetryPolicy, RetryValue, SystemClock, TaskError,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::JobContext;
use crate::manager::{JobManager, ManagerError};

/// What a task run produces.
pub type TaskResult = Result<Value, TaskError>;

/// Type-erased entry point of a task, also the `next` of a middleware.
pub type Next = Arc<dyn Fn(JobContext, JobArgs) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Wraps a task run: receives the rest of the chain, the context and the
/// arguments.
pub type Middleware =
    Arc<dyn Fn(Next, JobContext, JobArgs) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// A named unit of work.
#[derive(Clone)]
pub struct Task {
    name: String,
    aliases: Vec<String>,
    queue: String,
    lock: Option<String>,
    queueing_lock: Option<String>,
    priority: i32,
    retry: Option<Arc<dyn RetryPolicy>>,
    pass_context: bool,
    is_async: bool,
    runner: Next,
    manager: Option<JobManager>,
    clock: Arc<dyn Clock>,
}

impl Task {
    /// An async task taking its arguments only.
    pub fn new<A, F, Fut, R, E>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<TaskError> + 'static,
    {
        let runner: Next = Arc::new(move |_: JobContext, args: JobArgs| {
            let call = parse_args::<A>(args).map(&func);
            async move { into_task_result(call?.await) }.boxed()
        });
        Self::from_runner(name, runner, true, false)
    }

    /// An async task that also receives its [`JobContext`].
    pub fn with_context<A, F, Fut, R, E>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(JobContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<TaskError> + 'static,
    {
        let runner: Next = Arc::new(move |ctx: JobContext, args: JobArgs| {
            let call = parse_args::<A>(args).map(|args| func(ctx, args));
            async move { into_task_result(call?.await) }.boxed()
        });
        Self::from_runner(name, runner, true, true)
    }

    /// A synchronous task, run on the blocking thread pool.
    pub fn blocking<A, F, R, E>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize + 'static,
        E: Into<TaskError> + 'static,
    {
        let func = Arc::new(func);
        let runner: Next = Arc::new(move |_: JobContext, args: JobArgs| {
            let func = func.clone();
            run_blocking(move || into_task_result(func(parse_args::<A>(args)?)))
        });
        Self::from_runner(name, runner, false, false)
    }

    /// A synchronous task that receives its [`JobContext`]. Long-running
    /// bodies should call [`JobContext::check_abort`] between steps.
    pub fn blocking_with_context<A, F, R, E>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(JobContext, A) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize + 'static,
        E: Into<TaskError> + 'static,
    {
        let func = Arc::new(func);
        let runner: Next = Arc::new(move |ctx: JobContext, args: JobArgs| {
            let func = func.clone();
            run_blocking(move || into_task_result(func(ctx, parse_args::<A>(args)?)))
        });
        Self::from_runner(name, runner, false, true)
    }

    fn from_runner(name: impl Into<String>, runner: Next, is_async: bool, pass_context: bool) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            queue: DEFAULT_QUEUE.to_string(),
            lock: None,
            queueing_lock: None,
            priority: DEFAULT_PRIORITY,
            retry: None,
            pass_context,
            is_async,
            runner,
            manager: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
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
        self.priority = priority;
        self
    }

    /// `false`, `true`, a max attempt count, a [`RetryStrategy`] or any
    /// [`RetryPolicy`].
    ///
    /// [`RetryStrategy`]: procrastinate_core::RetryStrategy
    pub fn with_retry(mut self, retry: impl Into<RetryValue>) -> Self {
        self.retry = retry.into().into_policy();
        self
    }

    /// Wrap the task in `middleware`. The most recently added middleware is
    /// the outermost one.
    pub fn with_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(Next, JobContext, JobArgs) -> BoxFuture<'static, TaskResult> + Send + Sync + 'static,
    {
        let middleware: Middleware = Arc::new(middleware);
        let inner = self.runner.clone();
        self.runner = Arc::new(move |ctx: JobContext, args: JobArgs| {
            middleware(inner.clone(), ctx, args)
        });
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn lock(&self) -> Option<&str> {
        self.lock.as_deref()
    }

    pub fn queueing_lock(&self) -> Option<&str> {
        self.queueing_lock.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry.as_ref()
    }

    pub fn pass_context(&self) -> bool {
        self.pass_context
    }

    /// Async tasks can be interrupted at an await point; blocking ones only
    /// stop when they check for it.
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_bound(&self) -> bool {
        self.manager.is_some()
    }

    /// Run the task with its middleware chain. Panics are reported as task
    /// failures of kind `Panic`.
    pub fn run(&self, ctx: JobContext, args: JobArgs) -> BoxFuture<'static, TaskResult> {
        let future = (self.runner)(ctx, args);
        async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(TaskError::failed("Panic", panic_message(panic.as_ref()))),
            }
        }
        .boxed()
    }

    pub(crate) fn bind(mut self, manager: JobManager, clock: Arc<dyn Clock>) -> Self {
        self.manager = Some(manager);
        self.clock = clock;
        self
    }

    /// Copy of this task under `<namespace>:<name>`, aliases prefixed too.
    pub(crate) fn namespaced(&self, namespace: &str) -> Self {
        let mut task = self.clone();
        task.name = format!("{namespace}:{}", self.name);
        task.aliases = self
            .aliases
            .iter()
            .map(|alias| format!("{namespace}:{alias}"))
            .collect();
        task
    }

    /// Deferral with per-call overrides, starting from the task's defaults.
    pub fn configure(&self) -> JobDeferrer {
        let mut job = NewJob::new(self.name.clone())
            .with_queue(self.queue.clone())
            .with_priority(self.priority);
        job.lock = self.lock.clone();
        job.queueing_lock = self.queueing_lock.clone();
        JobDeferrer {
            task_name: self.name.clone(),
            manager: self.manager.clone(),
            clock: self.clock.clone(),
            job,
            schedule_at: None,
            schedule_in: None,
        }
    }

    /// Defer a job with the task's defaults.
    pub async fn defer<A: Serialize + ?Sized>(&self, args: &A) -> Result<JobId, ManagerError> {
        self.configure().defer(args).await
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("queue", &self.queue)
            .field("lock", &self.lock)
            .field("queueing_lock", &self.queueing_lock)
            .field("priority", &self.priority)
            .field("retry", &self.retry)
            .field("pass_context", &self.pass_context)
            .field("is_async", &self.is_async)
            .field("bound", &self.manager.is_some())
            .finish()
    }
}

/// One deferral of a task, with overrides.
#[derive(Debug, Clone)]
pub struct JobDeferrer {
    task_name: String,
    manager: Option<JobManager>,
    clock: Arc<dyn Clock>,
    job: NewJob,
    schedule_at: Option<DateTime<Utc>>,
    schedule_in: Option<Duration>,
}

impl JobDeferrer {
    /// Deferrer for a task known only by name (e.g. defined in another
    /// process).
    pub fn new(manager: JobManager, job: NewJob, clock: Arc<dyn Clock>) -> Self {
        Self {
            task_name: job.task_name.clone(),
            manager: Some(manager),
            clock,
            job,
            schedule_at: None,
            schedule_in: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.job.queue = queue.into();
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.job.lock = Some(lock.into());
        self
    }

    pub fn with_queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.job.queueing_lock = Some(queueing_lock.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job.priority = priority;
        self
    }

    /// Static arguments merged under the per-call ones.
    pub fn with_task_kwargs(mut self, kwargs: JobArgs) -> Self {
        self.job.task_kwargs.extend(kwargs);
        self
    }

    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.schedule_in = Some(delay);
        self
    }

    /// The job that `defer` would insert.
    pub fn build_job<A: Serialize + ?Sized>(&self, args: &A) -> Result<NewJob, DomainError> {
        let mut job = self.job.clone();
        job.task_kwargs.extend(args_to_map(args)?);
        job.scheduled_at = match (self.schedule_at, self.schedule_in) {
            (Some(_), Some(_)) => {
                return Err(DomainError::validation(
                    "cannot set both schedule_at and schedule_in",
                ));
            }
            (Some(at), None) => Some(at),
            (None, Some(delay)) => Some(self.clock.now() + delay),
            (None, None) => None,
        };
        Ok(job)
    }

    pub async fn defer<A: Serialize + ?Sized>(&self, args: &A) -> Result<JobId, ManagerError> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| DomainError::unbound_task(self.task_name.clone()))?;
        let job = self.build_job(args)?;
        manager.defer_job(&job).await
    }
}

/// Serialize task arguments. `()` and `null` mean "no arguments"; anything
/// else must serialize to a JSON object.
pub fn args_to_map<A: Serialize + ?Sized>(args: &A) -> Result<JobArgs, DomainError> {
    match serde_json::to_value(args) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(JobArgs::new()),
        Ok(other) => Err(DomainError::validation(format!(
            "task arguments must be a JSON object, got {other}"
        ))),
        Err(e) => Err(DomainError::validation(format!("unserializable task arguments: {e}"))),
    }
}

/// Deserialize a job's arguments into a task's argument type.
pub fn parse_args<A: DeserializeOwned>(args: JobArgs) -> Result<A, TaskError> {
    Ok(serde_json::from_value(Value::Object(args))?)
}

fn into_task_result<R: Serialize, E: Into<TaskError>>(result: Result<R, E>) -> TaskResult {
    let value = result.map_err(Into::into)?;
    serde_json::to_value(value).map_err(|e| TaskError::failed("InvalidResult", e.to_string()))
}

fn run_blocking<F>(func: F) -> BoxFuture<'static, TaskResult>
where
    F: FnOnce() -> TaskResult + Send + 'static,
{
    async move {
        match tokio::task::spawn_blocking(func).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                Err(TaskError::failed("Panic", panic_message(e.into_panic().as_ref())))
            }
            Err(e) => Err(TaskError::failed("Cancelled", e.to_string())),
        }
    }
    .boxed()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
