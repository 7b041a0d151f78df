//! `procrastinate-infra`: PostgreSQL job queue runtime.
//!
//! ## Design
//!
//! - PostgreSQL is the single source of truth: job rows, their events and
//!   worker heartbeats live in the schema installed by [`SchemaManager`]
//! - Every state change goes through a stored procedure, so concurrent
//!   workers cannot claim the same job or break a lock
//! - LISTEN/NOTIFY wakes idle workers early; polling keeps them correct
//!   without it
//!
//! ## Components
//!
//! | Module | Role |
//! |---|---|
//! | `connector` | database boundary (`PgConnector`, `InMemoryConnector`) |
//! | `schema` | DDL and query catalog |
//! | `manager` | job lifecycle operations on top of a connector |
//! | `tasks` | task definitions, blueprints, job context, deferral |
//! | `periodic` | cron schedules and the periodic deferrer |
//! | `processor` | runs one job and records its outcome |
//! | `worker` | fetch loop, concurrency, abort and shutdown handling |
//! | `app` | wires a connector to a registry |

pub mod app;
pub mod builtin_tasks;
pub mod connector;
pub mod healthchecks;
pub mod manager;
pub mod periodic;
pub mod processor;
pub mod schema;
pub mod signals;
pub mod tasks;
pub mod worker;

pub use app::{App, AppError};
pub use connector::{
    Connector, ConnectorConfig, ConnectorError, InMemoryConnector, PgConnector, Row, SqlValue,
};
pub use healthchecks::{HealthCheck, HealthReport, run_healthchecks};
pub use manager::{JobFilter, JobManager, ManagerError, OldJobs};
pub use periodic::{PeriodicConfig, PeriodicDeferrer, PeriodicRegistry, PeriodicTask};
pub use processor::{JobOutcome, JobProcessor};
pub use schema::SchemaManager;
pub use tasks::{
    AbortReason, AbortSignal, Blueprint, JobContext, JobDeferrer, Middleware, Next, Task,
    TaskResult,
};
pub use worker::{Worker, WorkerConfig, WorkerStats};
