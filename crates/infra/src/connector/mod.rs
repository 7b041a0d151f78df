//! Database boundary.
//!
//! ## Design
//!
//! - The connector is the only component that talks to PostgreSQL
//! - Statements come from the query catalog (`schema::queries`) with
//!   positional [`SqlValue`] parameters
//! - Rows come back as [`Row`]: a JSON object keyed by column name, decoded
//!   into domain types by the job manager
//! - `listen` keeps a dedicated connection and forwards every notification
//!   to a handler, reconnecting transparently
//!
//! ## Components
//!
//! - `Connector`: the trait
//! - `PgConnector`: sqlx pool + `PgListener`
//! - `InMemoryConnector`: the same state machine in process, for tests

pub mod in_memory;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::schema::queries::Query;

pub use in_memory::InMemoryConnector;
pub use postgres::{ConnectorConfig, PgConnector};

/// Channel receiving notifications for every queue.
pub const ANY_QUEUE_CHANNEL: &str = "procrastinate_any_queue";

/// Prefix of per-queue channels: `procrastinate_queue#<queue>`.
pub const QUEUE_CHANNEL_PREFIX: &str = "procrastinate_queue#";

/// SQLSTATE for unique violations.
pub const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE raised by the job procedures when the target row is missing or in
/// the wrong status.
pub const NO_DATA_FOUND: &str = "P0002";

/// Channels to LISTEN on for a set of queues (`None` = every queue).
pub fn channels_for_queues(queues: Option<&[String]>) -> Vec<String> {
    match queues {
        None => vec![ANY_QUEUE_CHANNEL.to_string()],
        Some(queues) => queues
            .iter()
            .map(|queue| format!("{QUEUE_CHANNEL_PREFIX}{queue}"))
            .collect(),
    }
}

/// Callback invoked with `(channel, payload)` for each notification.
pub type NotificationHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connector error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// `open` was never called (or `close` already was).
    #[error("connector is not open")]
    NotOpen,

    /// Could not reach the database.
    #[error("connection error: {0}")]
    Connection(String),

    /// A unique constraint rejected the statement.
    #[error("unique violation on {constraint:?} in {operation}: {message}")]
    UniqueViolation {
        operation: String,
        constraint: Option<String>,
        message: String,
    },

    /// Any other database error.
    #[error("database error in {operation} ({code:?}): {message}")]
    Database {
        operation: String,
        code: Option<String>,
        message: String,
    },

    /// A column could not be decoded into the requested type.
    #[error("failed to decode column {column}: {message}")]
    Decode { column: String, message: String },

    /// The statement is not part of the query catalog.
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),
}

impl ConnectorError {
    pub fn database(
        operation: impl Into<String>,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    pub fn unique_violation(
        operation: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::UniqueViolation {
            operation: operation.into(),
            constraint: Some(constraint.into()),
            message: message.into(),
        }
    }

    /// SQLSTATE, when the database reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ConnectorError::UniqueViolation { .. } => Some(UNIQUE_VIOLATION),
            ConnectorError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Name of the violated unique constraint, if this is a unique violation.
    pub fn constraint_name(&self) -> Option<&str> {
        match self {
            ConnectorError::UniqueViolation { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }
}

/// A positional, typed query parameter. `None` binds a typed NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Bool(Option<bool>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Float(Option<f64>),
    Text(Option<String>),
    TextArray(Option<Vec<String>>),
    Json(Option<Value>),
    Timestamp(Option<DateTime<Utc>>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Bool(v) => v.is_none(),
            SqlValue::Int(v) => v.is_none(),
            SqlValue::BigInt(v) => v.is_none(),
            SqlValue::Float(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
            SqlValue::TextArray(v) => v.is_none(),
            SqlValue::Json(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(Some(v))
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(Some(v))
    }
}

impl From<Option<i32>> for SqlValue {
    fn from(v: Option<i32>) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(Some(v))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(Some(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(v: Option<&str>) -> Self {
        SqlValue::Text(v.map(str::to_string))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Option<Vec<String>>> for SqlValue {
    fn from(v: Option<Vec<String>>) -> Self {
        SqlValue::TextArray(v)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(v: Vec<String>) -> Self {
        SqlValue::TextArray(Some(v))
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        SqlValue::Json(Some(v))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(Some(v))
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// A result row, keyed by column name.
///
/// Timestamps are stored as RFC 3339 strings so that `get::<DateTime<Utc>>`
/// works through serde like every other column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(serde_json::Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Raw value; a missing column reads as NULL.
    pub fn value(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&Value::Null)
    }

    pub fn is_null(&self, column: &str) -> bool {
        self.value(column).is_null()
    }

    pub fn get<T: DeserializeOwned>(&self, column: &str) -> Result<T, ConnectorError> {
        serde_json::from_value(self.value(column).clone()).map_err(|e| ConnectorError::Decode {
            column: column.to_string(),
            message: e.to_string(),
        })
    }

    pub fn into_map(self) -> serde_json::Map<String, Value> {
        self.0
    }
}

impl From<serde_json::Map<String, Value>> for Row {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Abstract boundary to the database.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Create the pool. Idempotent.
    async fn open(&self) -> Result<(), ConnectorError>;

    /// Close the pool. Idempotent.
    async fn close(&self) -> Result<(), ConnectorError>;

    /// Run a statement for its side effects; returns affected rows.
    async fn execute(&self, query: &Query, params: &[SqlValue]) -> Result<u64, ConnectorError>;

    /// First row, if any.
    async fn fetch_one(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Option<Row>, ConnectorError>;

    async fn fetch_all(&self, query: &Query, params: &[SqlValue])
    -> Result<Vec<Row>, ConnectorError>;

    /// Run a multi-statement script in one transaction (schema installation).
    async fn execute_script(&self, script: &str) -> Result<(), ConnectorError>;

    /// LISTEN on `channels` and call `on_notification` for each notification.
    ///
    /// Runs until the returned future is dropped; errors only when listening
    /// cannot start at all.
    async fn listen(
        &self,
        channels: &[String],
        on_notification: NotificationHandler,
    ) -> Result<(), ConnectorError>;
}

#[async_trait::async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn open(&self) -> Result<(), ConnectorError> {
        (**self).open().await
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        (**self).close().await
    }

    async fn execute(&self, query: &Query, params: &[SqlValue]) -> Result<u64, ConnectorError> {
        (**self).execute(query, params).await
    }

    async fn fetch_one(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Option<Row>, ConnectorError> {
        (**self).fetch_one(query, params).await
    }

    async fn fetch_all(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, ConnectorError> {
        (**self).fetch_all(query, params).await
    }

    async fn execute_script(&self, script: &str) -> Result<(), ConnectorError> {
        (**self).execute_script(script).await
    }

    async fn listen(
        &self,
        channels: &[String],
        on_notification: NotificationHandler,
    ) -> Result<(), ConnectorError> {
        (**self).listen(channels, on_notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_for_all_queues() {
        assert_eq!(channels_for_queues(None), vec!["procrastinate_any_queue"]);
    }

    #[test]
    fn channels_per_queue() {
        let queues = vec!["emails".to_string(), "default".to_string()];
        assert_eq!(
            channels_for_queues(Some(&queues)),
            vec!["procrastinate_queue#emails", "procrastinate_queue#default"]
        );
    }

    #[test]
    fn row_reads_missing_columns_as_null() {
        let row = Row::new().with("id", 3);
        assert_eq!(row.get::<i64>("id").unwrap(), 3);
        assert_eq!(row.get::<Option<String>>("lock").unwrap(), None);
        assert!(matches!(
            row.get::<i64>("lock"),
            Err(ConnectorError::Decode { column, .. }) if column == "lock"
        ));
    }

    #[test]
    fn unique_violation_exposes_constraint() {
        let err = ConnectorError::unique_violation("defer_job", "idx", "dup");
        assert_eq!(err.code(), Some(UNIQUE_VIOLATION));
        assert_eq!(err.constraint_name(), Some("idx"));
        assert_eq!(ConnectorError::NotOpen.constraint_name(), None);
    }
}
