//! PostgreSQL connector built on a sqlx pool.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ConnectorError | Scenario |
//! |------------|----------------------|----------------|----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` | Queueing lock already taken, or two fetchers racing for one lock |
//! | Database (other) | Any other | `Database` | `P0002` from finish/retry on a job that is not running, terminal-status guard, ... |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Connection` | Database unreachable |
//! | Other | N/A | `Database` | Anything else |
//!
//! ## Columns
//!
//! Rows are decoded by column type into a [`Row`]. Enum columns are cast to
//! text in the catalog queries, so only builtin types appear here.

use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgListener, PgPoolOptions, PgRow};
use sqlx::query::Query as SqlxQuery;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo};
use tracing::{debug, error, info, instrument, warn};

use super::{Connector, ConnectorError, NotificationHandler, Row, SqlValue};
use crate::schema::queries::Query;

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection settings.
///
/// Without a URL, libpq environment variables (`PGHOST`, `PGPORT`, `PGUSER`,
/// `PGPASSWORD`, `PGDATABASE`, ...) are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectorConfig {
    /// Defaults, with the URL taken from `DATABASE_URL` when set.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            ..Self::default()
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn connect_options(&self) -> Result<PgConnectOptions, ConnectorError> {
        match &self.database_url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| ConnectorError::Connection(format!("invalid database url: {e}"))),
            None => Ok(PgConnectOptions::new()),
        }
    }
}

/// Connector backed by a sqlx `PgPool`.
///
/// The pool is created by `open` (or supplied with [`PgConnector::from_pool`])
/// and shared by clones of the pool handle; `listen` takes its own dedicated
/// connection through `PgListener`.
#[derive(Debug)]
pub struct PgConnector {
    config: ConnectorConfig,
    pool: Mutex<Option<PgPool>>,
}

impl PgConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    /// Use an existing pool; `open` becomes a no-op.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            config: ConnectorConfig::default(),
            pool: Mutex::new(Some(pool)),
        }
    }

    fn pool(&self) -> Result<PgPool, ConnectorError> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectorError::NotOpen)
    }
}

#[async_trait::async_trait]
impl Connector for PgConnector {
    #[instrument(skip(self), fields(max_connections = self.config.max_connections), err)]
    async fn open(&self) -> Result<(), ConnectorError> {
        if self.pool.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_with(self.config.connect_options()?)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(pool);
            info!(action = "connector_open", "connection pool opened");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(action = "connector_close", "connection pool closed");
        }
        Ok(())
    }

    #[instrument(skip(self, params), fields(query = query.name), err)]
    async fn execute(&self, query: &Query, params: &[SqlValue]) -> Result<u64, ConnectorError> {
        let pool = self.pool()?;
        let result = bind_params(sqlx::query(query.sql), params)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error(query.name, e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, params), fields(query = query.name), err)]
    async fn fetch_one(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Option<Row>, ConnectorError> {
        let pool = self.pool()?;
        let row = bind_params(sqlx::query(query.sql), params)
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error(query.name, e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, params), fields(query = query.name), err)]
    async fn fetch_all(
        &self,
        query: &Query,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, ConnectorError> {
        let pool = self.pool()?;
        let rows = bind_params(sqlx::query(query.sql), params)
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error(query.name, e))?;
        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self, script), err)]
    async fn execute_script(&self, script: &str) -> Result<(), ConnectorError> {
        let pool = self.pool()?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("execute_script", e))?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(script))
            .await
            .map_err(|e| map_sqlx_error("execute_script", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("execute_script", e))?;
        Ok(())
    }

    async fn listen(
        &self,
        channels: &[String],
        on_notification: NotificationHandler,
    ) -> Result<(), ConnectorError> {
        let pool = self.pool()?;
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;
        debug!(action = "listen", channels = ?channels, "listening for notifications");

        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    on_notification(
                        notification.channel().to_string(),
                        notification.payload().to_string(),
                    )
                    .await;
                }
                // The listener reconnects and re-issues LISTEN on the next call.
                Ok(None) => {
                    warn!(action = "listen_reconnect", "notification connection lost, reconnecting");
                }
                Err(e) => {
                    error!(action = "listen_error", error = %e, "error while waiting for notifications");
                    tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                }
            }
        }
    }
}

fn bind_params<'q>(
    mut query: SqlxQuery<'q, Postgres, PgArguments>,
    params: &[SqlValue],
) -> SqlxQuery<'q, Postgres, PgArguments> {
    for param in params {
        query = match param.clone() {
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::BigInt(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::TextArray(v) => query.bind(v),
            SqlValue::Json(v) => query.bind(v.map(sqlx::types::Json)),
            SqlValue::Timestamp(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, ConnectorError> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name()).map_err(|e| {
            ConnectorError::Decode {
                column: column.name().to_string(),
                message: e.to_string(),
            }
        })?;
        decoded.insert(column.name(), value);
    }
    Ok(decoded)
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "VOID" => Value::Null,
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index)?.unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|at| at.to_rfc3339())
            .into(),
        "INT8[]" => row.try_get::<Option<Vec<i64>>, _>(index)?.into(),
        "TEXT[]" | "VARCHAR[]" => row.try_get::<Option<Vec<String>>, _>(index)?.into(),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" | "CHAR" => {
            row.try_get::<Option<String>, _>(index)?.into()
        }
        _ => row.try_get_unchecked::<Option<String>, _>(index)?.into(),
    };
    Ok(value)
}

/// Map SQLx errors to connector errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|code| code.into_owned());
            match code.as_deref() {
                Some(super::UNIQUE_VIOLATION) => ConnectorError::UniqueViolation {
                    operation: operation.to_string(),
                    constraint: db_err.constraint().map(str::to_string),
                    message: db_err.message().to_string(),
                },
                _ => ConnectorError::database(operation, code, db_err.message()),
            }
        }
        sqlx::Error::PoolClosed => {
            ConnectorError::Connection(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            ConnectorError::Connection(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::Io(e) => ConnectorError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => ConnectorError::Connection(format!("tls error in {operation}: {e}")),
        other => ConnectorError::database(operation, None, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders() {
        let config = ConnectorConfig::default()
            .with_database_url("postgres://localhost/jobs")
            .with_max_connections(0)
            .with_acquire_timeout(Duration::from_secs(3));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert!(config.connect_options().is_ok());
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let config = ConnectorConfig::default().with_database_url("not a url");
        assert!(matches!(
            config.connect_options(),
            Err(ConnectorError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn queries_before_open_fail() {
        let connector = PgConnector::new(ConnectorConfig::default());
        let err = connector
            .execute(&crate::schema::queries::CHECK_CONNECTION, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotOpen));
        // closing an unopened connector is fine
        connector.close().await.unwrap();
    }

    #[test]
    fn pool_errors_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error("fetch_job", sqlx::Error::PoolClosed),
            ConnectorError::Connection(msg) if msg.contains("fetch_job")
        ));
        assert!(matches!(
            map_sqlx_error("fetch_job", sqlx::Error::RowNotFound),
            ConnectorError::Database { code: None, .. }
        ));
    }
}
