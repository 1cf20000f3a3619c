//! Database boundary.
//!
//! The rest of the crate only needs to enumerate tables and columns, fetch a
//! bounded number of rows for literal SQL text, and dry-run a statement.
//! [`SqlDatabase`] captures exactly that; [`SqlxDatabase`] implements it over
//! a bounded sqlx pool for PostgreSQL and SQLite.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, sqlite::SqlitePoolOptions, PgPool, SqlitePool};
use thiserror::Error;

use crate::tools::BoxFuture;

mod postgres;
mod sqlite;

/// One result row, keyed by column name in select order.
pub type SqlRow = serde_json::Map<String, Value>;

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default time to wait for a pooled connection before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: None,
        }
    }
}

/// Rows fetched for one statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<SqlRow>,
}

/// Broad classification of database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseErrorKind {
    /// The connection or pool is gone (I/O, TLS, closed pool).
    Connection,
    /// No pooled connection became available within the acquire timeout.
    PoolExhausted,
    /// The database rejected the statement.
    Query,
    /// A value could not be converted into JSON.
    Decode,
    /// The URL or driver is not supported.
    Unsupported,
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DatabaseErrorKind::Connection => "connection error",
            DatabaseErrorKind::PoolExhausted => "connection pool exhausted",
            DatabaseErrorKind::Query => "query error",
            DatabaseErrorKind::Decode => "decode error",
            DatabaseErrorKind::Unsupported => "unsupported",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Connection, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Query, message)
    }

    /// Whether a model could reasonably try again (possibly with different SQL).
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, DatabaseErrorKind::Unsupported)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::new(
                DatabaseErrorKind::PoolExhausted,
                "timed out waiting for a database connection",
            ),
            sqlx::Error::PoolClosed => Self::connection("connection pool is closed"),
            sqlx::Error::Io(e) => Self::connection(e.to_string()),
            sqlx::Error::Tls(e) => Self::connection(e.to_string()),
            sqlx::Error::WorkerCrashed => Self::connection("database worker crashed"),
            sqlx::Error::Configuration(e) => Self::connection(e.to_string()),
            sqlx::Error::Database(db) => Self::query(db.message().to_string()),
            e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
                Self::new(DatabaseErrorKind::Decode, e.to_string())
            }
            other => Self::query(other.to_string()),
        }
    }
}

/// Read and execute capability the catalog and executor depend on.
pub trait SqlDatabase: Send + Sync {
    /// Short backend label used in logs and prompts (e.g. "postgres").
    fn backend(&self) -> &'static str;

    /// Names of user tables and views, sorted.
    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, DatabaseError>>;

    /// Columns of `table` in declaration order. Empty when the table is unknown.
    fn table_columns<'a>(
        &'a self,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>, DatabaseError>>;

    /// Runs literal SQL and returns at most `limit` rows.
    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<RowSet, DatabaseError>>;

    /// Plans `sql` without executing it.
    fn explain<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DatabaseError>>;

    /// Cheap round-trip used for health checks.
    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>>;
}

/// Pool settings for [`SqlxDatabase::connect`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `postgres://`, `postgresql://` or `sqlite:` URL.
    pub url: String,
    pub max_connections: u32,
    /// Bound on waiting for a pooled connection; exhaustion surfaces as
    /// [`DatabaseErrorKind::PoolExhausted`] instead of blocking.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
enum DatabasePool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// [`SqlDatabase`] over a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct SqlxDatabase {
    pool: DatabasePool,
}

impl SqlxDatabase {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = cfg.url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.max_connections)
                .acquire_timeout(cfg.acquire_timeout)
                .connect(url)
                .await?;
            return Ok(Self::from_pg_pool(pool));
        }
        if url.starts_with("sqlite:") {
            let mut options = SqlitePoolOptions::new().acquire_timeout(cfg.acquire_timeout);
            // Every connection to an in-memory database sees its own empty
            // database, so keep exactly one alive for the pool's lifetime.
            if url.contains(":memory:") || url.contains("mode=memory") {
                options = options
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None);
            } else {
                options = options.max_connections(cfg.max_connections);
            }
            let pool = options.connect(url).await?;
            return Ok(Self::from_sqlite_pool(pool));
        }
        Err(DatabaseError::new(
            DatabaseErrorKind::Unsupported,
            "unsupported database url; expected postgres://, postgresql:// or sqlite:",
        ))
    }

    pub fn from_pg_pool(pool: PgPool) -> Self {
        Self {
            pool: DatabasePool::Postgres(pool),
        }
    }

    pub fn from_sqlite_pool(pool: SqlitePool) -> Self {
        Self {
            pool: DatabasePool::Sqlite(pool),
        }
    }

    /// Closes every pooled connection; later calls fail with a connection error.
    pub async fn close(&self) {
        match &self.pool {
            DatabasePool::Postgres(pool) => pool.close().await,
            DatabasePool::Sqlite(pool) => pool.close().await,
        }
    }
}

impl SqlDatabase for SqlxDatabase {
    fn backend(&self) -> &'static str {
        match &self.pool {
            DatabasePool::Postgres(_) => "postgres",
            DatabasePool::Sqlite(_) => "sqlite",
        }
    }

    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, DatabaseError>> {
        Box::pin(async move {
            match &self.pool {
                DatabasePool::Postgres(pool) => postgres::list_tables(pool).await,
                DatabasePool::Sqlite(pool) => sqlite::list_tables(pool).await,
            }
        })
    }

    fn table_columns<'a>(
        &'a self,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>, DatabaseError>> {
        Box::pin(async move {
            match &self.pool {
                DatabasePool::Postgres(pool) => postgres::table_columns(pool, table).await,
                DatabasePool::Sqlite(pool) => sqlite::table_columns(pool, table).await,
            }
        })
    }

    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<RowSet, DatabaseError>> {
        Box::pin(async move {
            match &self.pool {
                DatabasePool::Postgres(pool) => postgres::fetch_rows(pool, sql, limit).await,
                DatabasePool::Sqlite(pool) => sqlite::fetch_rows(pool, sql, limit).await,
            }
        })
    }

    fn explain<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DatabaseError>> {
        Box::pin(async move {
            let statement = format!("EXPLAIN {sql}");
            match &self.pool {
                DatabasePool::Postgres(pool) => {
                    sqlx::query(&statement).persistent(false).fetch_all(pool).await?;
                }
                DatabasePool::Sqlite(pool) => {
                    sqlx::query(&statement).persistent(false).fetch_all(pool).await?;
                }
            }
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(async move {
            match &self.pool {
                DatabasePool::Postgres(pool) => {
                    sqlx::query("SELECT 1").execute(pool).await?;
                }
                DatabasePool::Sqlite(pool) => {
                    sqlx::query("SELECT 1").execute(pool).await?;
                }
            }
            Ok(())
        })
    }
}

/// Double-quotes an identifier for use in generated SQL.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
