//! Generic driver shell over the supported relational engines.
//!
//! The storage engine never talks to a database client directly. It hands rendered SQL
//! and a slice of [`Value`]s to a [`Driver`] (or to a [`Transaction`] begun on one) and
//! gets plain [`Row`]s back. Each driver translates native failures through its
//! [`Dialect`] before returning, so errors above this module are already classified.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::dialect::Dialect;
use crate::storage::{StorageError, StorageResult};

pub use self::postgres::PostgresDriver;
pub use self::sqlite::SqliteDriver;

/// A statement parameter or a result cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// One result row, cells in select-list order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn cell(&self, idx: usize) -> StorageResult<&Value> {
        self.values
            .get(idx)
            .ok_or_else(|| StorageError::Decode(format!("column {} out of range", idx)))
    }

    /// Integer cell; NULL is an error.
    pub fn get_i64(&self, idx: usize) -> StorageResult<i64> {
        self.get_opt_i64(idx)?
            .ok_or_else(|| StorageError::Decode(format!("column {} is NULL", idx)))
    }

    /// Integer cell; aggregates over empty sets come back as `None`.
    pub fn get_opt_i64(&self, idx: usize) -> StorageResult<Option<i64>> {
        match self.cell(idx)? {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            Value::Bool(v) => Ok(Some(i64::from(*v))),
            other => Err(StorageError::Decode(format!(
                "column {}: expected integer, got {:?}",
                idx, other
            ))),
        }
    }

    /// 0/1 flag column.
    pub fn get_flag(&self, idx: usize) -> StorageResult<bool> {
        Ok(self.get_opt_i64(idx)?.unwrap_or(0) != 0)
    }

    pub fn get_string(&self, idx: usize) -> StorageResult<String> {
        match self.cell(idx)? {
            Value::Text(v) => Ok(v.clone()),
            Value::Bytes(v) => String::from_utf8(v.clone())
                .map_err(|e| StorageError::Decode(format!("column {}: {}", idx, e))),
            other => Err(StorageError::Decode(format!(
                "column {}: expected text, got {:?}",
                idx, other
            ))),
        }
    }

    /// Byte cell; NULL reads as empty.
    pub fn get_bytes(&self, idx: usize) -> StorageResult<Vec<u8>> {
        match self.cell(idx)? {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(v) => Ok(v.clone()),
            Value::Text(v) => Ok(v.as_bytes().to_vec()),
            other => Err(StorageError::Decode(format!(
                "column {}: expected bytes, got {:?}",
                idx, other
            ))),
        }
    }
}

/// A handle that executes rendered SQL against one database.
///
/// Statements issued directly on the driver run in autocommit mode.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn dialect(&self) -> Dialect;

    /// Runs a statement that produces rows.
    async fn query(&self, sql: &str, args: &[Value]) -> StorageResult<Vec<Row>>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&self, sql: &str, args: &[Value]) -> StorageResult<u64>;

    /// Starts a write transaction.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;
}

/// An open transaction.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back,
/// so a cancelled operation leaves nothing behind.
#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, sql: &str, args: &[Value]) -> StorageResult<Vec<Row>>;

    async fn execute(&mut self, sql: &str, args: &[Value]) -> StorageResult<u64>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Connection settings for a backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Which engine to talk to.
    pub dialect: Dialect,

    /// Connection string (postgres) or database file path (sqlite).
    /// Empty selects the backend default.
    pub endpoint: String,

    /// How long sqlite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            endpoint: String::new(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Creates the target database if needed and connects to it.
///
/// Database creation is a one-time bootstrap step that tolerates running in
/// several processes at once; schema is applied separately.
pub async fn connect(config: &BackendConfig) -> StorageResult<Arc<dyn Driver>> {
    info!(backend = %config.dialect, "Connecting to database");

    let driver: Arc<dyn Driver> = match config.dialect {
        Dialect::Postgres => {
            let pg_config = postgres::parse_dsn(&config.endpoint)?;
            postgres::ensure_database_exists(&pg_config).await?;
            Arc::new(PostgresDriver::connect(&pg_config).await?)
        }
        Dialect::Sqlite => {
            let path = sqlite::database_path(&config.endpoint);
            sqlite::ensure_database_exists(&path)?;
            Arc::new(SqliteDriver::open(&path, config.busy_timeout)?)
        }
    };

    Ok(driver)
}
