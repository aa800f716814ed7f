//! SQLite driver built on rusqlite.
//!
//! One connection serves every caller. A transaction holds the connection for its
//! whole lifetime, so transactions are serialized in process, and `BEGIN IMMEDIATE`
//! serializes them against other processes sharing the file. Statements run on the
//! blocking pool so a slow disk or a locked file never stalls the runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Driver, Row, Transaction, Value};
use crate::dialect::Dialect;
use crate::storage::{StorageError, StorageResult};

/// Database file used when no endpoint is configured.
pub const DEFAULT_PATH: &str = "./db/state.db";

/// Resolves the configured endpoint to a database file path.
pub fn database_path(endpoint: &str) -> PathBuf {
    let endpoint = endpoint.strip_prefix("sqlite://").unwrap_or(endpoint);
    if endpoint.is_empty() {
        PathBuf::from(DEFAULT_PATH)
    } else {
        PathBuf::from(endpoint)
    }
}

/// Makes sure the directory holding the database file exists.
///
/// SQLite creates the file itself on first open.
pub fn ensure_database_exists(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Bootstrap(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Int(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::Bool(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*v))),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

fn translate(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            Dialect::Sqlite.translate(&failure.extended_code.to_string(), err.to_string())
        }
        _ => Dialect::Sqlite.translate("rusqlite", err.to_string()),
    }
}

fn decode(value: ValueRef<'_>, idx: usize) -> StorageResult<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
        ValueRef::Real(v) => {
            return Err(StorageError::Decode(format!(
                "column {}: unexpected floating point value {}",
                idx, v
            )))
        }
    })
}

fn run_query(conn: &Connection, sql: &str, args: &[Value]) -> StorageResult<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql).map_err(translate)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(args.iter())).map_err(translate)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(translate)? {
        let mut values = Vec::with_capacity(columns);
        for idx in 0..columns {
            values.push(decode(row.get_ref(idx).map_err(translate)?, idx)?);
        }
        out.push(Row::new(values));
    }
    Ok(out)
}

fn run_execute(conn: &Connection, sql: &str, args: &[Value]) -> StorageResult<u64> {
    let mut stmt = conn.prepare_cached(sql).map_err(translate)?;
    let affected = stmt.execute(params_from_iter(args.iter())).map_err(translate)?;
    Ok(affected as u64)
}

/// True for `SQLITE_BUSY` and its extended variants.
fn is_busy(err: &StorageError) -> bool {
    match err {
        StorageError::Backend { code, .. } => code
            .parse::<i32>()
            .map(|code| code & 0xff == rusqlite::ffi::SQLITE_BUSY)
            .unwrap_or(false),
        _ => false,
    }
}

/// Pause between attempts while another connection holds the write lock.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// The connection, locked for one caller.
///
/// Dropping it while a transaction is still open rolls that transaction back. This
/// also covers work abandoned on the blocking pool when its caller gave up waiting.
struct LockedConn(OwnedMutexGuard<Connection>);

impl LockedConn {
    fn conn(&self) -> &Connection {
        &self.0
    }
}

impl Drop for LockedConn {
    fn drop(&mut self) {
        if !self.0.is_autocommit() {
            if let Err(e) = self.0.execute_batch("ROLLBACK") {
                warn!("Rollback of abandoned transaction failed: {}", e);
            }
        }
    }
}

/// Runs `work` on the blocking pool and hands the connection back with its result.
///
/// `SQLITE_BUSY` is retried here rather than in SQLite's busy handler, so the wait
/// happens on the runtime and a deadline around the caller can interrupt it.
async fn run_blocking<T, F>(
    mut conn: LockedConn,
    busy_timeout: Duration,
    work: F,
) -> StorageResult<(LockedConn, StorageResult<T>)>
where
    F: Fn(&Connection) -> StorageResult<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let work = Arc::new(work);
    let give_up = Instant::now() + busy_timeout;

    loop {
        let attempt = work.clone();
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = attempt(conn.conn());
            (conn, result)
        })
        .await
        .map_err(|e| StorageError::Backend {
            code: "join".to_string(),
            message: format!("sqlite worker failed: {}", e),
        })?;
        conn = returned;

        match result {
            Err(e) if is_busy(&e) && Instant::now() < give_up => {
                debug!("Database is locked, retrying");
                tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
            }
            result => return Ok((conn, result)),
        }
    }
}

/// SQLite-backed [`Driver`].
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDriver {
    /// Opens (or creates) the database file at `path`.
    ///
    /// Configures WAL journaling and case-sensitive `LIKE` so prefix matching behaves
    /// the same as on PostgreSQL. Lock waits of up to `busy_timeout` are handled by the
    /// driver itself.
    pub fn open(path: &Path, busy_timeout: Duration) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(translate)?;

        conn.busy_timeout(Duration::ZERO).map_err(translate)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(translate)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(translate)?;
        conn.pragma_update(None, "case_sensitive_like", true)
            .map_err(translate)?;

        debug!("Opened sqlite database at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            busy_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self) -> LockedConn {
        LockedConn(self.conn.clone().lock_owned().await)
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&self, sql: &str, args: &[Value]) -> StorageResult<Vec<Row>> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        let (_, result) = run_blocking(self.lock().await, self.busy_timeout, move |conn| {
            run_query(conn, &sql, &args)
        })
        .await?;
        result
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> StorageResult<u64> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        let (_, result) = run_blocking(self.lock().await, self.busy_timeout, move |conn| {
            run_execute(conn, &sql, &args)
        })
        .await?;
        result
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        let (conn, result) = run_blocking(self.lock().await, self.busy_timeout, |conn| {
            conn.execute_batch("BEGIN IMMEDIATE").map_err(translate)
        })
        .await?;
        result?;
        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
            busy_timeout: self.busy_timeout,
        }))
    }
}

/// An open `BEGIN IMMEDIATE` transaction on the shared connection.
///
/// The connection leaves the transaction while a statement runs on the blocking pool
/// and comes back with the result. If the caller is dropped in between, the
/// [`LockedConn`] rolls back on its own.
pub struct SqliteTransaction {
    conn: Option<LockedConn>,
    busy_timeout: Duration,
}

impl SqliteTransaction {
    fn take(&mut self) -> StorageResult<LockedConn> {
        self.conn
            .take()
            .ok_or_else(|| StorageError::InvalidArgument("transaction already finished".to_string()))
    }

    async fn run<T, F>(&mut self, work: F) -> StorageResult<T>
    where
        F: Fn(&Connection) -> StorageResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let (conn, result) = run_blocking(self.take()?, self.busy_timeout, work).await?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&mut self, sql: &str, args: &[Value]) -> StorageResult<Vec<Row>> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        self.run(move |conn| run_query(conn, &sql, &args)).await
    }

    async fn execute(&mut self, sql: &str, args: &[Value]) -> StorageResult<u64> {
        let (sql, args) = (sql.to_string(), args.to_vec());
        self.run(move |conn| run_execute(conn, &sql, &args)).await
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        // A failed COMMIT leaves the transaction open; dropping the connection rolls it back.
        let (_, result) = run_blocking(self.take()?, self.busy_timeout, |conn| {
            conn.execute_batch("COMMIT").map_err(translate)
        })
        .await?;
        result
    }

    async fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        let (_, result) = run_blocking(self.take()?, self.busy_timeout, |conn| {
            conn.execute_batch("ROLLBACK").map_err(translate)
        })
        .await?;
        result
    }
}
