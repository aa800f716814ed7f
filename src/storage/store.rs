//! The store facade: one handle over the log, the query engine and compaction.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::{self, BackendConfig, Driver};
use crate::dialect::{Dialect, SqlTemplates};
use crate::storage::schema::{apply_schema, rebuild_projection};
use crate::storage::{
    CompactionEngine, CompactionOutcome, CountResult, ListResult, NewRevision, ReadMode,
    RevisionLog, SnapshotQuery, StorageError, StorageResult,
};

/// Settings for opening a [`SqlLog`].
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    pub backend: BackendConfig,

    pub read_mode: ReadMode,

    /// Upper bound on each operation, including time spent waiting for the connection.
    /// `None` waits indefinitely.
    pub operation_timeout: Option<Duration>,
}

/// A revisioned, compactable key-value log stored in a relational database.
///
/// Cheap to share behind an `Arc`; every operation is a self-contained transaction or
/// single statement.
pub struct SqlLog {
    driver: Arc<dyn Driver>,
    templates: Arc<SqlTemplates>,
    log: RevisionLog,
    query: SnapshotQuery,
    compaction: CompactionEngine,
    operation_timeout: Option<Duration>,
}

impl SqlLog {
    /// Connects, creating the database if needed, and brings the schema up to date.
    pub async fn open(config: StoreConfig) -> StorageResult<Self> {
        let driver = backend::connect(&config.backend).await?;
        Self::from_driver(driver, config.read_mode, config.operation_timeout).await
    }

    /// Builds a store on an existing connection.
    ///
    /// In [`ReadMode::Projection`] the projection is rebuilt from the log first, since
    /// writes made in log mode do not maintain it.
    pub async fn from_driver(
        driver: Arc<dyn Driver>,
        read_mode: ReadMode,
        operation_timeout: Option<Duration>,
    ) -> StorageResult<Self> {
        let templates = Arc::new(SqlTemplates::new(driver.dialect()));

        apply_schema(driver.as_ref(), &templates).await?;
        if read_mode.uses_projection() {
            rebuild_projection(driver.as_ref(), &templates).await?;
        }

        info!(
            backend = %driver.dialect(),
            read_mode = %read_mode,
            "Revision log store ready"
        );

        Ok(Self {
            log: RevisionLog::new(
                driver.clone(),
                templates.clone(),
                read_mode.uses_projection(),
            ),
            query: SnapshotQuery::new(driver.clone(), templates.clone(), read_mode),
            compaction: CompactionEngine::new(driver.clone(), templates.clone()),
            driver,
            templates,
            operation_timeout,
        })
    }

    /// Runs `op` under the configured deadline. Dropping the future on expiry rolls
    /// back whatever transaction it held.
    async fn bounded<T>(&self, op: impl Future<Output = StorageResult<T>>) -> StorageResult<T> {
        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| StorageError::Timeout(limit))?,
            None => op.await,
        }
    }

    /// Appends a revision; see [`RevisionLog::insert`].
    pub async fn insert(&self, rev: &NewRevision) -> StorageResult<i64> {
        self.bounded(self.log.insert(rev)).await
    }

    /// Removes one log row by revision; see [`RevisionLog::delete`].
    pub async fn delete(&self, revision: i64) -> StorageResult<u64> {
        self.bounded(self.log.delete(revision)).await
    }

    pub async fn current(
        &self,
        pattern: &str,
        include_deleted: bool,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        self.bounded(self.query.current(pattern, include_deleted, limit))
            .await
    }

    pub async fn as_of(
        &self,
        pattern: &str,
        min_key_exclusive: Option<&str>,
        max_revision: i64,
        include_deleted: bool,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        self.bounded(self.query.as_of(
            pattern,
            min_key_exclusive,
            max_revision,
            include_deleted,
            limit,
        ))
        .await
    }

    pub async fn count(&self, pattern: &str, include_deleted: bool) -> StorageResult<CountResult> {
        self.bounded(self.query.count(pattern, include_deleted)).await
    }

    pub async fn after(
        &self,
        pattern: &str,
        revision: i64,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        self.bounded(self.query.after(pattern, revision, limit)).await
    }

    /// Compacts up to `boundary`; see [`CompactionEngine::compact`].
    pub async fn compact(&self, boundary: i64) -> StorageResult<CompactionOutcome> {
        self.bounded(self.compaction.compact(boundary)).await
    }

    pub async fn current_revision(&self) -> StorageResult<i64> {
        self.bounded(self.query.current_revision()).await
    }

    pub async fn compact_revision(&self) -> StorageResult<i64> {
        self.bounded(self.query.compact_revision()).await
    }

    /// Approximate bytes used by the database.
    pub async fn size(&self) -> StorageResult<i64> {
        self.bounded(self.query.size()).await
    }

    pub fn dialect(&self) -> Dialect {
        self.templates.dialect
    }

    pub fn read_mode(&self) -> ReadMode {
        self.query.mode()
    }

    pub fn templates(&self) -> &SqlTemplates {
        &self.templates
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDriver;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir, name: &str) -> StoreConfig {
        StoreConfig {
            backend: BackendConfig {
                dialect: Dialect::Sqlite,
                endpoint: dir.path().join(name).display().to_string(),
                busy_timeout: Duration::from_secs(1),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_creates_database() {
        let dir = TempDir::new().unwrap();
        let store = SqlLog::open(sqlite_config(&dir, "nested/state.db"))
            .await
            .unwrap();

        assert!(dir.path().join("nested/state.db").exists());
        assert_eq!(store.dialect(), Dialect::Sqlite);
        assert_eq!(store.read_mode(), ReadMode::Log);
        assert_eq!(store.current_revision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_projection_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir, "state.db");

        {
            let store = SqlLog::open(config.clone()).await.unwrap();
            store
                .insert(&NewRevision::create("a", b"1".to_vec(), 0, 0))
                .await
                .unwrap();
            let a = store.current("a", false, None).await.unwrap().rows[0].clone();
            store
                .insert(&NewRevision::update(&a, b"2".to_vec(), 0))
                .await
                .unwrap();
        }

        let store = SqlLog::open(StoreConfig {
            read_mode: ReadMode::Projection,
            ..config
        })
        .await
        .unwrap();
        let result = store.current("%", false, None).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].value, b"2".to_vec());
        assert_eq!(result.current_revision, 2);
    }

    #[tokio::test]
    async fn test_operation_timeout_rolls_back() {
        let dir = TempDir::new().unwrap();
        let driver: Arc<dyn Driver> = Arc::new(
            SqliteDriver::open(&dir.path().join("t.db"), Duration::from_secs(1)).unwrap(),
        );
        let store = SqlLog::from_driver(
            driver.clone(),
            ReadMode::Log,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        // Hold the connection so the insert cannot start.
        let blocker = driver.begin().await.unwrap();
        let err = store
            .insert(&NewRevision::create("a", b"1".to_vec(), 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)));
        drop(blocker);

        assert_eq!(store.current_revision().await.unwrap(), 0);
        store
            .insert(&NewRevision::create("a", b"1".to_vec(), 0, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operation_timeout_fires_while_file_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let store = SqlLog::open(StoreConfig {
            backend: BackendConfig {
                dialect: Dialect::Sqlite,
                endpoint: path.display().to_string(),
                busy_timeout: Duration::from_secs(3),
            },
            operation_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .await
        .unwrap();

        // A second connection holds the file's write lock.
        let other = SqliteDriver::open(&path, Duration::from_secs(1)).unwrap();
        let blocker = other.begin().await.unwrap();

        let started = std::time::Instant::now();
        let err = store
            .insert(&NewRevision::create("a", b"1".to_vec(), 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)), "unexpected error: {}", err);
        assert!(started.elapsed() < Duration::from_secs(1));

        blocker.rollback().await.unwrap();
        store
            .insert(&NewRevision::create("a", b"1".to_vec(), 0, 0))
            .await
            .unwrap();
        assert_eq!(store.current_revision().await.unwrap(), 1);
    }
}
