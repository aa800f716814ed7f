//! Snapshot reads over the revision log.
//!
//! A snapshot read at revision `R` returns, for every matching key, the newest row with
//! `id <= R`. Results are ordered by key name so a caller can page through them by
//! passing the last key it saw as the next exclusive lower bound.
//!
//! Every result carries the log's current revision and compaction boundary as observed
//! by the same statement. A caller that asked for a revision below the boundary can tell
//! with [`ListResult::ensure_revision`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::trace;

use crate::backend::{Driver, Row, Value};
use crate::dialect::SqlTemplates;
use crate::storage::{CountResult, ListResult, RevisionRow, StorageError, StorageResult};

/// Where `current`, `as_of` and `count` read from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Resolve every read from the full log. Historical reads are exact.
    #[default]
    Log,

    /// Resolve reads from the one-row-per-key projection.
    ///
    /// Faster for large histories, but the projection only knows each key's latest
    /// row: `as_of` ignores `max_revision` when selecting rows and can return a key's
    /// current state instead of its state at that revision. Use [`ReadMode::Log`]
    /// when strict historical reads are required.
    Projection,
}

impl ReadMode {
    pub fn uses_projection(&self) -> bool {
        matches!(self, ReadMode::Projection)
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadMode::Log => f.write_str("log"),
            ReadMode::Projection => f.write_str("projection"),
        }
    }
}

impl FromStr for ReadMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" | "strict" => Ok(ReadMode::Log),
            "projection" | "accelerated" => Ok(ReadMode::Projection),
            _ => Err(StorageError::InvalidArgument(format!(
                "Invalid read mode: {}. Must be 'log' or 'projection'",
                s
            ))),
        }
    }
}

/// Answers listing, counting and watermark queries.
pub struct SnapshotQuery {
    driver: Arc<dyn Driver>,
    templates: Arc<SqlTemplates>,
    mode: ReadMode,
}

impl SnapshotQuery {
    pub fn new(driver: Arc<dyn Driver>, templates: Arc<SqlTemplates>, mode: ReadMode) -> Self {
        Self {
            driver,
            templates,
            mode,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Latest row of every key matching `pattern`.
    pub async fn current(
        &self,
        pattern: &str,
        include_deleted: bool,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        self.as_of(pattern, None, 0, include_deleted, limit).await
    }

    /// Newest row with `id <= max_revision` of every key matching `pattern` and,
    /// when given, sorting strictly after `min_key_exclusive`.
    ///
    /// `max_revision <= 0` reads the latest state. `limit` of `None` or `<= 0`
    /// returns every match.
    pub async fn as_of(
        &self,
        pattern: &str,
        min_key_exclusive: Option<&str>,
        max_revision: i64,
        include_deleted: bool,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        let max_revision = if max_revision <= 0 {
            i64::MAX
        } else {
            max_revision
        };
        let limit = limit.filter(|l| *l > 0);
        let min_key = min_key_exclusive.unwrap_or("");

        let t = &self.templates;
        let (sql, mut args) = match self.mode {
            ReadMode::Log => (
                if limit.is_some() { &t.list_limited } else { &t.list },
                vec![
                    Value::from(pattern),
                    Value::from(min_key),
                    Value::Int(max_revision),
                    Value::Bool(include_deleted),
                ],
            ),
            ReadMode::Projection => (
                if limit.is_some() {
                    &t.list_projection_limited
                } else {
                    &t.list_projection
                },
                vec![
                    Value::from(pattern),
                    Value::from(min_key),
                    Value::Bool(include_deleted),
                ],
            ),
        };
        if let Some(limit) = limit {
            args.push(Value::Int(limit));
        }

        trace!(pattern, min_key, max_revision, include_deleted, ?limit, mode = %self.mode, "list");
        let rows = self.driver.query(sql, &args).await?;
        self.list_result(rows).await
    }

    /// Number of keys matching `pattern`, counted the same way `current` lists them.
    pub async fn count(&self, pattern: &str, include_deleted: bool) -> StorageResult<CountResult> {
        let sql = match self.mode {
            ReadMode::Log => &self.templates.count,
            ReadMode::Projection => &self.templates.count_projection,
        };
        let rows = self
            .driver
            .query(sql, &[Value::from(pattern), Value::Bool(include_deleted)])
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| StorageError::Decode("count returned no rows".to_string()))?;

        Ok(CountResult {
            current_revision: row.get_opt_i64(0)?.unwrap_or(0),
            count: row.get_opt_i64(1)?.unwrap_or(0),
        })
    }

    /// Every log row of matching keys with `id > revision`, oldest first.
    ///
    /// Always reads the log, whatever the mode; this is how the layer above replays
    /// changes for watchers.
    pub async fn after(
        &self,
        pattern: &str,
        revision: i64,
        limit: Option<i64>,
    ) -> StorageResult<ListResult> {
        let limit = limit.filter(|l| *l > 0);
        let mut args = vec![Value::from(pattern), Value::Int(revision)];
        let sql = match limit {
            Some(limit) => {
                args.push(Value::Int(limit));
                &self.templates.after_limited
            }
            None => &self.templates.after,
        };

        let rows = self.driver.query(sql, &args).await?;
        self.list_result(rows).await
    }

    pub async fn current_revision(&self) -> StorageResult<i64> {
        let rows = self.driver.query(&self.templates.current_revision, &[]).await?;
        first_i64(&rows)
    }

    pub async fn compact_revision(&self) -> StorageResult<i64> {
        let rows = self.driver.query(&self.templates.compact_revision, &[]).await?;
        first_i64(&rows)
    }

    /// `(current_revision, compact_revision)` read by one statement.
    pub async fn watermarks(&self) -> StorageResult<(i64, i64)> {
        let rows = self.driver.query(&self.templates.watermarks, &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| StorageError::Decode("watermark query returned no rows".to_string()))?;
        Ok((
            row.get_opt_i64(0)?.unwrap_or(0),
            row.get_opt_i64(1)?.unwrap_or(0),
        ))
    }

    /// Approximate on-disk size of the log in bytes.
    pub async fn size(&self) -> StorageResult<i64> {
        let rows = self.driver.query(&self.templates.size, &[]).await?;
        first_i64(&rows)
    }

    /// Decodes listing rows, each carrying the watermarks in its first two columns.
    ///
    /// An empty listing has nowhere to carry them, so they come from a second statement
    /// issued right after. Those watermarks can be newer than the snapshot that found no
    /// rows: a matching write committed in between is covered by the reported
    /// `current_revision` without appearing in `rows`. Callers that resume from the
    /// reported revision should list again with an explicit `max_revision`.
    async fn list_result(&self, rows: Vec<Row>) -> StorageResult<ListResult> {
        let (current_revision, compact_revision) = match rows.first() {
            Some(first) => (
                first.get_opt_i64(0)?.unwrap_or(0),
                first.get_opt_i64(1)?.unwrap_or(0),
            ),
            None => self.watermarks().await?,
        };

        let rows = rows
            .iter()
            .map(|row| RevisionRow::from_row(row, 2))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ListResult {
            current_revision,
            compact_revision,
            rows,
        })
    }
}

/// First column of the first row; an empty aggregate reads as 0.
fn first_i64(rows: &[Row]) -> StorageResult<i64> {
    match rows.first() {
        Some(row) => Ok(row.get_opt_i64(0)?.unwrap_or(0)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDriver;
    use crate::dialect::{prefix_pattern, Dialect};
    use crate::storage::schema::apply_schema;
    use crate::storage::{NewRevision, RevisionLog};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, mode: ReadMode) -> (RevisionLog, SnapshotQuery) {
        let driver: Arc<dyn Driver> = Arc::new(
            SqliteDriver::open(&dir.path().join("query.db"), Duration::from_secs(1)).unwrap(),
        );
        let templates = Arc::new(SqlTemplates::new(Dialect::Sqlite));
        apply_schema(driver.as_ref(), &templates).await.unwrap();
        (
            RevisionLog::new(driver.clone(), templates.clone(), mode.uses_projection()),
            SnapshotQuery::new(driver, templates, mode),
        )
    }

    async fn put(log: &RevisionLog, query: &SnapshotQuery, key: &str, value: &[u8]) -> i64 {
        let existing = query.current(key, true, None).await.unwrap();
        let rev = match existing.rows.iter().find(|r| r.name == key) {
            Some(prev) if !prev.deleted => NewRevision::update(prev, value.to_vec(), 0),
            Some(prev) => NewRevision::create(key, value.to_vec(), 0, prev.id),
            None => NewRevision::create(key, value.to_vec(), 0, 0),
        };
        log.insert(&rev).await.unwrap()
    }

    #[test]
    fn test_read_mode_parsing() {
        assert_eq!("log".parse::<ReadMode>().unwrap(), ReadMode::Log);
        assert_eq!("Projection".parse::<ReadMode>().unwrap(), ReadMode::Projection);
        assert!("fast".parse::<ReadMode>().is_err());
        assert_eq!(ReadMode::default(), ReadMode::Log);
    }

    #[tokio::test]
    async fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let (_, query) = setup(&dir, ReadMode::Log).await;

        let result = query.current("%", false, None).await.unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.current_revision, 0);
        assert_eq!(result.compact_revision, 0);

        let count = query.count("%", true).await.unwrap();
        assert_eq!(count.count, 0);
        assert_eq!(query.current_revision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_as_of_resolves_per_key_history() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;

        let rev1 = put(&log, &query, "k", b"v1").await;
        let rev2 = put(&log, &query, "k", b"v2").await;
        let _rev3 = put(&log, &query, "other", b"x").await;
        let _rev4 = put(&log, &query, "k", b"v3").await;

        let at1 = query.as_of("k", None, rev1, false, None).await.unwrap();
        assert_eq!(at1.rows.len(), 1);
        assert_eq!(at1.rows[0].value, b"v1".to_vec());

        let at2 = query.as_of("%", None, rev2, false, None).await.unwrap();
        assert_eq!(at2.rows.len(), 1);
        assert_eq!(at2.rows[0].value, b"v2".to_vec());

        let latest = query.current("%", false, None).await.unwrap();
        let names: Vec<_> = latest.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["k", "other"]);
        assert_eq!(latest.rows[0].value, b"v3".to_vec());
        assert_eq!(latest.current_revision, 4);
    }

    #[tokio::test]
    async fn test_prefix_matching_is_literal() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;

        put(&log, &query, "/a_b/1", b"1").await;
        put(&log, &query, "/axb/2", b"2").await;
        put(&log, &query, "/A_b/3", b"3").await;

        let result = query
            .current(&prefix_pattern("/a_b/"), false, None)
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].name, "/a_b/1");
    }

    #[tokio::test]
    async fn test_pagination() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;

        for key in ["c", "a", "b"] {
            put(&log, &query, key, b"v").await;
        }
        let latest = query.current_revision().await.unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = query
                .as_of("%", cursor.as_deref(), latest, false, Some(1))
                .await
                .unwrap();
            match page.last_key() {
                Some(key) => {
                    seen.push(key.to_string());
                    cursor = Some(key.to_string());
                }
                None => break,
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_count_matches_current() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;

        let a = put(&log, &query, "a", b"1").await;
        put(&log, &query, "b", b"2").await;
        put(&log, &query, "b", b"3").await;
        let a_row = query.current("a", false, None).await.unwrap().rows[0].clone();
        assert_eq!(a_row.id, a);
        log.insert(&NewRevision::tombstone(&a_row)).await.unwrap();

        let live = query.count("%", false).await.unwrap();
        assert_eq!(live.count, 1);
        assert_eq!(live.current_revision, 4);

        let all = query.count("%", true).await.unwrap();
        assert_eq!(all.count, 2);
    }

    #[tokio::test]
    async fn test_after_returns_history_in_order() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;

        let r1 = put(&log, &query, "/x/a", b"1").await;
        put(&log, &query, "/y/b", b"2").await;
        put(&log, &query, "/x/a", b"3").await;

        let events = query.after("/x/%", 0, None).await.unwrap();
        let ids: Vec<_> = events.rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);

        let events = query.after("%", r1, Some(1)).await.unwrap();
        assert_eq!(events.rows.len(), 1);
        assert_eq!(events.rows[0].id, 2);
    }

    #[tokio::test]
    async fn test_projection_mode_reads_latest_rows() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Projection).await;

        let rev1 = put(&log, &query, "k", b"v1").await;
        put(&log, &query, "k", b"v2").await;
        put(&log, &query, "j", b"w").await;

        let latest = query.current("%", false, None).await.unwrap();
        assert_eq!(latest.rows.len(), 2);
        assert_eq!(latest.rows[0].name, "j");
        assert_eq!(latest.rows[1].value, b"v2".to_vec());

        // The projection only holds current rows, so an older revision still sees v2.
        let old = query.as_of("k", None, rev1, false, None).await.unwrap();
        assert_eq!(old.rows[0].value, b"v2".to_vec());

        assert_eq!(query.count("%", false).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_size_is_reported() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;
        put(&log, &query, "a", b"1").await;
        assert!(query.size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_empty_listing_reports_watermarks() {
        let dir = TempDir::new().unwrap();
        let (log, query) = setup(&dir, ReadMode::Log).await;
        put(&log, &query, "a", b"1").await;
        let head = put(&log, &query, "a", b"2").await;

        let missing = query.current("/nothing/%", false, None).await.unwrap();
        assert!(missing.rows.is_empty());
        assert_eq!(missing.current_revision, head);
        assert_eq!(missing.compact_revision, 0);

        let after = query.after("a", head, None).await.unwrap();
        assert!(after.rows.is_empty());
        assert_eq!(after.current_revision, head);
    }
}
