//! The append-only revision log and its two mutation primitives.
//!
//! Every change to a key is a new row. The unique `(name, prev_revision)` index is the
//! only concurrency control: two writers extending a key from the same revision race on
//! that index and exactly one of them commits. The loser gets
//! [`StorageError::KeyExists`](crate::storage::StorageError::KeyExists) and is expected
//! to re-read and retry; nothing is retried here.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{Driver, Value};
use crate::dialect::SqlTemplates;
use crate::storage::{NewRevision, StorageError, StorageResult};

/// Appends and removes log rows, keeping the projection in step.
pub struct RevisionLog {
    driver: Arc<dyn Driver>,
    templates: Arc<SqlTemplates>,

    /// Upsert `kv_current` alongside each append.
    projection: bool,
}

impl RevisionLog {
    pub fn new(driver: Arc<dyn Driver>, templates: Arc<SqlTemplates>, projection: bool) -> Self {
        Self {
            driver,
            templates,
            projection,
        }
    }

    /// Appends one revision and returns its id.
    ///
    /// The log row and, when enabled, the projection row are written in one
    /// transaction. A failure at any point, including cancellation, leaves neither.
    pub async fn insert(&self, rev: &NewRevision) -> StorageResult<i64> {
        rev.validate()?;
        let args = rev.to_args();

        let mut tx = self.driver.begin().await?;

        let rows = tx.query(&self.templates.insert, &args).await?;
        let id = rows
            .first()
            .ok_or_else(|| StorageError::Decode("insert returned no id".to_string()))?
            .get_i64(0)?;

        if self.projection {
            let mut projection_args = Vec::with_capacity(args.len() + 1);
            projection_args.push(Value::Int(id));
            projection_args.extend(args);
            tx.execute(&self.templates.upsert_projection, &projection_args)
                .await?;
        }

        tx.commit().await?;

        debug!(
            "Appended {} at revision {} (prev={}, created={}, deleted={})",
            rev.name, id, rev.prev_revision, rev.created, rev.deleted
        );
        Ok(id)
    }

    /// Removes the row with the given revision from the log and the projection.
    ///
    /// Returns the number of log rows removed. Deleting a key is done by inserting a
    /// tombstone; this is for reclaiming history.
    pub async fn delete(&self, revision: i64) -> StorageResult<u64> {
        let args = [Value::Int(revision)];

        let mut tx = self.driver.begin().await?;
        let removed = tx.execute(&self.templates.delete, &args).await?;
        tx.execute(&self.templates.delete_projection, &args).await?;
        tx.commit().await?;

        debug!("Deleted revision {} ({} rows)", revision, removed);
        Ok(removed)
    }
}
