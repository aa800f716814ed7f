//! Compaction of the revision log.
//!
//! Compaction removes history no read at or above the boundary can observe: every row
//! superseded by a revision at or below the boundary, and every tombstone at or below
//! it. The boundary is persisted in the log itself, on the sentinel row, inside the same
//! transaction as the delete pass. A pass that dies halfway leaves the log
//! under-compacted and the next pass picks up from the persisted boundary.
//!
//! Compaction modes of the background worker:
//! - Periodic: every interval, advance towards `current - retention` in batches
//! - Revision: compact once to a fixed revision

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::backend::{Driver, Transaction, Value};
use crate::dialect::SqlTemplates;
use crate::storage::{SqlLog, StorageError, StorageResult};

/// What a compaction pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Boundary in effect after the pass.
    pub boundary: i64,

    /// Log rows removed.
    pub deleted: u64,
}

/// Runs single compaction passes.
pub struct CompactionEngine {
    driver: Arc<dyn Driver>,
    templates: Arc<SqlTemplates>,
}

impl CompactionEngine {
    pub fn new(driver: Arc<dyn Driver>, templates: Arc<SqlTemplates>) -> Self {
        Self { driver, templates }
    }

    /// Compacts the log up to and including `boundary` in one transaction.
    ///
    /// A boundary at or below the persisted one re-runs the delete pass at the
    /// persisted boundary, so repeated and concurrent calls are harmless. A boundary
    /// above the current revision is rejected.
    pub async fn compact(&self, boundary: i64) -> StorageResult<CompactionOutcome> {
        if boundary < 0 {
            return Err(StorageError::InvalidArgument(format!(
                "compaction boundary {} is negative",
                boundary
            )));
        }

        let mut tx = self.driver.begin().await?;

        let rows = tx.query(&self.templates.watermarks, &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| StorageError::Decode("watermark query returned no rows".to_string()))?;
        let current = row.get_opt_i64(0)?.unwrap_or(0);
        let persisted = row.get_opt_i64(1)?;

        if boundary > current {
            return Err(StorageError::InvalidArgument(format!(
                "compaction boundary {} is beyond current revision {}",
                boundary, current
            )));
        }

        let head_removed = match persisted {
            Some(cur) if cur < boundary && boundary == current => {
                head_is_tombstone(&mut *tx, &self.templates).await?
            }
            _ => false,
        };

        let effective = match persisted {
            None if boundary == 0 => {
                debug!("Nothing to compact");
                return Ok(CompactionOutcome::default());
            }
            Some(cur) if cur >= boundary => cur,
            None => {
                self.insert_marker(&mut *tx, boundary).await?;
                boundary
            }
            // The head row is about to be deleted, so a new marker row takes its place
            // as the newest row and the current revision cannot move backwards.
            Some(_) if head_removed => {
                self.insert_marker(&mut *tx, boundary).await?;
                boundary
            }
            Some(_) => {
                tx.execute(&self.templates.update_compact_marker, &[Value::Int(boundary)])
                    .await?;
                boundary
            }
        };

        let mut deleted = tx
            .execute(
                &self.templates.compact,
                &[Value::Int(effective), Value::Int(effective)],
            )
            .await?;
        deleted += tx.execute(&self.templates.compact_stale_markers, &[]).await?;
        tx.execute(&self.templates.compact_projection, &[Value::Int(effective)])
            .await?;
        tx.commit().await?;

        info!(
            "Compacted log to revision {} ({} rows removed)",
            effective, deleted
        );
        Ok(CompactionOutcome {
            boundary: effective,
            deleted,
        })
    }

    /// Creates a new marker row. Loses with [`StorageError::KeyExists`] when another
    /// compactor persisted the same boundary first.
    async fn insert_marker(&self, tx: &mut dyn Transaction, boundary: i64) -> StorageResult<()> {
        tx.query(&self.templates.insert_compact_marker, &[Value::Int(boundary)])
            .await?;
        Ok(())
    }
}

async fn head_is_tombstone(tx: &mut dyn Transaction, templates: &SqlTemplates) -> StorageResult<bool> {
    let rows = tx.query(&templates.head_deleted, &[]).await?;
    match rows.first() {
        Some(row) => row.get_flag(0),
        None => Ok(false),
    }
}

/// Compaction strategy.
#[derive(Clone, Debug)]
pub enum CompactionMode {
    /// Periodically compact at a fixed interval
    Periodic(Duration),

    /// Compact to a specific revision (one-shot)
    Revision(i64),
}

/// Background compactor driving [`SqlLog::compact`].
pub struct Compactor {
    store: Arc<SqlLog>,

    mode: CompactionMode,

    /// Number of most recent revisions periodic runs leave alone.
    retention: i64,

    /// Largest boundary advance per transaction.
    batch_size: i64,
}

impl Compactor {
    pub fn new(store: Arc<SqlLog>, mode: CompactionMode, retention: i64, batch_size: i64) -> Self {
        Self {
            store,
            mode,
            retention: retention.max(0),
            batch_size: batch_size.max(1),
        }
    }

    /// Spawns a background tokio task that performs compaction.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(interval_duration) => {
                    self.run_periodic(interval_duration).await;
                }
                CompactionMode::Revision(target_revision) => {
                    self.compact_to(target_revision).await;
                }
            }
        })
    }

    async fn run_periodic(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);

        info!(
            "Starting periodic compactor with interval: {:?}, retention: {} revisions",
            interval_duration, self.retention
        );

        loop {
            ticker.tick().await;

            if let Err(e) = self.catch_up().await {
                warn!("Periodic compaction failed: {}", e);
            }
        }
    }

    /// Advances the boundary to `current - retention`, one batch per transaction.
    ///
    /// Returns the boundary reached.
    pub async fn catch_up(&self) -> StorageResult<i64> {
        let current_rev = self.store.current_revision().await?;
        let mut compact_rev = self.store.compact_revision().await?;
        let target = (current_rev - self.retention).max(0);

        if target <= compact_rev {
            return Ok(compact_rev);
        }

        debug!(
            "Periodic compaction: current_rev={}, compact_rev={}, target={}",
            current_rev, compact_rev, target
        );

        while compact_rev < target {
            let step = (compact_rev + self.batch_size).min(target);
            match self.store.compact(step).await {
                Ok(outcome) => compact_rev = outcome.boundary.max(step),
                // Lost a race with another compactor at this step; carry on past it.
                Err(StorageError::KeyExists) => compact_rev = step,
                Err(e) => return Err(e),
            }
        }

        info!("Periodic compaction completed to revision {}", compact_rev);
        Ok(compact_rev)
    }

    /// Compacts to `revision` once, logging the outcome.
    pub async fn compact_to(&self, revision: i64) {
        match self.store.compact(revision).await {
            Ok(outcome) => {
                info!(
                    "Compaction to revision {} succeeded ({} rows removed)",
                    outcome.boundary, outcome.deleted
                );
            }
            Err(e) => {
                warn!("Compaction to revision {} failed: {}", revision, e);
            }
        }
    }
}
