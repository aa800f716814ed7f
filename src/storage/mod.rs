//! Revisioned key-value storage on top of a relational database.
//!
//! The storage module implements an etcd-style revision model over an ordinary SQL table:
//!
//! 1. **Revision log**: every mutation appends one immutable row; the row's `id` is its revision
//! 2. **Concurrency control**: a unique `(name, prev_revision)` index admits exactly one writer
//!    per key per revision
//! 3. **Snapshot reads**: "latest row per key with `id <= R`" answers reads at any retained revision
//! 4. **Compaction**: superseded revisions and tombstones below a persisted boundary are reclaimed
//!
//! The SQL itself lives in [`crate::dialect`]; statement execution goes through
//! [`crate::backend::Driver`].

pub mod compaction;
pub mod log;
pub mod query;
pub mod record;
pub mod schema;
pub mod store;

pub use compaction::{CompactionEngine, CompactionMode, CompactionOutcome, Compactor};
pub use log::RevisionLog;
pub use query::{ReadMode, SnapshotQuery};
pub use record::{CountResult, ListResult, NewRevision, RevisionRow};
pub use store::{SqlLog, StoreConfig};

use std::time::Duration;
use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Another writer already appended a revision with the same `(name, prev_revision)`.
    #[error("Key exists")]
    KeyExists,

    #[error("Revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted {
        requested: i64,
        compact_revision: i64,
    },

    /// Connection, transport and every other unclassified backend failure.
    #[error("Backend error [{code}]: {message}")]
    Backend { code: String, message: String },

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
