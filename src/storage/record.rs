//! Rows of the revision log and the results returned to callers.

use crate::backend::{Row, Value};
use crate::storage::{StorageError, StorageResult};

/// One committed revision of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionRow {
    /// The revision number, assigned by the database.
    pub id: i64,

    pub name: String,

    /// First revision of a lineage.
    pub created: bool,

    /// Tombstone.
    pub deleted: bool,

    /// Stored creation revision. Zero on the creating row itself;
    /// see [`RevisionRow::create_revision`].
    pub create_revision: i64,

    /// The revision this one supersedes (0 for the first revision of a key).
    pub prev_revision: i64,

    /// Opaque lease id owned by the layer above.
    pub lease: i64,

    pub value: Vec<u8>,

    pub old_value: Vec<u8>,
}

impl RevisionRow {
    /// Decodes the nine log columns starting at `offset`.
    pub(crate) fn from_row(row: &Row, offset: usize) -> StorageResult<Self> {
        Ok(Self {
            id: row.get_i64(offset)?,
            name: row.get_string(offset + 1)?,
            created: row.get_flag(offset + 2)?,
            deleted: row.get_flag(offset + 3)?,
            create_revision: row.get_opt_i64(offset + 4)?.unwrap_or(0),
            prev_revision: row.get_opt_i64(offset + 5)?.unwrap_or(0),
            lease: row.get_opt_i64(offset + 6)?.unwrap_or(0),
            value: row.get_bytes(offset + 7)?,
            old_value: row.get_bytes(offset + 8)?,
        })
    }

    /// Revision at which the key's current lineage was created.
    pub fn create_revision(&self) -> i64 {
        if self.created {
            self.id
        } else {
            self.create_revision
        }
    }

    /// Revision of the last modification, i.e. this row's id.
    pub fn mod_revision(&self) -> i64 {
        self.id
    }
}

/// A revision to append to the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewRevision {
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

impl NewRevision {
    /// First revision of a key. `prev_revision` is the key's last tombstone, or 0.
    pub fn create(name: impl Into<String>, value: impl Into<Vec<u8>>, lease: i64, prev_revision: i64) -> Self {
        Self {
            name: name.into(),
            created: true,
            prev_revision,
            lease,
            value: value.into(),
            ..Default::default()
        }
    }

    /// Replaces the value of `prev`.
    pub fn update(prev: &RevisionRow, value: impl Into<Vec<u8>>, lease: i64) -> Self {
        Self {
            name: prev.name.clone(),
            created: false,
            deleted: false,
            create_revision: prev.create_revision(),
            prev_revision: prev.id,
            lease,
            value: value.into(),
            old_value: prev.value.clone(),
        }
    }

    /// Tombstone for `prev`. The deleted value is kept in both payload columns.
    pub fn tombstone(prev: &RevisionRow) -> Self {
        Self {
            name: prev.name.clone(),
            created: false,
            deleted: true,
            create_revision: prev.create_revision(),
            prev_revision: prev.id,
            lease: prev.lease,
            value: prev.value.clone(),
            old_value: prev.value.clone(),
        }
    }

    /// Statement arguments in log column order.
    pub(crate) fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.name.as_str()),
            Value::Int(i64::from(self.created)),
            Value::Int(i64::from(self.deleted)),
            Value::Int(self.create_revision),
            Value::Int(self.prev_revision),
            Value::Int(self.lease),
            Value::from(self.value.clone()),
            Value::from(self.old_value.clone()),
        ]
    }

    pub(crate) fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidArgument("key name is empty".to_string()));
        }
        if self.name == crate::dialect::COMPACT_REV_KEY {
            return Err(StorageError::InvalidArgument(format!(
                "key name {} is reserved",
                self.name
            )));
        }
        if self.prev_revision < 0 || self.create_revision < 0 {
            return Err(StorageError::InvalidArgument(
                "revisions must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rows returned by a listing plus the two watermarks observed with them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListResult {
    /// Highest revision in the log when the query ran.
    pub current_revision: i64,

    /// Last compaction boundary; reads below it may be incomplete.
    pub compact_revision: i64,

    pub rows: Vec<RevisionRow>,
}

impl ListResult {
    /// Fails with [`StorageError::Compacted`] when `requested` lies below the
    /// compaction boundary, so a vanished snapshot is not mistaken for an empty one.
    ///
    /// A request of 0 means "latest" and never fails.
    pub fn ensure_revision(&self, requested: i64) -> StorageResult<()> {
        if requested > 0 && requested < self.compact_revision {
            return Err(StorageError::Compacted {
                requested,
                compact_revision: self.compact_revision,
            });
        }
        Ok(())
    }

    /// Key after which the next page starts.
    pub fn last_key(&self) -> Option<&str> {
        self.rows.last().map(|r| r.name.as_str())
    }
}

/// Result of a count query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountResult {
    pub current_revision: i64,
    pub count: i64,
}
