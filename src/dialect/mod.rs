//! Backend adapter: SQL dialects, placeholder rendering and error classification.
//!
//! Every statement this crate issues is written once as a template that uses `?` as a
//! generic positional placeholder. A [`Dialect`] rewrites those placeholders into the
//! backend's own syntax and maps native error codes onto a closed set of outcomes.
//!
//! The rendered statements for a backend are collected into an immutable
//! [`SqlTemplates`] value built once when the store is opened and shared by every
//! query-issuing call afterwards.

pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use crate::storage::StorageError;

/// Name of the row whose `prev_revision` column persists the compaction boundary.
///
/// It never holds a value and is excluded from every listing.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Name of the append-only revision log table.
pub const LOG_TABLE: &str = "kv_log";

/// Name of the one-row-per-key current-value projection table.
pub const PROJECTION_TABLE: &str = "kv_current";

/// Generic positional placeholder used by all templates.
const PLACEHOLDER: char = '?';

/// Column list shared by the log and the projection, in row-decoding order.
pub(crate) const COLUMNS: &str =
    "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// The relational engines this crate can run against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Semantic outcome of a native backend error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Uniqueness violation: another writer already advanced the key.
    KeyExists,
    /// The configured database does not exist yet.
    DatabaseMissing,
    /// A `CREATE DATABASE` raced with another process and lost.
    DatabaseExists,
    /// Anything else, tagged with its native code.
    Other(String),
}

impl Dialect {
    /// Rewrites every `?` in `template` into this dialect's positional parameter
    /// syntax, numbering left to right starting at 1.
    ///
    /// Rendering an already rendered statement is a no-op.
    pub fn render(&self, template: &str) -> String {
        let prefix = match self {
            Dialect::Postgres => '$',
            Dialect::Sqlite => '?',
        };

        let mut out = String::with_capacity(template.len() + 16);
        let mut n = 0usize;
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            // `?N` is an already numbered sqlite parameter.
            let numbered = chars.peek().map_or(false, |next| next.is_ascii_digit());
            if ch == PLACEHOLDER && !numbered {
                n += 1;
                out.push(prefix);
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Maps a native diagnostic code onto a semantic outcome.
    pub fn classify(&self, code: &str) -> ErrorClass {
        match self {
            Dialect::Postgres => postgres::classify_code(code),
            Dialect::Sqlite => sqlite::classify_code(code),
        }
    }

    /// Builds the error value returned to callers for a native failure.
    ///
    /// This is the single point where native codes turn into [`StorageError`].
    pub fn translate(&self, code: &str, message: impl Into<String>) -> StorageError {
        match self.classify(code) {
            ErrorClass::KeyExists => StorageError::KeyExists,
            ErrorClass::DatabaseMissing | ErrorClass::DatabaseExists => StorageError::Backend {
                code: code.to_string(),
                message: message.into(),
            },
            ErrorClass::Other(code) => StorageError::Backend {
                code,
                message: message.into(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" => Ok(Dialect::Postgres),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            _ => Err(StorageError::InvalidArgument(format!(
                "unknown backend: {}. Must be 'postgres' or 'sqlite'",
                s
            ))),
        }
    }
}

/// Turns a key prefix into a LIKE pattern matching every key that starts with it.
///
/// `%`, `_` and `\` in the prefix are escaped; all templates declare `ESCAPE '\'`.
pub fn prefix_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

/// The full set of rendered statements for one backend.
///
/// Parameter order for each statement is documented on its field.
#[derive(Clone, Debug)]
pub struct SqlTemplates {
    pub dialect: Dialect,

    /// Idempotent DDL, applied in order on every start.
    pub schema: Vec<String>,

    /// `name, created, deleted, create_revision, prev_revision, lease, value, old_value`;
    /// returns the new `id`.
    pub insert: String,

    /// `id, name, created, deleted, create_revision, prev_revision, lease, value, old_value`.
    pub upsert_projection: String,

    /// `id`.
    pub delete: String,

    /// `id`.
    pub delete_projection: String,

    /// No parameters; returns `MAX(id)`.
    pub current_revision: String,

    /// No parameters; returns the persisted compaction boundary.
    pub compact_revision: String,

    /// No parameters; returns current and compact revision in one row.
    pub watermarks: String,

    /// `boundary`; creates the boundary marker row, returning its `id`.
    pub insert_compact_marker: String,

    /// `boundary`; advances the newest boundary marker row.
    pub update_compact_marker: String,

    /// No parameters; returns the `deleted` flag of the newest log row.
    pub head_deleted: String,

    /// `boundary, boundary`; removes superseded revisions and tombstones.
    pub compact: String,

    /// No parameters; removes every boundary marker row but the newest.
    pub compact_stale_markers: String,

    /// `boundary`; drops projection rows of compacted tombstones.
    pub compact_projection: String,

    /// `pattern, min_key, max_revision, include_deleted`.
    pub list: String,

    /// As `list`, plus `limit`.
    pub list_limited: String,

    /// `pattern, min_key, include_deleted`.
    pub list_projection: String,

    /// As `list_projection`, plus `limit`.
    pub list_projection_limited: String,

    /// `pattern, include_deleted`; returns current revision and count.
    pub count: String,

    /// `pattern, include_deleted`.
    pub count_projection: String,

    /// `pattern, revision`.
    pub after: String,

    /// As `after`, plus `limit`.
    pub after_limited: String,

    /// No parameters; returns approximate size in bytes.
    pub size: String,

    /// No parameters; empties the projection.
    pub clear_projection: String,

    /// No parameters; refills the projection from the log.
    pub fill_projection: String,
}

impl SqlTemplates {
    /// Builds and renders the statements for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        let parts = match dialect {
            Dialect::Postgres => postgres::templates(),
            Dialect::Sqlite => sqlite::templates(),
        };
        let r = |t: &str| dialect.render(t);

        let watermarks = format!(
            "SELECT {}, {}",
            current_revision_subquery(),
            compact_revision_subquery()
        );

        let after = format!(
            r"SELECT {cur}, {cmp}, {COLUMNS}
            FROM {LOG_TABLE} AS kv
            WHERE kv.name LIKE ? ESCAPE '\' AND kv.id > ? AND kv.name != '{COMPACT_REV_KEY}'
            ORDER BY kv.id ASC",
            cur = current_revision_subquery(),
            cmp = compact_revision_subquery(),
        );

        let list_projection = format!(
            r"SELECT {cur}, {cmp}, {COLUMNS}
            FROM {PROJECTION_TABLE} AS kv
            WHERE kv.name LIKE ? ESCAPE '\' AND kv.name > ? AND (kv.deleted = 0 OR ?)
            ORDER BY kv.name ASC",
            cur = current_revision_subquery(),
            cmp = compact_revision_subquery(),
        );

        let count_projection = format!(
            r"SELECT {cur}, COUNT(kv.id)
            FROM {PROJECTION_TABLE} AS kv
            WHERE kv.name LIKE ? ESCAPE '\' AND (kv.deleted = 0 OR ?)",
            cur = current_revision_subquery(),
        );

        let insert_columns =
            "name, created, deleted, create_revision, prev_revision, lease, value, old_value";

        Self {
            dialect,
            schema: parts.schema.iter().map(|s| s.to_string()).collect(),
            insert: r(&format!(
                "INSERT INTO {LOG_TABLE} ({insert_columns}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id"
            )),
            upsert_projection: r(&format!(
                "INSERT INTO {PROJECTION_TABLE} (id, {insert_columns})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (name) DO UPDATE SET
                    id = excluded.id,
                    created = excluded.created,
                    deleted = excluded.deleted,
                    create_revision = excluded.create_revision,
                    prev_revision = excluded.prev_revision,
                    lease = excluded.lease,
                    value = excluded.value,
                    old_value = excluded.old_value
                WHERE {PROJECTION_TABLE}.id < excluded.id"
            )),
            delete: r(&format!("DELETE FROM {LOG_TABLE} WHERE id = ?")),
            delete_projection: r(&format!("DELETE FROM {PROJECTION_TABLE} WHERE id = ?")),
            current_revision: format!("SELECT {}", current_revision_subquery()),
            compact_revision: format!("SELECT {}", compact_revision_subquery()),
            watermarks,
            insert_compact_marker: r(&format!(
                "INSERT INTO {LOG_TABLE} ({insert_columns})
                VALUES ('{COMPACT_REV_KEY}', 1, 0, 0, ?, 0, NULL, NULL) RETURNING id"
            )),
            update_compact_marker: r(&format!(
                "UPDATE {LOG_TABLE} SET prev_revision = ?
                WHERE name = '{COMPACT_REV_KEY}'
                AND id = (SELECT MAX(ckv.id) FROM {LOG_TABLE} AS ckv WHERE ckv.name = '{COMPACT_REV_KEY}')"
            )),
            head_deleted: format!(
                "SELECT kv.deleted FROM {LOG_TABLE} AS kv WHERE kv.id = {}",
                current_revision_subquery()
            ),
            compact: r(&parts.compact),
            compact_stale_markers: format!(
                "DELETE FROM {LOG_TABLE}
                WHERE name = '{COMPACT_REV_KEY}'
                AND id < (SELECT MAX(ckv.id) FROM {LOG_TABLE} AS ckv WHERE ckv.name = '{COMPACT_REV_KEY}')"
            ),
            compact_projection: r(&format!(
                "DELETE FROM {PROJECTION_TABLE} WHERE deleted != 0 AND id <= ?"
            )),
            list: r(&parts.list),
            list_limited: r(&format!("{} LIMIT ?", parts.list)),
            list_projection: r(&list_projection),
            list_projection_limited: r(&format!("{} LIMIT ?", list_projection)),
            count: r(&parts.count),
            count_projection: r(&count_projection),
            after: r(&after),
            after_limited: r(&format!("{} LIMIT ?", after)),
            size: parts.size.to_string(),
            clear_projection: format!("DELETE FROM {PROJECTION_TABLE}"),
            fill_projection: format!(
                "INSERT INTO {PROJECTION_TABLE} (id, {insert_columns})
                SELECT {COLUMNS}
                FROM {LOG_TABLE} AS kv
                JOIN (
                    SELECT MAX(mkv.id) AS id
                    FROM {LOG_TABLE} AS mkv
                    WHERE mkv.name != '{COMPACT_REV_KEY}'
                    GROUP BY mkv.name
                ) AS maxkv ON maxkv.id = kv.id"
            ),
        }
    }
}

/// Statements that differ between backends, as unrendered templates.
pub(crate) struct DialectParts {
    pub schema: &'static [&'static str],
    pub list: String,
    pub count: String,
    pub compact: String,
    pub size: &'static str,
}

pub(crate) fn current_revision_subquery() -> String {
    format!("(SELECT MAX(rkv.id) FROM {LOG_TABLE} AS rkv)")
}

pub(crate) fn compact_revision_subquery() -> String {
    format!(
        "(SELECT MAX(crkv.prev_revision) FROM {LOG_TABLE} AS crkv WHERE crkv.name = '{COMPACT_REV_KEY}')"
    )
}
