//! SQLite statements and error codes.

use super::{
    compact_revision_subquery, current_revision_subquery, DialectParts, ErrorClass, COLUMNS,
    COMPACT_REV_KEY, LOG_TABLE,
};

/// `SQLITE_CONSTRAINT_UNIQUE`
pub const CONSTRAINT_UNIQUE: &str = "2067";

/// `SQLITE_CONSTRAINT_PRIMARYKEY`
pub const CONSTRAINT_PRIMARYKEY: &str = "1555";

// AUTOINCREMENT keeps ids from being reused once compaction removes the newest row.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv_log
        (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            created INTEGER,
            deleted INTEGER,
            create_revision INTEGER,
            prev_revision INTEGER,
            lease INTEGER,
            value BLOB,
            old_value BLOB
        )",
    "CREATE INDEX IF NOT EXISTS kv_log_name_index ON kv_log (name)",
    "CREATE INDEX IF NOT EXISTS kv_log_name_id_index ON kv_log (name, id)",
    "CREATE INDEX IF NOT EXISTS kv_log_id_deleted_index ON kv_log (id, deleted)",
    "CREATE INDEX IF NOT EXISTS kv_log_prev_revision_index ON kv_log (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_log_name_prev_revision_uindex ON kv_log (name, prev_revision)",
    "CREATE TABLE IF NOT EXISTS kv_current
        (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            created INTEGER,
            deleted INTEGER,
            create_revision INTEGER,
            prev_revision INTEGER,
            lease INTEGER,
            value BLOB,
            old_value BLOB
        )",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_current_name_uindex ON kv_current (name)",
    "CREATE INDEX IF NOT EXISTS kv_current_id_deleted_index ON kv_current (id, deleted)",
];

pub(crate) fn classify_code(code: &str) -> ErrorClass {
    match code {
        CONSTRAINT_UNIQUE | CONSTRAINT_PRIMARYKEY => ErrorClass::KeyExists,
        other => ErrorClass::Other(other.to_string()),
    }
}

pub(crate) fn templates() -> DialectParts {
    let cur = current_revision_subquery();
    let cmp = compact_revision_subquery();

    let list = format!(
        r"SELECT {cur}, {cmp}, {COLUMNS}
        FROM {LOG_TABLE} AS kv
        JOIN (
            SELECT MAX(mkv.id) AS id
            FROM {LOG_TABLE} AS mkv
            WHERE
                mkv.name LIKE ? ESCAPE '\'
                AND mkv.name > ?
                AND mkv.id <= ?
                AND mkv.name != '{COMPACT_REV_KEY}'
            GROUP BY mkv.name
        ) AS maxkv ON maxkv.id = kv.id
        WHERE (kv.deleted = 0 OR ?)
        ORDER BY kv.name ASC"
    );

    let count = format!(
        r"SELECT {cur}, COUNT(c.id)
        FROM (
            SELECT kv.id AS id
            FROM {LOG_TABLE} AS kv
            JOIN (
                SELECT MAX(mkv.id) AS id
                FROM {LOG_TABLE} AS mkv
                WHERE
                    mkv.name LIKE ? ESCAPE '\'
                    AND mkv.name != '{COMPACT_REV_KEY}'
                GROUP BY mkv.name
            ) AS maxkv ON maxkv.id = kv.id
            WHERE (kv.deleted = 0 OR ?)
        ) AS c"
    );

    let compact = format!(
        "DELETE FROM {LOG_TABLE}
        WHERE id IN (
            SELECT kp.prev_revision
            FROM {LOG_TABLE} AS kp
            WHERE
                kp.name != '{COMPACT_REV_KEY}' AND
                kp.prev_revision != 0 AND
                kp.id <= ?
            UNION
            SELECT kd.id
            FROM {LOG_TABLE} AS kd
            WHERE
                kd.deleted != 0 AND
                kd.id <= ?
        )"
    );

    DialectParts {
        schema: SCHEMA,
        list,
        count,
        compact,
        size: "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
    }
}
