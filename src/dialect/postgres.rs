//! PostgreSQL statements and error codes.

use super::{
    compact_revision_subquery, current_revision_subquery, DialectParts, ErrorClass, COLUMNS,
    COMPACT_REV_KEY, LOG_TABLE,
};

/// `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";

/// `invalid_catalog_name`: the database named in the DSN does not exist.
pub const INVALID_CATALOG_NAME: &str = "3D000";

/// `duplicate_database`
pub const DUPLICATE_DATABASE: &str = "42P04";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv_log
        (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(630),
            created INTEGER,
            deleted INTEGER,
            create_revision BIGINT,
            prev_revision BIGINT,
            lease BIGINT,
            value BYTEA,
            old_value BYTEA
        )",
    "CREATE INDEX IF NOT EXISTS kv_log_name_index ON kv_log (name)",
    "CREATE INDEX IF NOT EXISTS kv_log_name_id_index ON kv_log (name, id)",
    "CREATE INDEX IF NOT EXISTS kv_log_id_deleted_index ON kv_log (id, deleted)",
    "CREATE INDEX IF NOT EXISTS kv_log_prev_revision_index ON kv_log (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_log_name_prev_revision_uindex ON kv_log (name, prev_revision)",
    "CREATE INDEX IF NOT EXISTS kv_log_list_query_index ON kv_log (name, id DESC) INCLUDE (deleted)",
    "CREATE TABLE IF NOT EXISTS kv_current
        (
            id BIGINT PRIMARY KEY,
            name VARCHAR(630) NOT NULL,
            created INTEGER,
            deleted INTEGER,
            create_revision BIGINT,
            prev_revision BIGINT,
            lease BIGINT,
            value BYTEA,
            old_value BYTEA
        )",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_current_name_uindex ON kv_current (name)",
    "CREATE INDEX IF NOT EXISTS kv_current_id_deleted_index ON kv_current (id, deleted)",
];

pub(crate) fn classify_code(code: &str) -> ErrorClass {
    match code {
        UNIQUE_VIOLATION => ErrorClass::KeyExists,
        INVALID_CATALOG_NAME => ErrorClass::DatabaseMissing,
        DUPLICATE_DATABASE => ErrorClass::DatabaseExists,
        other => ErrorClass::Other(other.to_string()),
    }
}

pub(crate) fn templates() -> DialectParts {
    let cur = current_revision_subquery();
    let cmp = compact_revision_subquery();

    // The latest revision per key is picked before the deleted filter is applied,
    // so a tombstoned key never falls back to its previous value.
    let list = format!(
        r"SELECT {cur}, {cmp}, {COLUMNS}
        FROM (
            SELECT DISTINCT ON (lkv.name) lkv.*
            FROM {LOG_TABLE} AS lkv
            WHERE
                lkv.name LIKE ? ESCAPE '\'
                AND lkv.name > ?
                AND lkv.id <= ?
                AND lkv.name != '{COMPACT_REV_KEY}'
            ORDER BY lkv.name, lkv.id DESC
        ) AS kv
        WHERE (kv.deleted = 0 OR ?)
        ORDER BY kv.name ASC"
    );

    let count = format!(
        r"SELECT {cur}, COUNT(c.id)
        FROM (
            SELECT DISTINCT ON (lkv.name) lkv.id, lkv.deleted
            FROM {LOG_TABLE} AS lkv
            WHERE
                lkv.name LIKE ? ESCAPE '\'
                AND lkv.name != '{COMPACT_REV_KEY}'
            ORDER BY lkv.name, lkv.id DESC
        ) AS c
        WHERE (c.deleted = 0 OR ?)"
    );

    let compact = format!(
        "DELETE FROM {LOG_TABLE} AS kv
        USING (
            SELECT kp.prev_revision AS id
            FROM {LOG_TABLE} AS kp
            WHERE
                kp.name != '{COMPACT_REV_KEY}' AND
                kp.prev_revision != 0 AND
                kp.id <= ?
            UNION
            SELECT kd.id AS id
            FROM {LOG_TABLE} AS kd
            WHERE
                kd.deleted != 0 AND
                kd.id <= ?
        ) AS ks
        WHERE kv.id = ks.id"
    );

    DialectParts {
        schema: SCHEMA,
        list,
        count,
        compact,
        size: "SELECT pg_total_relation_size('kv_log')",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Dialect, SqlTemplates};

    #[test]
    fn test_schema_is_idempotent_ddl() {
        for stmt in SCHEMA {
            assert!(stmt.contains("IF NOT EXISTS"), "not re-runnable: {}", stmt);
        }
    }

    #[test]
    fn test_list_parameter_order() {
        let t = SqlTemplates::new(Dialect::Postgres);
        let like = t.list.find("LIKE $1").unwrap();
        let min_key = t.list.find("> $2").unwrap();
        let max_rev = t.list.find("<= $3").unwrap();
        let deleted = t.list.find("OR $4").unwrap();
        assert!(like < min_key && min_key < max_rev && max_rev < deleted);
        assert!(t.list_limited.ends_with("LIMIT $5"));
    }

    #[test]
    fn test_compact_uses_boundary_twice() {
        let t = SqlTemplates::new(Dialect::Postgres);
        assert!(t.compact.contains("kp.id <= $1"));
        assert!(t.compact.contains("kd.id <= $2"));
    }
}
