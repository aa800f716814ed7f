//! Schema provisioning and projection maintenance.

use tracing::{info, trace};

use crate::backend::Driver;
use crate::dialect::SqlTemplates;
use crate::storage::{StorageError, StorageResult};

/// Collapses whitespace so multi-line DDL logs on one line.
fn stripped(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Applies every `CREATE ... IF NOT EXISTS` statement for the backend.
///
/// Safe to run on every start; an existing schema is left untouched.
pub async fn apply_schema(driver: &dyn Driver, templates: &SqlTemplates) -> StorageResult<()> {
    info!("Configuring database table schema and indexes, this may take a moment...");

    for stmt in &templates.schema {
        trace!("SETUP EXEC : {}", stripped(stmt));
        driver
            .execute(stmt, &[])
            .await
            .map_err(|e| StorageError::Bootstrap(format!("schema statement failed: {}", e)))?;
    }

    info!("Database tables and indexes are up to date");
    Ok(())
}

/// Replaces the projection with the latest row of every key in the log.
///
/// Runs in one transaction so readers never see a half-filled projection.
pub async fn rebuild_projection(driver: &dyn Driver, templates: &SqlTemplates) -> StorageResult<u64> {
    let mut tx = driver.begin().await?;
    tx.execute(&templates.clear_projection, &[]).await?;
    let filled = tx.execute(&templates.fill_projection, &[]).await?;
    tx.commit().await?;

    info!(rows = filled, "Rebuilt current-value projection from the log");
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDriver;
    use crate::dialect::Dialect;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_stripped() {
        assert_eq!(stripped("CREATE TABLE t\n    (\n  id INTEGER\n )"), "CREATE TABLE t ( id INTEGER )");
    }

    #[tokio::test]
    async fn test_apply_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let driver = SqliteDriver::open(&dir.path().join("s.db"), Duration::from_secs(1)).unwrap();
        let templates = SqlTemplates::new(Dialect::Sqlite);

        for _ in 0..3 {
            apply_schema(&driver, &templates).await.unwrap();
        }

        let rows = driver
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'kv_%'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64(0).unwrap(), 7);
    }
}
