//! Process-level wiring.
//!
//! This module coordinates the initialization and execution of:
//! - The relational backend connection and schema bootstrap
//! - The revision log store
//! - The background compactor

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::storage::{CompactionMode, Compactor, SqlLog, StoreConfig};

/// Configuration for the relkv server process.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub store: StoreConfig,

    /// How often the compactor wakes up. `None` disables background compaction.
    pub compaction_interval: Option<Duration>,

    /// Number of most recent revisions compaction leaves in place.
    pub compaction_retention: i64,

    /// Largest boundary advance per compaction transaction.
    pub compaction_batch_size: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            compaction_interval: Some(Duration::from_secs(300)),
            compaction_retention: 1000,
            compaction_batch_size: 1000,
        }
    }
}

/// Owns the store and its background tasks.
pub struct RelkvServer {
    config: ServerConfig,
    store: Arc<SqlLog>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl RelkvServer {
    /// Opens the store, creating database and schema as needed.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        info!(
            backend = %config.store.backend.dialect,
            read_mode = %config.store.read_mode,
            "Initializing relkv server"
        );

        let store = SqlLog::open(config.store.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open revision log: {}", e))?;

        info!("relkv server initialization complete");
        Ok(Self {
            config,
            store: Arc::new(store),
            background_tasks: Vec::new(),
        })
    }

    /// Starts background compaction and waits for `shutdown`.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        if let Some(interval) = self.config.compaction_interval {
            let compactor = Compactor::new(
                self.store.clone(),
                CompactionMode::Periodic(interval),
                self.config.compaction_retention,
                self.config.compaction_batch_size,
            );
            self.background_tasks.push(compactor.run());
        } else {
            info!("Background compaction disabled");
        }

        let revision = self.store.current_revision().await?;
        info!(revision, "relkv server running");

        shutdown.await;

        info!("relkv server shutting down");
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Get reference to the store.
    pub fn store(&self) -> Arc<SqlLog> {
        self.store.clone()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
