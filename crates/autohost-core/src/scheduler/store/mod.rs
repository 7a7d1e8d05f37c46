//! Job storage using SQLite
//!
//! Persists plugin descriptors, job definitions, trigger state and the
//! append-only run history so all of it survives a restart.

mod migrations;
mod queries;


use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::StoreError;
use crate::plugin::{PluginDescriptor, PluginState};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted plugin entry
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    /// Descriptor as last loaded
    pub descriptor: PluginDescriptor,
    /// Last recorded state
    pub state: PluginState,
    /// When the state was recorded
    pub updated_at: DateTime<Utc>,
}

/// SQLite-based job store
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the database at `path`
    pub async fn from_path(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never expires: the database lives as long as it does
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
