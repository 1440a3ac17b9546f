//! SQLite store lifecycle and runtime state (clean shutdown tracking).

use crate::error::PersistenceError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed ledger storage
///
/// Only the ledger actor holds one of these once the ledger is open.
pub(crate) struct LedgerStore {
    pub(super) pool: SqlitePool,
}

impl LedgerStore {
    /// Open the store, creating the file and its directory if missing
    pub(crate) async fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    PersistenceError::OpenFailed(format!(
                        "Failed to create ledger directory: {}",
                        e
                    ))
                })?;
            }
        }

        // FULL sync so a committed record survives a process kill
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                PersistenceError::OpenFailed(format!("Failed to parse ledger path: {}", e))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            PersistenceError::OpenFailed(format!("Failed to connect to ledger: {}", e))
        })?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Close the connection pool
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    /// Check if the last session ended without [`set_clean_shutdown`](Self::set_clean_shutdown)
    pub(crate) async fn was_unclean_shutdown(&self) -> Result<bool, PersistenceError> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM runtime_state WHERE key = 'clean_shutdown'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            PersistenceError::ReadFailed(format!("Failed to check shutdown state: {}", e))
        })?;

        // A fresh ledger has no flag yet and nothing to recover
        Ok(value.is_some_and(|v| v != "true"))
    }

    /// Mark that a session is running
    pub(crate) async fn set_clean_start(&self) -> Result<(), PersistenceError> {
        self.set_shutdown_flag("false").await
    }

    /// Mark that the session ended cleanly
    pub(crate) async fn set_clean_shutdown(&self) -> Result<(), PersistenceError> {
        self.set_shutdown_flag("true").await
    }

    async fn set_shutdown_flag(&self, value: &str) -> Result<(), PersistenceError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES ('clean_shutdown', ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            PersistenceError::OpenFailed(format!("Failed to set shutdown state: {}", e))
        })?;

        Ok(())
    }
}
