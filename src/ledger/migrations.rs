//! Ledger schema migrations.

use crate::error::PersistenceError;
use sqlx::SqliteConnection;

use super::LedgerStore;

impl LedgerStore {
    /// Bring the schema up to the current version
    pub(super) async fn run_migrations(&self) -> Result<(), PersistenceError> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            PersistenceError::MigrationFailed(format!("Failed to acquire connection: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            PersistenceError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            ))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    PersistenceError::MigrationFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    ))
                })?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: ledger and runtime state tables
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<(), PersistenceError> {
        tracing::info!("Applying ledger migration v1");

        // Wrap migration in a transaction so partial failures don't leave the ledger broken
        sqlx::query("BEGIN").execute(&mut *conn).await.map_err(|e| {
            PersistenceError::MigrationFailed(format!("Failed to begin transaction: {}", e))
        })?;

        let result = async {
            Self::create_ledger_schema(conn).await?;
            Self::create_runtime_state_table(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), PersistenceError>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(|e| {
                    PersistenceError::MigrationFailed(format!(
                        "Failed to commit migration v1: {}",
                        e
                    ))
                })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Ledger migration v1 complete");
        Ok(())
    }

    async fn create_ledger_schema(conn: &mut SqliteConnection) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                locator TEXT,
                target_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                identity_used TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            PersistenceError::MigrationFailed(format!("Failed to create ledger table: {}", e))
        })?;

        sqlx::query("CREATE INDEX idx_ledger_status ON ledger(status, kind)")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                PersistenceError::MigrationFailed(format!(
                    "Failed to create status index: {}",
                    e
                ))
            })?;

        sqlx::query("CREATE INDEX idx_ledger_identity ON ledger(identity_used, updated_at)")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                PersistenceError::MigrationFailed(format!(
                    "Failed to create identity index: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn create_runtime_state_table(
        conn: &mut SqliteConnection,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE runtime_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            PersistenceError::MigrationFailed(format!(
                "Failed to create runtime_state table: {}",
                e
            ))
        })?;

        Ok(())
    }

    async fn record_migration(
        conn: &mut SqliteConnection,
        version: i64,
    ) -> Result<(), PersistenceError> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                PersistenceError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    version, e
                ))
            })?;

        Ok(())
    }
}
