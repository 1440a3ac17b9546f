//! Ledger record queries and writes.

use crate::error::PersistenceError;
use crate::types::{ArtifactKind, IdentityId, Item, ItemId, Status};
use sqlx::FromRow;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{ImportSummary, LedgerRecord, LedgerStore, PendingFilter, RecordUpdate, StatusCounts};

const RECORD_COLUMNS: &str = "id, identifier, kind, locator, target_path, status, attempts, \
                              last_error, identity_used, created_at, updated_at";

/// Raw ledger row
#[derive(Debug, FromRow)]
struct LedgerRow {
    id: i64,
    identifier: String,
    kind: String,
    locator: Option<String>,
    target_path: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    identity_used: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<LedgerRow> for LedgerRecord {
    type Error = PersistenceError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let kind = ArtifactKind::parse(&row.kind).ok_or_else(|| {
            PersistenceError::ReadFailed(format!(
                "record {} has unknown kind '{}'",
                row.identifier, row.kind
            ))
        })?;

        let status = Status::parse(&row.status).ok_or_else(|| {
            PersistenceError::ReadFailed(format!(
                "record {} has unknown status '{}'",
                row.identifier, row.status
            ))
        })?;

        Ok(LedgerRecord {
            row_id: row.id,
            id: ItemId(row.identifier),
            kind,
            locator: row.locator.filter(|l| !l.is_empty()),
            target_path: PathBuf::from(row.target_path),
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            identity_used: row.identity_used.map(IdentityId),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_records(rows: Vec<LedgerRow>) -> Result<Vec<LedgerRecord>, PersistenceError> {
    rows.into_iter().map(LedgerRecord::try_from).collect()
}

fn path_text(item: &Item) -> String {
    item.target_path.to_string_lossy().into_owned()
}

impl LedgerStore {
    /// All records in insertion order
    pub(super) async fn load(&self) -> Result<Vec<LedgerRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger ORDER BY id",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::ReadFailed(format!("Failed to load ledger: {}", e)))?;

        into_records(rows)
    }

    /// One record by identifier
    pub(super) async fn get(&self, id: &ItemId) -> Result<Option<LedgerRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger WHERE identifier = ?",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PersistenceError::ReadFailed(format!("Failed to get record {}: {}", id, e)))?;

        row.map(LedgerRecord::try_from).transpose()
    }

    /// Next page of records matching `filter` with a row ID above `after`
    pub(super) async fn pending_page(
        &self,
        filter: &PendingFilter,
        after: i64,
        limit: u32,
    ) -> Result<Vec<LedgerRecord>, PersistenceError> {
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {} FROM ledger WHERE id > ",
            RECORD_COLUMNS
        ));
        builder.push_bind(after);

        builder.push(" AND status IN (");
        let mut statuses = builder.separated(", ");
        for status in filter.statuses() {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");

        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_str());
        }

        if !filter.ids.is_empty() {
            builder.push(" AND identifier IN (");
            let mut ids = builder.separated(", ");
            for id in &filter.ids {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
        }

        builder.push(" ORDER BY id LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows = builder
            .build_query_as::<LedgerRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                PersistenceError::ReadFailed(format!("Failed to read pending items: {}", e))
            })?;

        into_records(rows)
    }

    /// Apply one update and return the stored record
    pub(super) async fn record(&self, update: &RecordUpdate) -> Result<LedgerRecord, PersistenceError> {
        let id = &update.item.id;
        let status = update.status.persisted();

        if let Some(existing) = self.get(id).await? {
            if existing.status == Status::Succeeded && status != Status::Succeeded {
                tracing::warn!(
                    item_id = %id,
                    requested = %status,
                    "refusing to downgrade a succeeded record"
                );
                return Ok(existing);
            }
        }

        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO ledger (
                identifier, kind, locator, target_path, status,
                attempts, last_error, identity_used, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                kind = excluded.kind,
                locator = excluded.locator,
                target_path = excluded.target_path,
                status = excluded.status,
                attempts = ledger.attempts + excluded.attempts,
                last_error = excluded.last_error,
                identity_used = excluded.identity_used,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(update.item.kind.as_str())
        .bind(&update.item.locator)
        .bind(path_text(&update.item))
        .bind(status.as_str())
        .bind(i64::from(update.attempts))
        .bind(&update.error)
        .bind(update.identity_used.as_ref().map(|i| i.as_str()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteFailed {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        self.get(id).await?.ok_or_else(|| PersistenceError::WriteFailed {
            id: id.clone(),
            reason: "record missing after write".to_string(),
        })
    }

    /// Upsert discovered items, leaving status and attempts of known records alone
    pub(super) async fn import(&self, items: &[Item]) -> Result<ImportSummary, PersistenceError> {
        let mut summary = ImportSummary::default();
        if items.is_empty() {
            return Ok(summary);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(|e| {
            PersistenceError::WriteFailed {
                id: items[0].id.clone(),
                reason: format!("Failed to begin import: {}", e),
            }
        })?;

        for item in items {
            let write_failed = |e: sqlx::Error| PersistenceError::WriteFailed {
                id: item.id.clone(),
                reason: e.to_string(),
            };

            let existing: Option<(String, Option<String>, String, String)> = sqlx::query_as(
                "SELECT status, locator, target_path, kind FROM ledger WHERE identifier = ?",
            )
            .bind(&item.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(write_failed)?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO ledger (
                            identifier, kind, locator, target_path, status,
                            attempts, created_at, updated_at
                        ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
                        "#,
                    )
                    .bind(&item.id)
                    .bind(item.kind.as_str())
                    .bind(&item.locator)
                    .bind(path_text(item))
                    .bind(Status::Pending.as_str())
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_failed)?;
                    summary.inserted += 1;
                }
                Some((status, locator, target, kind)) => {
                    let changed = locator != item.locator
                        || target != path_text(item)
                        || kind != item.kind.as_str();

                    if Status::parse(&status) == Some(Status::Succeeded) || !changed {
                        summary.unchanged += 1;
                        continue;
                    }

                    sqlx::query(
                        r#"
                        UPDATE ledger
                        SET kind = ?, locator = ?, target_path = ?, updated_at = ?
                        WHERE identifier = ?
                        "#,
                    )
                    .bind(item.kind.as_str())
                    .bind(&item.locator)
                    .bind(path_text(item))
                    .bind(now)
                    .bind(&item.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_failed)?;
                    summary.updated += 1;
                }
            }
        }

        tx.commit().await.map_err(|e| PersistenceError::WriteFailed {
            id: items[items.len() - 1].id.clone(),
            reason: format!("Failed to commit import: {}", e),
        })?;

        Ok(summary)
    }

    /// Record counts per status
    pub(super) async fn counts(&self) -> Result<StatusCounts, PersistenceError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM ledger GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    PersistenceError::ReadFailed(format!("Failed to count records: {}", e))
                })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let parsed = Status::parse(&status).ok_or_else(|| {
                PersistenceError::ReadFailed(format!("unknown status '{}' in ledger", status))
            })?;
            counts.add(parsed, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Records in `FAILED_PERMANENT`
    pub(super) async fn failed(&self) -> Result<Vec<LedgerRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {} FROM ledger WHERE status = ? ORDER BY id",
            RECORD_COLUMNS
        ))
        .bind(Status::FailedPermanent.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::ReadFailed(format!("Failed to list failures: {}", e)))?;

        into_records(rows)
    }

    /// Successful downloads per identity since a Unix timestamp
    pub(super) async fn usage_since(
        &self,
        since: i64,
    ) -> Result<HashMap<IdentityId, u32>, PersistenceError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT identity_used, COUNT(*) FROM ledger
            WHERE status = ? AND identity_used IS NOT NULL AND updated_at >= ?
            GROUP BY identity_used
            "#,
        )
        .bind(Status::Succeeded.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            PersistenceError::ReadFailed(format!("Failed to read identity usage: {}", e))
        })?;

        Ok(rows
            .into_iter()
            .map(|(identity, count)| (IdentityId(identity), u32::try_from(count).unwrap_or(0)))
            .collect())
    }

    /// Move `FAILED_PERMANENT` records back to `PENDING`
    pub(super) async fn reset_failed(&self) -> Result<u64, PersistenceError> {
        self.move_status(Status::FailedPermanent, Status::Pending)
            .await
    }

    /// Move `IN_PROGRESS` records back to `PENDING`
    pub(super) async fn reset_in_progress(&self) -> Result<u64, PersistenceError> {
        self.move_status(Status::InProgress, Status::Pending).await
    }

    async fn move_status(&self, from: Status, to: Status) -> Result<u64, PersistenceError> {
        let result = sqlx::query("UPDATE ledger SET status = ?, updated_at = ? WHERE status = ?")
            .bind(to.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                PersistenceError::UpdateFailed(format!(
                    "Failed to move {} records to {}: {}",
                    from, to, e
                ))
            })?;

        Ok(result.rows_affected())
    }
}
