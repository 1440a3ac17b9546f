//! Durable per-item download ledger
//!
//! The ledger is the single source of truth for what is done, what failed and
//! why. It is backed by SQLite and owned by one actor task: every read and
//! write is a message handled in order, so concurrent workers can call
//! [`Ledger::record`] freely and the stored state always reflects the last
//! write the actor accepted.
//!
//! ## Submodules
//!
//! - `store`: SQLite connection, lifecycle and clean shutdown tracking
//! - `migrations`: schema versions
//! - `records`: record reads and writes
//! - `actor`: message loop owning the store
//!
//! A record only ever moves out of `SUCCEEDED` through an explicit operator
//! action; [`Ledger::record`] refuses such downgrades.

use crate::error::PersistenceError;
use crate::types::{ArtifactKind, IdentityId, Item, ItemId, Status};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

mod actor;
mod migrations;
mod records;
mod store;

use actor::{LedgerActor, LedgerCommand};
pub(crate) use store::LedgerStore;

/// Number of records fetched per page by [`Ledger::pending`]
const PENDING_PAGE_SIZE: u32 = 64;

/// Mailbox capacity of the ledger actor
const COMMAND_BUFFER: usize = 256;

/// Persisted projection of an item's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    /// Row ID (insertion order)
    pub row_id: i64,
    /// Item identifier
    pub id: ItemId,
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Remote locator
    pub locator: Option<String>,
    /// Final local path
    pub target_path: PathBuf,
    /// Current status
    pub status: Status,
    /// Attempts made across all runs
    pub attempts: u32,
    /// Last error reason
    pub last_error: Option<String>,
    /// Identity used on success
    pub identity_used: Option<IdentityId>,
    /// Unix timestamp when the record was created
    pub created_at: i64,
    /// Unix timestamp of the last update
    pub updated_at: i64,
}

impl LedgerRecord {
    /// Rebuild the item this record describes
    pub fn to_item(&self) -> Item {
        Item {
            id: self.id.clone(),
            locator: self.locator.clone(),
            target_path: self.target_path.clone(),
            kind: self.kind,
            status: self.status,
            last_error: self.last_error.clone(),
            identity_used: self.identity_used.clone(),
        }
    }
}

/// One state change to write
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    /// Item being recorded (its locator and target are stored too)
    pub item: Item,
    /// New status; `FailedExhausted` is stored as `Pending`
    pub status: Status,
    /// Error reason, cleared when `None`
    pub error: Option<String>,
    /// Identity that produced the artifact
    pub identity_used: Option<IdentityId>,
    /// Attempts to add to the stored counter
    pub attempts: u32,
}

impl RecordUpdate {
    /// Start an update moving `item` to `status`
    pub fn new(item: &Item, status: Status) -> Self {
        Self {
            item: item.clone(),
            status,
            error: None,
            identity_used: None,
            attempts: 0,
        }
    }

    /// Attach an error reason
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the identity used
    pub fn with_identity(mut self, identity: Option<IdentityId>) -> Self {
        self.identity_used = identity;
        self
    }

    /// Count attempts made since the previous write
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Which records [`Ledger::pending`] yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFilter {
    /// Restrict to one artifact kind
    pub kind: Option<ArtifactKind>,
    /// Restrict to these identifiers (empty means no restriction)
    pub ids: Vec<ItemId>,
    /// Also yield `FAILED_PERMANENT` records
    pub include_failed: bool,
}

impl PendingFilter {
    /// Every record that is not `SUCCEEDED`
    pub fn all() -> Self {
        Self {
            kind: None,
            ids: Vec::new(),
            include_failed: true,
        }
    }

    /// Restrict to one kind
    pub fn for_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to the given identifiers
    pub fn for_ids(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.ids = ids.into_iter().collect();
        self
    }

    /// Set whether `FAILED_PERMANENT` records are yielded
    pub fn include_failed(mut self, include: bool) -> Self {
        self.include_failed = include;
        self
    }

    /// Statuses this filter selects
    pub(crate) fn statuses(&self) -> Vec<Status> {
        let mut statuses = vec![Status::Pending, Status::InProgress];
        if self.include_failed {
            statuses.push(Status::FailedPermanent);
        }
        statuses
    }
}

/// Result of importing discovered items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// New records created
    pub inserted: u64,
    /// Existing records whose locator or target was refreshed
    pub updated: u64,
    /// Existing records left as they were
    pub unchanged: u64,
}

/// Record counts per stored status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Records waiting to be attempted
    pub pending: u64,
    /// Records marked in progress
    pub in_progress: u64,
    /// Records succeeded
    pub succeeded: u64,
    /// Records failed permanently
    pub failed_permanent: u64,
}

impl StatusCounts {
    /// Total number of records
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.succeeded + self.failed_permanent
    }

    pub(crate) fn add(&mut self, status: Status, count: u64) {
        match status {
            Status::Pending | Status::FailedExhausted => self.pending += count,
            Status::InProgress => self.in_progress += count,
            Status::Succeeded => self.succeeded += count,
            Status::FailedPermanent => self.failed_permanent += count,
        }
    }
}

/// Handle to the ledger actor
///
/// Cheap to clone. All clones talk to the same actor, which owns the SQLite
/// store; dropping every handle without calling [`Ledger::close`] leaves the
/// ledger marked as uncleanly shut down.
#[derive(Clone)]
pub struct Ledger {
    sender: mpsc::Sender<LedgerCommand>,
}

impl Ledger {
    /// Open (or create) the ledger at `path` and start its actor
    ///
    /// If the previous session did not close the ledger cleanly, records left
    /// `IN_PROGRESS` are moved back to `PENDING`.
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        let store = LedgerStore::open(path).await?;

        if store.was_unclean_shutdown().await? {
            let recovered = store.reset_in_progress().await?;
            tracing::warn!(
                path = %path.display(),
                recovered,
                "ledger was not closed cleanly, in-progress items reset to pending"
            );
        }
        store.set_clean_start().await?;

        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(LedgerActor::new(store, receiver).run());

        Ok(Self { sender })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PersistenceError>>) -> LedgerCommand,
    ) -> Result<T, PersistenceError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| PersistenceError::WriterStopped)?;
        response.await.map_err(|_| PersistenceError::WriterStopped)?
    }

    /// Every record, in insertion order
    pub async fn load(&self) -> Result<Vec<LedgerRecord>, PersistenceError> {
        self.request(|reply| LedgerCommand::Load { reply }).await
    }

    /// Look up a single record
    pub async fn get(&self, id: &ItemId) -> Result<Option<LedgerRecord>, PersistenceError> {
        let id = id.clone();
        self.request(|reply| LedgerCommand::Get { id, reply }).await
    }

    /// Lazily yield items that still need work
    ///
    /// Records are fetched a page at a time in insertion order, so a record
    /// that is updated while the stream is being consumed is never yielded
    /// twice.
    pub fn pending(&self, filter: PendingFilter) -> BoxStream<'static, Result<Item, PersistenceError>> {
        self.pending_records(filter)
            .map(|record| record.map(|r| r.to_item()))
            .boxed()
    }

    /// Like [`pending`](Self::pending), yielding the stored records
    pub fn pending_records(
        &self,
        filter: PendingFilter,
    ) -> BoxStream<'static, Result<LedgerRecord, PersistenceError>> {
        let ledger = self.clone();

        stream::unfold(Some(0_i64), move |cursor| {
            let ledger = ledger.clone();
            let filter = filter.clone();
            async move {
                let after = cursor?;
                let page = ledger
                    .request(|reply| LedgerCommand::PendingPage {
                        filter,
                        after,
                        limit: PENDING_PAGE_SIZE,
                        reply,
                    })
                    .await;

                match page {
                    Ok(records) if records.is_empty() => None,
                    Ok(records) => {
                        let next = records.last().map(|r| r.row_id);
                        let records: Vec<Result<LedgerRecord, PersistenceError>> =
                            records.into_iter().map(Ok).collect();
                        Some((stream::iter(records), next))
                    }
                    // Surface the error once, then end the stream
                    Err(e) => Some((stream::iter(vec![Err(e)]), None)),
                }
            }
        })
        .flatten()
        .boxed()
    }

    /// Durably write one state change and return the stored record
    ///
    /// Returns only after the write is committed. A change that would move a
    /// `SUCCEEDED` record to any other status is refused and the stored
    /// record is returned unchanged.
    pub async fn record(&self, update: RecordUpdate) -> Result<LedgerRecord, PersistenceError> {
        self.request(|reply| LedgerCommand::Record {
            update: Box::new(update),
            reply,
        })
        .await
    }

    /// Insert discovered items without resetting progress of known ones
    pub async fn import(&self, items: Vec<Item>) -> Result<ImportSummary, PersistenceError> {
        self.request(|reply| LedgerCommand::Import { items, reply })
            .await
    }

    /// Record counts per status
    pub async fn counts(&self) -> Result<StatusCounts, PersistenceError> {
        self.request(|reply| LedgerCommand::Counts { reply }).await
    }

    /// Records in `FAILED_PERMANENT`
    pub async fn failed(&self) -> Result<Vec<LedgerRecord>, PersistenceError> {
        self.request(|reply| LedgerCommand::Failed { reply }).await
    }

    /// Successful downloads per identity updated at or after `since` (Unix seconds)
    pub async fn usage_since(
        &self,
        since: i64,
    ) -> Result<HashMap<IdentityId, u32>, PersistenceError> {
        self.request(|reply| LedgerCommand::UsageSince { since, reply })
            .await
    }

    /// Move every `FAILED_PERMANENT` record back to `PENDING`
    pub async fn reset_failed(&self) -> Result<u64, PersistenceError> {
        self.request(|reply| LedgerCommand::ResetFailed { reply })
            .await
    }

    /// Mark a clean shutdown and stop the actor
    ///
    /// Commands queued before the close are still applied; later ones fail
    /// with [`PersistenceError::WriterStopped`].
    pub async fn close(&self) -> Result<(), PersistenceError> {
        self.request(|reply| LedgerCommand::Close { reply }).await
    }
}
