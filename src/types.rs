//! Core types for harvest-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stable unique identifier of an item in the batch
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PartialEq<&str> for ItemId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Implement sqlx Type and Encode so identifiers bind directly in queries
impl sqlx::Type<sqlx::Sqlite> for ItemId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ItemId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

/// Unique identifier of a credentialed identity (typically the account email)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    /// Create a new IdentityId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl PartialEq<&str> for IdentityId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of artifact an item points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Document file (pdf, epub, ...)
    File,
    /// Cover image
    Cover,
}

impl ArtifactKind {
    /// All kinds, in the order a run dispatches them
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Cover, ArtifactKind::File];

    /// Stable string form used in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Cover => "cover",
        }
    }

    /// Parse the ledger string form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(ArtifactKind::File),
            "cover" => Some(ArtifactKind::Cover),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item download status
///
/// `Succeeded` and `FailedPermanent` are terminal. `FailedExhausted` is
/// terminal for the current run only and is stored as `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting to be attempted
    Pending,
    /// Dispatched to a worker
    InProgress,
    /// Artifact is on disk and validated
    Succeeded,
    /// Gave up on this item; will not be retried within the run
    FailedPermanent,
    /// No identity was left to retry with
    FailedExhausted,
}

impl Status {
    /// Stable string form used in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::InProgress => "IN_PROGRESS",
            Status::Succeeded => "SUCCEEDED",
            Status::FailedPermanent => "FAILED_PERMANENT",
            Status::FailedExhausted => "FAILED_EXHAUSTED",
        }
    }

    /// Parse the ledger string form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Status::Pending),
            "IN_PROGRESS" => Some(Status::InProgress),
            "SUCCEEDED" => Some(Status::Succeeded),
            "FAILED_PERMANENT" => Some(Status::FailedPermanent),
            "FAILED_EXHAUSTED" => Some(Status::FailedExhausted),
            _ => None,
        }
    }

    /// The status actually written to the ledger
    pub fn persisted(self) -> Self {
        match self {
            Status::FailedExhausted => Status::Pending,
            other => other,
        }
    }

    /// Whether no further automatic transition happens within a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::FailedPermanent | Status::FailedExhausted
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact to fetch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier across the batch
    pub id: ItemId,
    /// Remote locator (None when discovery found no URL)
    pub locator: Option<String>,
    /// Final local path of the artifact
    pub target_path: PathBuf,
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Current status
    #[serde(default = "default_status")]
    pub status: Status,
    /// Last error reason
    #[serde(default)]
    pub last_error: Option<String>,
    /// Identity used on success
    #[serde(default)]
    pub identity_used: Option<IdentityId>,
}

impl Item {
    /// Create a fresh pending item
    pub fn new(
        id: impl Into<ItemId>,
        locator: Option<String>,
        target_path: impl Into<PathBuf>,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            id: id.into(),
            locator,
            target_path: target_path.into(),
            kind,
            status: Status::Pending,
            last_error: None,
            identity_used: None,
        }
    }
}

fn default_status() -> Status {
    Status::Pending
}

/// Event emitted during a batch run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item dispatched to a worker
    ItemStarted {
        /// Item ID
        id: ItemId,
        /// Artifact kind
        kind: ArtifactKind,
    },

    /// One attempt failed and will be retried
    AttemptFailed {
        /// Item ID
        id: ItemId,
        /// Attempt number (1-based)
        attempt: u32,
        /// Failure reason
        error: String,
        /// Delay before the next attempt in milliseconds
        retry_in_ms: u64,
    },

    /// Item downloaded (or already present) and recorded
    ItemSucceeded {
        /// Item ID
        id: ItemId,
        /// Identity the item was fetched with (None for a skip)
        identity: Option<IdentityId>,
        /// Bytes on disk
        bytes: u64,
        /// True when the target already existed
        skipped: bool,
    },

    /// Item reached a failed state for this run
    ItemFailed {
        /// Item ID
        id: ItemId,
        /// Final status (FailedPermanent or FailedExhausted)
        status: Status,
        /// Failure reason
        reason: String,
    },

    /// Active identity changed
    IdentityRotated {
        /// Previously active identity
        from: IdentityId,
        /// Newly active identity (None when nothing is left)
        to: Option<IdentityId>,
        /// Why the rotation happened
        reason: String,
    },

    /// No identity can serve further downloads in this run
    IdentitiesExhausted,

    /// Run finished
    RunFinished {
        /// Items succeeded in this run
        succeeded: u64,
        /// Items failed permanently in this run
        failed_permanent: u64,
        /// Items left pending because identities ran out
        failed_exhausted: u64,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_ledger_strings() {
        for status in [
            Status::Pending,
            Status::InProgress,
            Status::Succeeded,
            Status::FailedPermanent,
            Status::FailedExhausted,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert_eq!(Status::parse("YES"), None);
        assert_eq!(Status::parse(""), None);
        assert_eq!(Status::parse("pending"), None);
    }

    #[test]
    fn failed_exhausted_is_persisted_as_pending() {
        assert_eq!(Status::FailedExhausted.persisted(), Status::Pending);
        assert_eq!(Status::Succeeded.persisted(), Status::Succeeded);
        assert_eq!(Status::InProgress.persisted(), Status::InProgress);
    }

    #[test]
    fn terminal_states() {
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::FailedPermanent.is_terminal());
        assert!(Status::FailedExhausted.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::InProgress.is_terminal());
    }

    #[test]
    fn artifact_kind_parses_ledger_form() {
        assert_eq!(ArtifactKind::parse("file"), Some(ArtifactKind::File));
        assert_eq!(ArtifactKind::parse("cover"), Some(ArtifactKind::Cover));
        assert_eq!(ArtifactKind::parse("image"), None);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::ItemStarted {
            id: ItemId::from("B42"),
            kind: ArtifactKind::File,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_started");
        assert_eq!(json["id"], "B42");
        assert_eq!(json["kind"], "file");
    }
}
