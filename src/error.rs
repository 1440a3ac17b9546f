//! Error types for harvest-dl
//!
//! Errors are split by blast radius:
//! - [`FetchError`] is item-level. It is always contained by the scheduler and
//!   recorded against the item, never propagated out of a run.
//! - [`PersistenceError`] and [`Error::AllIdentitiesExhausted`] are run-level and
//!   stop dispatch of new work.
//! - [`AuthError`] is produced by an [`Authenticator`](crate::fetch::Authenticator)
//!   and folded into a [`FetchError`] by the scheduler.

use crate::types::{IdentityId, ItemId};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for harvest-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for harvest-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "identities")
        key: Option<String>,
    },

    /// Ledger could not be read or written
    #[error("ledger error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Every identity is quota-exhausted or rotated out
    #[error("all identities exhausted: {0}")]
    AllIdentitiesExhausted(String),

    /// Item manifest could not be parsed
    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest {
        /// Manifest path
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Run was cancelled
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Process exit code for the CLI driver
    ///
    /// `1` means the run stopped early and can be resumed, `2` means the
    /// ledger (or the configuration needed to open it) is unusable.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AllIdentitiesExhausted(_) | Error::Cancelled => 1,
            _ => 2,
        }
    }
}

/// Ledger persistence errors
///
/// Any of these is fatal to a run: the scheduler halts dispatch instead of
/// continuing with unrecorded state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Failed to open or create the ledger store
    #[error("failed to open ledger: {0}")]
    OpenFailed(String),

    /// Failed to run migrations
    #[error("failed to migrate ledger: {0}")]
    MigrationFailed(String),

    /// Failed to read records
    #[error("failed to read ledger: {0}")]
    ReadFailed(String),

    /// Failed to durably write a record
    #[error("failed to record {id}: {reason}")]
    WriteFailed {
        /// Item whose record could not be written
        id: ItemId,
        /// Underlying failure
        reason: String,
    },

    /// Failed to apply a bulk status change
    #[error("failed to update ledger: {0}")]
    UpdateFailed(String),

    /// The ledger actor is no longer running
    #[error("ledger writer has stopped")]
    WriterStopped,
}

/// Why a downloaded (or about to be downloaded) artifact was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// Server answered with an HTML page instead of the artifact
    #[error("HTML error page instead of artifact ({content_type}, {length:?} bytes)")]
    HtmlErrorPage {
        /// Content type reported by the server
        content_type: String,
        /// Content length reported by the server, if any
        length: Option<u64>,
    },

    /// Artifact smaller than the minimum size floor
    #[error("artifact too small: {size} bytes (minimum {min})")]
    TooSmall {
        /// Bytes received
        size: u64,
        /// Configured floor
        min: u64,
    },

    /// Artifact larger than the maximum size ceiling
    #[error("artifact too large: {size} bytes (maximum {max})")]
    TooLarge {
        /// Bytes received or advertised
        size: u64,
        /// Configured ceiling
        max: u64,
    },

    /// A pre-existing file sits at the target path but fails the size check
    #[error("existing file at {path} fails size check: {size} bytes")]
    ExistingFileInvalid {
        /// Target path
        path: PathBuf,
        /// Size of the existing file
        size: u64,
    },
}

/// Outcome of a failed item attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeout, connection reset, 5xx and similar retryable failures
    #[error("{0}")]
    TransientNetwork(String),

    /// Artifact failed validation and was discarded
    #[error("{0}")]
    ContentValidation(#[from] ValidationFailure),

    /// Resource gone or never had a locator
    #[error("{0}")]
    PermanentRemote(String),

    /// The identity's quota is used up on the remote side
    #[error("identity {identity} reached its quota: {detail}")]
    QuotaExhausted {
        /// Identity that hit the quota
        identity: IdentityId,
        /// What the service reported
        detail: String,
    },

    /// Identity could not be authenticated
    #[error("authentication failed for {identity}: {reason}")]
    Authentication {
        /// Identity that failed to authenticate
        identity: IdentityId,
        /// Reason reported by the authenticator
        reason: String,
    },

    /// Local I/O failure while writing the artifact
    #[error("local I/O failure: {0}")]
    LocalIo(String),

    /// Attempt was cancelled with the run
    #[error("attempt cancelled")]
    Cancelled,
}

impl FetchError {
    /// Taxonomy name used as the prefix of recorded reasons
    pub fn category(&self) -> &'static str {
        match self {
            FetchError::TransientNetwork(_) | FetchError::LocalIo(_) => "TransientNetworkError",
            FetchError::ContentValidation(_) => "ContentValidationError",
            FetchError::PermanentRemote(_) => "PermanentRemoteError",
            FetchError::QuotaExhausted { .. } => "QuotaExhaustedError",
            FetchError::Authentication { .. } => "AuthenticationError",
            FetchError::Cancelled => "Cancelled",
        }
    }

    /// Reason string as stored in the ledger
    pub fn reason(&self) -> String {
        format!("{}: {}", self.category(), self)
    }

    /// Whether the failure says something about the identity rather than the item
    ///
    /// Permanent remote errors (404-class, missing locator) and cancellations
    /// are not held against the identity.
    pub fn counts_against_identity(&self) -> bool {
        !matches!(self, FetchError::PermanentRemote(_) | FetchError::Cancelled)
    }
}

/// Authentication failures reported by an authenticator
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Service rejected the credentials
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// Service could not be reached
    #[error("login request failed: {0}")]
    Unreachable(String),
}
