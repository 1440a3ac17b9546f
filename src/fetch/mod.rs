//! Single-item download attempts
//!
//! [`FetchWorker::fetch`] performs one attempt for one item under an
//! [`AccessContext`]:
//!
//! 1. an item without a locator fails permanently;
//! 2. a non-empty file already at the target path is an idempotent skip;
//! 3. the response status and headers are classified before any byte is
//!    written (HTML error pages and oversized artifacts are rejected early);
//! 4. the body is streamed to a hidden `.part` file next to the target,
//!    synced, size-checked and only then renamed into place.
//!
//! The partial file is removed whenever the attempt does not end in the
//! rename, including when the attempt future is dropped by a timeout.

use crate::config::ValidationConfig;
use crate::error::{FetchError, ValidationFailure};
use crate::types::{ArtifactKind, IdentityId, Item};
use crate::utils::partial_path;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

mod auth;
mod transport;

pub use auth::{Authenticator, FormLoginAuthenticator};
pub use transport::{HttpTransport, Transport, TransportResponse};

/// Authenticated session bound to one identity
///
/// Produced by an [`Authenticator`], cached by the scheduler for the run and
/// discarded after any failed attempt.
#[derive(Debug, Clone)]
pub struct AccessContext {
    identity: IdentityId,
    client: reqwest::Client,
    issued_at: Instant,
}

impl AccessContext {
    /// Wrap an HTTP client carrying the identity's session
    pub fn new(identity: IdentityId, client: reqwest::Client) -> Self {
        Self {
            identity,
            client,
            issued_at: Instant::now(),
        }
    }

    /// Identity the session belongs to
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// HTTP client carrying the session
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// When the session was created
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// Result of a successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSuccess {
    /// Size of the artifact on disk
    pub bytes: u64,
    /// Final path of the artifact
    pub path: PathBuf,
    /// True when the artifact was already present and nothing was downloaded
    pub skipped: bool,
}

/// Removes a partial file unless disarmed
struct PartialFileGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "removed partial file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove partial file"
                ),
            }
        }
    }
}

/// Performs download attempts and validates their results
#[derive(Clone)]
pub struct FetchWorker {
    transport: Arc<dyn Transport>,
    file_rules: ValidationConfig,
    cover_rules: ValidationConfig,
}

impl FetchWorker {
    /// Create a worker with per-kind validation rules
    pub fn new(
        transport: Arc<dyn Transport>,
        file_rules: ValidationConfig,
        cover_rules: ValidationConfig,
    ) -> Self {
        Self {
            transport,
            file_rules,
            cover_rules,
        }
    }

    /// Validation rules for a kind
    pub fn rules_for(&self, kind: ArtifactKind) -> &ValidationConfig {
        match kind {
            ArtifactKind::File => &self.file_rules,
            ArtifactKind::Cover => &self.cover_rules,
        }
    }

    /// Size of a valid artifact already at the item's target, if any
    ///
    /// An existing file outside the size bounds is reported as a validation
    /// failure and left where it is.
    pub async fn existing(&self, item: &Item) -> Result<Option<u64>, FetchError> {
        let metadata = match tokio::fs::metadata(&item.target_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FetchError::LocalIo(format!(
                "failed to inspect {}: {}",
                item.target_path.display(),
                e
            ))),
        };

        if !metadata.is_file() || metadata.len() == 0 {
            return Ok(None);
        }

        let size = metadata.len();
        let rules = self.rules_for(item.kind);
        if size < rules.min_size || size > rules.max_size {
            return Err(ValidationFailure::ExistingFileInvalid {
                path: item.target_path.clone(),
                size,
            }
            .into());
        }

        Ok(Some(size))
    }

    /// Perform one download attempt for `item`
    pub async fn fetch(
        &self,
        item: &Item,
        context: &AccessContext,
        cancel: &CancellationToken,
    ) -> Result<FetchSuccess, FetchError> {
        let locator = item
            .locator
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| FetchError::PermanentRemote("no locator".to_string()))?;

        if let Some(bytes) = self.existing(item).await? {
            tracing::debug!(item_id = %item.id, bytes, "artifact already on disk");
            return Ok(FetchSuccess {
                bytes,
                path: item.target_path.clone(),
                skipped: true,
            });
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.transport.get(locator, context) => response?,
        };

        let rules = self.rules_for(item.kind);
        classify_response(&response, context.identity(), rules)?;

        let bytes = self
            .stream_to_disk(response, &item.target_path, rules, cancel)
            .await?;

        tracing::debug!(item_id = %item.id, bytes, path = %item.target_path.display(), "artifact written");
        Ok(FetchSuccess {
            bytes,
            path: item.target_path.clone(),
            skipped: false,
        })
    }

    async fn stream_to_disk(
        &self,
        response: TransportResponse,
        target: &Path,
        rules: &ValidationConfig,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FetchError::LocalIo(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
            FetchError::LocalIo(format!("failed to create {}: {}", partial.display(), e))
        })?;
        let mut guard = PartialFileGuard::new(partial.clone());

        let write_error = |e: std::io::Error| {
            FetchError::LocalIo(format!("failed to write {}: {}", partial.display(), e))
        };

        let mut body = response.body;
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            written += chunk.len() as u64;
            if written > rules.max_size {
                return Err(ValidationFailure::TooLarge {
                    size: written,
                    max: rules.max_size,
                }
                .into());
            }

            file.write_all(&chunk).await.map_err(write_error)?;
        }

        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        if written < rules.min_size {
            return Err(ValidationFailure::TooSmall {
                size: written,
                min: rules.min_size,
            }
            .into());
        }

        tokio::fs::rename(&partial, target).await.map_err(|e| {
            FetchError::LocalIo(format!(
                "failed to move {} into place: {}",
                target.display(),
                e
            ))
        })?;
        guard.disarm();

        Ok(written)
    }
}

/// Check status and headers before anything is written
fn classify_response(
    response: &TransportResponse,
    identity: &IdentityId,
    rules: &ValidationConfig,
) -> Result<(), FetchError> {
    let status = response.status;

    match status {
        200..=299 => {}
        429 => {
            return Err(FetchError::QuotaExhausted {
                identity: identity.clone(),
                detail: "HTTP 429 Too Many Requests".to_string(),
            });
        }
        408 | 500..=599 => return Err(FetchError::TransientNetwork(format!("HTTP {}", status))),
        400..=499 => return Err(FetchError::PermanentRemote(format!("HTTP {}", status))),
        _ => {
            return Err(FetchError::TransientNetwork(format!(
                "unexpected HTTP {}",
                status
            )));
        }
    }

    let is_html = response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));

    // A missing length counts as short
    if is_html && response.content_length.unwrap_or(0) < rules.html_floor {
        return Err(ValidationFailure::HtmlErrorPage {
            content_type: response.content_type.clone().unwrap_or_default(),
            length: response.content_length,
        }
        .into());
    }

    if let Some(length) = response.content_length {
        if length > rules.max_size {
            return Err(ValidationFailure::TooLarge {
                size: length,
                max: rules.max_size,
            }
            .into());
        }
    }

    Ok(())
}
