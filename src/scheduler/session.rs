//! Per-identity access context cache

use crate::error::{AuthError, FetchError};
use crate::fetch::{AccessContext, Authenticator};
use crate::identity::Identity;
use crate::types::IdentityId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sessions reused across attempts on the same identity
///
/// A session is dropped as soon as an attempt under it fails, so the next
/// attempt on that identity logs in again.
pub(crate) struct SessionCache {
    authenticator: Arc<dyn Authenticator>,
    sessions: Mutex<HashMap<IdentityId, AccessContext>>,
}

impl SessionCache {
    pub(crate) fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cached session for `identity`, logging in when there is none
    pub(crate) async fn get(&self, identity: &Identity) -> Result<AccessContext, FetchError> {
        if let Some(context) = self.sessions.lock().await.get(&identity.id) {
            return Ok(context.clone());
        }

        // Login runs without the lock so other identities are not held up
        let context = self
            .authenticator
            .authenticate(identity)
            .await
            .map_err(|e| {
                let reason = match e {
                    AuthError::Rejected(msg) => format!("login rejected: {}", msg),
                    AuthError::Unreachable(msg) => format!("login endpoint unreachable: {}", msg),
                };
                FetchError::Authentication {
                    identity: identity.id.clone(),
                    reason,
                }
            })?;

        self.sessions
            .lock()
            .await
            .insert(identity.id.clone(), context.clone());
        Ok(context)
    }

    /// Drop the cached session for `identity`
    pub(crate) async fn invalidate(&self, identity: &IdentityId) {
        if self.sessions.lock().await.remove(identity).is_some() {
            tracing::debug!(identity = %identity, "discarded session");
        }
    }
}
