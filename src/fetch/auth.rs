//! Authenticator seam: turns an identity into an access context.

use super::AccessContext;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::identity::Identity;
use async_trait::async_trait;
use std::time::Duration;

/// Produces access contexts for identities
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Log `identity` in and return a session bound to it
    async fn authenticate(&self, identity: &Identity) -> Result<AccessContext, AuthError>;
}

/// Cookie-session authenticator posting a login form
///
/// Each identity gets its own `reqwest` client with a cookie store, so the
/// session cookies set by the login response ride along on every download.
/// Without a configured `login_url` the session is anonymous.
#[derive(Debug, Clone)]
pub struct FormLoginAuthenticator {
    config: AuthConfig,
}

impl FormLoginAuthenticator {
    /// Create an authenticator from its configuration
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn build_client(&self) -> Result<reqwest::Client, AuthError> {
        reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Unreachable(format!("failed to build HTTP client: {}", e)))
    }
}

#[async_trait]
impl Authenticator for FormLoginAuthenticator {
    async fn authenticate(&self, identity: &Identity) -> Result<AccessContext, AuthError> {
        let client = self.build_client()?;

        let Some(login_url) = self.config.login_url.as_deref() else {
            tracing::debug!(identity = %identity.id, "no login endpoint configured, using anonymous session");
            return Ok(AccessContext::new(identity.id.clone(), client));
        };

        let form = [
            (self.config.login_field.as_str(), identity.id.as_str()),
            (self.config.secret_field.as_str(), identity.secret.expose()),
        ];

        let response = client
            .post(login_url)
            .form(&form)
            .timeout(self.config.login_timeout)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            tracing::info!(identity = %identity.id, "logged in");
            Ok(AccessContext::new(identity.id.clone(), client))
        } else if status.is_server_error() {
            Err(AuthError::Unreachable(format!("login returned HTTP {}", status.as_u16())))
        } else {
            Err(AuthError::Rejected(format!("login returned HTTP {}", status.as_u16())))
        }
    }
}
