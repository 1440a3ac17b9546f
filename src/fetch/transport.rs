//! Transport seam: issues the GET for one locator under an access context.

use super::AccessContext;
use crate::error::FetchError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Response head plus a streaming body
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// `Content-Type` header, if present
    pub content_type: Option<String>,
    /// `Content-Length` header, if present
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BoxStream<'static, Result<Vec<u8>, FetchError>>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Issues network requests for item locators
///
/// Implementations report connection-level failures as
/// [`FetchError::TransientNetwork`] and leave status code interpretation to
/// the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `locator` using the session in `context`
    async fn get(
        &self,
        locator: &str,
        context: &AccessContext,
    ) -> Result<TransportResponse, FetchError>;
}

/// `reqwest`-backed transport using the context's HTTP client
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl HttpTransport {
    /// Create the transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        locator: &str,
        context: &AccessContext,
    ) -> Result<TransportResponse, FetchError> {
        let url = url::Url::parse(locator)
            .map_err(|e| FetchError::PermanentRemote(format!("invalid locator '{}': {}", locator, e)))?;

        let response = context
            .client()
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::TransientNetwork(describe_reqwest_error(&e)))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let status = response.status().as_u16();
        let content_length = response.content_length();

        // Pull chunks until the body ends or fails; a failure ends the stream
        let body = stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(FetchError::TransientNetwork(describe_reqwest_error(&e))),
                    None,
                )),
            }
        })
        .boxed();

        Ok(TransportResponse {
            status,
            content_type,
            content_length,
            body,
        })
    }
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else if e.is_body() || e.is_decode() {
        format!("body read failed: {}", e)
    } else {
        e.to_string()
    }
}
