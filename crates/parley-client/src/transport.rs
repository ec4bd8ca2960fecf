//! Completion transport.
//!
//! The controller only talks to the network through the [`Transport`] trait,
//! so tests can script the byte stream without a server.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::config::ChatConfig;
use crate::error::TransportError;
use crate::types::{error_message, CompletionRequest, CompletionResponse};

/// Byte chunks of a streamed response body, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Trait for talking to a chat-completions endpoint.
///
/// This trait abstracts the HTTP client, allowing for mock implementations
/// in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a streaming request and return the body as a chunk stream.
    ///
    /// Resolves once the response headers arrived with a success status.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the endpoint rejects it.
    async fn open_stream(&self, request: CompletionRequest) -> Result<ChunkStream, TransportError>;

    /// Send a non-streaming request and parse the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, is rejected, or the response
    /// cannot be parsed.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, TransportError>;
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport using the connect timeout of `config`.
    ///
    /// The whole-request timeout is enforced by the caller, since a streamed
    /// body may legitimately take longer than any fixed limit.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Http` if the HTTP client cannot be created.
    pub fn new(config: &ChatConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self { client })
    }

    /// Create a transport with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        accept: &'static str,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .json(&request.body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::handle_error(response).await)
        }
    }

    async fn handle_error(response: reqwest::Response) -> TransportError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| {
            if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                body.trim().to_string()
            }
        });

        tracing::warn!(status = %status, error = %message, "Completion request rejected");

        TransportError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, request: CompletionRequest) -> Result<ChunkStream, TransportError> {
        let response = self.send(&request, "text/event-stream").await?;
        tracing::debug!(url = %request.url, status = %response.status(), "Stream opened");

        Ok(response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(TransportError::from)
            .boxed())
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, TransportError> {
        let response = self.send(&request, "application/json").await?;
        response
            .json::<CompletionResponse>()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }
}
