//! Error types for the conversation client.
//!
//! Errors fall into three kinds:
//!
//! - **invalid operation**: caller misuse, reported synchronously
//! - **transport**: the request could not be sent or was rejected
//! - **decode**: a stream record could not be parsed
//!
//! All errors are `Clone` so that the same failure can be handed to the error
//! callback, stored in the request outcome and returned to the caller.

use std::time::Duration;

use parley_store::StoreError;
use thiserror::Error;

/// A result type using `ChatError`.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Broad classification of a [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller asked for something the conversation does not allow.
    InvalidOperation,
    /// The network layer failed or rejected the request.
    Transport,
    /// The response stream could not be decoded.
    Decode,
}

/// Errors raised by the completion transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The endpoint answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message extracted from the response body.
        message: String,
    },

    /// The request did not finish in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request body could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// A non-streaming response could not be parsed.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Errors raised while decoding a streamed response.
///
/// Both variants carry the content decoded before the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A record was not valid JSON or did not have the chunk shape.
    #[error("malformed stream record #{index}: {reason}")]
    Malformed {
        /// Position of the record in the stream.
        index: usize,
        /// Parser message.
        reason: String,
        /// Content decoded from earlier records.
        partial: String,
    },

    /// The body ended without `[DONE]` or a usage record.
    #[error("stream ended before a terminal record")]
    Truncated {
        /// Content decoded before the body ended.
        partial: String,
    },
}

impl DecodeError {
    /// Content decoded before the failure.
    #[must_use]
    pub fn partial_content(&self) -> &str {
        match self {
            Self::Malformed { partial, .. } | Self::Truncated { partial } => partial,
        }
    }
}

/// Errors returned by conversation operations.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// The history rejected the operation.
    #[error("invalid operation: {0}")]
    Store(#[from] StoreError),

    /// A request is already in flight for this conversation.
    #[error("invalid operation: a request is already in flight")]
    RequestInFlight,

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Stream decoding failure.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl ChatError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) | Self::RequestInFlight | Self::Config(_) => ErrorKind::InvalidOperation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
        }
    }

    /// Returns `true` for caller misuse.
    #[must_use]
    pub const fn is_invalid_operation(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidOperation)
    }
}
