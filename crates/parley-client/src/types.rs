//! Wire types for the chat-completions endpoint.
//!
//! Only the fields the client reads are modelled; everything else in a
//! response is ignored.

use parley_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TransportError;

// =============================================================================
// Requests
// =============================================================================

/// A request ready to hand to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Endpoint URL.
    pub url: String,
    /// JSON body.
    pub body: Value,
}

impl CompletionRequest {
    /// Build a streaming request: `{ ...extra, messages, stream: true }`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Encode` if the messages cannot be serialized.
    pub fn streaming(
        url: impl Into<String>,
        extra: &Map<String, Value>,
        messages: &[Message],
    ) -> Result<Self, TransportError> {
        let mut body = extra.clone();
        body.insert("messages".to_string(), encode_messages(messages)?);
        body.insert("stream".to_string(), Value::Bool(true));

        Ok(Self {
            url: url.into(),
            body: Value::Object(body),
        })
    }

    /// Build a one-shot request:
    /// `{ ...extra, messages, max_tokens?, temperature }`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Encode` if the messages cannot be serialized.
    pub fn one_shot(
        url: impl Into<String>,
        extra: &Map<String, Value>,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: f64,
    ) -> Result<Self, TransportError> {
        let mut body = extra.clone();
        body.insert("messages".to_string(), encode_messages(messages)?);
        if let Some(max_tokens) = max_tokens {
            body.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        body.insert("temperature".to_string(), Value::from(temperature));

        Ok(Self {
            url: url.into(),
            body: Value::Object(body),
        })
    }

    /// Whether the body asks for a streamed response.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.body.get("stream").and_then(Value::as_bool) == Some(true)
    }
}

fn encode_messages(messages: &[Message]) -> Result<Value, TransportError> {
    serde_json::to_value(messages).map_err(|e| TransportError::Encode(e.to_string()))
}

// =============================================================================
// Streaming Responses
// =============================================================================

/// One `data:` record of a streamed response.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    /// Choices; only the first one is read.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Token accounting, sent with the last record.
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// Content delta of the first choice, empty when absent.
    #[must_use]
    pub fn into_delta_content(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .unwrap_or_default()
    }
}

/// A choice inside a stream record.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    /// Incremental message fields.
    #[serde(default)]
    pub delta: Delta,
    /// Why generation stopped, on the last content record.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental message fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    /// Content fragment.
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens generated.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Sum of both.
    #[serde(default)]
    pub total_tokens: u64,
}

// =============================================================================
// One-shot Responses
// =============================================================================

/// Response of a non-streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    /// Generated choices.
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    /// Token accounting.
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    /// Message content of the first choice.
    #[must_use]
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_deref().unwrap_or_default())
    }
}

/// A choice of a non-streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    /// The generated message.
    pub message: ResponseMessage,
}

/// Message inside a non-streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    /// Generated text.
    #[serde(default)]
    pub content: Option<String>,
}

// =============================================================================
// Error Response
// =============================================================================

/// Extract a human readable message from an error body.
///
/// Understands `{"error": {"message": "..."}}` and `{"error": "..."}`.
#[must_use]
pub fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}
