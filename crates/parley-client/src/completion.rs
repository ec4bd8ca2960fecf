//! One-shot, non-streaming completions.

use parley_core::Message;
use serde_json::{Map, Value};

use crate::config::ChatConfig;
use crate::error::{Result, TransportError};
use crate::transport::Transport;
use crate::types::CompletionRequest;

/// Temperature used when the caller does not set one.
pub const DEFAULT_TEMPERATURE: f64 = 0.35;

/// Parameters of a one-shot completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Conversation to complete.
    pub messages: Vec<Message>,
    /// Upper bound on generated tokens; omitted from the request when unset.
    pub max_tokens: Option<u32>,
    /// Sampling temperature, [`DEFAULT_TEMPERATURE`] when unset.
    pub temperature: Option<f64>,
    /// Extra body fields, merged over the configured ones.
    pub body: Map<String, Value>,
}

impl CompletionOptions {
    /// Options for the given messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set the token limit.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Run a non-streaming completion and return the trimmed reply.
///
/// The body is `{ ...config.body, ...options.body, messages, max_tokens?,
/// temperature }`. The configured whole-request timeout applies.
///
/// # Errors
///
/// Returns a transport error if the request fails or times out, and
/// `TransportError::Parse` if the response has no choices.
pub async fn chat_completion(
    transport: &dyn Transport,
    config: &ChatConfig,
    options: CompletionOptions,
) -> Result<String> {
    let mut extra = config.body.clone();
    extra.extend(options.body);

    let request = CompletionRequest::one_shot(
        config.completions_url(),
        &extra,
        &options.messages,
        options.max_tokens,
        options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    )?;

    tracing::debug!(messages = options.messages.len(), "Sending completion request");

    let response = match config.timeout() {
        Some(limit) => tokio::time::timeout(limit, transport.complete(request))
            .await
            .map_err(|_| TransportError::Timeout(limit))??,
        None => transport.complete(request).await?,
    };

    tracing::debug!(
        choices = response.choices.len(),
        total_tokens = response.usage.as_ref().map(|usage| usage.total_tokens),
        "Received completion"
    );

    let content = response
        .first_content()
        .ok_or_else(|| TransportError::Parse("response has no choices".to_string()))?;

    Ok(content.trim().to_string())
}
