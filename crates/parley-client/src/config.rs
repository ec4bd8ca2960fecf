//! Client configuration.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::decoder::TailPolicy;
use crate::error::{ChatError, Result};

/// Server used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Path of the chat-completions operation, appended to the base URL.
pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Configuration for a conversation client.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Server base URL (e.g., "http://localhost:8080").
    #[serde(default = "ChatConfig::default_base_url")]
    pub base_url: String,

    /// Extra JSON fields merged into every completion request body
    /// (model name, sampling parameters, ...).
    #[serde(default)]
    pub body: Map<String, Value>,

    /// Whole-request timeout in seconds. No limit when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// TCP connect timeout in seconds.
    #[serde(default = "ChatConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// How to treat an unparseable record at the end of a growing stream.
    #[serde(default)]
    pub tail_policy: TailPolicy,
}

impl ChatConfig {
    fn default_base_url() -> String {
        DEFAULT_BASE_URL.to_string()
    }

    const fn default_connect_timeout() -> u64 {
        10
    }

    /// Load configuration from the environment.
    ///
    /// Reads `PARLEY_BASE_URL` and `PARLEY_TIMEOUT_SECONDS`; everything else
    /// keeps its default.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Config` if `PARLEY_TIMEOUT_SECONDS` is not a number.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("PARLEY_BASE_URL") {
            config.base_url = base_url;
        }

        if let Ok(raw) = std::env::var("PARLEY_TIMEOUT_SECONDS") {
            let seconds = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| ChatError::Config(format!("PARLEY_TIMEOUT_SECONDS: {e}")))?;
            config.timeout_seconds = Some(seconds);
        }

        Ok(config)
    }

    /// Use a different server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Add an extra field to every request body.
    #[must_use]
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Set the whole-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Get the chat-completions endpoint URL.
    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), COMPLETIONS_PATH)
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Get the connect timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            body: Map::new(),
            timeout_seconds: None,
            connect_timeout_seconds: Self::default_connect_timeout(),
            tail_policy: TailPolicy::default(),
        }
    }
}
