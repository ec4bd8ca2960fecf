//! Chat message types.
//!
//! These types mirror the message objects exchanged with an OpenAI-style
//! chat-completions endpoint, plus a few pass-through metadata fields used by
//! front ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::MessageId;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The system prompt. Only ever found at index 0 of a conversation.
    System,
    /// A message typed by the user.
    User,
    /// A model response.
    Assistant,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of a conversation.
///
/// `id` and `role` are fixed once the message exists; only `content` (and
/// the metadata) is mutable. A message deserialized without an `id` receives
/// a freshly generated one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    #[serde(default = "MessageId::generate")]
    pub id: MessageId,
    role: Role,
    /// Text body; overwritten in place while an assistant reply streams in.
    pub content: String,
    /// Creation time, milliseconds since the epoch on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub created: Option<DateTime<Utc>>,
    /// Last edit time, milliseconds since the epoch on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub updated: Option<DateTime<Utc>>,
    /// Thread the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Position inside the thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_index: Option<u32>,
    /// Attached image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Attached speech audio reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<String>,
}

impl Message {
    /// Create a message with a fresh id and no metadata.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            content: content.into(),
            created: None,
            updated: None,
            thread_id: None,
            thread_index: None,
            image: None,
            tts: None,
        }
    }

    /// Create a system prompt message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create the empty assistant message that a streamed reply is written into.
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            created: Some(Utc::now()),
            ..Self::assistant("")
        }
    }

    /// Author of the message.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Check if this is the system prompt.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Check if this is a user message.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Check if this is an assistant message.
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}
