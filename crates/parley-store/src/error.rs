//! Error types for the history store.
//!
//! Every variant describes caller misuse; none of them is retriable.

use parley_core::{MessageId, Role};
use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Invalid operations on a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No message with the given id exists.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The action is not allowed for a message of this role.
    #[error("cannot {action} {role} message {id}")]
    RoleNotAllowed {
        /// The message targeted by the action.
        id: MessageId,
        /// Role of that message.
        role: Role,
        /// What the caller tried to do.
        action: &'static str,
    },

    /// The history has no system prompt at index 0.
    #[error("no system prompt at index 0")]
    NoSystemPrompt,

    /// A system message would end up somewhere other than index 0.
    #[error("system message must be at index 0, found at index {index}")]
    MisplacedSystemMessage {
        /// Position the system message would occupy.
        index: usize,
    },
}
