//! The ordered message history of a single conversation.

use std::collections::HashSet;

use parley_core::{Message, MessageId, Role};

use crate::error::{Result, StoreError};

/// Ordered history of one conversation.
///
/// Invariants:
/// - a `system` message can only live at index 0
/// - message ids are unique and never nil
///
/// Every mutation bumps [`MessageStore::revision`].
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    revision: u64,
}

impl MessageStore {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history from an initial list of messages.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MisplacedSystemMessage` if a system message appears
    /// after index 0.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut store = Self::new();
        store.set_all(messages)?;
        Ok(store)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All messages, system prompt included.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages shown to the user: everything except the system prompt.
    ///
    /// Computed on every call from the current history.
    pub fn visible(&self) -> impl Iterator<Item = &Message> + '_ {
        self.messages.iter().filter(|msg| !msg.is_system())
    }

    /// Number of messages, system prompt included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history has no messages at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Mutation counter, bumped by every change to the history.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Position of the message with the given id.
    #[must_use]
    pub fn find_index(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|msg| msg.id == id)
    }

    /// The message with the given id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|msg| msg.id == id)
    }

    /// Content of the system prompt, if index 0 holds one.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|msg| msg.is_system())
            .map(|msg| msg.content.as_str())
    }

    /// Consume the store, returning the messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    // =========================================================================
    // Primitive mutations
    // =========================================================================

    /// Append a message to the end of the history.
    ///
    /// A nil or already used id is replaced with a fresh one. Returns the id
    /// the message was stored under.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MisplacedSystemMessage` when appending a system
    /// message to a non-empty history.
    pub fn append(&mut self, mut message: Message) -> Result<MessageId> {
        if message.is_system() && !self.messages.is_empty() {
            return Err(StoreError::MisplacedSystemMessage {
                index: self.messages.len(),
            });
        }

        if message.id.is_nil() || self.find_index(message.id).is_some() {
            message.id = MessageId::generate();
        }

        let id = message.id;
        self.messages.push(message);
        self.touch();
        Ok(id)
    }

    /// Append several messages, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MisplacedSystemMessage` if any system message would
    /// land after index 0. The history is unchanged in that case.
    pub fn extend(&mut self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let base = self.messages.len();
        if let Some(offset) = messages.iter().position(Message::is_system) {
            if base + offset != 0 {
                return Err(StoreError::MisplacedSystemMessage {
                    index: base + offset,
                });
            }
        }

        let mut seen: HashSet<MessageId> = self.messages.iter().map(|msg| msg.id).collect();
        for mut message in messages {
            if message.id.is_nil() || !seen.insert(message.id) {
                message.id = MessageId::generate();
                seen.insert(message.id);
            }
            self.messages.push(message);
        }
        self.touch();
        Ok(())
    }

    /// Replace the whole history at once.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MisplacedSystemMessage` if a system message appears
    /// after index 0. The previous history is kept in that case.
    pub fn set_all(&mut self, messages: Vec<Message>) -> Result<()> {
        if let Some(index) = messages
            .iter()
            .skip(1)
            .position(Message::is_system)
            .map(|pos| pos + 1)
        {
            return Err(StoreError::MisplacedSystemMessage { index });
        }

        let previous = std::mem::take(&mut self.messages);
        if let Err(e) = self.extend(messages) {
            self.messages = previous;
            return Err(e);
        }
        if self.messages.is_empty() {
            // extend() does not bump on an empty list
            self.touch();
        }
        Ok(())
    }

    /// Remove the message at `index`.
    pub fn splice_out(&mut self, index: usize) -> Option<Message> {
        if index >= self.messages.len() {
            return None;
        }
        let removed = self.messages.remove(index);
        self.touch();
        Some(removed)
    }

    /// Keep the first `len` messages and return the rest.
    pub fn truncate(&mut self, len: usize) -> Vec<Message> {
        if len >= self.messages.len() {
            return Vec::new();
        }
        let tail = self.messages.split_off(len);
        self.touch();
        tail
    }

    /// Overwrite the content of a message regardless of its role.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MessageNotFound` if the id is unknown.
    pub fn set_content(&mut self, id: MessageId, content: impl Into<String>) -> Result<()> {
        let message = self
            .messages
            .iter_mut()
            .find(|msg| msg.id == id)
            .ok_or(StoreError::MessageNotFound(id))?;
        message.content = content.into();
        self.touch();
        Ok(())
    }

    /// Set the content of the system prompt.
    ///
    /// The prompt is never created implicitly.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSystemPrompt` if index 0 is missing or is not a
    /// system message.
    pub fn set_system_prompt(&mut self, content: impl Into<String>) -> Result<()> {
        match self.messages.first_mut() {
            Some(msg) if msg.is_system() => {
                msg.content = content.into();
                self.touch();
                Ok(())
            }
            _ => Err(StoreError::NoSystemPrompt),
        }
    }

    // =========================================================================
    // Conversation operations
    // =========================================================================

    /// Delete a message together with its turn partner.
    ///
    /// A user message takes the assistant reply right after it along; an
    /// assistant reply takes the user message right before it. At most one
    /// partner is removed and a system message never is. Returns the removed
    /// messages in history order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MessageNotFound` for an unknown id and
    /// `StoreError::RoleNotAllowed` for the system prompt. The history is
    /// unchanged on error.
    pub fn delete_turn(&mut self, id: MessageId) -> Result<Vec<Message>> {
        let index = self.find_index(id).ok_or(StoreError::MessageNotFound(id))?;
        let role = self.messages[index].role();
        if role == Role::System {
            return Err(StoreError::RoleNotAllowed {
                id,
                role,
                action: "delete",
            });
        }

        let target = self.messages.remove(index);
        let mut removed = vec![target];

        match role {
            Role::User
                if self
                    .messages
                    .get(index)
                    .is_some_and(Message::is_assistant) =>
            {
                removed.push(self.messages.remove(index));
            }
            Role::Assistant
                if index > 0 && self.messages.get(index - 1).is_some_and(Message::is_user) =>
            {
                removed.insert(0, self.messages.remove(index - 1));
            }
            _ => {}
        }

        self.touch();
        tracing::debug!(message_id = %id, removed = removed.len(), "Deleted turn");
        Ok(removed)
    }

    /// Replace the content of a user or assistant message.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MessageNotFound` for an unknown id and
    /// `StoreError::RoleNotAllowed` for the system prompt.
    pub fn edit_content(&mut self, id: MessageId, content: impl Into<String>) -> Result<()> {
        let message = self.get(id).ok_or(StoreError::MessageNotFound(id))?;
        if message.is_system() {
            return Err(StoreError::RoleNotAllowed {
                id,
                role: Role::System,
                action: "edit",
            });
        }
        self.set_content(id, content)
    }

    /// Cut the history at an assistant message for regeneration.
    ///
    /// Keeps everything before the message, drops the message itself and
    /// returns everything after it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MessageNotFound` for an unknown id and
    /// `StoreError::RoleNotAllowed` for anything but an assistant message.
    pub fn split_for_reload(&mut self, id: MessageId) -> Result<Vec<Message>> {
        let index = self.find_index(id).ok_or(StoreError::MessageNotFound(id))?;
        let role = self.messages[index].role();
        if role != Role::Assistant {
            return Err(StoreError::RoleNotAllowed {
                id,
                role,
                action: "reload",
            });
        }

        let mut tail = self.truncate(index);
        tail.remove(0);
        Ok(tail)
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
