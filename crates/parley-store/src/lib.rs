//! In-memory conversation history for parley.
//!
//! This crate owns the ordered message list of one conversation and enforces
//! its invariants:
//!
//! - a system prompt can only sit at index 0 and is never deleted, edited or
//!   reloaded through the conversation operations
//! - message ids are unique
//! - deleting a message removes its turn partner (user + direct reply)
//!
//! History is kept for the lifetime of the owning session only; nothing is
//! written to disk.
//!
//! # Example
//!
//! ```
//! use parley_core::Message;
//! use parley_store::MessageStore;
//!
//! let mut store = MessageStore::from_messages(vec![Message::system("You are helpful")]).unwrap();
//! let user = store.append(Message::user("Hi")).unwrap();
//! store.append(Message::assistant("Hello")).unwrap();
//!
//! assert_eq!(store.visible().count(), 2);
//!
//! // Deleting the user message takes the reply with it.
//! let removed = store.delete_turn(user).unwrap();
//! assert_eq!(removed.len(), 2);
//! assert_eq!(store.system_prompt(), Some("You are helpful"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod history;

pub use error::{Result, StoreError};
pub use history::MessageStore;
