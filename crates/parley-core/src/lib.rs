//! Core types and utilities for parley.
//!
//! This crate provides the foundational types shared by the store and the
//! conversation client:
//!
//! - **Identifiers**: `MessageId` for messages, `RequestId` for request generations
//! - **Messages**: `Message` and `Role`
//!
//! # Example
//!
//! ```
//! use parley_core::{Message, MessageId, Role};
//!
//! let msg = Message::user("Hi");
//! assert_eq!(msg.role(), Role::User);
//!
//! let parsed: MessageId = msg.id.to_string().parse().unwrap();
//! assert_eq!(parsed, msg.id);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;
pub mod message;

pub use ids::{IdError, MessageId, RequestId};
pub use message::{Message, Role};
