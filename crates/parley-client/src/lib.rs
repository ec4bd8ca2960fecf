//! Streaming chat-completion client for parley.
//!
//! This crate drives one conversation against an OpenAI-style
//! chat-completions endpoint, including:
//!
//! - the conversation state machine (submit, reload, append, stop, edits)
//! - incremental decoding of `data:`-separated stream records
//! - an HTTP transport and a one-shot completion helper
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────────────┐
//! │   Front end      │────▶│ ConversationController │
//! │   (CLI, UI)      │     │ (history + request)    │
//! └──────────────────┘     └───────────┬────────────┘
//!                                      │
//!                 ┌────────────────────┼────────────────────┐
//!                 │                    │                    │
//!        ┌────────▼────────┐  ┌────────▼────────┐  ┌────────▼────────┐
//!        │  MessageStore   │  │  StreamDecoder  │  │   Transport     │
//!        │  (history)      │  │  (records)      │  │   (trait)       │
//!        └─────────────────┘  └─────────────────┘  └────────┬────────┘
//!                                                           │ HTTP
//!                                                  ┌────────▼────────┐
//!                                                  │  /v1/chat/      │
//!                                                  │  completions    │
//!                                                  └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use parley_client::{ChatConfig, ConversationController, HttpTransport};
//! use parley_core::Message;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig::default().with_body_field("model", "llama3");
//! let transport = Arc::new(HttpTransport::new(&config)?);
//!
//! let controller = ConversationController::builder(transport)
//!     .with_config(config)
//!     .with_initial_messages(vec![Message::system("You are helpful")])
//!     .with_on_finish(|messages| println!("{} messages", messages.len()))
//!     .build()?;
//!
//! let handle = controller.submit("Hi").await?;
//! handle.wait().await;
//!
//! for message in controller.visible_messages() {
//!     println!("{}: {}", message.role(), message.content);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod completion;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod transport;
pub mod types;

pub use completion::{chat_completion, CompletionOptions, DEFAULT_TEMPERATURE};
pub use config::{ChatConfig, COMPLETIONS_PATH, DEFAULT_BASE_URL};
pub use controller::{
    ControllerBuilder, ConversationController, ErrorCallback, FinishCallback, RequestHandle,
    RequestOutcome, RequestPhase,
};
pub use decoder::{decode, Decoded, StreamDecoder, StreamState, TailPolicy};
pub use error::{ChatError, DecodeError, ErrorKind, Result, TransportError};
pub use transport::{ChunkStream, HttpTransport, Transport};
pub use types::{CompletionRequest, CompletionResponse, Usage};
