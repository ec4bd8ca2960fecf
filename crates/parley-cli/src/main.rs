//! Parley CLI - chat with a completions server from the terminal.
//!
//! This is the entry point for the `parley` binary.

mod app;
mod command;

use std::io;
use std::sync::Arc;

use clap::Parser;
use parley_client::{ChatConfig, ConversationController, HttpTransport, TailPolicy};
use parley_core::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use app::App;

/// Parley CLI - chat with a completions server from the terminal.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server base URL.
    #[arg(long, env = "PARLEY_BASE_URL")]
    base_url: Option<String>,

    /// Model name sent with every request.
    #[arg(long, env = "PARLEY_MODEL")]
    model: Option<String>,

    /// System prompt for the conversation.
    #[arg(long)]
    system: Option<String>,

    /// Whole-request timeout in seconds.
    #[arg(long, env = "PARLEY_TIMEOUT_SECONDS")]
    timeout: Option<u64>,

    /// Fail on any malformed stream record instead of waiting for more data.
    #[arg(long, default_value = "false")]
    strict: bool,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.debug {
        EnvFilter::new("parley=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // Build configuration
    let mut config = ChatConfig::from_env()?;
    if let Some(base_url) = args.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(model) = args.model {
        config = config.with_body_field("model", model);
    }
    if let Some(seconds) = args.timeout {
        config = config.with_timeout(seconds);
    }
    if args.strict {
        config.tail_policy = TailPolicy::Strict;
    }

    tracing::info!(url = %config.completions_url(), "Starting parley");

    // Create controller
    let transport = Arc::new(HttpTransport::new(&config)?);
    let initial = args.system.map(Message::system).into_iter().collect();
    let controller = ConversationController::builder(transport)
        .with_config(config)
        .with_initial_messages(initial)
        .with_on_finish(|messages| {
            tracing::debug!(messages = messages.len(), "Reply finished");
        })
        .build()?;

    // Read stdin on its own task so input stays responsive while streaming
    let (line_tx, mut lines) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut app = App::new(controller, io::stdout());
    println!("parley: type a message, /help for commands");

    while !app.should_quit() {
        app.prompt()?;
        let Some(line) = lines.recv().await else {
            break;
        };
        app.handle_line(&line, &mut lines).await?;
    }

    Ok(())
}
