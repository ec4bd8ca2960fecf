//! REPL state and command execution.

use std::io::Write;
use std::time::Duration;

use parley_client::{ConversationController, RequestHandle, RequestOutcome};
use parley_core::{Message, MessageId};
use parley_store::MessageStore;
use tokio::sync::mpsc;

use crate::command::{Command, HELP};

/// How often streamed content is flushed to the terminal.
pub const STREAM_REFRESH: Duration = Duration::from_millis(50);

/// Application state.
pub struct App<W> {
    controller: ConversationController,
    out: W,
    should_quit: bool,
}

impl<W: Write> App<W> {
    /// Create the app around a controller.
    pub fn new(controller: ConversationController, out: W) -> Self {
        Self {
            controller,
            out,
            should_quit: false,
        }
    }

    /// Whether the user asked to leave.
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Print the input prompt.
    pub fn prompt(&mut self) -> anyhow::Result<()> {
        write!(self.out, "> ")?;
        self.out.flush()?;
        Ok(())
    }

    /// Handle one input line, streaming the reply if it starts a request.
    ///
    /// Lines arriving while a reply streams are read from `lines`.
    pub async fn handle_line(
        &mut self,
        line: &str,
        lines: &mut mpsc::UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) => {
                writeln!(self.out, "error: {e}")?;
                return Ok(());
            }
        };

        if let Some(handle) = self.execute(command).await? {
            self.stream_reply(handle, lines).await?;
        }
        Ok(())
    }

    /// Run a command. Returns the request handle when a reply was started.
    pub async fn execute(&mut self, command: Command) -> anyhow::Result<Option<RequestHandle>> {
        let result = match command {
            Command::Say(text) => self.controller.submit(text).await.map(Some),
            Command::Reload(index) => match self.reload_target(index) {
                Some(id) => self.controller.reload(id).await.map(Some),
                None => {
                    writeln!(self.out, "error: no reply to reload")?;
                    return Ok(None);
                }
            },
            Command::Delete(index) => {
                let Some(id) = self.visible_id(index)? else {
                    return Ok(None);
                };
                self.controller.delete_message(id).map(|removed| {
                    tracing::debug!(removed = removed.len(), "Deleted messages");
                    None
                })
            }
            Command::Edit(index, text) => {
                let Some(id) = self.visible_id(index)? else {
                    return Ok(None);
                };
                self.controller.edit_message(id, text).map(|()| None)
            }
            Command::Stop => {
                if !self.controller.stop() {
                    writeln!(self.out, "nothing to stop")?;
                }
                Ok(None)
            }
            Command::System(text) => self.set_system_prompt(text).map(|()| None),
            Command::History => {
                self.print_history()?;
                Ok(None)
            }
            Command::Help => {
                writeln!(self.out, "{HELP}")?;
                Ok(None)
            }
            Command::Quit => {
                self.controller.stop();
                self.should_quit = true;
                Ok(None)
            }
        };

        match result {
            Ok(handle) => Ok(handle),
            Err(e) => {
                writeln!(self.out, "error: {e}")?;
                Ok(None)
            }
        }
    }

    fn set_system_prompt(&self, text: String) -> parley_client::Result<()> {
        if self.controller.system_prompt().is_some() {
            return self.controller.set_system_prompt(text);
        }

        let mut messages = vec![Message::system(text)];
        messages.extend(self.controller.messages());
        self.controller.set_messages(messages)
    }

    fn visible_id(&mut self, index: usize) -> anyhow::Result<Option<MessageId>> {
        let id = self
            .controller
            .read(|store| nth_visible(store, index).map(|m| m.id));
        if id.is_none() {
            writeln!(self.out, "error: no message {index}")?;
        }
        Ok(id)
    }

    fn reload_target(&self, index: Option<usize>) -> Option<MessageId> {
        self.controller.read(|store| match index {
            Some(index) => nth_visible(store, index)
                .filter(|m| m.is_assistant())
                .map(|m| m.id),
            None => store
                .visible()
                .filter(|m| m.is_assistant())
                .last()
                .map(|m| m.id),
        })
    }

    fn print_history(&mut self) -> anyhow::Result<()> {
        if let Some(prompt) = self.controller.system_prompt() {
            writeln!(self.out, "[system] {prompt}")?;
        }
        for (n, message) in self.controller.visible_messages().iter().enumerate() {
            writeln!(
                self.out,
                "{:>3} {:<9} {}",
                n + 1,
                message.role().as_str(),
                message.content
            )?;
        }
        Ok(())
    }

    /// Print the reply as it grows until the request ends.
    ///
    /// `/stop` or Ctrl-C interrupt the reply; other input is refused.
    pub async fn stream_reply(
        &mut self,
        handle: RequestHandle,
        lines: &mut mpsc::UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let assistant_id = handle.assistant_id();
        let wait = handle.wait();
        tokio::pin!(wait);

        let mut ticker = tokio::time::interval(STREAM_REFRESH);
        let mut printed = String::new();
        let mut input_open = true;

        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break outcome,
                _ = ticker.tick() => self.print_progress(assistant_id, &mut printed)?,
                line = lines.recv(), if input_open => match line.as_deref().map(Command::parse) {
                    Some(Ok(Some(Command::Stop))) => {
                        self.controller.stop();
                    }
                    Some(Ok(Some(Command::Quit))) => {
                        self.controller.stop();
                        self.should_quit = true;
                    }
                    Some(Ok(None)) => {}
                    Some(_) => writeln!(self.out, "\n(reply in progress, /stop to interrupt)")?,
                    None => input_open = false,
                },
                _ = tokio::signal::ctrl_c() => {
                    self.controller.stop();
                }
            }
        };

        self.print_progress(assistant_id, &mut printed)?;
        writeln!(self.out)?;
        match outcome {
            RequestOutcome::Completed => {}
            RequestOutcome::Aborted => writeln!(self.out, "[stopped]")?,
            RequestOutcome::Errored(e) => writeln!(self.out, "error: {e}")?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn print_progress(&mut self, id: MessageId, printed: &mut String) -> anyhow::Result<()> {
        let Some(content) = self
            .controller
            .read(|store| store.get(id).map(|m| m.content.clone()))
        else {
            return Ok(());
        };

        if let Some(rest) = content.strip_prefix(printed.as_str()) {
            write!(self.out, "{rest}")?;
        } else {
            write!(self.out, "\n{content}")?;
        }
        self.out.flush()?;
        *printed = content;
        Ok(())
    }
}

/// Message at a 1-based position in the visible conversation.
fn nth_visible(store: &MessageStore, number: usize) -> Option<&Message> {
    number.checked_sub(1).and_then(|i| store.visible().nth(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use parley_client::{
        ChunkStream, CompletionRequest, CompletionResponse, Transport, TransportError,
    };
    use std::sync::Arc;

    struct CannedTransport {
        reply: &'static str,
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn open_stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<ChunkStream, TransportError> {
            let record = serde_json::json!({ "choices": [{ "delta": { "content": self.reply } }] });
            let chunks = vec![
                Ok(format!("data: {record}\n\n").into_bytes()),
                Ok(b"data: [DONE]\n\n".to_vec()),
            ];
            Ok(futures::stream::iter(chunks).boxed())
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, TransportError> {
            Err(TransportError::Http("unused".into()))
        }
    }

    fn app(messages: Vec<Message>) -> App<Vec<u8>> {
        let controller = ConversationController::builder(Arc::new(CannedTransport {
            reply: "Hello there",
        }))
        .with_initial_messages(messages)
        .build()
        .unwrap();
        App::new(controller, Vec::new())
    }

    fn output(app: &mut App<Vec<u8>>) -> String {
        String::from_utf8(std::mem::take(&mut app.out)).unwrap()
    }

    #[tokio::test]
    async fn say_streams_reply() {
        let mut app = app(vec![Message::system("sys")]);
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("Hi", &mut lines).await.unwrap();

        assert!(output(&mut app).contains("Hello there"));
        let messages = app.controller.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "Hello there");
    }

    #[tokio::test]
    async fn history_numbers_visible_messages() {
        let mut app = app(vec![
            Message::system("sys"),
            Message::user("q"),
            Message::assistant("a"),
        ]);
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("/history", &mut lines).await.unwrap();
        let out = output(&mut app);

        assert!(out.contains("[system] sys"));
        assert!(out.contains("  1 user      q"));
        assert!(out.contains("  2 assistant a"));
    }

    #[tokio::test]
    async fn edit_and_delete_by_number() {
        let mut app = app(vec![
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
        ]);
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("/edit 3 q2 edited", &mut lines).await.unwrap();
        assert_eq!(app.controller.messages()[2].content, "q2 edited");

        app.handle_line("/delete 1", &mut lines).await.unwrap();
        let contents: Vec<String> = app
            .controller
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["q2 edited"]);

        app.handle_line("/delete 9", &mut lines).await.unwrap();
        assert!(output(&mut app).contains("error: no message 9"));
    }

    #[tokio::test]
    async fn reload_last_reply() {
        let mut app = app(vec![
            Message::user("q1"),
            Message::assistant("old"),
            Message::user("q2"),
        ]);
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("/reload", &mut lines).await.unwrap();

        let contents: Vec<String> = app
            .controller
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["q1", "Hello there", "q2"]);

        app.handle_line("/reload 1", &mut lines).await.unwrap();
        assert!(output(&mut app).contains("error: no reply to reload"));
    }

    #[tokio::test]
    async fn system_prompt_is_created_or_replaced() {
        let mut app = app(vec![Message::user("q")]);
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("/system be terse", &mut lines).await.unwrap();
        assert_eq!(app.controller.system_prompt().as_deref(), Some("be terse"));
        assert_eq!(app.controller.messages().len(), 2);

        app.handle_line("/system be kind", &mut lines).await.unwrap();
        assert_eq!(app.controller.system_prompt().as_deref(), Some("be kind"));
        assert_eq!(app.controller.messages().len(), 2);
    }

    #[tokio::test]
    async fn quit_and_parse_errors() {
        let mut app = app(Vec::new());
        let (_tx, mut lines) = mpsc::unbounded_channel();

        app.handle_line("/bogus", &mut lines).await.unwrap();
        assert!(output(&mut app).contains("unknown command"));
        assert!(!app.should_quit());

        app.handle_line("/quit", &mut lines).await.unwrap();
        assert!(app.should_quit());
    }
}
