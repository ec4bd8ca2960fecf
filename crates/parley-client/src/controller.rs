//! Conversation state machine.
//!
//! [`ConversationController`] owns the message history of one conversation and
//! at most one in-flight streaming request. User actions mutate the history
//! synchronously under a lock; the request runs in a spawned task that writes
//! the decoded content into a placeholder assistant message.
//!
//! Every write from the request task is checked against the current request
//! id, so notifications arriving after [`ConversationController::stop`] or
//! after a newer request are dropped.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::{Message, MessageId, RequestId};
use parley_store::MessageStore;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};

use crate::completion::{chat_completion, CompletionOptions};
use crate::config::ChatConfig;
use crate::decoder::{Decoded, StreamState};
use crate::error::{ChatError, Result, TransportError};
use crate::transport::Transport;
use crate::types::CompletionRequest;

/// Callback receiving the full history after a request completed.
pub type FinishCallback = Arc<dyn Fn(&[Message]) + Send + Sync>;

/// Callback receiving the error that ended a request.
pub type ErrorCallback = Arc<dyn Fn(&ChatError) + Send + Sync>;

// =============================================================================
// Request lifecycle
// =============================================================================

/// Phase of the most recent request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestPhase {
    /// No request was made yet.
    #[default]
    Idle,
    /// The request is sent, response headers not yet received.
    Sending,
    /// The response body is being received.
    Streaming,
    /// A terminal record was received.
    Completed,
    /// The request was stopped by the caller.
    Aborted,
    /// The request failed.
    Errored,
}

impl RequestPhase {
    /// Returns `true` while a request is in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

/// How a request ended.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// The stream ended with a terminal record.
    Completed,
    /// The request was stopped or superseded.
    Aborted,
    /// The request failed; partial content stays in the history.
    Errored(ChatError),
}

impl RequestOutcome {
    /// Returns `true` for a completed request.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Handle to a request started by a submit-style operation.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    assistant_id: MessageId,
    task: JoinHandle<RequestOutcome>,
}

impl RequestHandle {
    /// Generation of the request.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Id of the assistant message receiving the content.
    #[must_use]
    pub const fn assistant_id(&self) -> MessageId {
        self.assistant_id
    }

    /// Wait for the request to end.
    pub async fn wait(self) -> RequestOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RequestOutcome::Aborted,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct InFlight {
    id: RequestId,
    assistant_id: MessageId,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    store: MessageStore,
    input: String,
    loading: bool,
    phase: RequestPhase,
    generation: RequestId,
    in_flight: Option<InFlight>,
}

impl State {
    fn ensure_idle(&self) -> Result<()> {
        if self.loading || self.in_flight.is_some() {
            return Err(ChatError::RequestInFlight);
        }
        Ok(())
    }

    fn is_current(&self, id: RequestId) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    fn end_request(&mut self, phase: RequestPhase) -> Option<InFlight> {
        self.loading = false;
        self.phase = phase;
        self.in_flight.take()
    }
}

/// A request whose placeholder is in the history and whose body is frozen.
struct Prepared {
    id: RequestId,
    assistant_id: MessageId,
    request: CompletionRequest,
}

enum Progress {
    Stale,
    Streaming,
    Finished(Vec<Message>),
}

struct Shared {
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    config: ChatConfig,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
}

impl Shared {
    /// Append the placeholder, freeze the request body and mark the request
    /// in flight.
    fn prepare(&self, state: &mut State) -> Result<Prepared> {
        let assistant_id = state.store.append(Message::placeholder())?;

        let request = match CompletionRequest::streaming(
            self.config.completions_url(),
            &self.config.body,
            state.store.messages(),
        ) {
            Ok(request) => request,
            Err(e) => {
                if let Some(index) = state.store.find_index(assistant_id) {
                    state.store.splice_out(index);
                }
                return Err(e.into());
            }
        };

        state.input.clear();
        state.generation = state.generation.next();
        state.loading = true;
        state.phase = RequestPhase::Sending;
        state.in_flight = Some(InFlight {
            id: state.generation,
            assistant_id,
            abort: None,
        });

        tracing::debug!(
            request_id = %state.generation,
            message_id = %assistant_id,
            messages = state.store.len(),
            "Prepared completion request"
        );

        Ok(Prepared {
            id: state.generation,
            assistant_id,
            request,
        })
    }

    fn mark_streaming(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(id) {
            return false;
        }
        state.phase = RequestPhase::Streaming;
        true
    }

    /// Overwrite the placeholder with the trimmed content.
    fn apply(&self, prepared: &Prepared, content: &str, finished: bool) -> Progress {
        let mut state = self.state.lock();
        if !state.is_current(prepared.id) {
            return Progress::Stale;
        }

        let content = content.trim();
        match state.store.get(prepared.assistant_id) {
            Some(message) if message.content != content => {
                if let Err(e) = state.store.set_content(prepared.assistant_id, content) {
                    tracing::debug!(request_id = %prepared.id, error = %e, "Dropped content update");
                }
            }
            Some(_) => {}
            None => {
                tracing::debug!(
                    request_id = %prepared.id,
                    message_id = %prepared.assistant_id,
                    "Placeholder removed, dropping content update"
                );
            }
        }

        if finished {
            state.end_request(RequestPhase::Completed);
            Progress::Finished(state.store.messages().to_vec())
        } else {
            Progress::Streaming
        }
    }

    /// End the request as errored if it is still current.
    fn fail(
        &self,
        id: RequestId,
        error: ChatError,
        established: Option<oneshot::Sender<Result<()>>>,
    ) -> RequestOutcome {
        let current = {
            let mut state = self.state.lock();
            state.is_current(id) && state.end_request(RequestPhase::Errored).is_some()
        };
        if !current {
            return RequestOutcome::Aborted;
        }

        tracing::warn!(request_id = %id, error = %error, "Completion request failed");

        if let Some(on_error) = &self.on_error {
            on_error(&error);
        }
        if let Some(tx) = established {
            let _ = tx.send(Err(error.clone()));
        }

        RequestOutcome::Errored(error)
    }
}

async fn run_request(
    shared: Arc<Shared>,
    prepared: Prepared,
    established: oneshot::Sender<Result<()>>,
) -> RequestOutcome {
    let mut established = Some(established);

    let work = stream_into_placeholder(&shared, &prepared, &mut established);
    let result = match shared.config.timeout() {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(limit).into())),
        None => work.await,
    };

    match result {
        Ok(outcome) => {
            if let Some(tx) = established.take() {
                let _ = tx.send(Ok(()));
            }
            outcome
        }
        Err(error) => shared.fail(prepared.id, error, established.take()),
    }
}

async fn stream_into_placeholder(
    shared: &Shared,
    prepared: &Prepared,
    established: &mut Option<oneshot::Sender<Result<()>>>,
) -> Result<RequestOutcome> {
    let mut chunks = shared.transport.open_stream(prepared.request.clone()).await?;

    if !shared.mark_streaming(prepared.id) {
        return Ok(RequestOutcome::Aborted);
    }
    if let Some(tx) = established.take() {
        let _ = tx.send(Ok(()));
    }
    tracing::debug!(request_id = %prepared.id, "Receiving stream");

    let mut stream = StreamState::new(shared.config.tail_policy);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let decoded = match stream.push(&chunk) {
            Ok(decoded) => decoded,
            Err(e) => {
                if let Progress::Stale = shared.apply(prepared, e.partial_content(), false) {
                    return Ok(RequestOutcome::Aborted);
                }
                return Err(e.into());
            }
        };

        match shared.apply(prepared, &decoded.content, decoded.finished) {
            Progress::Stale => return Ok(RequestOutcome::Aborted),
            Progress::Streaming => {}
            Progress::Finished(snapshot) => {
                finished(shared, prepared, &snapshot, &decoded, stream.len());
                return Ok(RequestOutcome::Completed);
            }
        }
    }

    match stream.finish() {
        Ok(decoded) => match shared.apply(prepared, &decoded.content, true) {
            Progress::Finished(snapshot) => {
                finished(shared, prepared, &snapshot, &decoded, stream.len());
                Ok(RequestOutcome::Completed)
            }
            Progress::Stale | Progress::Streaming => Ok(RequestOutcome::Aborted),
        },
        Err(e) => {
            if let Progress::Stale = shared.apply(prepared, e.partial_content(), false) {
                return Ok(RequestOutcome::Aborted);
            }
            Err(e.into())
        }
    }
}

fn finished(
    shared: &Shared,
    prepared: &Prepared,
    snapshot: &[Message],
    decoded: &Decoded,
    bytes: usize,
) {
    tracing::debug!(
        request_id = %prepared.id,
        bytes,
        finish_reason = decoded.finish_reason.as_deref().unwrap_or("none"),
        total_tokens = decoded.usage.as_ref().map(|usage| usage.total_tokens),
        "Completion finished"
    );
    if let Some(on_finish) = &shared.on_finish {
        on_finish(snapshot);
    }
}

// =============================================================================
// ConversationController
// =============================================================================

/// Client-side state of one conversation.
///
/// Cheap to clone; clones share the same history and request.
#[derive(Clone)]
pub struct ConversationController {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConversationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConversationController")
            .field("messages", &state.store.len())
            .field("loading", &state.loading)
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl ConversationController {
    /// Create a controller with an empty history.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ChatConfig) -> Self {
        Self::from_parts(transport, config, MessageStore::new(), None, None)
    }

    /// Start building a controller.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> ControllerBuilder {
        ControllerBuilder::new(transport)
    }

    fn from_parts(
        transport: Arc<dyn Transport>,
        config: ChatConfig,
        store: MessageStore,
        on_finish: Option<FinishCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    store,
                    ..State::default()
                }),
                transport,
                config,
                on_finish,
                on_error,
            }),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.shared.config
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Append a user message and stream a reply.
    ///
    /// Resolves once the response headers arrived; the body keeps streaming in
    /// the background. Use [`RequestHandle::wait`] to wait for the end.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::RequestInFlight` while another request runs, and the
    /// transport error if the request could not be established. The user
    /// message and placeholder stay in the history in the latter case.
    pub async fn submit(&self, text: impl Into<String>) -> Result<RequestHandle> {
        let prepared = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            state.store.append(Message::user(text))?;
            self.shared.prepare(&mut state)?
        };
        self.launch(prepared).await
    }

    /// Submit the current input buffer as a user message.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn submit_input(&self) -> Result<RequestHandle> {
        let prepared = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            let text = std::mem::take(&mut state.input);
            state.store.append(Message::user(text))?;
            self.shared.prepare(&mut state)?
        };
        self.launch(prepared).await
    }

    /// Stream a reply to the history as it is, without adding a user message.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn resubmit(&self) -> Result<RequestHandle> {
        let prepared = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            self.shared.prepare(&mut state)?
        };
        self.launch(prepared).await
    }

    /// Append a complete message and stream a reply.
    ///
    /// # Errors
    ///
    /// Fails like [`submit`](Self::submit), and with an invalid operation for
    /// a system message appended to a non-empty history.
    pub async fn append(&self, message: Message) -> Result<RequestHandle> {
        let prepared = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            state.store.append(message)?;
            self.shared.prepare(&mut state)?
        };
        self.launch(prepared).await
    }

    /// Regenerate an assistant message.
    ///
    /// The request is built from the history before the message. The new
    /// reply takes the message's place and everything that followed it is
    /// kept after the reply, also when the request fails.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation for an unknown id or a message that is not
    /// an assistant reply, plus the errors of [`submit`](Self::submit).
    pub async fn reload(&self, id: MessageId) -> Result<RequestHandle> {
        let prepared = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            let before = state.store.len();
            let stash = state.store.split_for_reload(id)?;

            let prepared = match self.shared.prepare(&mut state) {
                Ok(prepared) => prepared,
                Err(e) => {
                    if let Err(restore) = state.store.extend(stash) {
                        tracing::warn!(
                            message_id = %id,
                            error = %restore,
                            "Failed to restore messages after reload"
                        );
                    }
                    return Err(e);
                }
            };

            let stashed = stash.len();
            if let Err(e) = state.store.extend(stash) {
                state.end_request(RequestPhase::Errored);
                return Err(e.into());
            }

            tracing::debug!(
                request_id = %prepared.id,
                message_id = %id,
                kept = stashed,
                before,
                "Reloading assistant message"
            );
            prepared
        };
        self.launch(prepared).await
    }

    async fn launch(&self, prepared: Prepared) -> Result<RequestHandle> {
        let id = prepared.id;
        let assistant_id = prepared.assistant_id;
        let (established_tx, established_rx) = oneshot::channel();

        let task = tokio::spawn(run_request(
            Arc::clone(&self.shared),
            prepared,
            established_tx,
        ));

        {
            let state = &mut *self.shared.state.lock();
            match state.in_flight.as_mut() {
                Some(in_flight) if in_flight.id == id => {
                    in_flight.abort = Some(task.abort_handle());
                }
                // Stopped before the task was registered.
                _ if state.generation == id && state.phase == RequestPhase::Aborted => {
                    task.abort();
                }
                _ => {}
            }
        }

        match established_rx.await {
            Ok(Err(error)) => Err(error),
            Ok(Ok(())) | Err(_) => Ok(RequestHandle {
                id,
                assistant_id,
                task,
            }),
        }
    }

    /// Abort the in-flight request.
    ///
    /// Content already written stays in the history. Returns `false` when no
    /// request was in flight.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        let Some(in_flight) = state.end_request(RequestPhase::Aborted) else {
            return false;
        };

        if let Some(abort) = in_flight.abort {
            abort.abort();
        }

        tracing::debug!(
            request_id = %in_flight.id,
            message_id = %in_flight.assistant_id,
            "Stopped completion request"
        );
        true
    }

    /// Run a one-shot, non-streaming completion over the given messages.
    ///
    /// Does not touch the conversation.
    ///
    /// # Errors
    ///
    /// See [`chat_completion`].
    pub async fn complete(&self, options: CompletionOptions) -> Result<String> {
        chat_completion(self.shared.transport.as_ref(), &self.shared.config, options).await
    }

    // =========================================================================
    // History edits
    // =========================================================================

    /// Delete a message together with its turn partner.
    ///
    /// Returns the removed messages in history order.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation for an unknown id or the system prompt.
    pub fn delete_message(&self, id: MessageId) -> Result<Vec<Message>> {
        Ok(self.shared.state.lock().store.delete_turn(id)?)
    }

    /// Replace the content of a message. No request is made.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation for an unknown id or the system prompt.
    pub fn edit_message(&self, id: MessageId, content: impl Into<String>) -> Result<()> {
        Ok(self.shared.state.lock().store.edit_content(id, content)?)
    }

    /// Replace the whole history.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation if a system message is not at index 0.
    pub fn set_messages(&self, messages: Vec<Message>) -> Result<()> {
        Ok(self.shared.state.lock().store.set_all(messages)?)
    }

    /// Content of the system prompt.
    #[must_use]
    pub fn system_prompt(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .store
            .system_prompt()
            .map(str::to_string)
    }

    /// Replace the content of the system prompt.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation if the history has no system prompt.
    pub fn set_system_prompt(&self, content: impl Into<String>) -> Result<()> {
        Ok(self.shared.state.lock().store.set_system_prompt(content)?)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Snapshot of the full history.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.shared.state.lock().store.messages().to_vec()
    }

    /// Snapshot of the history without the system prompt.
    #[must_use]
    pub fn visible_messages(&self) -> Vec<Message> {
        self.shared.state.lock().store.visible().cloned().collect()
    }

    /// Run `f` against the history without copying it.
    ///
    /// `f` runs under the controller lock and must not call back into the
    /// controller.
    pub fn read<R>(&self, f: impl FnOnce(&MessageStore) -> R) -> R {
        f(&self.shared.state.lock().store)
    }

    /// Whether a request is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.shared.state.lock().loading
    }

    /// Phase of the most recent request.
    #[must_use]
    pub fn phase(&self) -> RequestPhase {
        self.shared.state.lock().phase
    }

    /// Current input buffer.
    #[must_use]
    pub fn input(&self) -> String {
        self.shared.state.lock().input.clone()
    }

    /// Replace the input buffer.
    pub fn set_input(&self, input: impl Into<String>) {
        self.shared.state.lock().input = input.into();
    }

    /// History revision, bumped on every mutation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.shared.state.lock().store.revision()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ConversationController`].
pub struct ControllerBuilder {
    transport: Arc<dyn Transport>,
    config: ChatConfig,
    initial_messages: Vec<Message>,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
}

impl ControllerBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ChatConfig::default(),
            initial_messages: Vec::new(),
            on_finish: None,
            on_error: None,
        }
    }

    /// Use the given configuration.
    #[must_use]
    pub fn with_config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from the given history.
    #[must_use]
    pub fn with_initial_messages(mut self, messages: Vec<Message>) -> Self {
        self.initial_messages = messages;
        self
    }

    /// Call `f` with the full history whenever a request completes.
    #[must_use]
    pub fn with_on_finish(mut self, f: impl Fn(&[Message]) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    /// Call `f` with the error whenever a request fails.
    #[must_use]
    pub fn with_on_error(mut self, f: impl Fn(&ChatError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns an invalid operation if the initial history has a system
    /// message after index 0.
    pub fn build(self) -> Result<ConversationController> {
        let store = MessageStore::from_messages(self.initial_messages)?;
        Ok(ConversationController::from_parts(
            self.transport,
            self.config,
            store,
            self.on_finish,
            self.on_error,
        ))
    }
}
