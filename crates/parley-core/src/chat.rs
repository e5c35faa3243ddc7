//! Request orchestration for one chat.

use std::fmt;
use std::sync::Arc;

use parley_observability::{emit_event, ObservabilityEvent, ProcessKind};
use parley_transport::{ChatTransport, RequestType, TransportRequest};
use parley_types::{ChatStatus, Message, MessageInput, ToolOutcome};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::callbacks::ChatCallbacks;
use crate::chat_state::{ActiveResponse, ChatState};
use crate::config::{ChatConfig, RequestOptions};
use crate::error::{ChatError, ChatResult};
use crate::job_executor::SerialJobExecutor;
use crate::merge::{MergeEnd, MessageMerger, PublishFn};
use crate::resubmit::{
    assistant_step_count, is_assistant_message_with_completed_tool_calls, should_resubmit,
    ResubmitCheck,
};
use crate::schema::SchemaRegistry;
use crate::stream_state::StreamingMessageState;

pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Finished,
    Cancelled,
    Failed,
}

/// Drives requests for one chat against a transport, writing every change
/// into the chat's `ChatState`.
///
/// Request failures are not returned from the operations; they are reported
/// through the chat's status and error and the `on_error` callback. Only
/// operations that are invalid for the current state return an error.
#[derive(Clone)]
pub struct ChatClient {
    state: Arc<dyn ChatState>,
    transport: Arc<dyn ChatTransport>,
    jobs: SerialJobExecutor,
    config: Arc<ChatConfig>,
    schemas: SchemaRegistry,
    callbacks: ChatCallbacks,
    generate_id: IdGenerator,
    process: ProcessKind,
}

/// A request that owns the chat: the history it is sent with and the
/// response registered for it.
struct Claim {
    messages: Vec<Message>,
    active: ActiveResponse,
}

impl ChatClient {
    pub fn new(state: Arc<dyn ChatState>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            state,
            transport,
            jobs: SerialJobExecutor::new(),
            config: Arc::new(ChatConfig::default()),
            schemas: SchemaRegistry::new(),
            callbacks: ChatCallbacks::new(),
            generate_id: Arc::new(|| Uuid::new_v4().to_string()),
            process: ProcessKind::Embedded,
        }
    }

    pub fn with_config(mut self, config: ChatConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_callbacks(mut self, callbacks: ChatCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_id_generator(
        mut self,
        generate: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.generate_id = Arc::new(generate);
        self
    }

    pub fn with_process_kind(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn status(&self) -> ChatStatus {
        self.state.status()
    }

    pub fn error(&self) -> Option<ChatError> {
        self.state.error()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.messages()
    }

    pub fn state(&self) -> &Arc<dyn ChatState> {
        &self.state
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Appends `input` and requests a response. An `input` whose id matches
    /// an existing message replaces it and drops every later message.
    pub async fn submit_message(
        &self,
        input: MessageInput,
        options: RequestOptions,
    ) -> ChatResult<()> {
        let message = input.into_message(|| (self.generate_id)());
        let state = Arc::clone(&self.state);
        let generate_id = Arc::clone(&self.generate_id);
        let claim = self
            .jobs
            .run(async move {
                ensure_idle(state.as_ref(), "submit a message")?;
                let mut messages = state.messages();
                match messages.iter().position(|existing| existing.id == message.id) {
                    Some(index) => {
                        messages.truncate(index);
                        messages.push(message);
                        state.set_messages(messages);
                    }
                    None => state.push_message(message),
                }
                Ok::<_, ChatError>(claim(state.as_ref(), generate_id.as_ref()))
            })
            .await??;

        self.run_requests(RequestType::Generate, options, claim).await;
        Ok(())
    }

    /// Regenerates the response to the last user message, dropping a trailing
    /// assistant message first. No-op on an empty chat.
    pub async fn resubmit_last_user_message(&self, options: RequestOptions) -> ChatResult<()> {
        let state = Arc::clone(&self.state);
        let generate_id = Arc::clone(&self.generate_id);
        let claimed = self
            .jobs
            .run(async move {
                ensure_idle(state.as_ref(), "resubmit")?;
                let Some(last) = state.last_message() else {
                    return Ok(None);
                };
                if last.is_assistant() {
                    state.pop_message();
                }
                Ok::<_, ChatError>(Some(claim(state.as_ref(), generate_id.as_ref())))
            })
            .await??;

        if let Some(claim) = claimed {
            self.run_requests(RequestType::Generate, options, claim).await;
        }
        Ok(())
    }

    /// Re-attaches to a response the transport can still deliver, without
    /// touching the message list first.
    pub async fn resume_stream(&self, options: RequestOptions) -> ChatResult<()> {
        let state = Arc::clone(&self.state);
        let generate_id = Arc::clone(&self.generate_id);
        let claim = self
            .jobs
            .run(async move { reserve(state.as_ref(), generate_id.as_ref(), "resume the stream") })
            .await??;

        self.run_requests(RequestType::Resume, options, claim).await;
        Ok(())
    }

    pub async fn remove_assistant_response(&self) -> ChatResult<()> {
        let state = Arc::clone(&self.state);
        self.jobs
            .run(async move {
                match state.last_message() {
                    None => Err(ChatError::invalid_state("chat has no messages")),
                    Some(last) if !last.is_assistant() => Err(ChatError::invalid_state(
                        "last message is not an assistant response",
                    )),
                    Some(_) => {
                        state.pop_message();
                        Ok(())
                    }
                }
            })
            .await?
    }

    /// Records the outcome of a tool call. When the chat is idle and the last
    /// assistant message has no pending tool calls left, a new request starts.
    pub async fn add_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        outcome: ToolOutcome,
    ) -> ChatResult<()> {
        let tool_call_id = tool_call_id.into();
        let state = Arc::clone(&self.state);
        let generate_id = Arc::clone(&self.generate_id);
        let continuation = self
            .jobs
            .run(async move {
                apply_tool_result(state.as_ref(), generate_id.as_ref(), &tool_call_id, &outcome)
            })
            .await??;

        if let Some(claim) = continuation {
            self.emit(
                Level::INFO,
                "chat.request.auto_continue",
                claim.messages.last().map(|message| message.id.as_str()),
                RequestType::Generate,
                ChatStatus::Submitted,
                None,
            );
            self.run_requests(RequestType::Generate, RequestOptions::default(), claim)
                .await;
        }
        Ok(())
    }

    /// Stops the in-flight response. Idempotent; a no-op unless a response is
    /// submitted or streaming.
    pub fn stop_stream(&self) {
        if !self.state.status().is_busy() {
            return;
        }
        if let Some(active) = self.state.active_response() {
            active.abort();
        }
        self.state.set_active_response(None);
    }

    /// Returns an `error` chat to `ready`.
    pub fn clear_error(&self) {
        if self.state.status() == ChatStatus::Error {
            self.state.set_status(ChatStatus::Ready, None);
        }
    }

    pub async fn set_messages(&self, messages: Vec<Message>) -> ChatResult<()> {
        let state = Arc::clone(&self.state);
        self.jobs
            .run(async move { state.set_messages(messages) })
            .await
    }

    async fn run_requests(
        &self,
        request_type: RequestType,
        options: RequestOptions,
        mut claim: Claim,
    ) {
        loop {
            let original_message_count = claim.messages.len();
            let original_step_count = assistant_step_count(&claim.messages);

            if self.run_cycle(request_type, &options, claim).await != CycleOutcome::Finished {
                return;
            }

            let messages = self.state.messages();
            let resubmit = should_resubmit(ResubmitCheck {
                original_message_count,
                original_step_count,
                max_steps: self.config.max_steps,
                messages: &messages,
            });
            if !resubmit {
                return;
            }

            let state = Arc::clone(&self.state);
            let generate_id = Arc::clone(&self.generate_id);
            let reserved = self
                .jobs
                .run(async move {
                    reserve(state.as_ref(), generate_id.as_ref(), "continue the tool loop")
                })
                .await;
            claim = match reserved {
                Ok(Ok(claim)) => claim,
                _ => {
                    tracing::debug!(
                        chat_id = %self.id(),
                        "skipping auto-continue; chat became busy"
                    );
                    return;
                }
            };
            self.emit(
                Level::INFO,
                "chat.request.auto_continue",
                messages.last().map(|message| message.id.as_str()),
                request_type,
                ChatStatus::Submitted,
                None,
            );
        }
    }

    async fn run_cycle(
        &self,
        request_type: RequestType,
        options: &RequestOptions,
        claim: Claim,
    ) -> CycleOutcome {
        let Claim { messages, active } = claim;
        let draft_id = active.message_id();
        let cancel = active.cancel_token();
        self.emit(
            Level::INFO,
            "chat.request.start",
            Some(&draft_id),
            request_type,
            ChatStatus::Submitted,
            None,
        );

        let request = TransportRequest {
            chat_id: self.id().to_string(),
            messages,
            body: self.config.request_body(options),
            headers: self.config.request_headers(options),
            request_type,
            metadata: options.metadata.clone(),
        };
        let result = self.stream_response(&active, request).await;

        self.state.set_active_response(None);
        let final_message = active.draft().lock().message().clone();

        match result {
            Ok(end) => {
                self.callbacks.finish(&final_message);
                self.state.set_status(ChatStatus::Ready, None);
                tracing::debug!(
                    chat_id = %self.id(),
                    finished = end == MergeEnd::Finished,
                    "response settled"
                );
                self.emit(
                    Level::INFO,
                    "chat.request.finish",
                    Some(&final_message.id),
                    request_type,
                    ChatStatus::Ready,
                    None,
                );
                CycleOutcome::Finished
            }
            Err(err) if err.is_cancellation() || cancel.is_cancelled() => {
                self.state.set_status(ChatStatus::Ready, None);
                self.emit(
                    Level::INFO,
                    "chat.request.cancelled",
                    Some(&final_message.id),
                    request_type,
                    ChatStatus::Ready,
                    None,
                );
                CycleOutcome::Cancelled
            }
            Err(err) => {
                tracing::warn!(
                    chat_id = %self.id(),
                    code = err.code(),
                    "chat request failed: {err}"
                );
                self.callbacks.error(&err);
                self.state.set_status(ChatStatus::Error, Some(err.clone()));
                self.emit(
                    Level::WARN,
                    "chat.request.error",
                    Some(&final_message.id),
                    request_type,
                    ChatStatus::Error,
                    Some(&err),
                );
                CycleOutcome::Failed
            }
        }
    }

    async fn stream_response(
        &self,
        active: &ActiveResponse,
        request: TransportRequest,
    ) -> ChatResult<MergeEnd> {
        let request_type = request.request_type;
        let cancel = active.cancel_token();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            opened = self.transport.send(request, cancel.clone()) => {
                opened.map_err(ChatError::transport)?
            }
        };

        let merger = MessageMerger::new(
            self.jobs.clone(),
            active.draft(),
            self.schemas.clone(),
            self.callbacks.clone(),
            self.publisher(request_type),
            cancel,
        );
        merger.run(stream).await
    }

    /// Writes the draft over the last message when the ids match, otherwise
    /// appends it. The first write moves `submitted` to `streaming`.
    fn publisher(&self, request_type: RequestType) -> PublishFn {
        let state = Arc::clone(&self.state);
        let process = self.process;
        Arc::new(move |draft: &Message| {
            if state.status() == ChatStatus::Submitted {
                state.set_status(ChatStatus::Streaming, None);
                emit_event(
                    Level::INFO,
                    process,
                    ObservabilityEvent {
                        event: "chat.request.first_chunk",
                        component: "chat",
                        chat_id: Some(state.id()),
                        message_id: Some(&draft.id),
                        request_type: Some(request_type.as_str()),
                        status: Some(ChatStatus::Streaming.as_str()),
                        ..ObservabilityEvent::default()
                    },
                );
            }
            let count = state.message_count();
            match state.last_message() {
                Some(last) if last.id == draft.id => {
                    state.replace_message(count - 1, draft.clone())
                }
                _ => state.push_message(draft.clone()),
            }
        })
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        message_id: Option<&str>,
        request_type: RequestType,
        status: ChatStatus,
        error: Option<&ChatError>,
    ) {
        let detail = error.map(ToString::to_string);
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: "chat",
                chat_id: Some(self.id()),
                message_id,
                request_type: Some(request_type.as_str()),
                status: Some(status.as_str()),
                error_code: error.map(ChatError::code),
                detail: detail.as_deref(),
            },
        );
    }
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("config", &self.config)
            .field("schemas", &self.schemas)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

fn ensure_idle(state: &dyn ChatState, action: &str) -> ChatResult<()> {
    let status = state.status();
    if status.is_busy() {
        return Err(ChatError::invalid_state(format!(
            "cannot {action} while a response is {}",
            status.as_str()
        )));
    }
    Ok(())
}

/// Moves the chat to `submitted` and registers the response for the current
/// history. Must run inside a serial job so nothing edits the history between
/// the snapshot and the registration.
fn claim(state: &dyn ChatState, next_id: &(dyn Fn() -> String + Send + Sync)) -> Claim {
    state.set_status(ChatStatus::Submitted, None);
    let messages = state.messages();
    let continue_from = messages.last().filter(|message| message.is_assistant());
    let draft = StreamingMessageState::new(next_id(), continue_from);
    let active = ActiveResponse::new(draft, CancellationToken::new());
    state.set_active_response(Some(active.clone()));
    Claim { messages, active }
}

fn reserve(
    state: &dyn ChatState,
    next_id: &(dyn Fn() -> String + Send + Sync),
    action: &str,
) -> ChatResult<Claim> {
    ensure_idle(state, action)?;
    Ok(claim(state, next_id))
}

/// Patches the outcome into the message list and the active draft. Returns
/// the claim for a follow-up request when one should start.
fn apply_tool_result(
    state: &dyn ChatState,
    next_id: &(dyn Fn() -> String + Send + Sync),
    tool_call_id: &str,
    outcome: &ToolOutcome,
) -> ChatResult<Option<Claim>> {
    let messages = state.messages();
    let mut patched = false;
    if let Some((index, message)) = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, message)| message.tool_invocation(tool_call_id).is_some())
    {
        let mut message = message.clone();
        message.apply_tool_outcome(tool_call_id, outcome);
        state.replace_message(index, message);
        patched = true;
    }
    if let Some(active) = state.active_response() {
        let draft = active.draft();
        patched |= draft.lock().apply_tool_outcome(tool_call_id, outcome);
    }
    if !patched {
        return Err(ChatError::invalid_state(format!(
            "no tool invocation with toolCallId {tool_call_id}"
        )));
    }

    // Mid-stream results are picked up by the resubmission check once the
    // stream settles.
    if state.status().is_busy() {
        return Ok(None);
    }
    let ready = state
        .last_message()
        .is_some_and(|message| is_assistant_message_with_completed_tool_calls(&message));
    Ok(ready.then(|| claim(state, next_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_state::InMemoryChatState;
    use async_trait::async_trait;
    use parley_transport::{ScriptedResponse, ScriptedTransport, UiEventStream};
    use parley_types::{
        MessagePart, MessageRole, ToolInvocation, ToolInvocationState, UiStreamEvent,
    };
    use serde_json::json;
    use std::time::Duration;

    fn next_draft_id() -> String {
        "draft-1".to_string()
    }

    fn assistant_with_call(state: ToolInvocationState) -> Message {
        Message::with_id(
            "a1",
            MessageRole::Assistant,
            vec![
                MessagePart::StepBoundary,
                MessagePart::ToolInvocation(ToolInvocation {
                    tool_call_id: "c1".to_string(),
                    tool_name: "weather".to_string(),
                    args: json!({"city": "Oslo"}),
                    state,
                    result: None,
                    error_text: None,
                }),
            ],
        )
    }

    #[test]
    fn tool_result_claims_idle_chat_once_all_calls_complete() {
        let state = InMemoryChatState::with_messages(
            "chat",
            vec![
                Message::user_text("weather?"),
                assistant_with_call(ToolInvocationState::InputAvailable),
            ],
        );
        let claim = apply_tool_result(
            &state,
            &next_draft_id,
            "c1",
            &ToolOutcome::Output(json!("sunny")),
        )
        .expect("tool result")
        .expect("continuation");
        assert_eq!(state.status(), ChatStatus::Submitted);
        let last = state.last_message().expect("last");
        assert_eq!(
            last.tool_invocation("c1").map(|call| call.state),
            Some(ToolInvocationState::OutputAvailable)
        );

        // The claim carries the patched history and a draft that continues it.
        assert_eq!(claim.messages.len(), 2);
        let draft = claim.active.draft();
        assert_eq!(
            draft.lock().message().tool_invocation("c1").map(|call| call.state),
            Some(ToolInvocationState::OutputAvailable)
        );
        assert_eq!(claim.active.message_id(), "a1");
        assert!(state.active_response().is_some());
    }

    #[test]
    fn tool_result_while_busy_only_patches() {
        let state = InMemoryChatState::with_messages(
            "chat",
            vec![assistant_with_call(ToolInvocationState::InputAvailable)],
        );
        state.set_status(ChatStatus::Streaming, None);
        let continuation = apply_tool_result(
            &state,
            &next_draft_id,
            "c1",
            &ToolOutcome::Error("denied".to_string()),
        )
        .expect("tool result");
        assert!(continuation.is_none());
        assert_eq!(state.status(), ChatStatus::Streaming);
    }

    #[test]
    fn tool_result_for_unknown_call_is_invalid_state() {
        let state = InMemoryChatState::new("chat");
        let err = apply_tool_result(&state, &next_draft_id, "ghost", &ToolOutcome::Output(json!(1)))
            .map(|_| ())
            .expect_err("unknown call");
        assert!(matches!(err, ChatError::InvalidState(_)));
    }

    #[tokio::test]
    async fn busy_chat_rejects_new_submissions() {
        let state = Arc::new(InMemoryChatState::new("chat"));
        state.set_status(ChatStatus::Streaming, None);
        let transport = Arc::new(ScriptedTransport::new([ScriptedResponse::from(vec![
            UiStreamEvent::finish(),
        ])]));
        let client = ChatClient::new(state.clone(), transport.clone());

        let err = client
            .submit_message(MessageInput::user_text("hi"), RequestOptions::default())
            .await
            .expect_err("busy");
        assert!(matches!(err, ChatError::InvalidState(_)));
        assert!(client.resume_stream(RequestOptions::default()).await.is_err());
        assert_eq!(transport.request_count(), 0);
        assert!(state.messages().is_empty());
    }

    #[tokio::test]
    async fn clear_error_only_leaves_error_status() {
        let state = Arc::new(InMemoryChatState::new("chat"));
        let client = ChatClient::new(state.clone(), Arc::new(ScriptedTransport::default()));

        state.set_status(ChatStatus::Submitted, None);
        client.clear_error();
        assert_eq!(client.status(), ChatStatus::Submitted);

        state.set_status(ChatStatus::Error, Some(ChatError::Stream("x".to_string())));
        client.clear_error();
        assert_eq!(client.status(), ChatStatus::Ready);
        assert_eq!(client.error(), None);
    }

    struct StallingTransport;

    #[async_trait]
    impl ChatTransport for StallingTransport {
        async fn send(
            &self,
            _request: TransportRequest,
            cancel: CancellationToken,
        ) -> anyhow::Result<UiEventStream> {
            cancel.cancelled().await;
            anyhow::bail!("connection aborted")
        }
    }

    #[tokio::test]
    async fn stop_right_after_the_claim_cancels_before_sending() {
        let state = Arc::new(InMemoryChatState::with_messages(
            "chat",
            vec![Message::user_text("hi")],
        ));
        let transport = Arc::new(ScriptedTransport::new([ScriptedResponse::from(vec![
            UiStreamEvent::text("never shown"),
            UiStreamEvent::finish(),
        ])]));
        let client = ChatClient::new(state.clone(), transport.clone());

        let claim = reserve(state.as_ref(), &next_draft_id, "submit").expect("idle chat");
        client.stop_stream();
        let outcome = client
            .run_cycle(RequestType::Generate, &RequestOptions::default(), claim)
            .await;

        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(client.status(), ChatStatus::Ready);
        assert_eq!(client.messages().len(), 1);
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn reserve_registers_a_response_for_the_current_history() {
        let state = InMemoryChatState::with_messages("chat", vec![Message::user_text("hi")]);
        let claim = reserve(&state, &next_draft_id, "submit").expect("idle chat");

        assert_eq!(state.status(), ChatStatus::Submitted);
        assert_eq!(claim.messages.len(), 1);
        assert_eq!(claim.active.message_id(), "draft-1");
        assert_eq!(
            state.active_response().map(|active| active.message_id()),
            Some("draft-1".to_string())
        );
        assert!(reserve(&state, &next_draft_id, "submit").is_err());
    }

    #[tokio::test]
    async fn stop_while_the_stream_is_opening_is_a_clean_stop() {
        let state = Arc::new(InMemoryChatState::new("chat"));
        let client = ChatClient::new(state.clone(), Arc::new(StallingTransport));
        let runner = client.clone();
        let handle = tokio::spawn(async move {
            runner
                .submit_message(MessageInput::user_text("hi"), RequestOptions::default())
                .await
        });

        for _ in 0..500 {
            if state.active_response().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(client.status(), ChatStatus::Submitted);
        client.stop_stream();
        handle.await.expect("join").expect("submit");

        assert_eq!(client.status(), ChatStatus::Ready);
        assert_eq!(client.error(), None);
        assert_eq!(client.messages().len(), 1);
    }
}
