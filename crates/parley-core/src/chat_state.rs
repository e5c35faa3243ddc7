use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use parley_types::{ChatStatus, Message};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::stream_state::StreamingMessageState;

pub type SharedDraft = Arc<Mutex<StreamingMessageState>>;

/// The in-flight response of a chat: its draft and the token that stops it.
#[derive(Clone)]
pub struct ActiveResponse {
    draft: SharedDraft,
    cancel: CancellationToken,
}

impl ActiveResponse {
    pub fn new(draft: StreamingMessageState, cancel: CancellationToken) -> Self {
        Self {
            draft: Arc::new(Mutex::new(draft)),
            cancel,
        }
    }

    pub fn draft(&self) -> SharedDraft {
        Arc::clone(&self.draft)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn message_id(&self) -> String {
        self.draft.lock().message().id.clone()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for ActiveResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveResponse")
            .field("message_id", &self.message_id())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Host-owned store of a chat's messages, status and active response.
///
/// The orchestrator is the only writer and serializes its writes, so
/// implementations only need to make each call atomic.
pub trait ChatState: Send + Sync {
    fn id(&self) -> &str;
    fn status(&self) -> ChatStatus;
    fn error(&self) -> Option<ChatError>;
    fn messages(&self) -> Vec<Message>;
    fn active_response(&self) -> Option<ActiveResponse>;

    /// Sets the status and replaces the stored error (`None` clears it).
    fn set_status(&self, status: ChatStatus, error: Option<ChatError>);
    fn set_active_response(&self, response: Option<ActiveResponse>);
    fn set_messages(&self, messages: Vec<Message>);
    fn push_message(&self, message: Message);
    fn pop_message(&self) -> Option<Message>;
    fn replace_message(&self, index: usize, message: Message);

    fn message_count(&self) -> usize {
        self.messages().len()
    }

    fn last_message(&self) -> Option<Message> {
        self.messages().pop()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStateEvent {
    MessagesChanged { count: usize },
    StatusChanged { status: ChatStatus },
    ActiveResponseChanged { active: bool },
}

#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    status: ChatStatus,
    error: Option<ChatError>,
    active: Option<ActiveResponse>,
}

/// `ChatState` kept in memory, broadcasting a `ChatStateEvent` per change.
pub struct InMemoryChatState {
    id: String,
    inner: RwLock<Inner>,
    tx: broadcast::Sender<ChatStateEvent>,
}

impl InMemoryChatState {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_messages(id, Vec::new())
    }

    pub fn with_messages(id: impl Into<String>, messages: Vec<Message>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            id: id.into(),
            inner: RwLock::new(Inner {
                messages,
                ..Inner::default()
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatStateEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ChatStateEvent) {
        let _ = self.tx.send(event);
    }

    fn messages_changed(&self, count: usize) {
        self.publish(ChatStateEvent::MessagesChanged { count });
    }
}

impl fmt::Debug for InMemoryChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("InMemoryChatState")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("messages", &inner.messages.len())
            .field("active", &inner.active.is_some())
            .finish()
    }
}

impl ChatState for InMemoryChatState {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ChatStatus {
        self.inner.read().status
    }

    fn error(&self) -> Option<ChatError> {
        self.inner.read().error.clone()
    }

    fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    fn active_response(&self) -> Option<ActiveResponse> {
        self.inner.read().active.clone()
    }

    fn set_status(&self, status: ChatStatus, error: Option<ChatError>) {
        {
            let mut inner = self.inner.write();
            inner.status = status;
            inner.error = error;
        }
        self.publish(ChatStateEvent::StatusChanged { status });
    }

    fn set_active_response(&self, response: Option<ActiveResponse>) {
        let active = response.is_some();
        self.inner.write().active = response;
        self.publish(ChatStateEvent::ActiveResponseChanged { active });
    }

    fn set_messages(&self, messages: Vec<Message>) {
        let count = messages.len();
        self.inner.write().messages = messages;
        self.messages_changed(count);
    }

    fn push_message(&self, message: Message) {
        let count = {
            let mut inner = self.inner.write();
            inner.messages.push(message);
            inner.messages.len()
        };
        self.messages_changed(count);
    }

    fn pop_message(&self) -> Option<Message> {
        let (popped, count) = {
            let mut inner = self.inner.write();
            let popped = inner.messages.pop();
            (popped, inner.messages.len())
        };
        if popped.is_some() {
            self.messages_changed(count);
        }
        popped
    }

    fn replace_message(&self, index: usize, message: Message) {
        let count = {
            let mut inner = self.inner.write();
            let Some(slot) = inner.messages.get_mut(index) else {
                tracing::warn!(chat_id = %self.id, index, "replace_message index out of range");
                return;
            };
            *slot = message;
            inner.messages.len()
        };
        self.messages_changed(count);
    }

    fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    fn last_message(&self) -> Option<Message> {
        self.inner.read().messages.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::MessagePart;

    #[tokio::test]
    async fn mutations_broadcast_change_events() {
        let state = InMemoryChatState::new("chat-1");
        let mut rx = state.subscribe();

        state.push_message(Message::user_text("hi"));
        state.set_status(ChatStatus::Submitted, None);
        state.set_active_response(Some(ActiveResponse::new(
            StreamingMessageState::new("a1", None),
            CancellationToken::new(),
        )));

        assert_eq!(
            rx.recv().await.expect("event"),
            ChatStateEvent::MessagesChanged { count: 1 }
        );
        assert_eq!(
            rx.recv().await.expect("event"),
            ChatStateEvent::StatusChanged {
                status: ChatStatus::Submitted
            }
        );
        assert_eq!(
            rx.recv().await.expect("event"),
            ChatStateEvent::ActiveResponseChanged { active: true }
        );
        assert_eq!(
            state.active_response().map(|active| active.message_id()),
            Some("a1".to_string())
        );
    }

    #[test]
    fn replace_and_pop_edit_the_list_in_place() {
        let state = InMemoryChatState::with_messages(
            "chat-1",
            vec![Message::user_text("a"), Message::user_text("b")],
        );
        let mut replacement = Message::user_text("B");
        replacement.parts.push(MessagePart::text("!"));
        state.replace_message(1, replacement.clone());
        state.replace_message(7, Message::user_text("ignored"));

        assert_eq!(state.last_message(), Some(replacement.clone()));
        assert_eq!(state.pop_message(), Some(replacement));
        assert_eq!(state.message_count(), 1);
    }

    #[test]
    fn status_error_is_replaced_on_every_status_change() {
        let state = InMemoryChatState::new("chat-1");
        state.set_status(
            ChatStatus::Error,
            Some(ChatError::Transport("down".to_string())),
        );
        assert_eq!(
            state.error(),
            Some(ChatError::Transport("down".to_string()))
        );
        state.set_status(ChatStatus::Ready, None);
        assert_eq!(state.error(), None);
        assert_eq!(state.id(), "chat-1");
    }

    #[test]
    fn aborting_an_active_response_cancels_its_token() {
        let token = CancellationToken::new();
        let active = ActiveResponse::new(StreamingMessageState::new("a1", None), token.clone());
        assert!(!active.is_aborted());
        active.abort();
        assert!(token.is_cancelled());
    }
}
