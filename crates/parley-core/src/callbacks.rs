use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parley_types::{DataPart, Message, ToolCall, ToolOutcome};

use crate::error::ChatError;

pub type FinishHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ChatError) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&DataPart) + Send + Sync>;
/// Executes a tool on the client. `None` leaves the call for `add_tool_result`.
pub type ToolCallHandler =
    Arc<dyn Fn(ToolCall) -> BoxFuture<'static, Option<ToolOutcome>> + Send + Sync>;

/// Optional hooks invoked by the orchestrator.
#[derive(Clone, Default)]
pub struct ChatCallbacks {
    pub on_finish: Option<FinishHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_data: Option<DataHandler>,
    pub on_tool_call: Option<ToolCallHandler>,
}

impl ChatCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_finish(mut self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&ChatError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn on_data(mut self, handler: impl Fn(&DataPart) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(handler));
        self
    }

    pub fn on_tool_call<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ToolOutcome>> + Send + 'static,
    {
        self.on_tool_call = Some(Arc::new(move |call: ToolCall| handler(call).boxed()));
        self
    }

    pub(crate) fn finish(&self, message: &Message) {
        if let Some(handler) = self.on_finish.as_ref() {
            handler(message);
        }
    }

    pub(crate) fn error(&self, err: &ChatError) {
        if let Some(handler) = self.on_error.as_ref() {
            handler(err);
        }
    }

    pub(crate) fn data(&self, part: &DataPart) {
        if let Some(handler) = self.on_data.as_ref() {
            handler(part);
        }
    }
}

impl fmt::Debug for ChatCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCallbacks")
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .finish()
    }
}
