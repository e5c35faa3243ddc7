//! Drives a transport stream into the active draft, one serial job per event.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use parley_transport::UiEventStream;
use parley_types::{Message, ToolOutcome, UiStreamEvent};
use tokio_util::sync::CancellationToken;

use crate::callbacks::ChatCallbacks;
use crate::chat_state::SharedDraft;
use crate::error::{ChatError, ChatResult};
use crate::job_executor::SerialJobExecutor;
use crate::schema::SchemaRegistry;
use crate::stream_state::{Applied, StreamingMessageState};

/// Copies the draft into the chat's message list.
pub type PublishFn = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEnd {
    /// A `finish` event was merged.
    Finished,
    /// The stream ended without `finish`.
    Exhausted,
}

pub struct MessageMerger {
    jobs: SerialJobExecutor,
    draft: SharedDraft,
    schemas: SchemaRegistry,
    callbacks: ChatCallbacks,
    publish: PublishFn,
    cancel: CancellationToken,
}

impl MessageMerger {
    pub fn new(
        jobs: SerialJobExecutor,
        draft: SharedDraft,
        schemas: SchemaRegistry,
        callbacks: ChatCallbacks,
        publish: PublishFn,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            draft,
            schemas,
            callbacks,
            publish,
            cancel,
        }
    }

    /// Consumes `stream` until `finish`, its end, an error or cancellation.
    /// Cancellation surfaces as `ChatError::Cancelled`.
    pub async fn run(&self, mut stream: UiEventStream) -> ChatResult<MergeEnd> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ChatError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = next else {
                return Ok(MergeEnd::Exhausted);
            };
            let event = match item {
                Ok(event) => event,
                Err(_) if self.cancel.is_cancelled() => return Err(ChatError::Cancelled),
                Err(err) => return Err(ChatError::transport(err)),
            };

            tracing::debug!(event = event.kind(), "merging stream event");
            let applied = self.apply(event).await?;

            if let Some(part) = applied.data.as_ref() {
                self.callbacks.data(part);
            }
            if let Some(call) = applied.tool_call {
                if let Some(handler) = self.callbacks.on_tool_call.clone() {
                    let tool_call_id = call.tool_call_id.clone();
                    let outcome = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(ChatError::Cancelled),
                        outcome = handler(call) => outcome,
                    };
                    if let Some(outcome) = outcome {
                        self.apply_tool_outcome(tool_call_id, outcome).await?;
                    }
                }
            }
            if applied.finished {
                return Ok(MergeEnd::Finished);
            }
        }
    }

    async fn apply(&self, event: UiStreamEvent) -> ChatResult<Applied> {
        let draft = Arc::clone(&self.draft);
        let schemas = self.schemas.clone();
        let publish = Arc::clone(&self.publish);
        self.jobs
            .run(async move { apply_and_publish(&draft, event, &schemas, publish.as_ref()) })
            .await?
    }

    async fn apply_tool_outcome(
        &self,
        tool_call_id: String,
        outcome: ToolOutcome,
    ) -> ChatResult<()> {
        let draft = Arc::clone(&self.draft);
        let publish = Arc::clone(&self.publish);
        let cancel = self.cancel.clone();
        self.jobs
            .run(async move {
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                let mut state = draft.lock();
                if state.apply_tool_outcome(&tool_call_id, &outcome) {
                    publish(state.message());
                }
                Ok(())
            })
            .await?
    }
}

fn apply_and_publish(
    draft: &Mutex<StreamingMessageState>,
    event: UiStreamEvent,
    schemas: &SchemaRegistry,
    publish: &(dyn Fn(&Message) + Send + Sync),
) -> ChatResult<Applied> {
    let mut state = draft.lock();
    let applied = state.apply(event, schemas)?;
    if applied.changed {
        publish(state.message());
    }
    Ok(applied)
}
