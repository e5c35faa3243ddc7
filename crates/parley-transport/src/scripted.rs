use std::collections::VecDeque;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parley_types::UiStreamEvent;

use crate::{ChatTransport, TransportRequest, UiEventStream};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Event(UiStreamEvent),
    Delay(Duration),
    /// Holds the stream open until the request is cancelled.
    WaitForCancel,
    /// Fails the stream after the preceding steps were delivered.
    Fail(String),
}

/// One scripted reply. `rejected` responses fail in `send` before any event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptedResponse {
    steps: Vec<ScriptStep>,
    rejected: Option<String>,
}

impl ScriptedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            rejected: Some(message.into()),
        }
    }

    pub fn event(mut self, event: UiStreamEvent) -> Self {
        self.steps.push(ScriptStep::Event(event));
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = UiStreamEvent>) -> Self {
        self.steps
            .extend(events.into_iter().map(ScriptStep::Event));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    pub fn wait_for_cancel(mut self) -> Self {
        self.steps.push(ScriptStep::WaitForCancel);
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(message.into()));
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

impl From<Vec<UiStreamEvent>> for ScriptedResponse {
    fn from(events: Vec<UiStreamEvent>) -> Self {
        Self::new().events(events)
    }
}

/// Deterministic transport that replays queued responses in order and records
/// every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<UiEventStream> {
        let chat_id = request.chat_id.clone();
        self.requests.lock().push(request);
        let Some(response) = self.responses.lock().pop_front() else {
            anyhow::bail!("no scripted response left for chat `{chat_id}`");
        };
        if let Some(message) = response.rejected {
            anyhow::bail!("{message}");
        }
        tracing::debug!(
            chat_id = %chat_id,
            steps = response.steps.len(),
            "replaying scripted response"
        );
        Ok(Box::pin(replay(response.steps, cancel)))
    }
}

fn replay(
    steps: Vec<ScriptStep>,
    cancel: CancellationToken,
) -> impl Stream<Item = anyhow::Result<UiStreamEvent>> + Send {
    try_stream! {
        for step in steps {
            if cancel.is_cancelled() {
                break;
            }
            match step {
                ScriptStep::Event(event) => yield event,
                ScriptStep::Delay(duration) => {
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(duration) => false,
                        _ = cancel.cancelled() => true,
                    };
                    if cancelled {
                        break;
                    }
                }
                ScriptStep::WaitForCancel => {
                    cancel.cancelled().await;
                    break;
                }
                ScriptStep::Fail(message) => {
                    Err(anyhow::anyhow!(message))?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestType;
    use futures::StreamExt;
    use serde_json::Value;

    fn request(chat_id: &str) -> TransportRequest {
        TransportRequest {
            chat_id: chat_id.to_string(),
            messages: Vec::new(),
            body: Value::Null,
            headers: Default::default(),
            request_type: RequestType::Generate,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn replays_responses_in_order_and_records_requests() {
        let transport = ScriptedTransport::new([
            ScriptedResponse::new().events([UiStreamEvent::text("one"), UiStreamEvent::finish()]),
            ScriptedResponse::reject("backend down"),
        ]);

        let stream = transport
            .send(request("c1"), CancellationToken::new())
            .await
            .expect("first response");
        let events = stream.collect::<Vec<_>>().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().expect("event"), &UiStreamEvent::text("one"));

        let err = transport
            .send(request("c1"), CancellationToken::new())
            .await
            .err()
            .expect("rejected response");
        assert!(err.to_string().contains("backend down"));

        let exhausted = transport.send(request("c1"), CancellationToken::new()).await;
        assert!(exhausted.is_err());
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn wait_for_cancel_ends_stream_once_cancelled() {
        let transport = ScriptedTransport::new([ScriptedResponse::new()
            .event(UiStreamEvent::text("Par"))
            .wait_for_cancel()
            .event(UiStreamEvent::text("never"))]);
        let cancel = CancellationToken::new();
        let mut stream = transport
            .send(request("c2"), cancel.clone())
            .await
            .expect("stream");

        let first = stream.next().await.expect("first").expect("event");
        assert_eq!(first, UiStreamEvent::text("Par"));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn fail_step_surfaces_error_after_prior_events() {
        let transport = ScriptedTransport::new([ScriptedResponse::new()
            .event(UiStreamEvent::text("partial"))
            .fail("connection reset")]);
        let results = transport
            .send(request("c3"), CancellationToken::new())
            .await
            .expect("stream")
            .collect::<Vec<_>>()
            .await;
        assert!(results[0].is_ok());
        let err = results[1].as_ref().err().expect("error item");
        assert!(err.to_string().contains("connection reset"));
    }
}
