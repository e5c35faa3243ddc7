//! Transport contract between a chat orchestrator and a model backend.
//!
//! A transport turns a chat id, its message history and per-request headers
//! into a lazy sequence of [`UiStreamEvent`]s. HTTP framing, retries and auth
//! belong to concrete transports, not to this crate.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use parley_types::{Message, UiStreamEvent};

mod scripted;

pub use scripted::{ScriptStep, ScriptedResponse, ScriptedTransport};

pub type UiEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<UiStreamEvent>> + Send>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    /// A fresh generation over the current history.
    Generate,
    /// Re-attach to a response the backend is still able to deliver.
    Resume,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Generate => "generate",
            RequestType::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    pub chat_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub request_type: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens the event stream for one request. Failing here means no event was
    /// produced. Once `cancel` fires the stream must stop producing events.
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<UiEventStream>;
}
