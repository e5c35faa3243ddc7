use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One protocol event of an incrementally delivered assistant response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiStreamEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    TextDelta {
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningDelta {
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    ReasoningPartFinish,
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        output: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        error_text: String,
    },
    Data {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Value,
        #[serde(default)]
        transient: bool,
    },
    #[serde(rename_all = "camelCase")]
    Source {
        source_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    File {
        media_type: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    StartStep,
    FinishStep,
    #[serde(rename_all = "camelCase")]
    MessageMetadata {
        message_metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

impl UiStreamEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    pub fn finish() -> Self {
        Self::Finish {
            message_metadata: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text-delta",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningPartFinish => "reasoning-part-finish",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::Data { .. } => "data",
            Self::Source { .. } => "source",
            Self::File { .. } => "file",
            Self::StartStep => "start-step",
            Self::FinishStep => "finish-step",
            Self::MessageMetadata { .. } => "message-metadata",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_parse_from_wire_shape() {
        let raw = json!([
            {"type": "start", "messageId": "msg-1"},
            {"type": "text-delta", "delta": "Hel"},
            {"type": "tool-input-delta", "toolCallId": "c1", "inputTextDelta": "{\"a\""},
            {"type": "data", "name": "weather", "data": {"temp": 3}},
            {"type": "start-step"},
            {"type": "finish"}
        ]);
        let events: Vec<UiStreamEvent> = serde_json::from_value(raw).expect("parse events");
        assert_eq!(
            events[0],
            UiStreamEvent::Start {
                message_id: Some("msg-1".to_string()),
                message_metadata: None
            }
        );
        assert_eq!(events[1], UiStreamEvent::text("Hel"));
        assert_eq!(events[2].kind(), "tool-input-delta");
        assert!(matches!(
            &events[3],
            UiStreamEvent::Data { transient: false, id: None, .. }
        ));
        assert_eq!(events[4], UiStreamEvent::StartStep);
        assert_eq!(events[5], UiStreamEvent::finish());
    }
}
