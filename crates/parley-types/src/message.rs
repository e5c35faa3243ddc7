use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One chat message. Parts are ordered and the order is preserved by every
/// mutation; messages are replaced wholesale rather than edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<MessagePart>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), role, parts)
    }

    pub fn with_id(id: impl Into<String>, role: MessageRole, parts: Vec<MessagePart>) -> Self {
        Self {
            id: id.into(),
            role,
            metadata: None,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![MessagePart::text(text)])
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    /// Concatenated content of every text part.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(MessagePart::as_tool_invocation)
    }

    pub fn tool_invocation(&self, tool_call_id: &str) -> Option<&ToolInvocation> {
        self.tool_invocations()
            .find(|invocation| invocation.tool_call_id == tool_call_id)
    }

    /// Number of step boundaries, i.e. model steps started in this message.
    pub fn step_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, MessagePart::StepBoundary))
            .count()
    }

    /// Applies a tool outcome to the invocation with `tool_call_id`.
    /// Returns false when the message has no such invocation.
    pub fn apply_tool_outcome(&mut self, tool_call_id: &str, outcome: &ToolOutcome) -> bool {
        let Some(invocation) = self.parts.iter_mut().find_map(|part| match part {
            MessagePart::ToolInvocation(invocation) if invocation.tool_call_id == tool_call_id => {
                Some(invocation)
            }
            _ => None,
        }) else {
            return false;
        };
        invocation.complete(outcome.clone());
        true
    }
}

/// Input accepted by `submit_message`; the id is assigned when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInput {
    #[serde(default)]
    pub id: Option<String>,
    pub role: MessageRole,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessageInput {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: MessageRole::User,
            metadata: None,
            parts: vec![MessagePart::text(text)],
        }
    }

    pub fn into_message(self, fallback_id: impl FnOnce() -> String) -> Message {
        Message {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(fallback_id),
            role: self.role,
            metadata: self.metadata,
            parts: self.parts,
        }
    }
}

/// One part of a message. Serialized with a `type` tag; data parts carry
/// their namespace in the tag itself (`data-weather`).
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    ToolInvocation(ToolInvocation),
    Data(DataPart),
    Source(SourcePart),
    File(FilePart),
    StepBoundary,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaggedPartRef<'a> {
    Text(&'a TextPart),
    Reasoning(&'a ReasoningPart),
    ToolInvocation(&'a ToolInvocation),
    Source(&'a SourcePart),
    File(&'a FilePart),
    StepBoundary,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaggedPart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    ToolInvocation(ToolInvocation),
    Source(SourcePart),
    File(FilePart),
    StepBoundary,
}

#[derive(Serialize)]
struct DataPartRef<'a> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    data: &'a Value,
}

#[derive(Deserialize)]
struct DataPartBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Serialize for MessagePart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tagged = match self {
            Self::Data(part) => {
                let data = DataPartRef {
                    kind: part.part_type(),
                    id: part.id.as_deref(),
                    data: &part.data,
                };
                return data.serialize(serializer);
            }
            Self::Text(part) => TaggedPartRef::Text(part),
            Self::Reasoning(part) => TaggedPartRef::Reasoning(part),
            Self::ToolInvocation(part) => TaggedPartRef::ToolInvocation(part),
            Self::Source(part) => TaggedPartRef::Source(part),
            Self::File(part) => TaggedPartRef::File(part),
            Self::StepBoundary => TaggedPartRef::StepBoundary,
        };
        tagged.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessagePart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let data_name = value
            .get("type")
            .and_then(Value::as_str)
            .and_then(|kind| kind.strip_prefix("data-"))
            .map(str::to_string);

        if let Some(name) = data_name {
            if name.is_empty() {
                return Err(de::Error::custom("data part type needs a name after `data-`"));
            }
            let body = DataPartBody::deserialize(value).map_err(de::Error::custom)?;
            return Ok(Self::Data(DataPart {
                name,
                id: body.id,
                data: body.data,
            }));
        }

        let part = TaggedPart::deserialize(value).map_err(de::Error::custom)?;
        Ok(match part {
            TaggedPart::Text(part) => Self::Text(part),
            TaggedPart::Reasoning(part) => Self::Reasoning(part),
            TaggedPart::ToolInvocation(part) => Self::ToolInvocation(part),
            TaggedPart::Source(part) => Self::Source(part),
            TaggedPart::File(part) => Self::File(part),
            TaggedPart::StepBoundary => Self::StepBoundary,
        })
    }
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextPart { text: text.into() })
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning(ReasoningPart {
            text: text.into(),
            provider_metadata: None,
        })
    }

    pub fn as_tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Self::ToolInvocation(invocation) => Some(invocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningPart {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolInvocationState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolInvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OutputAvailable | Self::OutputError)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Parsed arguments. `null` when the call was synthesized from an output
    /// whose input was never observed.
    #[serde(default)]
    pub args: Value,
    pub state: ToolInvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolInvocation {
    pub fn has_outcome(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn complete(&mut self, outcome: ToolOutcome) {
        match outcome {
            ToolOutcome::Output(value) => {
                self.state = ToolInvocationState::OutputAvailable;
                self.result = Some(value);
                self.error_text = None;
            }
            ToolOutcome::Error(text) => {
                self.state = ToolInvocationState::OutputError;
                self.result = None;
                self.error_text = Some(text);
            }
        }
    }
}

/// Result supplied for a tool call, either by the client or the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Output(Value),
    Error(String),
}

/// A tool call whose input is complete and awaits execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
}

/// Payload of a `data-<name>` part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPart {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Value,
}

impl DataPart {
    /// Namespaced part type, e.g. `data-weather`.
    pub fn part_type(&self) -> String {
        format!("data-{}", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourcePart {
    pub source_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}
