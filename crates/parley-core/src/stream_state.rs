//! Draft assistant message built up from protocol events.

use std::collections::HashMap;

use parley_types::{
    DataPart, FilePart, Message, MessagePart, MessageRole, ReasoningPart, SourcePart, TextPart,
    ToolCall, ToolInvocation, ToolInvocationState, ToolOutcome, UiStreamEvent,
};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};
use crate::partial_json::parse_partial_json;
use crate::schema::SchemaRegistry;

/// What applying one event did to the draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Visible content changed and should be published.
    pub changed: bool,
    /// A `finish` event was applied; the draft is frozen.
    pub finished: bool,
    /// Tool input became available and the call can be executed.
    pub tool_call: Option<ToolCall>,
    /// Data part to hand to the data callback (persisted or transient).
    pub data: Option<DataPart>,
}

impl Applied {
    fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    fn unchanged() -> Self {
        Self::default()
    }
}

/// Mutable draft of one streamed assistant message.
///
/// Every event is validated before the draft is touched, so a rejected event
/// leaves the draft exactly as it was.
#[derive(Debug, Clone)]
pub struct StreamingMessageState {
    message: Message,
    tool_parts: HashMap<String, usize>,
    tool_inputs: HashMap<String, String>,
    active_text: Option<usize>,
    active_reasoning: Option<usize>,
    step: usize,
    finished_steps: usize,
    finished: bool,
}

impl StreamingMessageState {
    /// Starts a draft. When `continue_from` is an assistant message the draft
    /// continues it (same id, existing parts kept); otherwise a new empty
    /// assistant message with `message_id` is started.
    pub fn new(message_id: impl Into<String>, continue_from: Option<&Message>) -> Self {
        let message = match continue_from {
            Some(last) if last.is_assistant() => last.clone(),
            _ => Message::with_id(message_id, MessageRole::Assistant, Vec::new()),
        };
        let tool_parts = message
            .parts
            .iter()
            .enumerate()
            .filter_map(|(index, part)| {
                part.as_tool_invocation()
                    .map(|invocation| (invocation.tool_call_id.clone(), index))
            })
            .collect();
        let step = message.step_count();
        Self {
            message,
            tool_parts,
            tool_inputs: HashMap::new(),
            active_text: None,
            active_reasoning: None,
            step,
            finished_steps: 0,
            finished: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Steps started in the draft, including those of a continued message.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn finished_steps(&self) -> usize {
        self.finished_steps
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn tool_part_index(&self, tool_call_id: &str) -> Option<usize> {
        self.tool_parts.get(tool_call_id).copied()
    }

    /// Patches a tool outcome supplied outside the stream into the draft.
    pub fn apply_tool_outcome(&mut self, tool_call_id: &str, outcome: &ToolOutcome) -> bool {
        let applied = self.message.apply_tool_outcome(tool_call_id, outcome);
        if applied {
            self.tool_inputs.remove(tool_call_id);
        }
        applied
    }

    pub fn apply(&mut self, event: UiStreamEvent, schemas: &SchemaRegistry) -> ChatResult<Applied> {
        if self.finished {
            return Err(ChatError::protocol(format!(
                "received {} after finish",
                event.kind()
            )));
        }

        match event {
            UiStreamEvent::Start {
                message_id,
                message_metadata,
            } => {
                let mut applied = Applied::unchanged();
                if let Some(metadata) = message_metadata {
                    self.merge_metadata(metadata, schemas)?;
                    applied.changed = true;
                }
                if let Some(id) = message_id.filter(|id| !id.is_empty()) {
                    if id != self.message.id {
                        self.message.id = id;
                        applied.changed = true;
                    }
                }
                Ok(applied)
            }
            UiStreamEvent::TextDelta { delta } => Ok(self.append_text(delta)),
            UiStreamEvent::ReasoningDelta {
                delta,
                provider_metadata,
            } => Ok(self.append_reasoning(delta, provider_metadata)),
            UiStreamEvent::ReasoningPartFinish => {
                self.active_reasoning = None;
                Ok(Applied::unchanged())
            }
            UiStreamEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                if self.tool_parts.contains_key(&tool_call_id) {
                    return Err(ChatError::protocol(format!(
                        "duplicate tool-input-start for toolCallId {tool_call_id}"
                    )));
                }
                self.tool_inputs.insert(tool_call_id.clone(), String::new());
                self.push_tool_invocation(ToolInvocation {
                    tool_call_id,
                    tool_name,
                    args: Value::Object(Default::default()),
                    state: ToolInvocationState::InputStreaming,
                    result: None,
                    error_text: None,
                });
                Ok(Applied::changed())
            }
            UiStreamEvent::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => self.append_tool_input(&tool_call_id, &input_text_delta),
            UiStreamEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => self.complete_tool_input(tool_call_id, tool_name, input),
            UiStreamEvent::ToolOutputAvailable {
                tool_call_id,
                tool_name,
                output,
            } => Ok(self.complete_tool_call(tool_call_id, tool_name, ToolOutcome::Output(output))),
            UiStreamEvent::ToolOutputError {
                tool_call_id,
                tool_name,
                error_text,
            } => Ok(self.complete_tool_call(
                tool_call_id,
                tool_name,
                ToolOutcome::Error(error_text),
            )),
            UiStreamEvent::Data {
                name,
                id,
                data,
                transient,
            } => {
                let data = schemas.validate_data(&name, data)?;
                let part = DataPart { name, id, data };
                if transient {
                    return Ok(Applied {
                        data: Some(part),
                        ..Applied::unchanged()
                    });
                }
                self.upsert_data(part.clone());
                Ok(Applied {
                    data: Some(part),
                    ..Applied::changed()
                })
            }
            UiStreamEvent::Source {
                source_id,
                url,
                title,
            } => {
                self.push_part(MessagePart::Source(SourcePart {
                    source_id,
                    url,
                    title,
                }));
                Ok(Applied::changed())
            }
            UiStreamEvent::File {
                media_type,
                url,
                filename,
            } => {
                self.push_part(MessagePart::File(FilePart {
                    media_type,
                    url,
                    filename,
                }));
                Ok(Applied::changed())
            }
            UiStreamEvent::StartStep => {
                self.step += 1;
                self.push_part(MessagePart::StepBoundary);
                Ok(Applied::changed())
            }
            UiStreamEvent::FinishStep => {
                self.finished_steps += 1;
                self.close_open_parts();
                Ok(Applied::unchanged())
            }
            UiStreamEvent::MessageMetadata { message_metadata } => {
                self.merge_metadata(message_metadata, schemas)?;
                Ok(Applied::changed())
            }
            UiStreamEvent::Finish { message_metadata } => {
                let mut applied = Applied::unchanged();
                if let Some(metadata) = message_metadata {
                    self.merge_metadata(metadata, schemas)?;
                    applied.changed = true;
                }
                self.close_open_parts();
                self.finished = true;
                applied.finished = true;
                Ok(applied)
            }
            UiStreamEvent::Error { error_text } => Err(ChatError::Stream(error_text)),
        }
    }

    fn append_text(&mut self, delta: String) -> Applied {
        self.active_reasoning = None;
        if delta.is_empty() {
            return Applied::unchanged();
        }
        match self.active_text.and_then(|index| self.message.parts.get_mut(index)) {
            Some(MessagePart::Text(part)) => part.text.push_str(&delta),
            _ => {
                self.message
                    .parts
                    .push(MessagePart::Text(TextPart { text: delta }));
                self.active_text = Some(self.message.parts.len() - 1);
            }
        }
        Applied::changed()
    }

    fn append_reasoning(&mut self, delta: String, provider_metadata: Option<Value>) -> Applied {
        self.active_text = None;
        if delta.is_empty() && provider_metadata.is_none() {
            return Applied::unchanged();
        }
        match self
            .active_reasoning
            .and_then(|index| self.message.parts.get_mut(index))
        {
            Some(MessagePart::Reasoning(part)) => {
                part.text.push_str(&delta);
                if provider_metadata.is_some() {
                    part.provider_metadata = provider_metadata;
                }
            }
            _ => {
                self.message
                    .parts
                    .push(MessagePart::Reasoning(ReasoningPart {
                        text: delta,
                        provider_metadata,
                    }));
                self.active_reasoning = Some(self.message.parts.len() - 1);
            }
        }
        Applied::changed()
    }

    fn append_tool_input(&mut self, tool_call_id: &str, delta: &str) -> ChatResult<Applied> {
        let index = self.tool_parts.get(tool_call_id).copied().ok_or_else(|| {
            ChatError::protocol(format!(
                "tool-input-delta for unknown toolCallId {tool_call_id}"
            ))
        })?;
        let streaming = matches!(
            self.invocation_mut(index).map(|invocation| invocation.state),
            Some(ToolInvocationState::InputStreaming)
        );
        if !streaming {
            return Err(ChatError::protocol(format!(
                "tool-input-delta for toolCallId {tool_call_id} after its input completed"
            )));
        }

        let buffer = self.tool_inputs.entry(tool_call_id.to_string()).or_default();
        buffer.push_str(delta);
        let partial = parse_partial_json(buffer);
        if let (Some(args), Some(invocation)) = (partial, self.invocation_mut(index)) {
            invocation.args = args;
        }
        Ok(Applied::changed())
    }

    fn complete_tool_input(
        &mut self,
        tool_call_id: String,
        tool_name: String,
        input: Option<Value>,
    ) -> ChatResult<Applied> {
        let buffered = self.tool_inputs.get(&tool_call_id);
        let args = match (input, buffered) {
            (Some(input), _) => input,
            (None, Some(buffer)) if !buffer.trim().is_empty() => serde_json::from_str(buffer)
                .map_err(|err| {
                    ChatError::protocol(format!(
                        "tool input for toolCallId {tool_call_id} is not valid JSON: {err}"
                    ))
                })?,
            (None, _) => Value::Object(Default::default()),
        };

        match self.tool_parts.get(&tool_call_id).copied() {
            Some(index) => {
                let invocation = self.invocation_mut(index).ok_or_else(|| {
                    ChatError::protocol(format!("toolCallId {tool_call_id} lost its part"))
                })?;
                if invocation.state.is_terminal() {
                    return Err(ChatError::protocol(format!(
                        "tool-input-available for toolCallId {tool_call_id} after its output"
                    )));
                }
                invocation.args = args.clone();
                invocation.state = ToolInvocationState::InputAvailable;
                if !tool_name.is_empty() {
                    invocation.tool_name = tool_name.clone();
                }
                let tool_name = invocation.tool_name.clone();
                self.tool_inputs.remove(&tool_call_id);
                Ok(Applied {
                    tool_call: Some(ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    }),
                    ..Applied::changed()
                })
            }
            None => {
                self.push_tool_invocation(ToolInvocation {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                    state: ToolInvocationState::InputAvailable,
                    result: None,
                    error_text: None,
                });
                Ok(Applied {
                    tool_call: Some(ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    }),
                    ..Applied::changed()
                })
            }
        }
    }

    fn complete_tool_call(
        &mut self,
        tool_call_id: String,
        tool_name: Option<String>,
        outcome: ToolOutcome,
    ) -> Applied {
        self.tool_inputs.remove(&tool_call_id);
        match self.tool_parts.get(&tool_call_id).copied() {
            Some(index) => {
                if let Some(invocation) = self.invocation_mut(index) {
                    invocation.complete(outcome);
                }
            }
            None => {
                let mut invocation = ToolInvocation {
                    tool_call_id,
                    tool_name: tool_name.unwrap_or_else(|| "unknown".to_string()),
                    args: Value::Null,
                    state: ToolInvocationState::InputAvailable,
                    result: None,
                    error_text: None,
                };
                invocation.complete(outcome);
                self.push_tool_invocation(invocation);
            }
        }
        Applied::changed()
    }

    fn upsert_data(&mut self, part: DataPart) {
        if part.id.is_some() {
            let existing = self.message.parts.iter_mut().find_map(|candidate| match candidate {
                MessagePart::Data(data) if data.name == part.name && data.id == part.id => {
                    Some(data)
                }
                _ => None,
            });
            if let Some(existing) = existing {
                existing.data = part.data;
                return;
            }
        }
        self.push_part(MessagePart::Data(part));
    }

    /// Top-level keys of `update` overwrite the current metadata; nested
    /// objects are replaced whole.
    fn merge_metadata(&mut self, update: Value, schemas: &SchemaRegistry) -> ChatResult<()> {
        if update.is_null() {
            return Ok(());
        }
        let merged = match (self.message.metadata.clone(), update) {
            (Some(Value::Object(mut current)), Value::Object(update)) => {
                current.extend(update);
                Value::Object(current)
            }
            (_, update) => update,
        };
        let validated = schemas.validate_metadata(merged)?;
        self.message.metadata = Some(validated);
        Ok(())
    }

    fn push_tool_invocation(&mut self, invocation: ToolInvocation) {
        let tool_call_id = invocation.tool_call_id.clone();
        self.push_part(MessagePart::ToolInvocation(invocation));
        self.tool_parts
            .insert(tool_call_id, self.message.parts.len() - 1);
    }

    fn push_part(&mut self, part: MessagePart) {
        self.close_open_parts();
        self.message.parts.push(part);
    }

    fn close_open_parts(&mut self) {
        self.active_text = None;
        self.active_reasoning = None;
    }

    fn invocation_mut(&mut self, index: usize) -> Option<&mut ToolInvocation> {
        match self.message.parts.get_mut(index) {
            Some(MessagePart::ToolInvocation(invocation)) => Some(invocation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply_all(state: &mut StreamingMessageState, events: Vec<UiStreamEvent>) {
        let schemas = SchemaRegistry::new();
        for event in events {
            state.apply(event, &schemas).expect("apply event");
        }
    }

    fn fresh() -> StreamingMessageState {
        StreamingMessageState::new("draft-1", None)
    }

    #[test]
    fn text_deltas_concatenate_into_one_part() {
        let mut state = fresh();
        let chunks = ["He", "l", "", "lo", " world"];
        apply_all(
            &mut state,
            chunks.iter().map(|chunk| UiStreamEvent::text(*chunk)).collect(),
        );

        assert_eq!(state.message().parts, vec![MessagePart::text("Hello world")]);
        assert_eq!(state.message().text(), chunks.concat());
        assert_eq!(state.message().role, MessageRole::Assistant);
        assert_eq!(state.message().id, "draft-1");
    }

    #[test]
    fn start_event_sets_message_id_and_metadata() {
        let mut state = fresh();
        let schemas = SchemaRegistry::new();
        let applied = state
            .apply(
                UiStreamEvent::Start {
                    message_id: Some("msg-9".to_string()),
                    message_metadata: Some(json!({"model": "m1"})),
                },
                &schemas,
            )
            .expect("start");
        assert!(applied.changed);
        state
            .apply(
                UiStreamEvent::Finish {
                    message_metadata: Some(json!({"usage": {"tokens": 3}})),
                },
                &schemas,
            )
            .expect("finish");

        assert_eq!(state.message().id, "msg-9");
        assert_eq!(
            state.message().metadata,
            Some(json!({"model": "m1", "usage": {"tokens": 3}}))
        );
        assert!(state.is_finished());
    }

    #[test]
    fn reasoning_and_text_alternate_into_separate_parts() {
        let mut state = fresh();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::ReasoningDelta {
                    delta: "think".to_string(),
                    provider_metadata: None,
                },
                UiStreamEvent::ReasoningDelta {
                    delta: "ing".to_string(),
                    provider_metadata: None,
                },
                UiStreamEvent::text("answer"),
                UiStreamEvent::ReasoningDelta {
                    delta: "more".to_string(),
                    provider_metadata: None,
                },
                UiStreamEvent::ReasoningPartFinish,
                UiStreamEvent::ReasoningDelta {
                    delta: "again".to_string(),
                    provider_metadata: None,
                },
            ],
        );

        assert_eq!(
            state.message().parts,
            vec![
                MessagePart::reasoning("thinking"),
                MessagePart::text("answer"),
                MessagePart::reasoning("more"),
                MessagePart::reasoning("again"),
            ]
        );
    }

    #[test]
    fn start_step_closes_open_text_and_counts_steps() {
        let mut state = fresh();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::StartStep,
                UiStreamEvent::text("one"),
                UiStreamEvent::FinishStep,
                UiStreamEvent::StartStep,
                UiStreamEvent::text("two"),
                UiStreamEvent::FinishStep,
            ],
        );

        assert_eq!(
            state.message().parts,
            vec![
                MessagePart::StepBoundary,
                MessagePart::text("one"),
                MessagePart::StepBoundary,
                MessagePart::text("two"),
            ]
        );
        assert_eq!(state.step(), 2);
        assert_eq!(state.finished_steps(), 2);
    }

    #[test]
    fn tool_input_streams_partial_args_then_becomes_available() {
        let mut state = fresh();
        let schemas = SchemaRegistry::new();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::ToolInputStart {
                    tool_call_id: "c1".to_string(),
                    tool_name: "weather".to_string(),
                },
                UiStreamEvent::ToolInputDelta {
                    tool_call_id: "c1".to_string(),
                    input_text_delta: r#"{"city": "Os"#.to_string(),
                },
            ],
        );
        let partial = state.message().tool_invocation("c1").expect("invocation");
        assert_eq!(partial.state, ToolInvocationState::InputStreaming);
        assert_eq!(partial.args, json!({"city": "Os"}));

        state
            .apply(
                UiStreamEvent::ToolInputDelta {
                    tool_call_id: "c1".to_string(),
                    input_text_delta: r#"lo"}"#.to_string(),
                },
                &schemas,
            )
            .expect("delta");
        let applied = state
            .apply(
                UiStreamEvent::ToolInputAvailable {
                    tool_call_id: "c1".to_string(),
                    tool_name: "weather".to_string(),
                    input: None,
                },
                &schemas,
            )
            .expect("available");

        assert_eq!(
            applied.tool_call,
            Some(ToolCall {
                tool_call_id: "c1".to_string(),
                tool_name: "weather".to_string(),
                args: json!({"city": "Oslo"}),
            })
        );
        let invocation = state.message().tool_invocation("c1").expect("invocation");
        assert_eq!(invocation.state, ToolInvocationState::InputAvailable);
        assert_eq!(state.tool_part_index("c1"), Some(0));
    }

    #[test]
    fn delta_for_unknown_tool_call_is_rejected_without_mutation() {
        let mut state = fresh();
        apply_all(&mut state, vec![UiStreamEvent::text("partial")]);
        let before = state.message().clone();

        let err = state
            .apply(
                UiStreamEvent::ToolInputDelta {
                    tool_call_id: "ghost".to_string(),
                    input_text_delta: "{".to_string(),
                },
                &SchemaRegistry::new(),
            )
            .expect_err("unknown id");

        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(state.message(), &before);
    }

    #[test]
    fn duplicate_tool_input_start_is_rejected() {
        let mut state = fresh();
        let start = UiStreamEvent::ToolInputStart {
            tool_call_id: "c1".to_string(),
            tool_name: "t".to_string(),
        };
        apply_all(&mut state, vec![start.clone()]);
        let err = state
            .apply(start, &SchemaRegistry::new())
            .expect_err("duplicate");
        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(state.message().parts.len(), 1);
    }

    #[test]
    fn output_during_streamed_input_drops_the_buffer() {
        let mut state = fresh();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::ToolInputStart {
                    tool_call_id: "c1".to_string(),
                    tool_name: "search".to_string(),
                },
                UiStreamEvent::ToolInputDelta {
                    tool_call_id: "c1".to_string(),
                    input_text_delta: r#"{"q": "ru"#.to_string(),
                },
                UiStreamEvent::ToolOutputAvailable {
                    tool_call_id: "c1".to_string(),
                    tool_name: None,
                    output: json!(["rust"]),
                },
            ],
        );

        assert!(state.tool_inputs.is_empty());
        let call = state.message().tool_invocation("c1").expect("c1");
        assert_eq!(call.state, ToolInvocationState::OutputAvailable);
        assert_eq!(call.args, json!({"q": "ru"}));
        let late = state.apply(
            UiStreamEvent::ToolInputDelta {
                tool_call_id: "c1".to_string(),
                input_text_delta: "st\"}".to_string(),
            },
            &SchemaRegistry::new(),
        );
        assert!(late.is_err());
    }

    #[test]
    fn metadata_updates_replace_top_level_keys() {
        let mut state = fresh();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::MessageMetadata {
                    message_metadata: json!({"usage": {"input": 5, "output": 1}, "model": "m1"}),
                },
                UiStreamEvent::MessageMetadata {
                    message_metadata: json!({"usage": {"output": 9}, "model": null}),
                },
                UiStreamEvent::MessageMetadata {
                    message_metadata: Value::Null,
                },
            ],
        );

        assert_eq!(
            state.message().metadata,
            Some(json!({"usage": {"output": 9}, "model": null}))
        );
    }

    #[test]
    fn output_without_start_synthesizes_terminal_invocation() {
        let mut state = fresh();
        apply_all(
            &mut state,
            vec![
                UiStreamEvent::ToolOutputAvailable {
                    tool_call_id: "resumed".to_string(),
                    tool_name: Some("search".to_string()),
                    output: json!({"hits": 2}),
                },
                UiStreamEvent::ToolOutputError {
                    tool_call_id: "orphan".to_string(),
                    tool_name: None,
                    error_text: "timeout".to_string(),
                },
            ],
        );

        let resumed = state.message().tool_invocation("resumed").expect("resumed");
        assert_eq!(resumed.state, ToolInvocationState::OutputAvailable);
        assert_eq!(resumed.tool_name, "search");
        assert_eq!(resumed.args, Value::Null);
        assert_eq!(resumed.result, Some(json!({"hits": 2})));

        let orphan = state.message().tool_invocation("orphan").expect("orphan");
        assert_eq!(orphan.state, ToolInvocationState::OutputError);
        assert_eq!(orphan.tool_name, "unknown");
        assert_eq!(orphan.error_text.as_deref(), Some("timeout"));
    }

    #[test]
    fn data_parts_validate_and_reconcile_by_id() {
        let schemas = SchemaRegistry::new().with_data_schema("progress", |value: Value| {
            if value.get("pct").is_some() {
                Ok(value)
            } else {
                Err("missing pct".to_string())
            }
        });
        let mut state = fresh();
        let data = |pct: u64, transient: bool| UiStreamEvent::Data {
            name: "progress".to_string(),
            id: Some("job".to_string()),
            data: json!({ "pct": pct }),
            transient,
        };

        state.apply(data(10, false), &schemas).expect("first");
        let applied = state.apply(data(90, false), &schemas).expect("update");
        assert!(applied.changed);
        let transient = state.apply(data(50, true), &schemas).expect("transient");
        assert!(!transient.changed);
        assert_eq!(transient.data.map(|part| part.data), Some(json!({"pct": 50})));

        assert_eq!(
            state.message().parts,
            vec![MessagePart::Data(DataPart {
                name: "progress".to_string(),
                id: Some("job".to_string()),
                data: json!({"pct": 90}),
            })]
        );

        let err = state
            .apply(
                UiStreamEvent::Data {
                    name: "progress".to_string(),
                    id: None,
                    data: json!({}),
                    transient: false,
                },
                &schemas,
            )
            .expect_err("schema failure");
        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(state.message().parts.len(), 1);
    }

    #[test]
    fn error_event_fails_and_keeps_merged_content() {
        let mut state = fresh();
        apply_all(&mut state, vec![UiStreamEvent::text("Par")]);
        let err = state
            .apply(
                UiStreamEvent::Error {
                    error_text: "backend overloaded".to_string(),
                },
                &SchemaRegistry::new(),
            )
            .expect_err("error event");
        assert_eq!(err, ChatError::Stream("backend overloaded".to_string()));
        assert_eq!(state.message().text(), "Par");
    }

    #[test]
    fn events_after_finish_are_rejected() {
        let mut state = fresh();
        apply_all(&mut state, vec![UiStreamEvent::text("done"), UiStreamEvent::finish()]);
        let err = state
            .apply(UiStreamEvent::text("late"), &SchemaRegistry::new())
            .expect_err("after finish");
        assert!(matches!(err, ChatError::Protocol(_)));
        assert_eq!(state.message().text(), "done");
    }

    #[test]
    fn continuing_an_assistant_message_keeps_its_parts_and_tool_index() {
        let previous = Message::with_id(
            "asst-1",
            MessageRole::Assistant,
            vec![
                MessagePart::StepBoundary,
                MessagePart::ToolInvocation(ToolInvocation {
                    tool_call_id: "c1".to_string(),
                    tool_name: "weather".to_string(),
                    args: json!({}),
                    state: ToolInvocationState::OutputAvailable,
                    result: Some(json!("sunny")),
                    error_text: None,
                }),
            ],
        );
        let mut state = StreamingMessageState::new("ignored", Some(&previous));
        assert_eq!(state.message().id, "asst-1");
        assert_eq!(state.step(), 1);
        assert_eq!(state.tool_part_index("c1"), Some(1));

        apply_all(
            &mut state,
            vec![UiStreamEvent::StartStep, UiStreamEvent::text("It is sunny.")],
        );
        assert_eq!(state.message().parts.len(), 4);
        assert_eq!(state.step(), 2);

        let user = Message::user_text("hi");
        let fresh = StreamingMessageState::new("new-id", Some(&user));
        assert_eq!(fresh.message().id, "new-id");
        assert!(fresh.message().parts.is_empty());
    }
}
