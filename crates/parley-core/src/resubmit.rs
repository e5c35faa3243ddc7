//! Decides whether a finished response should be followed by another request
//! without new user input.

use parley_types::{Message, MessagePart, ToolInvocation};

/// Snapshot taken before a request cycle plus the list it produced.
#[derive(Debug, Clone, Copy)]
pub struct ResubmitCheck<'a> {
    pub original_message_count: usize,
    pub original_step_count: usize,
    pub max_steps: usize,
    pub messages: &'a [Message],
}

/// Step count of the last message when it is an assistant message.
pub fn assistant_step_count(messages: &[Message]) -> usize {
    messages
        .last()
        .filter(|message| message.is_assistant())
        .map(Message::step_count)
        .unwrap_or(0)
}

pub fn should_resubmit(check: ResubmitCheck<'_>) -> bool {
    if check.max_steps <= 1 {
        return false;
    }
    let Some(last) = check.messages.last() else {
        return false;
    };
    if !is_assistant_message_with_completed_tool_calls(last) {
        return false;
    }

    let step_count = last.step_count();
    let made_progress = check.messages.len() > check.original_message_count
        || step_count > check.original_step_count;

    made_progress && step_count < check.max_steps
}

/// True when `message` is an assistant message whose latest step called at
/// least one tool and every such call has an output or an error.
pub fn is_assistant_message_with_completed_tool_calls(message: &Message) -> bool {
    if !message.is_assistant() {
        return false;
    }
    let mut invocations = last_step_invocations(message).peekable();
    if invocations.peek().is_none() {
        return false;
    }
    invocations.all(ToolInvocation::has_outcome)
}

fn last_step_invocations(message: &Message) -> impl Iterator<Item = &ToolInvocation> {
    let step_start = message
        .parts
        .iter()
        .rposition(|part| matches!(part, MessagePart::StepBoundary))
        .map(|index| index + 1)
        .unwrap_or(0);
    message.parts[step_start..]
        .iter()
        .filter_map(MessagePart::as_tool_invocation)
}
