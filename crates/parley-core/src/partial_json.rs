//! Best-effort parsing of a JSON document that is still being streamed.
//!
//! The prefix is cut back to the last point where a value was complete and the
//! open containers are closed. An unterminated string value is closed in
//! place so partially streamed text stays visible.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
enum Frame {
    Object { awaiting_value: bool },
    Array,
}

impl Frame {
    fn closer(self) -> char {
        match self {
            Frame::Object { .. } => '}',
            Frame::Array => ']',
        }
    }
}

pub fn parse_partial_json(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    repair_candidates(trimmed)
        .into_iter()
        .find_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
}

fn repair_candidates(input: &str) -> Vec<String> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut string_is_value = false;
    let mut escaped = false;
    let mut safe_len = 0usize;
    let mut safe_stack: Vec<Frame> = Vec::new();

    let value_position = |stack: &[Frame]| match stack.last() {
        Some(Frame::Object { awaiting_value }) => *awaiting_value,
        _ => true,
    };

    for (idx, ch) in input.char_indices() {
        let end = idx + ch.len_utf8();
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                if string_is_value {
                    safe_len = end;
                    safe_stack = stack.clone();
                }
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                string_is_value = value_position(&stack);
            }
            '{' => {
                stack.push(Frame::Object {
                    awaiting_value: false,
                });
                safe_len = end;
                safe_stack = stack.clone();
            }
            '[' => {
                stack.push(Frame::Array);
                safe_len = end;
                safe_stack = stack.clone();
            }
            '}' | ']' => {
                stack.pop();
                safe_len = end;
                safe_stack = stack.clone();
            }
            ':' => {
                if let Some(Frame::Object { awaiting_value }) = stack.last_mut() {
                    *awaiting_value = true;
                }
            }
            ',' => {
                if let Some(Frame::Object { awaiting_value }) = stack.last_mut() {
                    *awaiting_value = false;
                }
            }
            c if c.is_ascii_digit() && value_position(&stack) => {
                safe_len = end;
                safe_stack = stack.clone();
            }
            'e' | 'l' if value_position(&stack) => {
                let prefix = &input[..end];
                if prefix.ends_with("true") || prefix.ends_with("false") || prefix.ends_with("null")
                {
                    safe_len = end;
                    safe_stack = stack.clone();
                }
            }
            _ => {}
        }
    }

    let mut candidates = Vec::with_capacity(2);
    if in_string && string_is_value {
        let mut open = input.to_string();
        if escaped {
            open.pop();
        }
        open.push('"');
        open.extend(stack.iter().rev().map(|frame| frame.closer()));
        candidates.push(open);
    }

    let mut cut = input[..safe_len].to_string();
    cut.extend(safe_stack.iter().rev().map(|frame| frame.closer()));
    candidates.push(cut);
    candidates
}
