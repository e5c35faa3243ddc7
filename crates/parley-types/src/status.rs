use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl ChatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatStatus::Ready => "ready",
            ChatStatus::Submitted => "submitted",
            ChatStatus::Streaming => "streaming",
            ChatStatus::Error => "error",
        }
    }

    /// True while a response is outstanding.
    pub fn is_busy(self) -> bool {
        matches!(self, ChatStatus::Submitted | ChatStatus::Streaming)
    }
}
