use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Operation is incompatible with the chat's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or out-of-order protocol events.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend ended the response with an `error` event.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Serial job aborted: {0}")]
    JobAborted(String),
}

impl ChatError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ChatError::Protocol(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ChatError::InvalidState(message.into())
    }

    pub fn transport(err: anyhow::Error) -> Self {
        ChatError::Transport(format!("{err:#}"))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    /// Stable code for log records.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidState(_) => "INVALID_STATE",
            ChatError::Protocol(_) => "PROTOCOL_ERROR",
            ChatError::Cancelled => "CANCELLED",
            ChatError::Transport(_) => "TRANSPORT_ERROR",
            ChatError::Stream(_) => "STREAM_ERROR",
            ChatError::JobAborted(_) => "JOB_ABORTED",
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
