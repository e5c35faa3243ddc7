pub mod callbacks;
pub mod chat;
pub mod chat_state;
pub mod config;
pub mod error;
pub mod job_executor;
pub mod merge;
pub mod partial_json;
pub mod resubmit;
pub mod schema;
pub mod stream_state;

pub use callbacks::*;
pub use chat::*;
pub use chat_state::*;
pub use config::{ChatConfig, RequestOptions};
pub use error::*;
pub use job_executor::*;
pub use merge::*;
pub use partial_json::parse_partial_json;
pub use resubmit::*;
pub use schema::*;
pub use stream_state::*;

pub use parley_transport::{
    ChatTransport, RequestType, ScriptStep, ScriptedResponse, ScriptedTransport, TransportRequest,
    UiEventStream,
};
pub use parley_types::*;
