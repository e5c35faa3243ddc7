mod message;
mod status;
mod stream;

pub use message::*;
pub use status::*;
pub use stream::*;
