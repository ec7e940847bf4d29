//! Server protocol: the wire envelope and inbound dispatch.

mod dispatch;
mod message;

pub use dispatch::{Action, Dispatcher};
pub use message::{Message, MessageType, PROTOCOL_VERSION};
