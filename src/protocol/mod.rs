//! DDP wire protocol: message schemas and JSON framing.

pub mod message;
pub mod version;

pub use message::{ClientMessage, FrameError, ServerMessage};
pub use version::ProtocolVersion;
