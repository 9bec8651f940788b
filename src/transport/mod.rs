//! Transport seam: WebSocket lifecycle behind a trait.
//!
//! The worker owns exactly one transport per connection attempt. Transports
//! report activity through a shared event channel; every event carries the
//! connection generation that produced it so events from a torn-down
//! transport are discarded by the worker.

pub mod websocket;

use crossbeam::channel::Sender;
use thiserror::Error;

pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEventKind {
    /// Socket open and ready for frames.
    Opened,
    /// One inbound text frame.
    Message(String),
    /// Socket failure. Always followed by `Closed` for the same generation.
    Error(String),
    /// Socket gone, cleanly or not. Terminal for the generation.
    Closed,
}

pub trait Transport: Send {
    /// Queue a text frame for delivery.
    fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    /// Begin closing. `Closed` is still reported through the event channel.
    fn close(&mut self);
}

pub trait Connector: Send {
    /// Start opening a connection. Success or failure arrives on `events`
    /// (`Opened`, or `Error` then `Closed`) tagged with `generation`.
    fn connect(
        &self,
        url: &str,
        generation: u64,
        events: Sender<TransportEvent>,
    ) -> Box<dyn Transport>;
}
