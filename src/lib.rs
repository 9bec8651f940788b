#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod offline;
mod paths;
pub mod protocol;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use error::ClientError;
pub type Result<T> = std::result::Result<T, ClientError>;

// Re-export the types a host needs for day-to-day use at the crate root.
pub use crate::client::{
    AuthSession, AuthState, Client, ClientEvent, GroupReadyCallback, LogonCallback,
    MethodCallback, ReadyCallback, UserLocator,
};
pub use crate::config::{BackoffPolicy, ClientConfig};
pub use crate::core::document::Document;
pub use crate::core::ejson::{EjsonBinary, EjsonDate};
pub use crate::protocol::ProtocolVersion;
pub use crate::session::Phase;
pub use crate::store::codec::{Codec, CodecError, JsonCodec, TypedDocument};
pub use crate::store::dispatch::{ChangeEvent, WatchCallback, WatchPredicate, WatcherId};
pub use crate::store::{ChangeReason, StoredEntry};
