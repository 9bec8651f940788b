use thiserror::Error;

/// Errors surfaced to caller callbacks and blocking accessors.
///
/// Transport and decode failures are recovered internally (reconnect policy,
/// raw-document fallback) and never reach this type.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ClientError {
    /// The operation required a connected session and was not attempted.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while the method was in flight. Reported
    /// exactly once per outstanding method, before the disconnect
    /// notification is delivered.
    #[error("disconnected before callback completed")]
    DisconnectedBeforeCallbackComplete,

    /// Logon or signup was refused: an auth attempt was already in flight,
    /// the server rejected the credentials, or the OAuth credential-token
    /// handshake failed.
    #[error("logon rejected: {reason}")]
    LogonRejected { reason: String },

    /// The `result` frame carried a server error payload.
    #[error("server error {error_type}: {message}")]
    ServerMethod {
        error_type: String,
        code: Option<i64>,
        message: String,
    },

    /// A caller-supplied document failed local validation (not an object,
    /// or a non-string `_id`).
    #[error("invalid document: {reason}")]
    InvalidDocument { reason: String },

    /// An offline-cache read or delete failed.
    #[error("cache failure: {message}")]
    Cache { message: String },

    /// The worker thread is gone; the client handle is no longer usable.
    #[error("client worker has shut down")]
    WorkerGone,
}

impl ClientError {
    pub fn logon_rejected(reason: impl Into<String>) -> Self {
        ClientError::LogonRejected {
            reason: reason.into(),
        }
    }

    /// Numeric code supplied by the server, when present.
    pub fn server_code(&self) -> Option<i64> {
        match self {
            ClientError::ServerMethod { code, .. } => *code,
            _ => None,
        }
    }
}
