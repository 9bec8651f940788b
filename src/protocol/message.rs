//! Message schemas and JSON text framing.
//!
//! Every frame is one JSON text message discriminated by `msg`. Frames whose
//! `msg` is unknown (or absent, like the server's opening banner) are dropped
//! without error; malformed JSON and malformed known frames are reported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::ejson;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames the client emits.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect {
        version: String,
        support: Vec<String>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
    Unsub {
        id: String,
    },
    Method {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
}

impl ClientMessage {
    /// Marshal to the wire, running outgoing `params` through the EJSON
    /// normalization walk first.
    pub fn encode(&self) -> Result<String, FrameError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(params) = value.get_mut("params") {
            ejson::normalize_value(params);
        }
        Ok(value.to_string())
    }
}

/// Frames the client understands.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    Pong {
        #[serde(default)]
        id: Option<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default)]
        before: Option<String>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default)]
        cleared: Vec<String>,
    },
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default)]
        error: Option<Value>,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Updated {
        methods: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        offending_message: Option<Value>,
    },
}

const KNOWN_MESSAGES: &[&str] = &[
    "connected",
    "ping",
    "pong",
    "added",
    "addedBefore",
    "changed",
    "movedBefore",
    "removed",
    "ready",
    "nosub",
    "result",
    "updated",
    "error",
];

impl ServerMessage {
    /// Decode one text frame. `Ok(None)` means the frame was dropped: no
    /// `msg` discriminator, or a discriminator this client does not speak.
    pub fn decode(text: &str) -> Result<Option<ServerMessage>, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(msg) = value.get("msg").and_then(Value::as_str) else {
            return Ok(None);
        };
        if !KNOWN_MESSAGES.contains(&msg) {
            tracing::debug!(msg, "dropping unknown message");
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}
