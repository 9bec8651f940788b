//! Outstanding method-call bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::ClientError;

/// Success carries the whole `result` value; failure carries the mapped
/// server error or the disconnect error.
pub type MethodCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send>;

/// How a `result` frame for this call is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    /// Plain user call; the callback gets the result directly.
    User,
    /// `login` / `createUser`; the auth layer consumes the result first.
    Login,
}

pub struct MethodCall {
    pub kind: MethodKind,
    pub callback: Option<MethodCallback>,
}

/// Every registered id reaches exactly one terminal state per session:
/// completed by `result`, or failed when the connection drops.
#[derive(Default)]
pub struct MethodManager {
    outstanding: BTreeMap<String, MethodCall>,
    awaiting_updated: BTreeSet<String>,
}

impl MethodManager {
    pub fn register(&mut self, id: impl Into<String>, kind: MethodKind, callback: Option<MethodCallback>) {
        let id = id.into();
        self.awaiting_updated.insert(id.clone());
        self.outstanding.insert(id, MethodCall { kind, callback });
    }

    /// Route a `result` frame; the call leaves the outstanding set.
    pub fn complete(&mut self, id: &str) -> Option<MethodCall> {
        self.outstanding.remove(id)
    }

    /// `updated {methods}`: the listed methods' data effects are visible.
    /// Advisory only; nothing is surfaced to callers.
    pub fn on_updated(&mut self, ids: &[String]) {
        for id in ids {
            self.awaiting_updated.remove(id);
        }
    }

    /// Atomically drain every outstanding call for disconnect invalidation.
    /// The caller must run the returned callbacks with
    /// `DisconnectedBeforeCallbackComplete` before delivering the disconnect
    /// notification.
    pub fn drain_for_disconnect(&mut self) -> Vec<MethodCallback> {
        self.awaiting_updated.clear();
        std::mem::take(&mut self.outstanding)
            .into_values()
            .filter_map(|call| call.callback)
            .collect()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn awaiting_updated(&self) -> Vec<String> {
        self.awaiting_updated.iter().cloned().collect()
    }
}

/// Map a `result` frame's error payload onto the caller-facing error.
pub fn server_error(error: &Value) -> ClientError {
    let error_type = error
        .get("errorType")
        .and_then(Value::as_str)
        .unwrap_or("Meteor.Error")
        .to_string();
    let code = error.get("error").and_then(Value::as_i64);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.get("reason").and_then(Value::as_str))
        .unwrap_or("server rejected method call")
        .to_string();
    ClientError::ServerMethod {
        error_type,
        code,
        message,
    }
}
