use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolVersion;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws://host/websocket` or `wss://host/websocket`.
    pub url: String,
    /// Preferred DDP version to negotiate.
    pub version: ProtocolVersion,
    pub backoff: BackoffPolicy,
    /// Client-initiated ping interval while connected.
    pub heartbeat_interval_secs: u64,
    /// Coalescing window for offline-cache writes.
    pub persist_debounce_secs: u64,
    /// Override for the offline cache directory; defaults to the XDG cache
    /// location resolved in `paths`.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/websocket".to_string(),
            version: ProtocolVersion::V1,
            backoff: BackoffPolicy::default(),
            heartbeat_interval_secs: 30,
            persist_debounce_secs: 5,
            cache_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_secs(self.persist_debounce_secs)
    }
}

/// Linear reconnect backoff: `base × tries`, with `tries` capped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub max_tries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 5,
            max_tries: 6,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, tries: u32) -> Duration {
        Duration::from_secs(self.base_secs.saturating_mul(u64::from(tries.max(1))))
    }
}
