//! Configuration surface (§6, §4.10). Deserializable via `serde`; this
//! crate does not read files itself — that's the host application's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_retries_before_backoff() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    2_000
}
fn default_sync_timeout_ms() -> u64 {
    30_000
}
fn default_retry_queue_idle_after() -> u32 {
    10
}
fn default_join_retries() -> u32 {
    10
}
fn default_room_join_retry_interval_ms() -> u64 {
    100
}
fn default_room_join_retry_multiplier() -> f64 {
    1.55
}
fn default_room_prefix() -> String {
    "freeq".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `"auto"` to pick from `available_servers`, or an explicit URL.
    pub server: String,
    #[serde(default)]
    pub available_servers: Vec<String>,
    /// Room alias suffixes treated as public/broadcast rooms.
    #[serde(default)]
    pub broadcast_rooms: Vec<String>,

    #[serde(default = "default_retries_before_backoff")]
    pub retries_before_backoff: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_retry_queue_idle_after")]
    pub retry_queue_idle_after: u32,

    #[serde(default = "default_join_retries")]
    pub join_retries: u32,
    #[serde(default = "default_room_join_retry_interval_ms")]
    pub room_join_retry_interval_ms: u64,
    #[serde(default = "default_room_join_retry_multiplier")]
    pub room_join_retry_interval_multiplier: f64,

    /// Chain/network identifier folded into broadcast room aliases.
    pub chain_id: u64,
    #[serde(default = "default_room_prefix")]
    pub room_prefix: String,
    /// Overrides the server name derived from the client's API base
    /// URL when composing broadcast-room aliases.
    pub server_name: Option<String>,
}

impl TransportConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_interval_ceiling(&self) -> Duration {
        self.retry_interval() * 10
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn room_join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.room_join_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let json = serde_json::json!({
            "server": "auto",
            "available_servers": ["https://example.org"],
            "chain_id": 1,
        });
        let config: TransportConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.retries_before_backoff, 3);
        assert_eq!(config.retry_queue_idle_after, 10);
        assert_eq!(config.room_prefix, "freeq");
    }
}
