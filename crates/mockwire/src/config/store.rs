//! Shared store configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Backend type: "inmemory" or "redis"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Prefix for every key and the event channel name
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upper bound for a single store round-trip
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. "redis://localhost:6379"
    pub url: String,
}

fn default_backend() -> String {
    "inmemory".to_string()
}

fn default_key_prefix() -> String {
    "ms:".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
            redis: None,
        }
    }
}
