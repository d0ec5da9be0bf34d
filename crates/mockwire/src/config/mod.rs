//! Configuration types for the mock service.

mod history;
mod listen;
mod store;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use history::HistoryConfig;
pub use listen::ListenConfig;
pub use store::{RedisConfig, StoreConfig};

use crate::blacklist::BlacklistRule;
use crate::feature_id::FeatureIdResolver;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    /// TTL applied to both the mock record and its counter
    #[serde(default = "default_mock_ttl_seconds")]
    pub mock_ttl_seconds: u64,

    /// Sliding TTL for history hashes and response records
    #[serde(default = "default_history_ttl_seconds")]
    pub history_ttl_seconds: u64,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Decoded bodies larger than this are classified TOO_BIG
    #[serde(default = "default_body_size_limit_bytes")]
    pub body_size_limit_bytes: usize,

    #[serde(default)]
    pub feature_id: FeatureIdResolver,

    /// Feature IDs excluded from history. `/.../` entries are regexes.
    #[serde(default)]
    pub request_blacklist: Vec<String>,

    /// Interception proxy listener; only used by the binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<ListenConfig>,
}

fn default_mock_ttl_seconds() -> u64 {
    3600
}

fn default_history_ttl_seconds() -> u64 {
    3600
}

fn default_body_size_limit_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            mock_ttl_seconds: default_mock_ttl_seconds(),
            history_ttl_seconds: default_history_ttl_seconds(),
            history: HistoryConfig::default(),
            body_size_limit_bytes: default_body_size_limit_bytes(),
            feature_id: FeatureIdResolver::default(),
            request_blacklist: Vec::new(),
            listen: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match self.store.backend.as_str() {
            "inmemory" => {}
            "redis" => {
                let has_url = self
                    .store
                    .redis
                    .as_ref()
                    .map(|r| !r.url.trim().is_empty())
                    .unwrap_or(false);
                if !has_url {
                    anyhow::bail!(
                        "Redis backend requires 'store.redis.url' (e.g. redis://localhost:6379)"
                    );
                }
            }
            other => anyhow::bail!(
                "Unsupported store backend: '{}'. Supported: inmemory, redis",
                other
            ),
        }

        if self.store.operation_timeout_ms == 0 {
            anyhow::bail!("'store.operation_timeout_ms' must be greater than 0");
        }
        if self.mock_ttl_seconds == 0 {
            anyhow::bail!("'mock_ttl_seconds' must be greater than 0");
        }
        if self.history_ttl_seconds == 0 {
            anyhow::bail!("'history_ttl_seconds' must be greater than 0");
        }

        if self.feature_id.delimiter.is_empty() || self.feature_id.path_delimiter.is_empty() {
            anyhow::bail!("'feature_id.delimiter' and 'feature_id.path_delimiter' must not be empty");
        }

        for entry in &self.request_blacklist {
            BlacklistRule::parse(entry)
                .map_err(|e| anyhow::anyhow!("Invalid request_blacklist entry '{}': {}", entry, e))?;
        }

        Ok(())
    }

    /// Parsed blacklist rules. Only call on a validated config.
    pub fn blacklist_rules(&self) -> Vec<BlacklistRule> {
        self.request_blacklist
            .iter()
            .filter_map(|entry| BlacklistRule::parse(entry).ok())
            .collect()
    }

    pub fn short_body_threshold_bytes(&self) -> usize {
        self.history.short_body_kb_threshold * 1024
    }
}
