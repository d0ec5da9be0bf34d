//! History and response recording configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    /// Responses whose decoded body exceeds this size get a placeholder in
    /// the short record.
    #[serde(default = "default_short_body_kb_threshold")]
    pub short_body_kb_threshold: usize,
    /// Aggregation key used when no key function is installed
    #[serde(default = "default_aggregation_key")]
    pub aggregation_key: String,
    /// Response bodies above this size are replaced in dashboard history views
    #[serde(default = "default_dashboard_body_limit_kb")]
    pub dashboard_body_limit_kb: usize,
}

fn default_short_body_kb_threshold() -> usize {
    200
}

fn default_aggregation_key() -> String {
    "unknown".to_string()
}

fn default_dashboard_body_limit_kb() -> usize {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            short_body_kb_threshold: default_short_body_kb_threshold(),
            aggregation_key: default_aggregation_key(),
            dashboard_body_limit_kb: default_dashboard_body_limit_kb(),
        }
    }
}
