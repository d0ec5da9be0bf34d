//! Feature ID resolution.
//!
//! A feature ID names one logical API operation:
//! `<FEATURE_METHOD><delimiter><host><delimiter><path segments joined by path_delimiter>`.
//!
//! For example `GET https://API.example.com/v1/users/` resolves to
//! `GET-api.example.com-v1-users` with the default delimiters.
//!
//! Paths that differ only by delimiter characters collide
//! (`/a-b` and `/a/b` both resolve to `...-a-b`). This is accepted.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DELIMITER: &str = "-";

/// Maps an HTTP method to its feature verb.
pub fn feature_method(method: &str) -> &str {
    match method {
        "GET" => "GET",
        "POST" => "CREATE",
        "PUT" => "UPDATE",
        "DELETE" => "DELETE",
        "PATCH" => "MODIFY",
        "HEAD" => "INSPECT",
        "OPTIONS" => "OPTIONS",
        other => other,
    }
}

/// Deterministic (host, method, path) -> feature ID mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureIdResolver {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_delimiter")]
    pub path_delimiter: String,
}

fn default_delimiter() -> String {
    DEFAULT_DELIMITER.to_string()
}

impl Default for FeatureIdResolver {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            path_delimiter: default_delimiter(),
        }
    }
}

impl FeatureIdResolver {
    pub fn new(delimiter: impl Into<String>, path_delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            path_delimiter: path_delimiter.into(),
        }
    }

    /// Host without scheme, lowercased.
    pub fn resolve_api_id(&self, host: &str) -> String {
        host.to_lowercase()
            .replace("https://", "")
            .replace("http://", "")
    }

    /// Path without one leading and one trailing slash, separators replaced.
    pub fn resolve_path_id(&self, path: &str) -> String {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        trimmed.replace('/', &self.path_delimiter)
    }

    pub fn resolve_feature_id(&self, host: &str, method: &str, path: &str) -> String {
        [
            feature_method(method),
            &self.resolve_api_id(host),
            &self.resolve_path_id(path),
        ]
        .join(&self.delimiter)
    }
}
