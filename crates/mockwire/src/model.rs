//! Records exchanged with the shared store.
//!
//! Field names follow the JSON layout stored under the `ms:` namespace, so
//! records written by one instance are readable by every other instance.

use crate::body::ParsedBody;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MockPattern {
    /// Serve the stored response
    Mock,
    /// Let the real call go through
    Passthrough,
}

/// Status line and headers applied to a rendered mock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// A stored mock definition, also the set-mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRecord {
    pub pattern: MockPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<ResponseInit>,
    /// Remaining permitted matches; absent means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

impl MockRecord {
    pub fn mock(response_body: Value) -> Self {
        Self {
            pattern: MockPattern::Mock,
            response_body: Some(response_body),
            init: None,
            count: None,
        }
    }

    pub fn passthrough() -> Self {
        Self {
            pattern: MockPattern::Passthrough,
            response_body: None,
            init: None,
            count: None,
        }
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_init(mut self, init: ResponseInit) -> Self {
        self.init = Some(init);
        self
    }

    /// Reject payloads the repository must not persist.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(count) = self.count {
            if count <= 0 {
                return Err(format!("count must be a positive integer, got {count}"));
            }
        }
        if self.pattern == MockPattern::Passthrough
            && (self.response_body.is_some() || self.init.is_some())
        {
            return Err("PASSTHROUGH mocks carry no response".to_string());
        }
        Ok(())
    }
}

/// One intercepted request, stored in the history hash of its aggregation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub api_id: String,
    pub feature_id: String,
    pub path: String,
    pub method: String,
    /// RFC 3339 timestamp with millisecond precision
    pub date: String,
    pub request_id: String,
    #[serde(default)]
    pub body: Value,
    pub order: u32,
}

impl HistoryRecord {
    /// Hash field under which the record is stored.
    pub fn field(&self) -> String {
        format!("{}-{}", self.feature_id, self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(rename = "type")]
    pub body_type: crate::body::BodyType,
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Stored outcome of one request, full or short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub is_mocked_response: bool,
    pub status: u16,
    pub status_text: String,
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    pub meta: ResponseMeta,
}

impl ResponseRecord {
    pub fn new(
        is_mocked_response: bool,
        status: u16,
        status_text: impl Into<String>,
        params: BTreeMap<String, String>,
        parsed: ParsedBody,
    ) -> Self {
        Self {
            is_mocked_response,
            status,
            status_text: status_text.into(),
            params,
            body: parsed.body.unwrap_or(Value::Null),
            meta: ResponseMeta {
                body_type: parsed.body_type,
                size: parsed.size,
                content_type: parsed.content_type,
            },
        }
    }

    /// Copy with the body replaced by `placeholder` when the decoded size
    /// exceeds `threshold_bytes`.
    pub fn shortened(&self, threshold_bytes: usize, placeholder: &str) -> Self {
        let mut short = self.clone();
        if self.meta.size.unwrap_or(0) > threshold_bytes as u64 {
            short.body = Value::String(placeholder.to_string());
        }
        short
    }
}
