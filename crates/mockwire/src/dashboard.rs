//! Inspection and control operations behind the dashboard.
//!
//! Results serialize to the JSON shapes the dashboard UI consumes.

use crate::error::{ServiceError, StoreError};
use crate::handlers::{DefaultHandler, DefaultHandlers, Responder};
use crate::model::{HistoryRecord, MockPattern, MockRecord, ResponseInit, ResponseRecord};
use crate::registry::MockRegistry;
use crate::state::SharedState;
use crate::store::{KeySpace, KvStore};
use crate::watcher::RESPONSE_TOO_BIG;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

const NO_RESPONSE: &str = "[No response]";
const NOT_FOUND: &str = "[Not found]";
const RESOLVER_DESCRIPTION: &str = "Custom method resolver for mocking.";

/// `3600` -> `"60.00 minutes"`.
pub fn sec_to_min_human(seconds: u64) -> String {
    format!("{:.2} minutes", seconds as f64 / 60.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDetailed {
    pub expiration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetMockResponse {
    pub expiration: String,
    pub body: MockRecord,
}

/// What a default handler would answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<ResponseInit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
}

impl HandlerInfo {
    fn of(handler: &DefaultHandler) -> Self {
        match &handler.responder {
            Responder::Resolver(_) => Self {
                description: Some(RESOLVER_DESCRIPTION.to_string()),
                init: None,
                response_body: None,
            },
            Responder::Static(response) => Self {
                description: handler.options.description.clone(),
                init: Some(response.init().cloned().unwrap_or_else(ok_init)),
                response_body: Some(response.original_body()),
            },
        }
    }
}

/// What a stored custom mock would answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetHandlerInfo {
    pub pattern: MockPattern,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<ResponseInit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
}

impl From<&MockRecord> for SetHandlerInfo {
    fn from(record: &MockRecord) -> Self {
        match record.pattern {
            MockPattern::Passthrough => Self {
                pattern: record.pattern,
                count: record.count,
                init: None,
                response_body: None,
            },
            MockPattern::Mock => Self {
                pattern: record.pattern,
                count: record.count,
                init: Some(record.init.clone().unwrap_or_else(ok_init)),
                response_body: record.response_body.clone(),
            },
        }
    }
}

fn ok_init() -> ResponseInit {
    ResponseInit {
        status: Some(200),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DefaultMocking {
    Found(HandlerInfo),
    NotFound(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMockEntry {
    pub feature_id: String,
    pub mocking: SetHandlerInfo,
    pub default_mocking: DefaultMocking,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultMockEntry {
    pub feature_id: String,
    pub mocking: HandlerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MockingList {
    pub custom: Vec<CustomMockEntry>,
    pub default: Vec<DefaultMockEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MockStatusMocking {
    pub custom: Option<MockRecord>,
    pub default: Option<HandlerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MockStatus {
    pub id: String,
    pub mocking: MockStatusMocking,
}

/// A history record joined with its short response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub record: HistoryRecord,
    /// The short response record, or `"[No response]"`
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryShort {
    pub api_id: String,
    pub feature_id: String,
    pub date: String,
    pub order: u32,
}

pub struct Dashboard {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    state: Arc<SharedState>,
    registry: Arc<MockRegistry>,
    handlers: Arc<DefaultHandlers>,
    mock_ttl_seconds: u64,
    body_limit_bytes: usize,
}

impl Dashboard {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        state: Arc<SharedState>,
        registry: Arc<MockRegistry>,
        handlers: Arc<DefaultHandlers>,
        mock_ttl_seconds: u64,
        body_limit_bytes: usize,
    ) -> Self {
        Self {
            store,
            keys,
            state,
            registry,
            handlers,
            mock_ttl_seconds,
            body_limit_bytes,
        }
    }

    fn ensure_enabled(&self) -> Result<(), ServiceError> {
        if self.state.is_enabled() {
            Ok(())
        } else {
            Err(ServiceError::Disabled)
        }
    }

    pub fn config_detailed(&self) -> ConfigDetailed {
        ConfigDetailed {
            expiration: sec_to_min_human(self.mock_ttl_seconds),
        }
    }

    pub async fn set_mock(&self, id: &str, record: MockRecord) -> Result<SetMockResponse, ServiceError> {
        self.ensure_enabled()?;
        let ttl = self.registry.set(id, record.clone()).await?;
        Ok(SetMockResponse {
            expiration: sec_to_min_human(ttl),
            body: record,
        })
    }

    pub async fn drop_mock(&self, id: &str) -> Result<bool, ServiceError> {
        self.ensure_enabled()?;
        MockRegistry::drop(&self.registry, id).await?;
        Ok(true)
    }

    /// Drop every mock, then every key under the prefix. `false` when there
    /// was nothing to reset.
    pub async fn reset(&self) -> Result<bool, ServiceError> {
        self.ensure_enabled()?;

        let ids = self.registry.repository().get_all_mock_keys().await?;
        if ids.is_empty() {
            return Ok(false);
        }
        for id in &ids {
            MockRegistry::drop(&self.registry, id).await?;
        }

        let keys = self.store.keys(&self.keys.everything()).await?;
        if !keys.is_empty() {
            self.store.del(&keys).await?;
        }
        tracing::info!("Reset {} mocks and {} keys", ids.len(), keys.len());
        Ok(true)
    }

    pub async fn mocking_list(&self) -> Result<MockingList, ServiceError> {
        self.ensure_enabled()?;

        let repository = self.registry.repository();
        let mut custom = Vec::new();
        for id in repository.get_all_mock_keys().await? {
            // Expired between the scan and the read
            let Some(record) = repository.get_mock_by_id(&id).await? else {
                continue;
            };
            let default_mocking = match self.handlers.by_id(&id) {
                Some(handler) => DefaultMocking::Found(HandlerInfo::of(&handler)),
                None => DefaultMocking::NotFound(NOT_FOUND),
            };
            custom.push(CustomMockEntry {
                feature_id: id,
                mocking: SetHandlerInfo::from(&record),
                default_mocking,
            });
        }

        let default = self
            .handlers
            .all()
            .iter()
            .map(|handler| DefaultMockEntry {
                feature_id: handler.id.clone(),
                mocking: HandlerInfo::of(handler),
            })
            .collect();

        Ok(MockingList { custom, default })
    }

    pub async fn mock_status(&self, id: &str) -> Result<MockStatus, ServiceError> {
        self.ensure_enabled()?;
        let custom = self.registry.repository().get_mock_by_id(id).await?;
        let default = self.handlers.by_id(id).map(|h| HandlerInfo::of(&h));
        Ok(MockStatus {
            id: id.to_string(),
            mocking: MockStatusMocking { custom, default },
        })
    }

    /// History per aggregation key, newest first, groups ordered by their
    /// newest record.
    pub async fn main_history_full(&self) -> Result<Vec<Vec<HistoryEntry>>, ServiceError> {
        let hashes = self
            .store
            .hgetall_matching(&self.keys.history_pattern())
            .await?;

        let mut groups = Vec::with_capacity(hashes.len());
        for (key, fields) in hashes {
            let mut records: Vec<HistoryRecord> = fields
                .values()
                .filter_map(|raw| match serde_json::from_str(raw) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!("Skipping malformed history record in {}: {}", key, e);
                        None
                    }
                })
                .collect();
            if records.is_empty() {
                continue;
            }
            records.sort_by(|a, b| newest_first(&a.date, &b.date));

            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                entries.push(self.history_entry(record).await?);
            }
            groups.push(entries);
        }

        groups.sort_by(|a: &Vec<HistoryEntry>, b: &Vec<HistoryEntry>| {
            newest_first(&a[0].record.date, &b[0].record.date)
        });
        Ok(groups)
    }

    async fn history_entry(&self, record: HistoryRecord) -> Result<HistoryEntry, StoreError> {
        let short = self
            .store
            .get(&self.keys.response_short(&record.request_id))
            .await?;

        let response = match short.as_deref().map(serde_json::from_str::<ResponseRecord>) {
            Some(Ok(response)) => {
                serde_json::to_value(response.shortened(self.body_limit_bytes, RESPONSE_TOO_BIG))?
            }
            Some(Err(e)) => {
                tracing::warn!("Malformed short response for {}: {}", record.request_id, e);
                Value::String(NO_RESPONSE.to_string())
            }
            None => Value::String(NO_RESPONSE.to_string()),
        };

        let description = self
            .handlers
            .by_id(&record.feature_id)
            .and_then(|h| h.options.description.clone());

        Ok(HistoryEntry {
            description,
            record,
            response,
        })
    }

    pub async fn main_history_short(&self) -> Result<Vec<Vec<HistoryEntryShort>>, ServiceError> {
        Ok(self
            .main_history_full()
            .await?
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .map(|entry| HistoryEntryShort {
                        api_id: entry.record.api_id,
                        feature_id: entry.record.feature_id,
                        date: entry.record.date,
                        order: entry.record.order,
                    })
                    .collect()
            })
            .collect())
    }

    /// The full stored response for a request.
    pub async fn response_body(&self, request_id: &str) -> Result<ResponseRecord, ServiceError> {
        let raw = self
            .store
            .get(&self.keys.response(request_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound("RequestId".to_string()))?;
        Ok(serde_json::from_str(&raw).map_err(StoreError::from)?)
    }

    pub async fn remove_history(&self) -> Result<(), ServiceError> {
        let keys = self.store.keys(&self.keys.history_pattern()).await?;
        if !keys.is_empty() {
            self.store.del(&keys).await?;
        }
        Ok(())
    }
}

fn newest_first(a: &str, b: &str) -> Ordering {
    let parse = |date: &str| DateTime::<FixedOffset>::parse_from_rfc3339(date).ok();
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        _ => b.cmp(a),
    }
}
