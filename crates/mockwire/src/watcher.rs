//! Request history and response persistence.
//!
//! History records are stored in one hash per aggregation key, with a
//! sliding TTL refreshed on every write. Responses are stored twice: the
//! full record and a short copy whose oversized body is replaced by a
//! placeholder.

use crate::blacklist::BlacklistCache;
use crate::body::BodyClassifier;
use crate::error::StoreError;
use crate::handlers::HttpResponse;
use crate::metrics;
use crate::model::{HistoryRecord, ResponseRecord};
use crate::request::MsRequest;
use crate::store::{KeySpace, KvStore};
use std::sync::Arc;

pub const RESPONSE_TOO_BIG: &str = "[Response too big]";

/// Chooses the hash a request's history lands in.
pub type AggregationKeyFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    classifier: BodyClassifier,
    blacklist: Arc<BlacklistCache>,
    ttl_seconds: u64,
    short_threshold_bytes: usize,
    default_aggregation_key: String,
    aggregation_key: Option<AggregationKeyFn>,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        classifier: BodyClassifier,
        blacklist: Arc<BlacklistCache>,
        ttl_seconds: u64,
        short_threshold_bytes: usize,
        default_aggregation_key: impl Into<String>,
        aggregation_key: Option<AggregationKeyFn>,
    ) -> Self {
        Self {
            store,
            keys,
            classifier,
            blacklist,
            ttl_seconds,
            short_threshold_bytes,
            default_aggregation_key: default_aggregation_key.into(),
            aggregation_key,
        }
    }

    /// Current aggregation key; empty answers fall back to the default.
    pub fn aggregation_key(&self) -> String {
        self.aggregation_key
            .as_ref()
            .and_then(|f| f())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.default_aggregation_key.clone())
    }

    /// Record the request in the current aggregation hash. Returns `None`
    /// when the request is blacklisted and nothing was written.
    pub async fn save_in_history(
        &self,
        request: &MsRequest,
    ) -> Result<Option<HistoryRecord>, StoreError> {
        if self.blacklist.is_blacklisted(request.feature_id()) {
            return Ok(None);
        }

        let record = request.to_history_record(&self.classifier);
        let key = self.keys.history(&self.aggregation_key());
        let result = self.write_history(&key, &record).await;
        metrics::record_history_write("request", result.is_ok());
        result?;

        tracing::debug!("Saved {} in {}", record.field(), key);
        Ok(Some(record))
    }

    async fn write_history(&self, key: &str, record: &HistoryRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(record)?;
        self.store.hset(key, &record.field(), &encoded).await?;
        self.store.expire(key, self.ttl_seconds).await?;
        Ok(())
    }

    /// Store the full and short response records for a request.
    pub async fn save_response(
        &self,
        request: &MsRequest,
        response: &HttpResponse,
        is_mocked: bool,
    ) -> Result<ResponseRecord, StoreError> {
        let parsed = self
            .classifier
            .classify_bytes(&response.headers, &response.body);
        let record = ResponseRecord::new(
            is_mocked,
            response.status.as_u16(),
            response.status_text(),
            request.query_params(),
            parsed,
        );
        let short = record.shortened(self.short_threshold_bytes, RESPONSE_TOO_BIG);

        let result = self.write_responses(request.request_id(), &record, &short).await;
        metrics::record_history_write("response", result.is_ok());
        result?;

        tracing::debug!(
            "Saved response for {} (mocked={})",
            request.request_id(),
            is_mocked
        );
        Ok(record)
    }

    async fn write_responses(
        &self,
        request_id: &str,
        full: &ResponseRecord,
        short: &ResponseRecord,
    ) -> Result<(), StoreError> {
        for (key, record) in [
            (self.keys.response(request_id), full),
            (self.keys.response_short(request_id), short),
        ] {
            self.store.set(&key, &serde_json::to_string(record)?).await?;
            self.store.expire(&key, self.ttl_seconds).await?;
        }
        Ok(())
    }
}
