//! Mock repository: sole owner of mock records and their counters in the
//! shared store.

use crate::error::{RepositoryError, StoreError};
use crate::model::MockRecord;
use crate::store::{BatchOp, KeySpace, KvStore};
use std::sync::Arc;

/// Outcome of claiming one use of a mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockClaim {
    /// The mock may be served. `remaining` is `None` for an unlimited mock.
    Granted {
        record: MockRecord,
        remaining: Option<i64>,
    },
    /// Counter went negative; the mock is used up
    Exhausted,
    /// No record under this id
    Missing,
}

pub struct MockRepository {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    ttl_seconds: u64,
}

impl MockRepository {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace, ttl_seconds: u64) -> Self {
        Self {
            store,
            keys,
            ttl_seconds,
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Atomically write the record, its counter (or clear a stale one), and
    /// the shared expiry. Returns the applied TTL.
    pub async fn set_mock(&self, id: &str, record: &MockRecord) -> Result<u64, RepositoryError> {
        record
            .validate()
            .map_err(RepositoryError::InvalidPayload)?;

        let mock_key = self.keys.mock(id);
        let count_key = self.keys.mock_count(id);
        let encoded = serde_json::to_string(record).map_err(StoreError::from)?;

        let mut ops = vec![BatchOp::Set {
            key: mock_key.clone(),
            value: encoded,
        }];
        match record.count {
            Some(count) => ops.push(BatchOp::Set {
                key: count_key.clone(),
                value: count.to_string(),
            }),
            None => ops.push(BatchOp::Del {
                key: count_key.clone(),
            }),
        }
        ops.push(BatchOp::Expire {
            key: mock_key.clone(),
            ttl_seconds: self.ttl_seconds,
        });
        ops.push(BatchOp::Expire {
            key: count_key,
            ttl_seconds: self.ttl_seconds,
        });

        let results = self.store.exec_atomic(ops).await.map_err(|e| {
            tracing::error!("Atomic write for {} failed: {}", mock_key, e);
            RepositoryError::AtomicWriteFailed(mock_key.clone())
        })?;

        if results.is_empty() || results.iter().any(|ok| !ok) {
            return Err(RepositoryError::AtomicWriteFailed(mock_key));
        }

        tracing::debug!("Stored mock {} (ttl={}s)", id, self.ttl_seconds);
        Ok(self.ttl_seconds)
    }

    pub async fn get_mock_by_id(&self, id: &str) -> Result<Option<MockRecord>, RepositoryError> {
        let Some(raw) = self.store.get(&self.keys.mock(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| RepositoryError::InvalidPayload(format!("stored mock {id}: {e}")))
    }

    /// Every registered mock id, prefix stripped. O(n) over the keyspace.
    pub async fn get_all_mock_keys(&self) -> Result<Vec<String>, RepositoryError> {
        let keys = self.store.keys(&self.keys.mock_pattern()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.mock_id(key))
            .map(str::to_string)
            .collect())
    }

    /// Remove the record and its counter.
    pub async fn drop_mock(&self, id: &str) -> Result<(), RepositoryError> {
        self.store
            .del(&[self.keys.mock(id), self.keys.mock_count(id)])
            .await?;
        Ok(())
    }

    /// Take one use of the mock. The counter decrement and the record read
    /// happen in a single store step, so every caller whose decrement left
    /// the counter at zero or above gets the record.
    pub async fn claim(&self, id: &str) -> Result<MockClaim, RepositoryError> {
        let (remaining, raw) = self
            .store
            .decr_and_get(&self.keys.mock_count(id), &self.keys.mock(id))
            .await?;

        if matches!(remaining, Some(n) if n < 0) {
            return Ok(MockClaim::Exhausted);
        }
        let Some(raw) = raw else {
            return Ok(MockClaim::Missing);
        };
        let record = serde_json::from_str(&raw)
            .map_err(|e| RepositoryError::InvalidPayload(format!("stored mock {id}: {e}")))?;
        Ok(MockClaim::Granted { record, remaining })
    }
}
