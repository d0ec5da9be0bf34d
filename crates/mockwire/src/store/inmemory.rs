use super::{glob_matches, BatchOp, KvStore, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const CHANNEL_CAPACITY: usize = 256;

/// Expired entries are swept from the whole map once per this many writes.
const SWEEP_EVERY_WRITES: u64 = 64;

#[derive(Debug, Clone)]
enum StoredValue {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory implementation of `KvStore`
///
/// Keys carry optional expiry. They are dropped lazily on access, and every
/// `SWEEP_EVERY_WRITES` writes all expired keys are removed.
/// Pub/sub is backed by one broadcast channel per channel name, so several
/// service instances sharing one `InMemoryStore` behave like instances
/// sharing one Redis server. Useful for testing and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one write and, when due, drop every expired entry.
    fn sweep_if_due(&self, data: &mut HashMap<String, Entry>) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_WRITES != 0 {
            return;
        }
        let now = Instant::now();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        let swept = before - data.len();
        if swept > 0 {
            tracing::debug!("Swept {} expired keys from in-memory store", swept);
        }
    }

    /// Look up a live entry, removing it if it has expired.
    fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if data.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            data.remove(key);
            return None;
        }
        data.get_mut(key)
    }

    fn apply_op(data: &mut HashMap<String, Entry>, op: &BatchOp) -> bool {
        match op {
            BatchOp::Set { key, value } => {
                data.insert(
                    key.clone(),
                    Entry {
                        value: StoredValue::Str(value.clone()),
                        expires_at: None,
                    },
                );
                true
            }
            BatchOp::Expire { key, ttl_seconds } => {
                if let Some(entry) = Self::live(data, key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(*ttl_seconds));
                }
                true
            }
            BatchOp::Del { key } => {
                data.remove(key);
                true
            }
        }
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            Some(Entry {
                value: StoredValue::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        self.sweep_if_due(&mut data);
        Self::apply_op(
            &mut data,
            &BatchOp::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut data = self.data.lock();
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = data.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn decr_and_get(
        &self,
        counter_key: &str,
        value_key: &str,
    ) -> Result<(Option<i64>, Option<String>), StoreError> {
        // One lock for both keys: a concurrent DEL of the pair is seen either
        // before or after, never in between
        let mut data = self.data.lock();

        let remaining = match Self::live(&mut data, counter_key) {
            None => None,
            Some(entry) => {
                let current = match &entry.value {
                    StoredValue::Str(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| StoreError::NotAnInteger(counter_key.to_string()))?,
                    StoredValue::Hash(_) => {
                        return Err(StoreError::WrongType(counter_key.to_string()))
                    }
                };
                // DECR keeps the existing expiry
                entry.value = StoredValue::Str((current - 1).to_string());
                Some(current - 1)
            }
        };

        let value = match Self::live(&mut data, value_key) {
            Some(Entry {
                value: StoredValue::Str(s),
                ..
            }) => Some(s.clone()),
            Some(_) => return Err(StoreError::WrongType(value_key.to_string())),
            None => None,
        };

        Ok((remaining, value))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        self.sweep_if_due(&mut data);
        if Self::live(&mut data, key).is_none() {
            data.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }

        match data.get_mut(key).map(|e| &mut e.value) {
            Some(StoredValue::Hash(hash)) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn hgetall_matching(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
        let data = self.data.lock();
        let now = Instant::now();
        Ok(data
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_matches(pattern, key))
            .filter_map(|(key, entry)| match &entry.value {
                StoredValue::Hash(hash) => Some((key.clone(), hash.clone())),
                StoredValue::Str(_) => None,
            })
            .collect())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.lock();
        let now = Instant::now();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError> {
        // Single lock acquisition: no reader observes a partial batch
        let mut data = self.data.lock();
        self.sweep_if_due(&mut data);
        Ok(ops.iter().map(|op| Self::apply_op(&mut data, op)).collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let sender = self.channels.lock().get(channel).cloned();
        if let Some(sender) = sender {
            // No receivers is not an error for pub/sub
            let _ = sender.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let receiver = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(|message| message.ok());
        Ok(Box::pin(stream))
    }
}
