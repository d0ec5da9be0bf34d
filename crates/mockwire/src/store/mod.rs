//! Shared key-value / pub-sub store used by every instance of the service.
//!
//! Backends:
//! - `inmemory`: single-process store with TTLs and broadcast pub/sub
//! - `redis`: any Redis-compatible server (async connection manager)
//!
//! Every backend is wrapped in `TimeoutStore` so that a slow store degrades
//! the caller instead of stalling it.

mod inmemory;
mod keys;
#[cfg(feature = "redis-backend")]
mod redis;

pub use inmemory::InMemoryStore;
pub use keys::KeySpace;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStore;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::metrics;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Stream of raw messages received on a subscribed channel.
pub type Subscription = BoxStream<'static, String>;

/// One step of an all-or-nothing batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: String },
    Expire { key: String, ttl_seconds: u64 },
    Del { key: String },
}

/// Backend-agnostic store operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Plain SET. Clears any expiry on the key.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError>;

    /// In one atomic step, decrement `counter_key` if it exists and read
    /// `value_key`. An absent counter is reported as `None` and not created.
    async fn decr_and_get(
        &self,
        counter_key: &str,
        value_key: &str,
    ) -> Result<(Option<i64>, Option<String>), StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Read every hash whose key matches `pattern` in one atomic operation.
    async fn hgetall_matching(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, HashMap<String, String>>, StoreError>;

    /// Glob-style key listing (`*` and `?`). O(n) over the keyspace.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Apply all operations atomically (MULTI/EXEC). Returns one success flag
    /// per operation; an aborted transaction yields all `false`.
    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Bounds every operation of the wrapped store.
pub struct TimeoutStore {
    inner: Arc<dyn KvStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(operation)),
        };
        metrics::record_store_op(operation, result.is_ok());
        result
    }
}

#[async_trait]
impl KvStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.bounded("set", self.inner.set(key, value)).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.bounded("del", self.inner.del(keys)).await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        self.bounded("expire", self.inner.expire(key, ttl_seconds)).await
    }

    async fn decr_and_get(
        &self,
        counter_key: &str,
        value_key: &str,
    ) -> Result<(Option<i64>, Option<String>), StoreError> {
        self.bounded("decr_and_get", self.inner.decr_and_get(counter_key, value_key))
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.bounded("hset", self.inner.hset(key, field, value)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.bounded("hgetall", self.inner.hgetall(key)).await
    }

    async fn hgetall_matching(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
        self.bounded("hgetall_matching", self.inner.hgetall_matching(pattern)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.bounded("keys", self.inner.keys(pattern)).await
    }

    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError> {
        self.bounded("exec", self.inner.exec_atomic(ops)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.bounded("publish", self.inner.publish(channel, message)).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.bounded("subscribe", self.inner.subscribe(channel)).await
    }
}

/// Create a store based on configuration, wrapped with the operation timeout.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    let timeout = Duration::from_millis(config.operation_timeout_ms);

    let backend: Arc<dyn KvStore> = match config.backend.as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory store (timeout={}ms)", config.operation_timeout_ms);
            Arc::new(InMemoryStore::new())
        }
        "redis" => {
            let redis_config = config
                .redis
                .as_ref()
                .ok_or_else(|| anyhow!("Redis backend selected but no redis config provided"))?;

            #[cfg(feature = "redis-backend")]
            {
                use anyhow::Context;

                let store = RedisStore::connect(&redis_config.url)
                    .await
                    .context("Failed to create Redis backend")?;
                tracing::info!(
                    "Using redis store (url={}, timeout={}ms)",
                    redis_config.url,
                    config.operation_timeout_ms
                );
                Arc::new(store)
            }

            #[cfg(not(feature = "redis-backend"))]
            {
                let _ = redis_config;
                return Err(anyhow!(
                    "Redis backend not available. Compile with --features redis-backend"
                ));
            }
        }
        other => return Err(anyhow!("Unknown backend type: {other}")),
    };

    Ok(Arc::new(TimeoutStore::new(backend, timeout)))
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub(crate) fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((star_pi, star_ci)) = star {
            pi = star_pi + 1;
            ci = star_ci + 1;
            star = Some((star_pi, star_ci + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("ms:mocking:*", "ms:mocking:GET-a"));
        assert!(!glob_matches("ms:mocking:*", "ms:mocking-count:GET-a"));
        assert!(glob_matches("ms:*", "ms:"));
        assert!(glob_matches("a?c", "abc"));
        assert!(!glob_matches("a?c", "ac"));
        assert!(glob_matches("*x*y", "axbxy"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_create_store_inmemory() {
        let config = StoreConfig::default();
        let store = create_store(&config).await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_create_store_unknown_backend() {
        let config = StoreConfig {
            backend: "unknown".to_string(),
            ..StoreConfig::default()
        };
        let result = create_store(&config).await;
        let err_msg = result.err().unwrap().to_string();
        assert!(err_msg.contains("Unknown backend type"));
    }

    #[tokio::test]
    async fn test_create_store_redis_without_config() {
        let config = StoreConfig {
            backend: "redis".to_string(),
            redis: None,
            ..StoreConfig::default()
        };
        let result = create_store(&config).await;
        let err_msg = result.err().unwrap().to_string();
        assert!(err_msg.contains("redis config"));
    }

    struct SlowStore;

    #[async_trait]
    impl KvStore for SlowStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn del(&self, _keys: &[String]) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn expire(&self, _key: &str, _ttl: u64) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn decr_and_get(
            &self,
            _counter_key: &str,
            _value_key: &str,
        ) -> Result<(Option<i64>, Option<String>), StoreError> {
            Ok((None, None))
        }
        async fn hset(&self, _key: &str, _field: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn hgetall(&self, _key: &str) -> Result<HashMap<String, String>, StoreError> {
            Ok(HashMap::new())
        }
        async fn hgetall_matching(
            &self,
            _pattern: &str,
        ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
            Ok(HashMap::new())
        }
        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
        async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError> {
            Ok(vec![true; ops.len()])
        }
        async fn publish(&self, _channel: &str, _message: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn subscribe(&self, _channel: &str) -> Result<Subscription, StoreError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_timeout_store_bounds_slow_operations() {
        let store = TimeoutStore::new(Arc::new(SlowStore), Duration::from_millis(20));
        let result = store.get("key").await;
        assert!(matches!(result, Err(StoreError::Timeout("get"))));
    }
}
