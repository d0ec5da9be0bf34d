use super::{BatchOp, KvStore, Subscription};
use crate::error::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;

/// Decrement the counter only when it exists, so an exhausted or deleted
/// counter is never recreated at -1, and read the value in the same step.
const DECR_AND_GET_SCRIPT: &str = r#"
local remaining = false
if redis.call('EXISTS', KEYS[1]) == 1 then
  remaining = redis.call('DECR', KEYS[1])
end
return {remaining, redis.call('GET', KEYS[2])}
"#;

/// Collect every hash under a key pattern in one server-side step.
const HGETALL_MATCHING_SCRIPT: &str = r#"
local result = {}
for _, key in ipairs(redis.call('KEYS', ARGV[1])) do
  if redis.call('TYPE', key).ok == 'hash' then
    local flat = redis.call('HGETALL', key)
    local hash = {}
    for i = 1, #flat, 2 do
      hash[flat[i]] = flat[i + 1]
    end
    result[key] = hash
  end
end
if next(result) == nil then
  return '{}'
end
return cjson.encode(result)
"#;

const SCAN_BATCH: usize = 500;

/// Redis implementation of `KvStore` using the async connection manager.
///
/// # Compatibility
///
/// - Redis 6.x, 7.x: Fully supported
/// - Valkey, KeyDB: Likely compatible but not officially supported
///
/// The connection manager reconnects transparently; each operation clones it
/// (cheap) so concurrent callers never serialize on a lock. Pub/sub uses a
/// dedicated connection per subscription.
pub struct RedisStore {
    client: ::redis::Client,
    conn: ::redis::aio::ConnectionManager,
    claim_script: ::redis::Script,
    hgetall_script: ::redis::Script,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g. "redis://localhost:6379")
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url).context("Failed to parse Redis URL")?;
        let mut conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;

        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to PING Redis")?;

        tracing::info!("Connected to Redis at {}", url);

        Ok(Self {
            client,
            conn,
            claim_script: ::redis::Script::new(DECR_AND_GET_SCRIPT),
            hgetall_script: ::redis::Script::new(HGETALL_MATCHING_SCRIPT),
        })
    }

    fn conn(&self) -> ::redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = ::redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        let applied: bool = ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async(&mut self.conn())
            .await?;
        Ok(applied)
    }

    async fn decr_and_get(
        &self,
        counter_key: &str,
        value_key: &str,
    ) -> Result<(Option<i64>, Option<String>), StoreError> {
        let result: ::redis::RedisResult<(Option<i64>, Option<String>)> = self
            .claim_script
            .key(counter_key)
            .key(value_key)
            .invoke_async(&mut self.conn())
            .await;

        match result {
            Ok(pair) => Ok(pair),
            Err(e) if e.to_string().contains("not an integer") => {
                Err(StoreError::NotAnInteger(counter_key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let _: i64 = ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let hash: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(hash)
    }

    async fn hgetall_matching(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, HashMap<String, String>>, StoreError> {
        let encoded: String = self
            .hgetall_script
            .arg(pattern)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(serde_json::from_str(&encoded)?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<Vec<bool>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                BatchOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
                BatchOp::Expire { key, ttl_seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*ttl_seconds);
                }
                BatchOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }

        let replies: Vec<::redis::Value> = pipe.query_async(&mut self.conn()).await?;

        // A discarded transaction answers with fewer replies than commands
        if replies.len() == ops.len() {
            Ok(vec![true; ops.len()])
        } else {
            tracing::warn!(
                "Atomic batch returned {} replies for {} commands",
                replies.len(),
                ops.len()
            );
            Ok(vec![false; ops.len()])
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let _: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!("Dropping non-text pub/sub payload: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a live server: `REDIS_URL=redis://localhost:6379 cargo test -- --ignored`

    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_decr_and_get() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = format!("mockwire-test:{}", uuid::Uuid::new_v4());
        let value_key = format!("{key}:value");

        assert_eq!(store.decr_and_get(&key, &value_key).await.unwrap(), (None, None));
        assert_eq!(store.get(&key).await.unwrap(), None);

        store.set(&key, "1").await.unwrap();
        store.set(&value_key, "v").await.unwrap();
        assert_eq!(
            store.decr_and_get(&key, &value_key).await.unwrap(),
            (Some(0), Some("v".to_string()))
        );
        store.del(&[key, value_key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_hgetall_matching() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let prefix = format!("mockwire-test:{}:", uuid::Uuid::new_v4());
        let key = format!("{prefix}watcher:agg");

        store.hset(&key, "f", "v").await.unwrap();
        let all = store
            .hgetall_matching(&format!("{prefix}watcher:*"))
            .await
            .unwrap();
        assert_eq!(all[&key]["f"], "v");

        let empty = store
            .hgetall_matching(&format!("{prefix}nothing:*"))
            .await
            .unwrap();
        assert!(empty.is_empty());
        store.del(&[key]).await.unwrap();
    }
}
