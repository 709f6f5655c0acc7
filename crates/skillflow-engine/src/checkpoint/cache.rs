//! The cache tier: buffered JSON checkpoint copies with a sliding TTL so a
//! crash between writes does not lose recent checkpoints.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::{EngineError, Result};

/// Sliding TTL for buffered checkpoints, extended on every write.
pub const CACHE_TTL_SECONDS: i64 = 1800;

#[async_trait]
pub trait CheckpointCache: Send + Sync {
    async fn append(&self, thread_id: &str, payload: &Value) -> Result<()>;
    async fn get_all(&self, thread_id: &str) -> Result<Vec<Value>>;
    async fn delete(&self, thread_id: &str) -> Result<()>;
    /// Threads with buffered checkpoints, enumerated at startup recovery.
    async fn buffered_threads(&self) -> Result<Vec<String>>;
}

fn cache_key(thread_id: &str) -> String {
    format!("checkpoints:{thread_id}")
}

/// Redis-backed cache tier.
pub struct RedisCheckpointCache {
    manager: redis::aio::ConnectionManager,
    ttl_seconds: i64,
}

impl RedisCheckpointCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| EngineError::Cache(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| EngineError::Cache(format!("cannot connect to redis: {e}")))?;
        tracing::info!(url = %url, "checkpoint cache connected");
        Ok(Self { manager, ttl_seconds: CACHE_TTL_SECONDS })
    }
}

#[async_trait]
impl CheckpointCache for RedisCheckpointCache {
    async fn append(&self, thread_id: &str, payload: &Value) -> Result<()> {
        let mut conn = self.manager.clone();
        let key = cache_key(thread_id);
        let encoded = payload.to_string();
        let count: i64 = conn
            .rpush(&key, encoded)
            .await
            .map_err(|e| EngineError::Cache(e.to_string()))?;
        let _: bool = conn
            .expire(&key, self.ttl_seconds)
            .await
            .map_err(|e| EngineError::Cache(e.to_string()))?;
        tracing::debug!(thread_id = %thread_id, count, "buffered checkpoint");
        Ok(())
    }

    async fn get_all(&self, thread_id: &str) -> Result<Vec<Value>> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = conn
            .lrange(cache_key(thread_id), 0, -1)
            .await
            .map_err(|e| EngineError::Cache(e.to_string()))?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(EngineError::from))
            .collect()
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .del(cache_key(thread_id))
            .await
            .map_err(|e| EngineError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn buffered_threads(&self) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut threads = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("checkpoints:*")
                .query_async(&mut conn)
                .await
                .map_err(|e| EngineError::Cache(e.to_string()))?;
            threads.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix("checkpoints:").map(String::from)),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(threads)
    }
}

/// In-process cache tier used when redis is not configured and in tests.
#[derive(Default)]
pub struct MemoryCheckpointCache {
    entries: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryCheckpointCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointCache for MemoryCheckpointCache {
    async fn append(&self, thread_id: &str, payload: &Value) -> Result<()> {
        // Enforce the strict-JSON invariant the redis tier gets for free.
        let encoded = payload.to_string();
        let reparsed: Value = serde_json::from_str(&encoded)?;
        self.entries
            .lock()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push(reparsed);
        Ok(())
    }

    async fn get_all(&self, thread_id: &str) -> Result<Vec<Value>> {
        Ok(self.entries.lock().await.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.entries.lock().await.remove(thread_id);
        Ok(())
    }

    async fn buffered_threads(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCheckpointCache::new();
        cache.append("t1", &json!({"n": 1})).await.unwrap();
        cache.append("t1", &json!({"n": 2})).await.unwrap();
        cache.append("t2", &json!({"n": 3})).await.unwrap();

        let entries = cache.get_all("t1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["n"], 1);

        let mut threads = cache.buffered_threads().await.unwrap();
        threads.sort();
        assert_eq!(threads, vec!["t1", "t2"]);

        cache.delete("t1").await.unwrap();
        assert!(cache.get_all("t1").await.unwrap().is_empty());
    }
}
