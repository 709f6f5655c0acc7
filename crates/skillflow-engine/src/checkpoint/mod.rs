//! Durable, versioned per-thread state snapshots.
//!
//! Write path: every state transition lands in the fast in-memory tier and
//! is buffered as sanitized JSON to the cache tier (sliding TTL). When a run
//! reaches terminal status the buffer drains into the slow tier in one
//! idempotent batch and the fast tier is purged to bound memory. Startup
//! recovery performs the same flush for every thread left in the cache.

pub mod archive;
pub mod cache;
pub mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use skillflow_core::RunState;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::Result;
use crate::events::EventBus;
use crate::system_errors::SystemErrorStore;
pub use archive::{CheckpointArchive, SqliteCheckpointArchive, StoredCheckpoint};
pub use cache::{CheckpointCache, MemoryCheckpointCache, RedisCheckpointCache, CACHE_TTL_SECONDS};

pub struct BufferedCheckpointStore {
    fast: RwLock<HashMap<String, Vec<StoredCheckpoint>>>,
    cache: Option<Arc<dyn CheckpointCache>>,
    archive: Option<Arc<dyn CheckpointArchive>>,
    system_errors: Option<Arc<SystemErrorStore>>,
    events: EventBus,
}

impl BufferedCheckpointStore {
    pub fn new(
        cache: Option<Arc<dyn CheckpointCache>>,
        archive: Option<Arc<dyn CheckpointArchive>>,
        system_errors: Option<Arc<SystemErrorStore>>,
        events: EventBus,
    ) -> Self {
        Self { fast: RwLock::new(HashMap::new()), cache, archive, system_errors, events }
    }

    /// Record a state transition: fast tier first, then a sanitized JSON
    /// copy to the cache tier. Cache failures never fail the transition.
    pub async fn put(&self, state: &RunState, metadata: Value) -> Result<StoredCheckpoint> {
        let mut state_json = serde_json::to_value(state)?;
        sanitize::sanitize(&mut state_json);
        let mut metadata = metadata;
        sanitize::sanitize(&mut metadata);

        let checkpoint = {
            let mut fast = self.fast.write().await;
            let entries = fast.entry(state.thread_id.clone()).or_default();
            let checkpoint = StoredCheckpoint {
                thread_id: state.thread_id.clone(),
                namespace: String::new(),
                checkpoint_id: Uuid::new_v4().to_string(),
                parent_checkpoint_id: entries.last().map(|cp| cp.checkpoint_id.clone()),
                state: state_json,
                metadata,
                write_ordinal: entries.len() as i64,
                created_at: Utc::now(),
            };
            entries.push(checkpoint.clone());
            checkpoint
        };

        if let Some(cache) = &self.cache {
            let payload = serde_json::to_value(&checkpoint)?;
            if let Err(err) = cache.append(&checkpoint.thread_id, &payload).await {
                tracing::warn!(
                    thread_id = %checkpoint.thread_id,
                    error = %err,
                    "failed to buffer checkpoint to cache tier"
                );
            }
        }
        Ok(checkpoint)
    }

    /// Most recent checkpoint for a thread: fast tier, then cache, then the
    /// slow tier (post-restart reads).
    pub async fn latest(&self, thread_id: &str) -> Result<Option<StoredCheckpoint>> {
        if let Some(cp) = self.fast.read().await.get(thread_id).and_then(|v| v.last()).cloned() {
            return Ok(Some(cp));
        }
        if let Some(cache) = &self.cache {
            let buffered = cache.get_all(thread_id).await.unwrap_or_default();
            if let Some(last) = buffered.last() {
                return Ok(Some(serde_json::from_value(last.clone())?));
            }
        }
        if let Some(archive) = &self.archive {
            let mut listed = archive.list(thread_id, 1).await?;
            return Ok(listed.pop());
        }
        Ok(None)
    }

    /// Deserialize the most recent run state for a thread.
    pub async fn latest_state(&self, thread_id: &str) -> Result<Option<RunState>> {
        match self.latest(thread_id).await? {
            Some(cp) => Ok(Some(serde_json::from_value(cp.state)?)),
            None => Ok(None),
        }
    }

    /// Checkpoints in reverse chronological order.
    pub async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<StoredCheckpoint>> {
        let fast = self.fast.read().await;
        if let Some(entries) = fast.get(thread_id) {
            return Ok(entries.iter().rev().take(limit).cloned().collect());
        }
        drop(fast);
        if let Some(archive) = &self.archive {
            return archive.list(thread_id, limit as i64).await;
        }
        Ok(Vec::new())
    }

    /// Drain the thread's buffered checkpoints into the slow tier, then clear
    /// both the cache copy and the fast tier. On failure the cache copy is
    /// preserved for the next startup recovery and the failure is recorded
    /// for admins plus broadcast so the UI can show "logs may be incomplete".
    pub async fn flush_thread(&self, thread_id: &str) {
        let checkpoints: Vec<StoredCheckpoint> = {
            let fast = self.fast.read().await;
            fast.get(thread_id).cloned().unwrap_or_default()
        };
        let checkpoints = if checkpoints.is_empty() {
            self.cached_checkpoints(thread_id).await
        } else {
            checkpoints
        };
        if checkpoints.is_empty() {
            self.purge(thread_id).await;
            return;
        }

        let Some(archive) = &self.archive else {
            self.report_flush_failure(thread_id, "warning", "no slow tier configured", checkpoints.len())
                .await;
            self.purge(thread_id).await;
            return;
        };

        match archive.insert_batch(&checkpoints).await {
            Ok(()) => {
                if let Some(cache) = &self.cache {
                    if let Err(err) = cache.delete(thread_id).await {
                        tracing::warn!(thread_id = %thread_id, error = %err, "failed to clear checkpoint cache");
                    }
                }
                self.purge(thread_id).await;
                tracing::info!(
                    thread_id = %thread_id,
                    count = checkpoints.len(),
                    "flushed checkpoints to slow tier"
                );
            }
            Err(err) => {
                self.report_flush_failure(thread_id, "critical", &err.to_string(), checkpoints.len())
                    .await;
                // Cache copy stays for the next process start.
                self.purge(thread_id).await;
            }
        }
    }

    /// Startup recovery: flush every thread still present in the cache tier.
    /// Partial failures are reported but never block startup.
    pub async fn recover(&self) -> usize {
        let Some(cache) = &self.cache else { return 0 };
        let threads = match cache.buffered_threads().await {
            Ok(threads) => threads,
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint recovery could not enumerate cache");
                return 0;
            }
        };
        if threads.is_empty() {
            return 0;
        }
        tracing::info!(count = threads.len(), "recovering buffered checkpoint threads");
        let mut recovered = 0usize;
        for thread_id in threads {
            let checkpoints = self.cached_checkpoints(&thread_id).await;
            if checkpoints.is_empty() {
                let _ = cache.delete(&thread_id).await;
                continue;
            }
            let Some(archive) = &self.archive else {
                self.report_flush_failure(&thread_id, "warning", "no slow tier configured", checkpoints.len())
                    .await;
                continue;
            };
            match archive.insert_batch(&checkpoints).await {
                Ok(()) => {
                    let _ = cache.delete(&thread_id).await;
                    recovered += 1;
                    tracing::info!(thread_id = %thread_id, count = checkpoints.len(), "recovered thread");
                }
                Err(err) => {
                    self.report_flush_failure(&thread_id, "critical", &err.to_string(), checkpoints.len())
                        .await;
                }
            }
        }
        recovered
    }

    /// Clear the fast tier for a thread to bound memory.
    pub async fn purge(&self, thread_id: &str) {
        self.fast.write().await.remove(thread_id);
    }

    async fn cached_checkpoints(&self, thread_id: &str) -> Vec<StoredCheckpoint> {
        let Some(cache) = &self.cache else { return Vec::new() };
        match cache.get_all(thread_id).await {
            Ok(payloads) => payloads
                .into_iter()
                .filter_map(|payload| match serde_json::from_value(payload) {
                    Ok(cp) => Some(cp),
                    Err(err) => {
                        tracing::warn!(thread_id = %thread_id, error = %err, "skipping malformed buffered checkpoint");
                        None
                    }
                })
                .collect(),
            Err(err) => {
                tracing::warn!(thread_id = %thread_id, error = %err, "failed to read checkpoint cache");
                Vec::new()
            }
        }
    }

    async fn report_flush_failure(&self, thread_id: &str, severity: &str, message: &str, count: usize) {
        tracing::error!(thread_id = %thread_id, severity, count, "checkpoint flush failed: {message}");
        if let Some(store) = &self.system_errors {
            let context = json!({"checkpoint_count": count});
            if let Err(err) = store
                .record("checkpoint_flush_error", severity, Some(thread_id), message, Some(&context))
                .await
            {
                tracing::warn!(error = %err, "failed to record checkpoint flush system error");
            }
        }
        self.events.admin(json!({
            "type": "status_updated",
            "thread_id": thread_id,
            "warning": "checkpoint flush failed; logs may be incomplete",
            "severity": severity,
        }));
    }
}

/// Failing archive used to assert failure semantics without real I/O.
#[cfg(test)]
struct BrokenArchive;

#[cfg(test)]
#[async_trait::async_trait]
impl CheckpointArchive for BrokenArchive {
    async fn insert_batch(&self, _checkpoints: &[StoredCheckpoint]) -> Result<()> {
        Err(crate::errors::EngineError::Cache("slow tier unavailable".into()))
    }
    async fn list(&self, _thread_id: &str, _limit: i64) -> Result<Vec<StoredCheckpoint>> {
        Ok(Vec::new())
    }
    async fn delete_thread(&self, _thread_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_archive() -> Arc<SqliteCheckpointArchive> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Arc::new(SqliteCheckpointArchive::new(pool).await.unwrap())
    }

    fn state(thread: &str) -> RunState {
        RunState::new(thread, "Run the test workflow", Map::new())
    }

    #[tokio::test]
    async fn test_put_links_parents_and_orders_writes() {
        let store = BufferedCheckpointStore::new(
            Some(Arc::new(MemoryCheckpointCache::new())),
            None,
            None,
            EventBus::new(),
        );
        let first = store.put(&state("t1"), json!({"source": "planner"})).await.unwrap();
        let second = store.put(&state("t1"), json!({"source": "executor"})).await.unwrap();
        assert_eq!(first.write_ordinal, 0);
        assert_eq!(second.write_ordinal, 1);
        assert_eq!(second.parent_checkpoint_id.as_deref(), Some(first.checkpoint_id.as_str()));

        let latest = store.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        let listed = store.list("t1", 10).await.unwrap();
        assert_eq!(listed[0].checkpoint_id, second.checkpoint_id);
    }

    #[tokio::test]
    async fn test_flush_moves_buffer_to_archive_and_purges() {
        let cache = Arc::new(MemoryCheckpointCache::new());
        let archive = sqlite_archive().await;
        let store = BufferedCheckpointStore::new(
            Some(cache.clone()),
            Some(archive.clone()),
            None,
            EventBus::new(),
        );
        store.put(&state("t1"), json!({"source": "planner"})).await.unwrap();
        store.put(&state("t1"), json!({"source": "executor"})).await.unwrap();

        store.flush_thread("t1").await;

        assert!(cache.get_all("t1").await.unwrap().is_empty());
        let archived = archive.list("t1", 10).await.unwrap();
        assert_eq!(archived.len(), 2);
        // Fast tier purged; reads now come from the archive.
        let latest = store.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.write_ordinal, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_cache_and_records_system_error() {
        let cache = Arc::new(MemoryCheckpointCache::new());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let errors = Arc::new(SystemErrorStore::new(pool).await.unwrap());
        let bus = EventBus::new();
        let mut rx = bus.subscribe_admin();
        let store = BufferedCheckpointStore::new(
            Some(cache.clone()),
            Some(Arc::new(BrokenArchive)),
            Some(errors.clone()),
            bus,
        );
        store.put(&state("t1"), json!({})).await.unwrap();

        store.flush_thread("t1").await;

        // Cache retained for the next startup recovery.
        assert_eq!(cache.get_all("t1").await.unwrap().len(), 1);
        let recorded = errors.list(false, 10).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].severity, "critical");
        let broadcast = rx.recv().await.unwrap();
        assert!(broadcast["data"]["warning"].as_str().unwrap().contains("logs may be incomplete"));
    }

    #[tokio::test]
    async fn test_startup_recovery_flushes_cache_into_archive() {
        let cache = Arc::new(MemoryCheckpointCache::new());
        let archive = sqlite_archive().await;

        // A previous process buffered checkpoints, then died before flushing.
        {
            let crashed = BufferedCheckpointStore::new(Some(cache.clone()), None, None, EventBus::new());
            crashed.put(&state("t1"), json!({"source": "planner"})).await.unwrap();
            crashed.put(&state("t1"), json!({"source": "executor"})).await.unwrap();
            crashed.put(&state("t2"), json!({"source": "planner"})).await.unwrap();
        }

        let store = BufferedCheckpointStore::new(
            Some(cache.clone()),
            Some(archive.clone()),
            None,
            EventBus::new(),
        );
        let recovered = store.recover().await;
        assert_eq!(recovered, 2);
        assert_eq!(archive.list("t1", 10).await.unwrap().len(), 2);
        assert_eq!(archive.list("t2", 10).await.unwrap().len(), 1);
        assert!(cache.buffered_threads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_payloads_are_strict_json() {
        let cache = Arc::new(MemoryCheckpointCache::new());
        let store = BufferedCheckpointStore::new(Some(cache.clone()), None, None, EventBus::new());
        let mut s = state("t1");
        s.data_store.insert("ratio".into(), sanitize::number(f64::NAN));
        store.put(&s, json!({})).await.unwrap();
        let payloads = cache.get_all("t1").await.unwrap();
        let encoded = payloads[0].to_string();
        let reparsed: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed["state"]["data_store"]["ratio"], Value::Null);
    }
}
