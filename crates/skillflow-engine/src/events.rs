//! Unified event emission: log lines, admin events and workflow UI events.
//!
//! Log and UI events are queued per thread and batch-persisted when the run
//! reaches a terminal status; admin events are in-memory fan-out only. The
//! bus emits asynchronously and every path tolerates a failed broadcast
//! without aborting execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;

use crate::errors::Result;

/// One log line scoped to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub thread_id: Option<String>,
    pub text: String,
    pub level: String,
    pub timestamp: DateTime<Utc>,
}

/// Structured workflow UI event; ids form a DAG via `parent_event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiEvent {
    pub thread_id: String,
    pub phase: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_step_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl UiEvent {
    pub fn new(thread_id: &str, phase: &str, payload: Value) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            phase: phase.to_string(),
            event_id: format!("{thread_id}:{phase}:{}", uuid::Uuid::new_v4()),
            parent_event_id: None,
            pipeline_step_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.pipeline_step_id = Some(step_id.into());
        self
    }
}

/// Durable sink for queued events.
#[async_trait]
pub trait EventArchive: Send + Sync {
    async fn insert_logs(&self, events: &[LogEvent]) -> Result<()>;
    async fn insert_ui_events(&self, events: &[UiEvent]) -> Result<()>;
    async fn list_logs(&self, thread_id: &str, limit: i64) -> Result<Vec<LogEvent>>;
}

struct Inner {
    log_tx: broadcast::Sender<LogEvent>,
    admin_tx: broadcast::Sender<Value>,
    log_buffer: Mutex<HashMap<String, Vec<LogEvent>>>,
    ui_buffer: Mutex<HashMap<String, Vec<UiEvent>>>,
    archive: RwLock<Option<Arc<dyn EventArchive>>>,
}

/// Cheap-to-clone handle shared by executors and the engine.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (log_tx, _) = broadcast::channel(1024);
        let (admin_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                log_tx,
                admin_tx,
                log_buffer: Mutex::new(HashMap::new()),
                ui_buffer: Mutex::new(HashMap::new()),
                archive: RwLock::new(None),
            }),
        }
    }

    pub fn set_archive(&self, archive: Arc<dyn EventArchive>) {
        *self.inner.archive.write().unwrap_or_else(|e| e.into_inner()) = Some(archive);
    }

    fn archive(&self) -> Option<Arc<dyn EventArchive>> {
        self.inner.archive.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Emit a run-scoped log line.
    pub fn log(&self, thread_id: Option<&str>, level: &str, text: impl Into<String>) {
        let event = LogEvent {
            thread_id: thread_id.map(String::from),
            text: text.into(),
            level: level.to_string(),
            timestamp: Utc::now(),
        };
        match level {
            "ERROR" => tracing::error!(thread_id = ?event.thread_id, "{}", event.text),
            "WARN" => tracing::warn!(thread_id = ?event.thread_id, "{}", event.text),
            _ => tracing::info!(thread_id = ?event.thread_id, "{}", event.text),
        }
        if let Some(tid) = &event.thread_id {
            self.inner
                .log_buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(tid.clone())
                .or_default()
                .push(event.clone());
        }
        let _ = self.inner.log_tx.send(event);
    }

    pub fn info(&self, thread_id: &str, text: impl Into<String>) {
        self.log(Some(thread_id), "INFO", text);
    }

    pub fn warn(&self, thread_id: &str, text: impl Into<String>) {
        self.log(Some(thread_id), "WARN", text);
    }

    /// Broadcast an admin event (run_started, run_cancelled, run_rejected,
    /// status_updated, ack). No durability.
    pub fn admin(&self, payload: Value) {
        let _ = self.inner.admin_tx.send(json!({"type": "run_event", "data": payload}));
    }

    /// Queue and broadcast a workflow UI event.
    pub fn ui(&self, event: UiEvent) {
        let broadcast_payload = json!({
            "type": "workflow_ui_update",
            "thread_id": event.thread_id,
            "phase": event.phase,
            "event_id": event.event_id,
            "parent_event_id": event.parent_event_id,
            "pipeline_step_id": event.pipeline_step_id,
            "timestamp": event.timestamp.to_rfc3339(),
            "data": event.payload,
        });
        self.inner
            .ui_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.thread_id.clone())
            .or_default()
            .push(event);
        let _ = self.inner.admin_tx.send(broadcast_payload);
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.log_tx.subscribe()
    }

    pub fn subscribe_admin(&self) -> broadcast::Receiver<Value> {
        self.inner.admin_tx.subscribe()
    }

    /// Drain the thread's queued events into the archive. Called when a run
    /// reaches terminal status; archive failures are logged and the queues
    /// are retained for the next attempt.
    pub async fn flush_thread(&self, thread_id: &str) {
        let Some(archive) = self.archive() else {
            self.drop_thread(thread_id);
            return;
        };
        let logs = {
            let mut buffer = self.inner.log_buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.remove(thread_id).unwrap_or_default()
        };
        if !logs.is_empty() {
            if let Err(err) = archive.insert_logs(&logs).await {
                tracing::warn!(thread_id = %thread_id, error = %err, "failed to persist thread logs");
                self.inner
                    .log_buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(thread_id.to_string())
                    .or_default()
                    .splice(0..0, logs);
            }
        }
        let ui_events = {
            let mut buffer = self.inner.ui_buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.remove(thread_id).unwrap_or_default()
        };
        if !ui_events.is_empty() {
            if let Err(err) = archive.insert_ui_events(&ui_events).await {
                tracing::warn!(thread_id = %thread_id, error = %err, "failed to persist workflow UI events");
                self.inner
                    .ui_buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(thread_id.to_string())
                    .or_default()
                    .splice(0..0, ui_events);
            }
        }
    }

    /// Drain every queued thread, called once at process start.
    pub async fn flush_all(&self) {
        let threads: Vec<String> = {
            let logs = self.inner.log_buffer.lock().unwrap_or_else(|e| e.into_inner());
            let uis = self.inner.ui_buffer.lock().unwrap_or_else(|e| e.into_inner());
            logs.keys().chain(uis.keys()).cloned().collect()
        };
        for thread_id in threads {
            self.flush_thread(&thread_id).await;
        }
    }

    fn drop_thread(&self, thread_id: &str) {
        self.inner
            .log_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id);
        self.inner
            .ui_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id);
    }

    pub async fn thread_logs(&self, thread_id: &str, limit: i64) -> Result<Vec<LogEvent>> {
        match self.archive() {
            Some(archive) => archive.list_logs(thread_id, limit).await,
            None => Ok(Vec::new()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// SQLite-backed event archive (`thread_logs`, `thread_workflow_ui_events`).
pub struct SqliteEventArchive {
    pool: SqlitePool,
}

impl SqliteEventArchive {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let archive = Self { pool };
        archive.setup().await?;
        Ok(archive)
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS thread_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT,
                message TEXT NOT NULL,
                level TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_thread_logs_thread ON thread_logs(thread_id, id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS thread_workflow_ui_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                event_id TEXT NOT NULL,
                parent_event_id TEXT,
                pipeline_step_id TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ui_events_thread ON thread_workflow_ui_events(thread_id, id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventArchive for SqliteEventArchive {
    async fn insert_logs(&self, events: &[LogEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO thread_logs (thread_id, message, level, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&event.thread_id)
            .bind(&event.text)
            .bind(&event.level)
            .bind(event.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_ui_events(&self, events: &[UiEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO thread_workflow_ui_events
                    (thread_id, phase, event_id, parent_event_id, pipeline_step_id, payload, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.thread_id)
            .bind(&event.phase)
            .bind(&event.event_id)
            .bind(&event.parent_event_id)
            .bind(&event.pipeline_step_id)
            .bind(event.payload.to_string())
            .bind(event.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_logs(&self, thread_id: &str, limit: i64) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, message, level, created_at
            FROM thread_logs
            WHERE thread_id = ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                LogEvent {
                    thread_id: row.get("thread_id"),
                    text: row.get("message"),
                    level: row.get("level"),
                    timestamp: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn bus_with_archive() -> EventBus {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let bus = EventBus::new();
        bus.set_archive(Arc::new(SqliteEventArchive::new(pool).await.unwrap()));
        bus
    }

    #[tokio::test]
    async fn test_logs_flush_to_archive_on_terminal_status() {
        let bus = bus_with_archive().await;
        bus.info("t1", "[PLANNER] Decision: sum");
        bus.warn("t1", "[EXECUTOR] extra key ignored");
        bus.info("t2", "[PLANNER] other thread");

        bus.flush_thread("t1").await;

        let logs = bus.thread_logs("t1", 100).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].text, "[PLANNER] Decision: sum");
        assert_eq!(logs[1].level, "WARN");
        assert!(bus.thread_logs("t2", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ui_events_broadcast_and_persist() {
        let bus = bus_with_archive().await;
        let mut rx = bus.subscribe_admin();
        let event = UiEvent::new("t1", "planner_decision", json!({"chosen_agent": "sum"}));
        let event_id = event.event_id.clone();
        bus.ui(event.clone().with_parent(event_id.clone()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], "workflow_ui_update");
        assert_eq!(received["phase"], "planner_decision");

        bus.flush_thread("t1").await;
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_tolerated() {
        let bus = EventBus::new();
        bus.admin(json!({"type": "run_started", "thread_id": "t1"}));
        bus.info("t1", "no archive configured");
        bus.flush_thread("t1").await;
    }
}
