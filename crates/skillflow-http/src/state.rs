//! Shared application state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use skillflow_engine::{
    ActionRegistry, BufferedCheckpointStore, CheckpointCache, ChatModel, EngineConfig,
    EngineContext, EventBus, GraphEngine, MemoryCheckpointCache, ModelRegistry,
    OpenAiChatModel, RedisCheckpointCache, SkillRegistry, SqliteCheckpointArchive,
    SqliteEventArchive, SystemErrorStore, WorkspaceDirectory,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::metadata::RunMetadataStore;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
    /// SQLite database file (`:memory:` supported). `None` disables the slow
    /// tier, run metadata and persisted logs.
    pub database_path: Option<String>,
    /// Redis URL for the checkpoint cache tier; absent falls back to the
    /// in-process buffer.
    pub redis_url: Option<String>,
    pub skills_dir: Option<PathBuf>,
    pub callback_base_url: String,
    pub default_model: String,
    pub allowed_models: Vec<String>,
    pub global_database_url: Option<String>,
    pub global_mongo_url: Option<String>,
    pub global_redis_url: Option<String>,
    pub relational_pool_min: u32,
    pub relational_pool_max: u32,
    pub document_pool_min: u32,
    pub document_pool_max: u32,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            enable_cors: true,
            enable_tracing: true,
            database_path: Some("~/.skillflow/skillflow.db".to_string()),
            redis_url: None,
            skills_dir: Some(PathBuf::from("skills")),
            callback_base_url: "http://localhost:8000".to_string(),
            default_model: "gpt-4o".to_string(),
            allowed_models: vec![
                "gpt-4o-mini".to_string(),
                "gpt-4.1".to_string(),
                "gpt-4.1-mini".to_string(),
            ],
            global_database_url: None,
            global_mongo_url: None,
            global_redis_url: None,
            relational_pool_min: 5,
            relational_pool_max: 15,
            document_pool_min: 5,
            document_pool_max: 20,
        }
    }
}

pub struct AppState {
    pub engine: GraphEngine,
    pub metadata: RunMetadataStore,
    pub workspaces: WorkspaceDirectory,
    pub system_errors: Option<Arc<SystemErrorStore>>,
    /// Live run tasks by thread id, for cancellation.
    pub run_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    pub started_at: Instant,
    pub config: HttpServerConfig,
    pub db: Option<SqlitePool>,
}

impl AppState {
    /// Build state with the production chat model.
    pub async fn new(config: HttpServerConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_chat(config, Arc::new(OpenAiChatModel::new())).await
    }

    /// Build state with an injected chat model (tests use scripted models).
    pub async fn with_chat(
        config: HttpServerConfig,
        chat: Arc<dyn ChatModel>,
    ) -> anyhow::Result<Arc<Self>> {
        let db = match &config.database_path {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if expanded != ":memory:" {
                    if let Some(parent) = std::path::Path::new(&expanded).parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                // In-memory databases are per-connection; the pool must not
                // fan out across connections.
                let (url, max_connections) = if expanded == ":memory:" {
                    ("sqlite::memory:".to_string(), 1)
                } else {
                    (format!("sqlite:{expanded}?mode=rwc"), config.relational_pool_max)
                };
                let pool = SqlitePoolOptions::new()
                    .min_connections(config.relational_pool_min.min(max_connections))
                    .max_connections(max_connections)
                    .connect(&url)
                    .await?;
                Some(pool)
            }
            None => None,
        };

        let events = EventBus::new();
        let cache: Arc<dyn CheckpointCache> = match &config.redis_url {
            Some(url) => match RedisCheckpointCache::connect(url).await {
                Ok(cache) => Arc::new(cache),
                Err(err) => {
                    tracing::warn!(error = %err, "redis cache unavailable; using in-process buffer");
                    Arc::new(MemoryCheckpointCache::new())
                }
            },
            None => Arc::new(MemoryCheckpointCache::new()),
        };

        let (checkpoint_archive, system_errors) = match &db {
            Some(pool) => {
                let archive: Arc<dyn skillflow_engine::CheckpointArchive> =
                    Arc::new(SqliteCheckpointArchive::new(pool.clone()).await?);
                let errors = Arc::new(SystemErrorStore::new(pool.clone()).await?);
                events.set_archive(Arc::new(SqliteEventArchive::new(pool.clone()).await?));
                (Some(archive), Some(errors))
            }
            None => (None, None),
        };

        let actions = Arc::new(ActionRegistry::new());
        let registry = Arc::new(SkillRegistry::new(
            config.skills_dir.clone(),
            db.clone(),
            actions.clone(),
        ));
        registry.setup().await?;
        registry.reload().await?;

        let workspaces = WorkspaceDirectory::new(db.clone()).await?;
        let models = Arc::new(ModelRegistry::new(
            config.default_model.clone(),
            config.allowed_models.clone(),
        ));
        let ctx = EngineContext {
            registry,
            actions,
            vault: Arc::new(skillflow_engine::EnvCredentialVault),
            chat,
            models,
            events: events.clone(),
            http: reqwest::Client::new(),
            config: Arc::new(EngineConfig {
                callback_base_url: config.callback_base_url.clone(),
                global_database_url: config.global_database_url.clone(),
                global_mongo_url: config.global_mongo_url.clone(),
                global_redis_url: config.global_redis_url.clone(),
                relational_pool_min: config.relational_pool_min,
                relational_pool_max: config.relational_pool_max,
                document_pool_min: config.document_pool_min,
                document_pool_max: config.document_pool_max,
            }),
            pools: Arc::new(skillflow_engine::QueryPools::new(
                config.relational_pool_min,
                config.relational_pool_max,
                config.document_pool_min,
                config.document_pool_max,
            )),
        };
        let checkpoints = Arc::new(BufferedCheckpointStore::new(
            Some(cache),
            checkpoint_archive,
            system_errors.clone(),
            events.clone(),
        ));

        // Startup recovery: flush whatever a previous process left behind.
        let recovered = checkpoints.recover().await;
        if recovered > 0 {
            tracing::info!(recovered, "recovered buffered checkpoint threads at startup");
        }
        events.flush_all().await;

        let metadata = RunMetadataStore::new(db.clone()).await?;
        Ok(Arc::new(Self {
            engine: GraphEngine::new(ctx, checkpoints),
            metadata,
            workspaces,
            system_errors,
            run_tasks: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            config,
            db,
        }))
    }

    pub fn ctx(&self) -> &EngineContext {
        self.engine.context()
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx().events
    }

    pub fn register_task(&self, thread_id: &str, handle: JoinHandle<()>) {
        self.run_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(thread_id.to_string(), handle);
    }

    pub fn take_task(&self, thread_id: &str) -> Option<JoinHandle<()>> {
        self.run_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id)
    }

    pub fn drop_task(&self, thread_id: &str) {
        self.run_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id);
    }
}
