//! Shared dependencies threaded through the planner, executors and pipeline
//! interpreter.

use std::sync::Arc;

use crate::actions::ActionRegistry;
use crate::credentials::CredentialVault;
use crate::events::EventBus;
use crate::llm::{ChatModel, ModelRegistry};
use crate::registry::SkillRegistry;

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL partners POST callbacks to; `/callback` is appended.
    pub callback_base_url: String,
    /// Global relational connection string, the data-query fallback when a
    /// skill names no credential.
    pub global_database_url: Option<String>,
    /// Global document-store connection string.
    pub global_mongo_url: Option<String>,
    /// Global redis connection string for redis-sourced queries.
    pub global_redis_url: Option<String>,
    /// Relational query pool bounds (per backing store).
    pub relational_pool_min: u32,
    pub relational_pool_max: u32,
    /// Document query pool bounds.
    pub document_pool_min: u32,
    pub document_pool_max: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8000".to_string(),
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

impl EngineConfig {
    /// The URL REST partners complete work through.
    pub fn callback_url(&self) -> String {
        format!("{}/callback", self.callback_base_url.trim_end_matches('/'))
    }
}

/// Everything an executor needs, cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub registry: Arc<SkillRegistry>,
    pub actions: Arc<ActionRegistry>,
    pub vault: Arc<dyn CredentialVault>,
    pub chat: Arc<dyn ChatModel>,
    pub models: Arc<ModelRegistry>,
    pub events: EventBus,
    pub http: reqwest::Client,
    pub config: Arc<EngineConfig>,
    /// Process-wide query pools, one per backing store.
    pub pools: Arc<crate::executors::query::QueryPools>,
}

/// Per-invocation environment handed down into executors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionEnv<'a> {
    pub sop: &'a str,
    pub thread_id: &'a str,
    pub workspace_id: Option<&'a str>,
    pub llm_model: Option<&'a str>,
    pub user_id: Option<&'a str>,
}
