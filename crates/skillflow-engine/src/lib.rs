//! skillflow-engine: skill registry, executors, pipeline interpreter,
//! durable checkpointing, events, and the planner-driven graph engine.

pub mod actions;
pub mod checkpoint;
pub mod context;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod executors;
pub mod graph;
pub mod llm;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod system_errors;
pub mod workspaces;

pub use actions::ActionRegistry;
pub use checkpoint::{
    BufferedCheckpointStore, CheckpointArchive, CheckpointCache, MemoryCheckpointCache,
    RedisCheckpointCache, SqliteCheckpointArchive, StoredCheckpoint,
};
pub use context::{EngineConfig, EngineContext, ExecutionEnv};
pub use executors::query::{QueryPoolStats, QueryPools};
pub use credentials::{CredentialVault, EnvCredentialVault};
pub use errors::{EngineError, Result};
pub use events::{EventArchive, EventBus, LogEvent, SqliteEventArchive, UiEvent};
pub use graph::{GraphEngine, RunOutcome};
pub use llm::{ChatModel, ChatRequest, ChatResponse, ModelRegistry, OpenAiChatModel};
pub use registry::{SaveSkillRequest, SkillRegistry};
pub use system_errors::{SystemErrorRow, SystemErrorStore};
pub use workspaces::{WorkspaceDirectory, WorkspaceRecord};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use skillflow_core::Skill;

    use crate::actions::ActionRegistry;
    use crate::context::{EngineConfig, EngineContext};
    use crate::credentials::EnvCredentialVault;
    use crate::errors::{EngineError, Result};
    use crate::events::EventBus;
    use crate::llm::{ChatModel, ChatRequest, ChatResponse, ModelRegistry};
    use crate::registry::SkillRegistry;

    /// Chat model that never returns tool calls and answers `{}`.
    pub struct StaticChat;

    impl StaticChat {
        pub fn silent() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ChatModel for StaticChat {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse { content: Some("{}".to_string()), tool_calls: vec![] })
        }
    }

    /// Scripted chat model that records every request it serves. Running out
    /// of scripted responses is an error so tests fail loudly.
    pub struct RecordingChat {
        responses: Mutex<VecDeque<ChatResponse>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl RecordingChat {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn requests(&self) -> Arc<Mutex<Vec<ChatRequest>>> {
            self.requests.clone()
        }
    }

    #[async_trait]
    impl ChatModel for RecordingChat {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(request);
            self.responses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| EngineError::Llm("scripted chat exhausted".into()))
        }
    }

    pub fn test_context(chat: impl ChatModel + 'static) -> EngineContext {
        let actions = Arc::new(ActionRegistry::new());
        EngineContext {
            registry: Arc::new(SkillRegistry::new(None, None, actions.clone())),
            actions,
            vault: Arc::new(EnvCredentialVault),
            chat: Arc::new(chat),
            models: Arc::new(ModelRegistry::default()),
            events: EventBus::new(),
            http: reqwest::Client::new(),
            config: Arc::new(EngineConfig::default()),
            pools: Arc::new(crate::executors::query::QueryPools::default()),
        }
    }

    pub fn context_with_skills(chat: impl ChatModel + 'static, skills: Vec<Skill>) -> EngineContext {
        let ctx = test_context(chat);
        ctx.registry.install(skills);
        ctx
    }
}
