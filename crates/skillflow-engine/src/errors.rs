use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] skillflow_core::CoreError),

    #[error("skill '{0}' not found")]
    SkillNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid skill: {0}")]
    InvalidSkill(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("inline code error: {0}")]
    InlineCode(String),

    #[error("skill execution failed: {0}")]
    Execution(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("invalid LLM model: {0}")]
    InvalidModel(String),

    #[error("checkpoint cache error: {0}")]
    Cache(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
