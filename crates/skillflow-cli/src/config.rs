//! Server configuration: defaults, optional TOML file, environment and CLI
//! flag overrides (flags win over file values).

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use skillflow_http::HttpServerConfig;

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to a TOML configuration file.
    #[arg(long, env = "SKILLFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "SKILLFLOW_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "SKILLFLOW_PORT")]
    pub port: Option<u16>,

    /// SQLite database file for metadata, checkpoints and logs.
    #[arg(long, env = "SKILLFLOW_DATABASE_PATH")]
    pub database_path: Option<String>,

    /// Redis URL for the checkpoint cache tier.
    #[arg(long, env = "SKILLFLOW_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Directory of filesystem skill manifests.
    #[arg(long, env = "SKILLFLOW_SKILLS_DIR")]
    pub skills_dir: Option<PathBuf>,

    /// Base URL partners POST REST callbacks to.
    #[arg(long, env = "SKILLFLOW_CALLBACK_BASE_URL")]
    pub callback_base_url: Option<String>,

    /// Global relational connection string for data-query skills.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    database_path: Option<String>,
    redis_url: Option<String>,
    skills_dir: Option<PathBuf>,
    callback_base_url: Option<String>,
    default_model: Option<String>,
    allowed_models: Option<Vec<String>>,
    global_database_url: Option<String>,
    global_mongo_url: Option<String>,
    global_redis_url: Option<String>,
    relational_pool_min: Option<u32>,
    relational_pool_max: Option<u32>,
    document_pool_min: Option<u32>,
    document_pool_max: Option<u32>,
    enable_cors: Option<bool>,
}

pub fn load(args: &ServeArgs) -> anyhow::Result<HttpServerConfig> {
    let file: FileConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let mut config = HttpServerConfig::default();
    if let Some(host) = file.host {
        config.host = host;
    }
    if let Some(port) = file.port {
        config.port = port;
    }
    if let Some(path) = file.database_path {
        config.database_path = Some(path);
    }
    if let Some(url) = file.redis_url {
        config.redis_url = Some(url);
    }
    if let Some(dir) = file.skills_dir {
        config.skills_dir = Some(dir);
    }
    if let Some(url) = file.callback_base_url {
        config.callback_base_url = url;
    }
    if let Some(model) = file.default_model {
        config.default_model = model;
    }
    if let Some(models) = file.allowed_models {
        config.allowed_models = models;
    }
    if let Some(url) = file.global_database_url {
        config.global_database_url = Some(url);
    }
    if let Some(url) = file.global_mongo_url {
        config.global_mongo_url = Some(url);
    }
    if let Some(url) = file.global_redis_url {
        config.global_redis_url = Some(url);
    }
    if let Some(min) = file.relational_pool_min {
        config.relational_pool_min = min;
    }
    if let Some(max) = file.relational_pool_max {
        config.relational_pool_max = max;
    }
    if let Some(min) = file.document_pool_min {
        config.document_pool_min = min;
    }
    if let Some(max) = file.document_pool_max {
        config.document_pool_max = max;
    }
    if let Some(cors) = file.enable_cors {
        config.enable_cors = cors;
    }

    // CLI flags and environment override the file.
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = &args.database_path {
        config.database_path = Some(path.clone());
    }
    if let Some(url) = &args.redis_url {
        config.redis_url = Some(url.clone());
    }
    if let Some(dir) = &args.skills_dir {
        config.skills_dir = Some(dir.clone());
    }
    if let Some(url) = &args.callback_base_url {
        config.callback_base_url = url.clone();
    }
    if let Some(url) = &args.database_url {
        config.global_database_url = Some(url.clone());
    }
    Ok(config)
}
