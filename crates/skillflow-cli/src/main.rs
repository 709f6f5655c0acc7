//! `skillflow` binary: serves the orchestrator API.

mod config;

use clap::{Parser, Subcommand};
use skillflow_http::HttpServer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skillflow", version, about = "Durable, planner-driven workflow orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator API server.
    Serve(config::ServeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = config::load(&args)?;
            tracing::info!(
                host = %config.host,
                port = config.port,
                skills_dir = ?config.skills_dir,
                "starting skillflow"
            );
            HttpServer::new(config).run().await
        }
    }
}
