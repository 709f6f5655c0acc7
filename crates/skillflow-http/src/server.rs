//! Router assembly and server entry point.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::{AppState, HttpServerConfig};
use crate::{admin, callback, health, runs, skills};

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/start", post(runs::start))
        .route("/stop/:thread_id", post(runs::stop))
        .route("/rerun/:thread_id", post(runs::rerun))
        .route("/status/:thread_id", get(runs::status))
        .route("/approve/:thread_id", post(runs::approve))
        .route("/callback", post(callback::rest_callback))
        .route("/skills", get(skills::list_skills).post(skills::save_skill))
        .route("/demo/rest-task", post(callback::demo_rest_task))
        .route("/health", get(health::health_check))
        .route("/logs/:thread_id", get(admin::thread_logs))
        .route("/admin/runs", get(admin::list_runs))
        .route("/admin/runs/:thread_id", get(admin::run_detail))
        .route("/admin/system-errors", get(admin::list_system_errors))
        .route("/admin/system-errors/:error_id/resolve", post(admin::resolve_system_error))
        .with_state(state)
}

pub struct HttpServer {
    config: HttpServerConfig,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let state = AppState::new(self.config.clone()).await?;

        let mut app = create_app(state);
        if self.config.enable_cors {
            app = app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }
        if self.config.enable_tracing {
            app = app.layer(TraceLayer::new_for_http());
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(
            address = %addr,
            cors = self.config.enable_cors,
            tracing = self.config.enable_tracing,
            "orchestrator API starting"
        );
        axum::serve(listener, app).await?;
        Ok(())
    }
}
