//! Health endpoint: per-backing-store pool utilization with
//! warning/critical thresholds.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

const WARNING_UTILIZATION: f64 = 75.0;
const CRITICAL_UTILIZATION: f64 = 90.0;

fn utilization_level(pct: f64) -> &'static str {
    if pct > CRITICAL_UTILIZATION {
        "critical"
    } else if pct > WARNING_UTILIZATION {
        "warning"
    } else {
        "ok"
    }
}

fn pool_block(size: u32, idle: u32, max: u32) -> Value {
    let max = max.max(1);
    let in_use = size.saturating_sub(idle);
    // Acquirers beyond the pool maximum queue; anything else is served.
    let waiting = in_use.saturating_sub(max);
    let pct = (in_use.min(max) as f64 / max as f64) * 100.0;
    json!({
        "size": size,
        "in_use": in_use,
        "available": idle,
        "waiting": waiting,
        "max": max,
        "utilization_pct": (pct * 10.0).round() / 10.0,
        "level": utilization_level(pct),
    })
}

pub async fn health_check(State(app): State<Arc<AppState>>) -> Json<Value> {
    let (relational, relational_healthy) = match &app.db {
        Some(pool) => (
            pool_block(pool.size(), pool.num_idle() as u32, app.config.relational_pool_max),
            !pool.is_closed(),
        ),
        None => (json!({"configured": false}), false),
    };

    // Query pools for data-query skills: relational targets plus the
    // document store.
    let query_stats = app.ctx().pools.stats().await;
    let mut query_relational = pool_block(
        query_stats.relational_size,
        query_stats.relational_idle,
        query_stats.relational_max,
    );
    query_relational["targets"] = json!(query_stats.relational_targets);
    query_relational["min"] = json!(query_stats.relational_min);
    let document_pool = json!({
        "min": query_stats.document_min,
        "max": query_stats.document_max,
        "clients": query_stats.document_clients,
        "established": query_stats.document_clients > 0,
        // The document driver bounds its own checkouts; waiting beyond the
        // configured maximum queues inside the client.
        "waiting": 0,
        "level": "ok",
    });

    let active_runs = app.run_tasks.lock().unwrap_or_else(|e| e.into_inner()).len();
    let status = if relational_healthy || app.db.is_none() { "healthy" } else { "degraded" };

    let mut recommendations: Vec<String> = Vec::new();
    for (name, block) in [
        ("relational pool", &relational),
        ("query relational pool", &query_relational),
    ] {
        match block["level"].as_str() {
            Some("critical") => recommendations
                .push(format!("{name} above 90% utilization; raise the pool maximum")),
            Some("warning") => {
                recommendations.push(format!("{name} above 75% utilization; monitor load"))
            }
            _ => {}
        }
    }

    Json(json!({
        "status": status,
        "uptime_seconds": app.started_at.elapsed().as_secs(),
        "checks": {
            "database": relational_healthy,
            "document_store": query_stats.document_clients > 0,
        },
        "details": {
            "relational_pool": relational,
            "query_relational_pool": query_relational,
            "document_pool": document_pool,
            "active_runs": active_runs,
        },
        "recommendations": recommendations,
    }))
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "skillflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
