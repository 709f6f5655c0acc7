//! Data-query executor: single queries against postgres, mysql, mongodb or
//! redis, with `{dot.notation}` templates rendered from the input context.
//!
//! Selects return `{query_result: [row...], row_count: N}`, writes return
//! `{affected_rows: N}`.

use std::collections::HashMap;

use futures::TryStreamExt;
use serde_json::{Map, Value};
use skillflow_core::paths::render_template;
use skillflow_core::{ActionConfig, PipelineStep};
use sqlx::{Column, Row};
use tokio::sync::Mutex;

use crate::checkpoint::sanitize;
use crate::context::EngineContext;
use crate::credentials::{expose, resolve_database_url, CredentialSource};
use crate::errors::{EngineError, Result};

/// Process-wide connection pools for query targets, one pool per backing
/// store URL. Sizes come from engine configuration.
pub struct QueryPools {
    relational_min: u32,
    relational_max: u32,
    document_min: u32,
    document_max: u32,
    postgres: Mutex<HashMap<String, sqlx::PgPool>>,
    mysql: Mutex<HashMap<String, sqlx::MySqlPool>>,
    mongo: Mutex<HashMap<String, mongodb::Client>>,
}

impl QueryPools {
    pub fn new(relational_min: u32, relational_max: u32, document_min: u32, document_max: u32) -> Self {
        Self {
            relational_min,
            relational_max,
            document_min,
            document_max,
            postgres: Mutex::new(HashMap::new()),
            mysql: Mutex::new(HashMap::new()),
            mongo: Mutex::new(HashMap::new()),
        }
    }

    async fn postgres(&self, url: &str) -> Result<sqlx::PgPool> {
        let mut pools = self.postgres.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(self.relational_min)
            .max_connections(self.relational_max)
            .connect(url)
            .await
            .map_err(|e| EngineError::Execution(format!("Postgres connection failed: {e}")))?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }

    async fn mysql(&self, url: &str) -> Result<sqlx::MySqlPool> {
        let mut pools = self.mysql.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .min_connections(self.relational_min)
            .max_connections(self.relational_max)
            .connect(url)
            .await
            .map_err(|e| EngineError::Execution(format!("MySQL connection failed: {e}")))?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }

    async fn mongo(&self, url: &str) -> Result<mongodb::Client> {
        let mut pools = self.mongo.lock().await;
        if let Some(client) = pools.get(url) {
            return Ok(client.clone());
        }
        let mut options = mongodb::options::ClientOptions::parse(url).await?;
        options.min_pool_size = Some(self.document_min);
        options.max_pool_size = Some(self.document_max);
        let client = mongodb::Client::with_options(options)?;
        pools.insert(url.to_string(), client.clone());
        Ok(client)
    }

    /// Snapshot for the health endpoint: configured bounds plus how many
    /// backing-store targets have an established pool or client.
    pub async fn stats(&self) -> QueryPoolStats {
        let postgres = self.postgres.lock().await;
        let mysql = self.mysql.lock().await;
        let mongo = self.mongo.lock().await;
        let (mut relational_size, mut relational_idle) = (0u32, 0u32);
        for pool in postgres.values() {
            relational_size += pool.size();
            relational_idle += pool.num_idle() as u32;
        }
        for pool in mysql.values() {
            relational_size += pool.size();
            relational_idle += pool.num_idle() as u32;
        }
        QueryPoolStats {
            relational_min: self.relational_min,
            relational_max: self.relational_max,
            relational_targets: postgres.len() + mysql.len(),
            relational_size,
            relational_idle,
            document_min: self.document_min,
            document_max: self.document_max,
            document_clients: mongo.len(),
        }
    }
}

/// Pool observability snapshot, one entry per backing store kind.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryPoolStats {
    pub relational_min: u32,
    pub relational_max: u32,
    /// Distinct relational URLs with an established pool.
    pub relational_targets: usize,
    /// Open connections across all relational query pools.
    pub relational_size: u32,
    pub relational_idle: u32,
    pub document_min: u32,
    pub document_max: u32,
    /// Distinct document-store URLs with an established client.
    pub document_clients: usize,
}

impl Default for QueryPools {
    fn default() -> Self {
        Self::new(5, 15, 5, 20)
    }
}

/// Source + template for one query, borrowed from either an action config or
/// a pipeline step.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec<'a> {
    pub source: Option<&'a str>,
    pub query: Option<&'a str>,
    pub collection: Option<&'a str>,
    pub filter: Option<&'a Map<String, Value>>,
    pub credential_ref: Option<&'a str>,
    pub db_config_file: Option<&'a str>,
}

impl<'a> QuerySpec<'a> {
    pub fn from_action(action: &'a ActionConfig) -> Self {
        Self {
            source: action.source.as_deref(),
            query: action.query.as_deref(),
            collection: action.collection.as_deref(),
            filter: action.filter.as_ref(),
            credential_ref: action.credential_ref.as_deref(),
            db_config_file: action.db_config_file.as_deref(),
        }
    }

    pub fn from_step(step: &'a PipelineStep, default_credential: Option<&'a str>, default_config: Option<&'a str>) -> Self {
        Self {
            source: step.source.as_deref(),
            query: step.query.as_deref(),
            collection: step.collection.as_deref(),
            filter: step.filter.as_ref(),
            credential_ref: step.credential_ref.as_deref().or(default_credential),
            db_config_file: step.db_config_file.as_deref().or(default_config),
        }
    }
}

pub async fn execute(
    ctx: &EngineContext,
    spec: &QuerySpec<'_>,
    inputs: &Map<String, Value>,
    user_id: Option<&str>,
) -> Result<Map<String, Value>> {
    let source = spec
        .source
        .ok_or_else(|| EngineError::Execution("data_query action requires a 'source' field".into()))?
        .to_lowercase();
    let credentials = CredentialSource {
        credential_ref: spec.credential_ref,
        db_config_file: spec.db_config_file,
    };
    match source.as_str() {
        "postgres" => {
            let url = resolve_database_url(
                credentials,
                ctx.vault.as_ref(),
                user_id,
                ctx.config.global_database_url.as_deref(),
                "postgres",
            )
            .await?;
            execute_postgres(ctx, spec, inputs, expose(&url)).await
        }
        "mysql" => {
            let url = resolve_database_url(
                credentials,
                ctx.vault.as_ref(),
                user_id,
                ctx.config.global_database_url.as_deref(),
                "mysql",
            )
            .await?;
            execute_mysql(ctx, spec, inputs, expose(&url)).await
        }
        "mongodb" => {
            let url = resolve_database_url(
                credentials,
                ctx.vault.as_ref(),
                user_id,
                ctx.config.global_mongo_url.as_deref(),
                "mongodb",
            )
            .await?;
            execute_mongodb(ctx, spec, inputs, expose(&url)).await
        }
        "redis" => {
            let url = resolve_database_url(
                credentials,
                ctx.vault.as_ref(),
                user_id,
                ctx.config.global_redis_url.as_deref(),
                "redis",
            )
            .await?;
            execute_redis(spec, inputs, expose(&url)).await
        }
        other => Err(EngineError::Execution(format!("Unknown data source: {other}"))),
    }
}

fn rendered_query(spec: &QuerySpec<'_>, inputs: &Map<String, Value>) -> Result<String> {
    let template = spec
        .query
        .ok_or_else(|| EngineError::Execution("query source requires a 'query' field".into()))?;
    Ok(render_template(template, inputs)?)
}

fn is_read_statement(query: &str) -> bool {
    let head = query.trim_start().to_uppercase();
    ["SELECT", "WITH", "SHOW", "EXPLAIN", "PRAGMA"].iter().any(|kw| head.starts_with(kw))
}

async fn execute_postgres(
    ctx: &EngineContext,
    spec: &QuerySpec<'_>,
    inputs: &Map<String, Value>,
    url: &str,
) -> Result<Map<String, Value>> {
    let query = rendered_query(spec, inputs)?;
    let pool = ctx.pools.postgres(url).await?;
    let result = if is_read_statement(&query) {
        let rows = sqlx::query(&query)
            .fetch_all(&pool)
            .await
            .map_err(|e| EngineError::Execution(format!("Postgres query failed: {e}")))?;
        let decoded: Vec<Value> = rows.iter().map(|row| Value::Object(pg_row_to_json(row))).collect();
        let count = decoded.len();
        json_result(decoded, count)
    } else {
        let done = sqlx::query(&query)
            .execute(&pool)
            .await
            .map_err(|e| EngineError::Execution(format!("Postgres query failed: {e}")))?;
        write_result(done.rows_affected())
    };
    Ok(result)
}

async fn execute_mysql(
    ctx: &EngineContext,
    spec: &QuerySpec<'_>,
    inputs: &Map<String, Value>,
    url: &str,
) -> Result<Map<String, Value>> {
    let query = rendered_query(spec, inputs)?;
    let pool = ctx.pools.mysql(url).await?;
    let result = if is_read_statement(&query) {
        let rows = sqlx::query(&query)
            .fetch_all(&pool)
            .await
            .map_err(|e| EngineError::Execution(format!("MySQL query failed: {e}")))?;
        let decoded: Vec<Value> = rows.iter().map(|row| Value::Object(mysql_row_to_json(row))).collect();
        let count = decoded.len();
        json_result(decoded, count)
    } else {
        let done = sqlx::query(&query)
            .execute(&pool)
            .await
            .map_err(|e| EngineError::Execution(format!("MySQL query failed: {e}")))?;
        write_result(done.rows_affected())
    };
    Ok(result)
}

async fn execute_mongodb(
    ctx: &EngineContext,
    spec: &QuerySpec<'_>,
    inputs: &Map<String, Value>,
    url: &str,
) -> Result<Map<String, Value>> {
    let collection_name = spec
        .collection
        .ok_or_else(|| EngineError::Execution("mongodb query requires a 'collection' field".into()))?;

    // String filter values are templates; everything else passes through.
    let mut filter_doc = mongodb::bson::Document::new();
    if let Some(filter) = spec.filter {
        for (key, value) in filter {
            let rendered = match value {
                Value::String(template) => Value::String(render_template(template, inputs)?),
                other => other.clone(),
            };
            let bson = mongodb::bson::to_bson(&rendered)
                .map_err(|e| EngineError::Execution(format!("MongoDB filter error: {e}")))?;
            filter_doc.insert(key.clone(), bson);
        }
    }

    let client = ctx.pools.mongo(url).await?;
    let database = client
        .default_database()
        .ok_or_else(|| EngineError::Execution("mongodb connection string must name a database".into()))?;
    let collection = database.collection::<mongodb::bson::Document>(collection_name);
    let cursor = collection.find(filter_doc, None).await?;
    let docs: Vec<mongodb::bson::Document> = cursor.try_collect().await?;
    let decoded: Vec<Value> = docs
        .into_iter()
        .map(|mut doc| {
            if let Ok(id) = doc.get_object_id("_id") {
                doc.insert("_id", id.to_hex());
            }
            serde_json::to_value(&doc).unwrap_or(Value::Null)
        })
        .collect();
    let count = decoded.len();
    Ok(json_result(decoded, count))
}

async fn execute_redis(
    spec: &QuerySpec<'_>,
    inputs: &Map<String, Value>,
    url: &str,
) -> Result<Map<String, Value>> {
    let key = rendered_query(spec, inputs)?;
    let client = redis::Client::open(url).map_err(|e| EngineError::Cache(e.to_string()))?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| EngineError::Cache(e.to_string()))?;
    let raw: Option<String> = redis::AsyncCommands::get(&mut conn, &key)
        .await
        .map_err(|e| EngineError::Cache(e.to_string()))?;
    let (value, count) = match raw {
        Some(text) => {
            let parsed = serde_json::from_str(&text).unwrap_or(Value::String(text));
            (parsed, 1)
        }
        None => (Value::Null, 0),
    };
    let mut out = Map::new();
    out.insert("query_result".into(), value);
    out.insert("row_count".into(), Value::from(count));
    Ok(out)
}

fn json_result(rows: Vec<Value>, count: usize) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("query_result".into(), Value::Array(rows));
    out.insert("row_count".into(), Value::from(count));
    out
}

fn write_result(affected: u64) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("affected_rows".into(), Value::from(affected));
    out
}

fn pg_row_to_json(row: &sqlx::postgres::PgRow) -> Map<String, Value> {
    let mut out = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), pg_value(row, idx));
    }
    out
}

fn pg_value(row: &sqlx::postgres::PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(sanitize::number).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::String(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    Value::Null
}

fn mysql_row_to_json(row: &sqlx::mysql::MySqlRow) -> Map<String, Value> {
    let mut out = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), mysql_value(row, idx));
    }
    out
}

fn mysql_value(row: &sqlx::mysql::MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(sanitize::number).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::String(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, StaticChat};
    use serde_json::json;

    #[test]
    fn test_read_statement_detection() {
        assert!(is_read_statement("SELECT * FROM orders"));
        assert!(is_read_statement("  with t as (select 1) select * from t"));
        assert!(!is_read_statement("INSERT INTO orders VALUES (1)"));
        assert!(!is_read_statement("UPDATE orders SET status = 'done'"));
    }

    #[test]
    fn test_spec_from_step_inherits_pipeline_credential() {
        let step: PipelineStep = serde_json::from_value(json!({
            "type": "query", "source": "postgres", "query": "SELECT 1"
        }))
        .unwrap();
        let spec = QuerySpec::from_step(&step, Some("pipeline_cred"), None);
        assert_eq!(spec.credential_ref, Some("pipeline_cred"));

        let step_with_own: PipelineStep = serde_json::from_value(json!({
            "type": "query", "source": "postgres", "query": "SELECT 1", "credential_ref": "own"
        }))
        .unwrap();
        let spec = QuerySpec::from_step(&step_with_own, Some("pipeline_cred"), None);
        assert_eq!(spec.credential_ref, Some("own"));
    }

    #[tokio::test]
    async fn test_pool_stats_report_configured_bounds() {
        let pools = QueryPools::new(5, 15, 5, 20);
        let stats = pools.stats().await;
        assert_eq!(stats.relational_min, 5);
        assert_eq!(stats.relational_max, 15);
        assert_eq!(stats.relational_targets, 0);
        assert_eq!(stats.relational_size, 0);
        assert_eq!(stats.document_min, 5);
        assert_eq!(stats.document_max, 20);
        assert_eq!(stats.document_clients, 0);
    }

    #[tokio::test]
    async fn test_unknown_source_fails() {
        let ctx = test_context(StaticChat::silent());
        let spec = QuerySpec { source: Some("cassandra"), ..QuerySpec::default() };
        let err = execute(&ctx, &spec, &Map::new(), None).await.unwrap_err();
        assert!(err.to_string().contains("Unknown data source"));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_with_guidance() {
        let ctx = test_context(StaticChat::silent());
        let spec = QuerySpec {
            source: Some("postgres"),
            query: Some("SELECT 1"),
            ..QuerySpec::default()
        };
        let err = execute(&ctx, &spec, &Map::new(), None).await.unwrap_err();
        assert!(err.to_string().contains("credential_ref"));
    }
}
