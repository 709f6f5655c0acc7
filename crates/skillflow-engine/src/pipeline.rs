//! Recursive interpreter for multi-step data pipelines.
//!
//! Steps execute against a mutable local context seeded with the skill's
//! input map; each step's outputs merge top-level into the context and only
//! keys not present in the seed are returned. Parallel steps fan out over
//! shallow copies of the context and merge after all branches complete; the
//! first failure cancels the group.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use skillflow_core::{
    apply_output_spec, check_step_condition, ActionConfig, PipelineStep, StepKind,
};

use crate::context::{EngineContext, ExecutionEnv};
use crate::errors::{EngineError, Result};
use crate::events::UiEvent;
use crate::executors::{self, query};

/// Execute a `data_pipeline` action.
pub async fn execute_pipeline(
    ctx: &EngineContext,
    action: &ActionConfig,
    inputs: &Map<String, Value>,
    env: ExecutionEnv<'_>,
) -> Result<Map<String, Value>> {
    let steps = action
        .steps
        .as_ref()
        .filter(|steps| !steps.is_empty())
        .ok_or_else(|| EngineError::Execution("data_pipeline action requires a 'steps' field".into()))?;

    let mut context = inputs.clone();
    ctx.events.info(env.thread_id, format!("[ACTIONS] Starting data pipeline with {} steps", steps.len()));

    for (idx, step) in steps.iter().enumerate() {
        let step_id = idx.to_string();
        if !check_step_condition(step, &context) {
            ctx.events.info(
                env.thread_id,
                format!("[ACTIONS] Pipeline step {idx} ({}) skipped by condition", step_label(step, idx)),
            );
            continue;
        }
        let outputs = execute_step(
            ctx,
            step,
            context.clone(),
            step_id,
            action.credential_ref.as_deref(),
            action.db_config_file.as_deref(),
            env,
        )
        .await?;
        merge_step_outputs(&mut context, outputs, env.thread_id);
    }

    // Only keys the pipeline added are the skill's outputs.
    let mut outputs = Map::new();
    for (key, value) in context {
        if !inputs.contains_key(&key) {
            outputs.insert(key, value);
        }
    }
    Ok(outputs)
}

fn step_label(step: &PipelineStep, idx: usize) -> String {
    step.name.clone().unwrap_or_else(|| format!("step_{idx}"))
}

fn merge_step_outputs(context: &mut Map<String, Value>, outputs: Map<String, Value>, thread_id: &str) {
    for (key, value) in outputs {
        if context.contains_key(&key) {
            tracing::debug!(thread_id = %thread_id, key = %key, "pipeline step overwrote an existing context key");
        }
        context.insert(key, value);
    }
}

/// Execute one step against a snapshot of the context. Boxed: parallel and
/// nested-skill steps recurse.
#[allow(clippy::too_many_arguments)]
fn execute_step<'a>(
    ctx: &'a EngineContext,
    step: &'a PipelineStep,
    context: Map<String, Value>,
    step_id: String,
    default_credential: Option<&'a str>,
    default_db_config: Option<&'a str>,
    env: ExecutionEnv<'a>,
) -> BoxFuture<'a, Result<Map<String, Value>>> {
    Box::pin(async move {
        let label = step_label(step, step_id.split('.').next_back().and_then(|s| s.parse().ok()).unwrap_or(0));
        let error_prefix = format!("Pipeline step {step_id} ({label})");
        let event = UiEvent::new(
            env.thread_id,
            "pipeline_step_started",
            json!({"step": step_id, "name": label, "kind": step.kind.to_string()}),
        )
        .with_step(step_id.clone());
        let parent_event_id = event.event_id.clone();
        ctx.events.ui(event);

        let result = run_step(ctx, step, &context, &step_id, &error_prefix, default_credential, default_db_config, env).await;

        match &result {
            Ok(outputs) => {
                ctx.events.ui(
                    UiEvent::new(
                        env.thread_id,
                        "pipeline_step_result",
                        json!({"step": step_id, "name": label, "outputs": outputs.keys().collect::<Vec<_>>()}),
                    )
                    .with_parent(parent_event_id)
                    .with_step(step_id.clone()),
                );
            }
            Err(err) => {
                ctx.events.ui(
                    UiEvent::new(
                        env.thread_id,
                        "pipeline_step_error",
                        json!({"step": step_id, "name": label, "error": err.to_string()}),
                    )
                    .with_parent(parent_event_id)
                    .with_step(step_id.clone()),
                );
            }
        }
        result
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    ctx: &EngineContext,
    step: &PipelineStep,
    context: &Map<String, Value>,
    step_id: &str,
    error_prefix: &str,
    default_credential: Option<&str>,
    default_db_config: Option<&str>,
    env: ExecutionEnv<'_>,
) -> Result<Map<String, Value>> {
    match step.kind {
        StepKind::Query => {
            if step.source.is_none() {
                return Err(EngineError::Execution(format!("{error_prefix}: 'query' type requires 'source'")));
            }
            let spec = query::QuerySpec::from_step(step, default_credential, default_db_config);
            if spec.credential_ref.is_none() && spec.db_config_file.is_none() {
                return Err(EngineError::Execution(format!(
                    "{error_prefix}: 'query' type requires 'credential_ref' to enforce secure connections"
                )));
            }
            let result = executors::query::execute(ctx, &spec, context, env.user_id).await?;
            ctx.events.info(env.thread_id, format!("[ACTIONS] {error_prefix}: query completed"));
            // Rows land under the step's output key; bare result map otherwise.
            let value = result
                .get("query_result")
                .cloned()
                .unwrap_or(Value::Object(result));
            apply_output_spec(step.output.as_ref(), value, error_prefix).map_err(EngineError::from)
        }
        StepKind::Transform => {
            let function = step
                .function
                .as_deref()
                .ok_or_else(|| EngineError::Execution(format!("{error_prefix}: 'transform' type requires 'function'")))?;
            // Absent context keys are omitted, not passed as null; the
            // callable's parameter check reports them as missing.
            let mut transform_inputs = Map::new();
            for key in &step.inputs {
                if let Some(value) = context.get(key) {
                    transform_inputs.insert(key.clone(), value.clone());
                }
            }
            let result = ctx.actions.call(function, &transform_inputs).await?;
            ctx.events.info(env.thread_id, format!("[ACTIONS] {error_prefix}: transform completed"));
            apply_output_spec(step.output.as_ref(), Value::Object(result), error_prefix)
                .map_err(EngineError::from)
        }
        StepKind::Merge => {
            if step.inputs.len() < 2 {
                return Err(EngineError::Execution(format!(
                    "{error_prefix}: 'merge' requires at least 2 inputs"
                )));
            }
            let mut merged = Map::new();
            for key in &step.inputs {
                if let Some(value) = context.get(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            ctx.events.info(env.thread_id, format!("[ACTIONS] {error_prefix}: merge completed"));
            let spec = step.output.clone().unwrap_or(skillflow_core::OutputSpec::Key("merged".into()));
            apply_output_spec(Some(&spec), Value::Object(merged), error_prefix).map_err(EngineError::from)
        }
        StepKind::Skill => {
            let skill_name = step
                .skill
                .as_deref()
                .ok_or_else(|| EngineError::Execution(format!("{error_prefix}: 'skill' type requires 'skill' field")))?;
            let skill = ctx
                .registry
                .get(skill_name, env.workspace_id)
                .ok_or_else(|| EngineError::SkillNotFound(skill_name.to_string()))?;
            let mut skill_inputs = Map::new();
            for key in &step.inputs {
                match context.get(key) {
                    Some(value) => {
                        skill_inputs.insert(key.clone(), value.clone());
                    }
                    None => ctx.events.warn(
                        env.thread_id,
                        format!("[ACTIONS] Input '{key}' not found in context for skill '{skill_name}'"),
                    ),
                }
            }
            ctx.events.info(
                env.thread_id,
                format!("[ACTIONS] {error_prefix}: invoking skill '{skill_name}'"),
            );
            let outputs = executors::execute_skill_core(ctx, &skill, skill_inputs, env).await?;
            ctx.events.info(
                env.thread_id,
                format!(
                    "[ACTIONS] {error_prefix}: skill '{skill_name}' completed, produced: {:?}",
                    outputs.keys().collect::<Vec<_>>()
                ),
            );
            // Skill results are already properly keyed.
            Ok(outputs)
        }
        StepKind::Parallel => {
            if step.steps.is_empty() {
                return Err(EngineError::Execution(format!("{error_prefix}: 'parallel' requires 'steps' list")));
            }
            ctx.events.info(
                env.thread_id,
                format!("[ACTIONS] {error_prefix}: executing {} steps in parallel", step.steps.len()),
            );
            let started = std::time::Instant::now();
            let branches = step.steps.iter().enumerate().map(|(sub_idx, substep)| {
                execute_step(
                    ctx,
                    substep,
                    context.clone(),
                    format!("{step_id}.{sub_idx}"),
                    default_credential,
                    default_db_config,
                    env,
                )
            });
            // First error cancels the remaining branches.
            let results = futures::future::try_join_all(branches).await?;
            let mut merged = Map::new();
            for outputs in results {
                for (key, value) in outputs {
                    if merged.contains_key(&key) {
                        tracing::debug!(key = %key, "parallel branches wrote the same key; last writer wins");
                    }
                    merged.insert(key, value);
                }
            }
            ctx.events.info(
                env.thread_id,
                format!(
                    "[ACTIONS] {error_prefix}: parallel execution completed in {:.2}s, produced: {:?}",
                    started.elapsed().as_secs_f64(),
                    merged.keys().collect::<Vec<_>>()
                ),
            );
            Ok(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, StaticChat};
    use serde_json::json;

    fn action(steps: Value) -> ActionConfig {
        serde_json::from_value(json!({"type": "data_pipeline", "steps": steps})).unwrap()
    }

    fn env<'a>() -> ExecutionEnv<'a> {
        ExecutionEnv { sop: "Pipeline execution", thread_id: "t1", ..Default::default() }
    }

    fn register_helpers(ctx: &EngineContext) {
        ctx.actions
            .register_pipeline_helpers(
                "fs.pipe",
                r#"
fn combine(a, b, c) { #{ combined: a + b + c } }
fn double(v) { #{ doubled: v * 2 } }
fn split_pair(v) { #{ left: v, right: v + 1 } }
"#,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_transform_chain_returns_only_new_keys() {
        let ctx = test_context(StaticChat::silent());
        register_helpers(&ctx);
        let action = action(json!([
            {"type": "transform", "function": "double", "inputs": ["v"], "output": "first"},
            {"type": "transform", "function": "double", "inputs": ["v"], "output": "second"}
        ]));
        let inputs = json!({"v": 3}).as_object().cloned().unwrap();
        let out = execute_pipeline(&ctx, &action, &inputs, env()).await.unwrap();
        assert_eq!(out["first"], json!({"doubled": 6}));
        assert_eq!(out["second"], json!({"doubled": 6}));
        assert!(!out.contains_key("v"));
    }

    #[tokio::test]
    async fn test_parallel_fanout_feeds_transform() {
        let ctx = test_context(StaticChat::silent());
        register_helpers(&ctx);
        ctx.actions
            .register_pipeline_helpers(
                "fs.fan",
                r#"
fn make_a() { #{ a: 1, a_src: "q1" } }
fn make_b() { #{ b: 2, b_src: "q2" } }
fn make_c() { #{ c: 3, c_src: "q3" } }
"#,
            )
            .unwrap();
        let action = action(json!([
            {"type": "parallel", "name": "fanout", "steps": [
                {"type": "transform", "function": "make_a", "inputs": [], "output": ["a", "a_src"]},
                {"type": "transform", "function": "make_b", "inputs": [], "output": ["b", "b_src"]},
                {"type": "transform", "function": "make_c", "inputs": [], "output": ["c", "c_src"]}
            ]},
            {"type": "transform", "function": "combine",
             "inputs": ["a", "b", "c"], "output": "total"}
        ]));
        let out = execute_pipeline(&ctx, &action, &Map::new(), env()).await.unwrap();
        assert_eq!(out["a"], 1);
        assert_eq!(out["b"], 2);
        assert_eq!(out["c"], 3);
        assert_eq!(out["total"], json!({"combined": 6}));
    }

    #[tokio::test]
    async fn test_missing_parallel_branch_breaks_downstream_transform() {
        let ctx = test_context(StaticChat::silent());
        register_helpers(&ctx);
        ctx.actions
            .register_pipeline_helpers("fs.fan2", "fn make_a() { #{ a: 1 } }")
            .unwrap();
        let action = action(json!([
            {"type": "parallel", "steps": [
                {"type": "transform", "function": "make_a", "inputs": [], "output": ["a"]}
            ]},
            {"type": "transform", "function": "combine", "inputs": ["a", "b", "c"], "output": "total"}
        ]));
        let err = execute_pipeline(&ctx, &action, &Map::new(), env()).await.unwrap_err();
        assert!(err.to_string().contains("Missing parameters"), "{err}");
    }

    #[tokio::test]
    async fn test_merge_step() {
        let ctx = test_context(StaticChat::silent());
        let action = action(json!([
            {"type": "merge", "inputs": ["x", "y"], "output": "pair"}
        ]));
        let inputs = json!({"x": 1, "y": 2}).as_object().cloned().unwrap();
        let out = execute_pipeline(&ctx, &action, &inputs, env()).await.unwrap();
        assert_eq!(out["pair"], json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn test_merge_requires_two_inputs() {
        let ctx = test_context(StaticChat::silent());
        let action = action(json!([{ "type": "merge", "inputs": ["x"], "output": "pair"}]));
        let inputs = json!({"x": 1}).as_object().cloned().unwrap();
        let err = execute_pipeline(&ctx, &action, &inputs, env()).await.unwrap_err();
        assert!(err.to_string().contains("at least 2 inputs"));
    }

    #[tokio::test]
    async fn test_conditional_skip() {
        let ctx = test_context(StaticChat::silent());
        register_helpers(&ctx);
        let action = action(json!([
            {"type": "transform", "function": "double", "inputs": ["v"], "output": "premium_path",
             "run_if": {"field": "plan", "operator": "equals", "value": "premium"}},
            {"type": "transform", "function": "double", "inputs": ["v"], "output": "always_path"}
        ]));
        let inputs = json!({"v": 2, "plan": "free"}).as_object().cloned().unwrap();
        let out = execute_pipeline(&ctx, &action, &inputs, env()).await.unwrap();
        assert!(!out.contains_key("premium_path"));
        assert!(out.contains_key("always_path"));
    }

    #[tokio::test]
    async fn test_positional_output_mapping() {
        let ctx = test_context(StaticChat::silent());
        register_helpers(&ctx);
        let action = action(json!([
            {"type": "transform", "function": "split_pair", "inputs": ["v"], "output": ["left", "right"]}
        ]));
        let inputs = json!({"v": 10}).as_object().cloned().unwrap();
        let out = execute_pipeline(&ctx, &action, &inputs, env()).await.unwrap();
        assert_eq!(out["left"], 10);
        assert_eq!(out["right"], 11);
    }

    #[tokio::test]
    async fn test_query_step_without_credential_fails() {
        let ctx = test_context(StaticChat::silent());
        let action = action(json!([
            {"type": "query", "source": "postgres", "query": "SELECT 1", "output": "rows"}
        ]));
        let err = execute_pipeline(&ctx, &action, &Map::new(), env()).await.unwrap_err();
        assert!(err.to_string().contains("credential_ref"));
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        let ctx = test_context(StaticChat::silent());
        let action: ActionConfig = serde_json::from_value(json!({"type": "data_pipeline"})).unwrap();
        assert!(execute_pipeline(&ctx, &action, &Map::new(), env()).await.is_err());
    }
}
