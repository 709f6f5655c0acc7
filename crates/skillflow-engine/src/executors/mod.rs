//! The five executor kinds behind one contract: given a skill, an input
//! context mapped from its `requires` keys, and the run environment, return
//! a map of output keys to values. Side effects go through the event bus;
//! only the returned map is merged into the data store.

pub mod function;
pub mod http_call;
pub mod llm;
pub mod query;
pub mod rest;
pub mod script;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use skillflow_core::{map_produces, ActionType, ExecutorKind, Skill};

use crate::context::{EngineContext, ExecutionEnv};
use crate::errors::{EngineError, Result};
use crate::pipeline;

/// Run a skill's LLM or action executor and map the result onto its declared
/// outputs. REST skills reached through this path (nested in a pipeline)
/// are dispatched fire-and-forget: the outbound POST is sent so partner work
/// is not lost, but a pipeline cannot pause, so no outputs are returned and
/// the eventual callback merges at the run level.
///
/// Boxed because pipelines re-enter this function for nested skill steps.
pub fn execute_skill_core<'a>(
    ctx: &'a EngineContext,
    skill: &'a Skill,
    inputs: Map<String, Value>,
    env: ExecutionEnv<'a>,
) -> BoxFuture<'a, Result<Map<String, Value>>> {
    Box::pin(async move {
        if let Some(diagnostic) = &skill.compile_error {
            return Err(EngineError::Execution(format!(
                "{}: attached code failed to compile: {diagnostic}",
                skill.name
            )));
        }

        let raw = match skill.executor {
            ExecutorKind::Rest => {
                ctx.events.warn(
                    env.thread_id,
                    format!(
                        "[EXECUTOR] {} dispatched via REST from a pipeline; outputs arrive via callback",
                        skill.name
                    ),
                );
                rest::dispatch_only(ctx, skill, &inputs, env).await?;
                return Ok(Map::new());
            }
            ExecutorKind::Llm => llm::execute(ctx, skill, &inputs, env).await?,
            ExecutorKind::Action => {
                let action = skill.action.as_ref().ok_or_else(|| {
                    EngineError::Execution(format!("{} is missing action configuration", skill.name))
                })?;
                ctx.events.info(
                    env.thread_id,
                    format!("[EXECUTOR] Running action {} (type: {})", skill.name, action.kind),
                );
                match action.kind {
                    ActionType::Function => function::execute(ctx, action, &inputs).await?,
                    ActionType::DataQuery => {
                        query::execute(ctx, &query::QuerySpec::from_action(action), &inputs, env.user_id)
                            .await?
                    }
                    ActionType::DataPipeline => {
                        pipeline::execute_pipeline(ctx, action, &inputs, env).await?
                    }
                    ActionType::Script => script::execute(action, &inputs).await?,
                    ActionType::HttpCall => http_call::execute(ctx, action, &inputs).await?,
                }
            }
        };

        let mapped = map_produces(skill, raw)?;
        ctx.events.info(
            env.thread_id,
            format!(
                "[EXECUTOR] {} completed. Results: {:?}",
                skill.name,
                mapped.keys().collect::<Vec<_>>()
            ),
        );
        Ok(mapped)
    })
}
