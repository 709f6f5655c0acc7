//! The autonomous planner: decides which skill runs next.
//!
//! Candidate computation is deterministic (available keys, completed skills,
//! runnable set, unblockers); the LLM only chooses among candidates, and an
//! invalid choice is overridden by a deterministic guardrail fallback.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{json, Value};
use skillflow_core::paths::available_paths;
use skillflow_core::{RunState, Skill, END_SENTINEL};

use crate::context::EngineContext;
use crate::errors::Result;
use crate::events::UiEvent;
use crate::llm::{safe_serialize, ChatMessage, ChatRequest, ResponseSchema};

#[derive(Debug, Clone, Deserialize)]
struct PlannerDecision {
    next_agent: String,
    #[serde(default)]
    reasoning: String,
}

fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "next_agent": {"type": "string", "description": "Name of agent or 'END'"},
            "reasoning": {"type": "string", "description": "Reasoning for the decision"}
        },
        "required": ["next_agent", "reasoning"],
        "additionalProperties": false
    })
}

/// Deterministic planner inputs, exposed for the prompt and the guardrail.
pub struct PlannerView {
    pub current_keys: BTreeSet<String>,
    pub runnable: Vec<Skill>,
    pub unblockers: Vec<String>,
}

/// Compute the runnable set and the unblockers over the workspace registry.
pub fn planner_view(ctx: &EngineContext, state: &RunState) -> PlannerView {
    let current_keys = available_paths(&state.data_store);
    let pending = state.rest_pending();
    let completed = state.completed_skills();
    let registry: Vec<Skill> = ctx
        .registry
        .list(state.workspace_id.as_deref())
        .into_iter()
        .filter(|s| s.enabled)
        .collect();

    let runnable: Vec<Skill> = registry
        .iter()
        .filter(|s| s.requires.is_subset(&current_keys))
        .filter(|s| !pending.contains(&s.name))
        // Reruns are allowed while outputs are missing; skip only skills that
        // are already completed with all outputs present.
        .filter(|s| !(completed.contains(&s.name) && s.produces.is_subset(&current_keys)))
        .cloned()
        .collect();

    // Map missing requirements to runnable skills that can provide them.
    // Only mandatory outputs qualify as providers.
    let mut missing_requirements: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for skill in &registry {
        if skill.produces.is_subset(&current_keys) {
            continue;
        }
        for req in skill.requires.difference(&current_keys) {
            let providers: BTreeSet<String> = runnable
                .iter()
                .filter(|s| s.produces.contains(req))
                .map(|s| s.name.clone())
                .collect();
            if !providers.is_empty() {
                missing_requirements.entry(req.clone()).or_default().extend(providers);
            }
        }
    }
    let unblockers: Vec<String> = missing_requirements
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    PlannerView { current_keys, runnable, unblockers }
}

fn capabilities(skills: &[Skill]) -> String {
    skills
        .iter()
        .map(|s| {
            let optional = if s.optional_produces.is_empty() {
                String::new()
            } else {
                format!(" Optional {:?}", s.optional_produces)
            };
            format!("- {}: Provides {:?}.{optional} (Needs {:?})", s.name, s.produces, s.requires)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn progress_summary(state: &RunState) -> Vec<String> {
    state
        .completed_skills()
        .into_iter()
        .map(|name| format!("{name}: completed"))
        .collect()
}

/// Run one planner step: sets `active_skill` and appends history.
pub async fn plan(ctx: &EngineContext, state: &mut RunState) -> Result<()> {
    ctx.events.info(
        &state.thread_id,
        format!(
            "[PLANNER] Assessing state. Current data: {:?}",
            state.data_store.keys().collect::<Vec<_>>()
        ),
    );

    // Failed workflows route straight to END.
    if state.is_failed() {
        let failed_skill = state.failed_skill().unwrap_or("unknown").to_string();
        let error = state.error().unwrap_or("Unknown error").to_string();
        ctx.events.info(
            &state.thread_id,
            format!("[PLANNER] Workflow failed at {failed_skill}: {error}"),
        );
        state.active_skill = Some(END_SENTINEL.to_string());
        state.push_history(format!("Workflow ended due to failure in {failed_skill}"));
        return Ok(());
    }

    // REST work in flight: do not plan new work, wait for the callback.
    let pending = state.rest_pending();
    if !pending.is_empty() {
        ctx.events.info(
            &state.thread_id,
            format!("[PLANNER] REST work in flight {pending:?}. Pausing planning until callback."),
        );
        let pending_list: Vec<&String> = pending.iter().collect();
        state.push_history(format!("Waiting for REST callback: {pending_list:?}"));
        state.active_skill = Some(END_SENTINEL.to_string());
        return Ok(());
    }

    let registry: Vec<Skill> = ctx
        .registry
        .list(state.workspace_id.as_deref())
        .into_iter()
        .filter(|s| s.enabled)
        .collect();
    let view = planner_view(ctx, state);
    let runnable_names: Vec<&str> = view.runnable.iter().map(|s| s.name.as_str()).collect();

    let prompt = format!(
        r#"GOAL: {goal}
DATA_STORE: {data}
PROGRESS: {progress:?}

CAPABILITIES:
{capabilities}

READY_TO_RUN: {runnable:?}
UNBLOCKERS: {unblockers:?}  # Only skills here can supply missing requirements right now.

RULES:
- You MUST pick only from READY_TO_RUN or UNBLOCKERS.
- If both lists are empty, return 'END'.
- Never select a skill whose required inputs are not already in DATA_STORE.

Pick the next agent. If the goal is met or no further action possible, return 'END'."#,
        goal = state.layman_sop,
        data = safe_serialize(&Value::Object(state.data_store.clone()), 3000),
        progress = progress_summary(state),
        capabilities = capabilities(&registry),
        runnable = runnable_names,
        unblockers = view.unblockers,
    );

    let model = ctx.models.resolve(state.llm_model.as_deref())?;
    let decision: PlannerDecision = match ctx
        .chat
        .complete(ChatRequest {
            model,
            messages: vec![ChatMessage::User(prompt)],
            response_schema: Some(ResponseSchema {
                name: "planner_decision".into(),
                schema: decision_schema(),
            }),
            enable_tools: false,
        })
        .await
    {
        Ok(response) => response
            .content
            .as_deref()
            .and_then(|content| serde_json::from_str(content.trim()).ok())
            .unwrap_or(PlannerDecision {
                next_agent: String::new(),
                reasoning: "unparseable planner response".into(),
            }),
        Err(err) => {
            // The guardrail below recovers with a deterministic choice.
            ctx.events.warn(&state.thread_id, format!("[PLANNER] LLM call failed: {err}"));
            PlannerDecision { next_agent: String::new(), reasoning: format!("planner LLM failed: {err}") }
        }
    };

    let allowed: BTreeSet<&str> = runnable_names
        .iter()
        .copied()
        .chain(view.unblockers.iter().map(String::as_str))
        .collect();
    let (chosen, reason) = if decision.next_agent != END_SENTINEL && !allowed.contains(decision.next_agent.as_str())
    {
        let fallback = runnable_names
            .first()
            .copied()
            .or_else(|| view.unblockers.first().map(String::as_str))
            .unwrap_or(END_SENTINEL)
            .to_string();
        ctx.events.info(
            &state.thread_id,
            format!("[PLANNER] Invalid choice '{}'. Falling back to '{fallback}'.", decision.next_agent),
        );
        let reason = format!("Guardrail override. LLM picked invalid skill; chose {fallback} instead.");
        (fallback, reason)
    } else {
        (decision.next_agent, decision.reasoning)
    };

    ctx.events.info(
        &state.thread_id,
        format!("[PLANNER] Decision: {chosen} | Reasoning: {reason}"),
    );
    ctx.events.ui(UiEvent::new(
        &state.thread_id,
        "planner_decision",
        json!({
            "chosen_agent": chosen,
            "reasoning": reason,
            "available_data_keys": view.current_keys.iter().collect::<Vec<_>>(),
            "ready_to_run": runnable_names,
            "unblockers": view.unblockers,
        }),
    ));
    state.push_history(format!("Planner chose {chosen}"));
    state.active_skill = Some(chosen);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use crate::test_support::{context_with_skills, RecordingChat};
    use serde_json::{json, Value};

    fn skill(name: &str, requires: &[&str], produces: &[&str]) -> Skill {
        let mut skill: Skill = serde_json::from_value(json!({"name": name, "description": name})).unwrap();
        skill.requires = requires.iter().map(|s| s.to_string()).collect();
        skill.produces = produces.iter().map(|s| s.to_string()).collect();
        skill
    }

    fn decision(name: &str) -> ChatResponse {
        ChatResponse {
            content: Some(json!({"next_agent": name, "reasoning": "test"}).to_string()),
            tool_calls: vec![],
        }
    }

    fn state_with(data: Value) -> RunState {
        RunState::new("t1", "Finish the workflow", data.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_runnable_requires_all_inputs() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![]),
            vec![skill("sum", &["x", "y"], &["sum"]), skill("report", &["sum"], &["report"])],
        );
        let state = state_with(json!({"x": 1}));
        let view = planner_view(&ctx, &state);
        assert!(view.runnable.is_empty());
        assert!(view.unblockers.is_empty());
    }

    #[tokio::test]
    async fn test_unblockers_point_at_providers() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![]),
            vec![skill("sum", &["x", "y"], &["sum"]), skill("report", &["sum"], &["report"])],
        );
        let state = state_with(json!({"x": 1, "y": 2}));
        let view = planner_view(&ctx, &state);
        assert_eq!(view.runnable.len(), 1);
        assert_eq!(view.runnable[0].name, "sum");
        // `sum` unblocks `report`.
        assert_eq!(view.unblockers, vec!["sum".to_string()]);
    }

    #[tokio::test]
    async fn test_completed_skill_with_outputs_is_not_runnable() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![]),
            vec![skill("sum", &["x", "y"], &["sum"])],
        );
        let mut state = state_with(json!({"x": 1, "y": 2, "sum": 3}));
        state.push_history(RunState::executed_marker("sum", "llm"));
        let view = planner_view(&ctx, &state);
        assert!(view.runnable.is_empty());

        // Missing outputs allow a rerun.
        let mut state = state_with(json!({"x": 1, "y": 2}));
        state.push_history(RunState::executed_marker("sum", "llm"));
        let view = planner_view(&ctx, &state);
        assert_eq!(view.runnable.len(), 1);
    }

    #[tokio::test]
    async fn test_plan_accepts_valid_choice() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![decision("sum")]),
            vec![skill("sum", &["x", "y"], &["sum"])],
        );
        let mut state = state_with(json!({"x": 1, "y": 2}));
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some("sum"));
        assert!(state.history.iter().any(|h| h == "Planner chose sum"));
    }

    #[tokio::test]
    async fn test_guardrail_overrides_hallucinated_choice() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![decision("made_up_skill")]),
            vec![skill("sum", &["x", "y"], &["sum"])],
        );
        let mut state = state_with(json!({"x": 1, "y": 2}));
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some("sum"));
    }

    #[tokio::test]
    async fn test_guardrail_falls_back_to_end_when_nothing_runnable() {
        let ctx = context_with_skills(
            RecordingChat::new(vec![decision("sum")]),
            vec![skill("sum", &["x", "y"], &["sum"])],
        );
        let mut state = state_with(json!({"x": 1}));
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some(END_SENTINEL));
    }

    #[tokio::test]
    async fn test_failed_state_short_circuits() {
        let ctx = context_with_skills(RecordingChat::new(vec![]), vec![]);
        let mut state = state_with(json!({}));
        state.fail("sum", "boom");
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some(END_SENTINEL));
        assert!(state.history.iter().any(|h| h.contains("failure in sum")));
    }

    #[tokio::test]
    async fn test_pending_rest_pauses_planning() {
        let ctx = context_with_skills(RecordingChat::new(vec![]), vec![]);
        let mut state = state_with(json!({}));
        state.mark_rest_pending("validate");
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some(END_SENTINEL));
        assert!(state.history.iter().any(|h| h.contains("Waiting for REST callback")));
    }

    #[tokio::test]
    async fn test_planner_llm_failure_recovers_deterministically() {
        // Empty script: the chat model errors, the guardrail picks the first
        // runnable skill.
        let ctx = context_with_skills(
            RecordingChat::new(vec![]),
            vec![skill("sum", &["x", "y"], &["sum"])],
        );
        let mut state = state_with(json!({"x": 1, "y": 2}));
        plan(&ctx, &mut state).await.unwrap();
        assert_eq!(state.active_skill.as_deref(), Some("sum"));
    }
}
