//! The graph engine: a four-node state machine (planner, executor and the
//! two passive interrupts) driven as an explicit loop. Every transition is
//! checkpointed before the run can suspend, so nothing in memory is load
//! bearing across a crash.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use skillflow_core::paths::{available_paths, get_path_value, set_path_value};
use skillflow_core::{detect_infinite_loop, ExecutorKind, Interrupt, RunState, END_SENTINEL};

use crate::checkpoint::BufferedCheckpointStore;
use crate::context::{EngineContext, ExecutionEnv};
use crate::errors::{EngineError, Result};
use crate::events::UiEvent;
use crate::executors::{self, rest};
use crate::planner;

/// Where a run ended up when the engine returned control.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { data_store: Map<String, Value> },
    Failed { error: String, failed_skill: Option<String>, data_store: Map<String, Value> },
    Paused { interrupt: Interrupt, data_store: Map<String, Value> },
}

impl RunOutcome {
    pub fn data_store(&self) -> &Map<String, Value> {
        match self {
            Self::Completed { data_store }
            | Self::Failed { data_store, .. }
            | Self::Paused { data_store, .. } => data_store,
        }
    }
}

/// Post-executor routing.
enum Route {
    Planner,
    HumanReview,
    AwaitCallback,
}

pub struct GraphEngine {
    ctx: EngineContext,
    checkpoints: Arc<BufferedCheckpointStore>,
}

impl GraphEngine {
    pub fn new(ctx: EngineContext, checkpoints: Arc<BufferedCheckpointStore>) -> Self {
        Self { ctx, checkpoints }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn checkpoints(&self) -> &Arc<BufferedCheckpointStore> {
        &self.checkpoints
    }

    async fn checkpoint(&self, state: &RunState, source: &str) {
        let metadata = json!({"source": source, "step": state.execution_sequence.len()});
        if let Err(err) = self.checkpoints.put(state, metadata).await {
            tracing::warn!(thread_id = %state.thread_id, error = %err, "failed to checkpoint state");
        }
    }

    /// Drive the planner→executor loop until the run completes, fails or
    /// pauses at an interrupt.
    pub async fn run(&self, mut state: RunState, user_id: Option<&str>) -> RunOutcome {
        loop {
            if let Err(err) = planner::plan(&self.ctx, &mut state).await {
                // Planner infrastructure failure (e.g. no model configured).
                let message = format!("WORKFLOW FAILED: {err}");
                self.ctx.events.warn(&state.thread_id, message.clone());
                state.push_history(message);
                state.fail("planner", err.to_string());
                state.active_skill = Some(END_SENTINEL.to_string());
                self.checkpoint(&state, "planner").await;
                return self.finish(state);
            }
            self.checkpoint(&state, "planner").await;

            let active = state.active_skill.clone();
            let Some(skill_name) = active.filter(|name| name.as_str() != END_SENTINEL) else {
                // Runs that stop while REST work is in flight are paused, not
                // done; persist the interrupt so status reads survive restart.
                if !state.is_failed() && !state.rest_pending().is_empty() {
                    state.pending_interrupt = Some(Interrupt::AwaitCallback);
                    self.checkpoint(&state, "planner").await;
                }
                return self.finish(state);
            };

            // A planner that re-picks the just-executed skill routes through
            // human review instead of repeating it blindly.
            if state.last_executed().as_deref() == Some(skill_name.as_str()) {
                self.ctx.events.info(
                    &state.thread_id,
                    format!("[PLANNER] {skill_name} was just executed. Routing to HUMAN_REVIEW to avoid repetition."),
                );
                state.pending_interrupt = Some(Interrupt::HumanReview);
                self.checkpoint(&state, "planner").await;
                return RunOutcome::Paused {
                    interrupt: Interrupt::HumanReview,
                    data_store: state.data_store.clone(),
                };
            }

            let route = self.execute_node(&skill_name, &mut state, user_id).await;
            match route {
                Route::Planner => {
                    self.checkpoint(&state, "executor").await;
                }
                Route::HumanReview => {
                    state.pending_interrupt = Some(Interrupt::HumanReview);
                    self.checkpoint(&state, "executor").await;
                    return RunOutcome::Paused {
                        interrupt: Interrupt::HumanReview,
                        data_store: state.data_store.clone(),
                    };
                }
                Route::AwaitCallback => {
                    state.pending_interrupt = Some(Interrupt::AwaitCallback);
                    self.checkpoint(&state, "executor").await;
                    return RunOutcome::Paused {
                        interrupt: Interrupt::AwaitCallback,
                        data_store: state.data_store.clone(),
                    };
                }
            }
        }
    }

    /// Resume a paused run from its latest checkpoint.
    pub async fn resume(&self, thread_id: &str, user_id: Option<&str>) -> Result<RunOutcome> {
        let mut state = self
            .checkpoints
            .latest_state(thread_id)
            .await?
            .ok_or_else(|| EngineError::Execution(format!("unknown thread: {thread_id}")))?;
        state.pending_interrupt = None;
        Ok(self.run(state, user_id).await)
    }

    fn finish(&self, state: RunState) -> RunOutcome {
        if state.is_failed() {
            self.ctx.events.info(&state.thread_id, "[PLANNER] Reached END. Execution failed.");
            return RunOutcome::Failed {
                error: state.error().unwrap_or("Unknown error").to_string(),
                failed_skill: state.failed_skill().map(String::from),
                data_store: state.data_store.clone(),
            };
        }
        if !state.rest_pending().is_empty() {
            return RunOutcome::Paused {
                interrupt: Interrupt::AwaitCallback,
                data_store: state.data_store.clone(),
            };
        }
        self.ctx.events.info(&state.thread_id, "[PLANNER] Reached END. Execution completed.");
        RunOutcome::Completed { data_store: state.data_store.clone() }
    }

    /// The executor node: sequence tracking, loop detection, input checks,
    /// execution, and output merging. Failures never bubble; they set the
    /// failure control keys and route back to the planner, which ends the run.
    async fn execute_node(&self, skill_name: &str, state: &mut RunState, user_id: Option<&str>) -> Route {
        self.ctx.events.info(&state.thread_id, format!("[EXECUTOR] Running {skill_name}..."));
        state.execution_sequence.push(skill_name.to_string());

        if let Some(loop_error) = detect_infinite_loop(&state.execution_sequence) {
            self.ctx.events.warn(&state.thread_id, format!("[EXECUTOR] {loop_error}"));
            let tail: Vec<&String> = state.execution_sequence.iter().rev().take(10).rev().collect();
            self.ctx.events.info(
                &state.thread_id,
                format!("[EXECUTOR] Execution sequence: {}", tail.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" -> ")),
            );
            state.fail(skill_name, loop_error.clone());
            state.push_history(format!("INFINITE LOOP DETECTED: {loop_error}"));
            state.active_skill = Some(END_SENTINEL.to_string());
            return Route::Planner;
        }

        let Some(skill) = self.ctx.registry.get(skill_name, state.workspace_id.as_deref()) else {
            let message = format!("Skill '{skill_name}' not found in registry");
            state.fail(skill_name, message.clone());
            state.push_history(format!("Skill {skill_name} failed: {message}"));
            state.active_skill = Some(END_SENTINEL.to_string());
            return Route::Planner;
        };

        let present = available_paths(&state.data_store);
        let missing: Vec<&String> = skill.requires.iter().filter(|req| !present.contains(*req)).collect();
        if !missing.is_empty() {
            let missing_list = missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
            let message = format!("{skill_name} cannot run. Missing required inputs: {missing_list}");
            self.ctx.events.warn(&state.thread_id, format!("[EXECUTOR] {message}"));
            state.fail(skill_name, message.clone());
            state.push_history(format!("Skill {skill_name} failed: {message}"));
            state.active_skill = Some(END_SENTINEL.to_string());
            return Route::Planner;
        }

        let store = Value::Object(state.data_store.clone());
        let mut inputs = Map::new();
        for req in &skill.requires {
            if let Some(value) = get_path_value(&store, req) {
                inputs.insert(req.clone(), value.clone());
            }
        }

        self.ctx.events.ui(UiEvent::new(
            &state.thread_id,
            "agent_action",
            json!({
                "agent_name": skill.name,
                "executor": skill.executor.to_string(),
                "required_inputs": skill.requires.iter().collect::<Vec<_>>(),
            }),
        ));

        // Executors see borrowed copies so the state stays mutable for the
        // REST dispatch bookkeeping.
        let sop = state.layman_sop.clone();
        let thread_id = state.thread_id.clone();
        let workspace_id = state.workspace_id.clone();
        let llm_model = state.llm_model.clone();
        let env = ExecutionEnv {
            sop: &sop,
            thread_id: &thread_id,
            workspace_id: workspace_id.as_deref(),
            llm_model: llm_model.as_deref(),
            user_id,
        };

        if skill.executor == ExecutorKind::Rest {
            return match rest::dispatch(&self.ctx, &skill, &inputs, state, env).await {
                Ok(_) => {
                    state.active_skill = Some(skill.name.clone());
                    Route::AwaitCallback
                }
                Err(err) => {
                    let message = err.to_string();
                    self.ctx.events.warn(&state.thread_id, format!("[EXECUTOR] Skill {skill_name} failed: {message}"));
                    state.fail(skill_name, message.clone());
                    state.push_history(format!("Skill {skill_name} failed: {message}"));
                    state.active_skill = Some(END_SENTINEL.to_string());
                    Route::Planner
                }
            };
        }

        match executors::execute_skill_core(&self.ctx, &skill, inputs, env).await {
            Ok(outputs) => {
                for (path, value) in outputs {
                    set_path_value(&mut state.data_store, &path, value);
                }
                state.push_history(RunState::executed_marker(&skill.name, &skill.executor.to_string()));
                state.active_skill = None;
                if skill.hitl_enabled {
                    self.ctx.events.info(
                        &state.thread_id,
                        format!("[ROUTER] HITL enabled for {skill_name}. Redirecting to HUMAN_REVIEW."),
                    );
                    Route::HumanReview
                } else {
                    Route::Planner
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.ctx.events.warn(&state.thread_id, format!("[EXECUTOR] Skill {skill_name} failed: {message}"));
                state.fail(skill_name, message.clone());
                state.push_history(format!("Skill {skill_name} failed: {message}"));
                state.active_skill = Some(END_SENTINEL.to_string());
                Route::Planner
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointCache;
    use crate::events::EventBus;
    use crate::llm::ChatResponse;
    use crate::test_support::{context_with_skills, RecordingChat};
    use serde_json::json;
    use skillflow_core::Skill;

    fn llm_skill(name: &str, requires: &[&str], produces: &[&str]) -> Skill {
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

    fn content(raw: &str) -> ChatResponse {
        ChatResponse { content: Some(raw.to_string()), tool_calls: vec![] }
    }

    fn engine_with(chat: RecordingChat, skills: Vec<Skill>) -> GraphEngine {
        let ctx = context_with_skills(chat, skills);
        let checkpoints = Arc::new(crate::checkpoint::BufferedCheckpointStore::new(
            Some(Arc::new(MemoryCheckpointCache::new())),
            None,
            None,
            EventBus::new(),
        ));
        GraphEngine::new(ctx, checkpoints)
    }

    fn state(data: serde_json::Value) -> RunState {
        let mut state = RunState::new("t1", "Compute the sum of x and y", Map::new());
        state.data_store = data.as_object().cloned().unwrap_or_default();
        state
    }

    #[tokio::test]
    async fn test_single_llm_skill_completes() {
        let engine = engine_with(
            RecordingChat::new(vec![
                decision("sum"),
                content("ok"),               // tool round
                content(r#"{"sum": 5}"#),    // extraction
                decision(END_SENTINEL),
            ]),
            vec![llm_skill("sum", &["x", "y"], &["sum"])],
        );
        let outcome = engine.run(state(json!({"x": 2, "y": 3})), None).await;
        let RunOutcome::Completed { data_store } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(data_store["sum"], 5);

        let history: Vec<String> = {
            let latest = engine.checkpoints.latest_state("t1").await.unwrap().unwrap();
            latest.history
        };
        assert!(history.iter().any(|h| h == "Executed sum (llm)"));
        assert!(history.iter().any(|h| h == "Planner chose END"));
    }

    #[tokio::test]
    async fn test_unschedulable_goal_completes_without_execution() {
        // `sum` needs y which nobody provides: no runnable skills, no
        // unblockers, planner goes straight to END.
        let engine = engine_with(
            RecordingChat::new(vec![decision("sum")]),
            vec![llm_skill("sum", &["x", "y"], &["sum"])],
        );
        let outcome = engine.run(state(json!({"x": 1})), None).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let latest = engine.checkpoints.latest_state("t1").await.unwrap().unwrap();
        assert!(!latest.history.iter().any(|h| h.starts_with("Executed sum")));
    }

    #[tokio::test]
    async fn test_loop_detection_fails_run() {
        // `ping` and `pong` each produce an empty value, so neither ever
        // counts as completed and the planner alternates between them. The
        // fourth pick matches A->B->A->B and trips the detector before
        // executing.
        let responses = vec![
            decision("ping"),
            content("ok"),
            content(r#"{"ping_out": ""}"#),
            decision("pong"),
            content("ok"),
            content(r#"{"pong_out": ""}"#),
            decision("ping"),
            content("ok"),
            content(r#"{"ping_out": ""}"#),
            decision("pong"),
        ];
        let engine = engine_with(
            RecordingChat::new(responses),
            vec![llm_skill("ping", &[], &["ping_out"]), llm_skill("pong", &[], &["pong_out"])],
        );

        let outcome = engine.run(state(json!({})), None).await;
        let RunOutcome::Failed { error, failed_skill, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("alternating pattern"), "{error}");
        assert_eq!(failed_skill.as_deref(), Some("pong"));
        let latest = engine.checkpoints.latest_state("t1").await.unwrap().unwrap();
        assert!(latest.history.iter().any(|h| h.starts_with("INFINITE LOOP DETECTED")));
    }

    #[tokio::test]
    async fn test_missing_produces_key_is_fatal() {
        let engine = engine_with(
            RecordingChat::new(vec![
                decision("sum"),
                content("ok"),
                content(r#"{"unrelated": 1}"#),
            ]),
            vec![llm_skill("sum", &["x"], &["sum"])],
        );
        let outcome = engine.run(state(json!({"x": 1})), None).await;
        let RunOutcome::Failed { error, failed_skill, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("Missing expected keys"), "{error}");
        assert_eq!(failed_skill.as_deref(), Some("sum"));
    }

    #[tokio::test]
    async fn test_hitl_skill_pauses_at_human_review() {
        let mut skill = llm_skill("review_me", &["x"], &["draft"]);
        skill.hitl_enabled = true;
        let engine = engine_with(
            RecordingChat::new(vec![
                decision("review_me"),
                content("ok"),
                content(r#"{"draft": "v1"}"#),
            ]),
            vec![skill],
        );
        let outcome = engine.run(state(json!({"x": 1})), None).await;
        let RunOutcome::Paused { interrupt, data_store } = outcome else {
            panic!("expected pause, got {outcome:?}");
        };
        assert_eq!(interrupt, Interrupt::HumanReview);
        assert_eq!(data_store["draft"], "v1");
        let latest = engine.checkpoints.latest_state("t1").await.unwrap().unwrap();
        assert_eq!(latest.pending_interrupt, Some(Interrupt::HumanReview));
    }

    #[tokio::test]
    async fn test_resume_after_approval_continues_to_end() {
        let mut skill = llm_skill("review_me", &["x"], &["draft"]);
        skill.hitl_enabled = true;
        let engine = engine_with(
            RecordingChat::new(vec![
                decision("review_me"),
                content("ok"),
                content(r#"{"draft": "v1"}"#),
                decision(END_SENTINEL),
            ]),
            vec![skill],
        );
        let outcome = engine.run(state(json!({"x": 1})), None).await;
        assert!(matches!(outcome, RunOutcome::Paused { .. }));

        let outcome = engine.resume("t1", None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_repetition_guard_routes_to_human_review() {
        // Two planner decisions for the same skill back to back: the second
        // routes to human review instead of executing again.
        let engine = engine_with(
            RecordingChat::new(vec![
                decision("sum"),
                content("ok"),
                content(r#"{"sum": ""}"#),
                decision("sum"),
            ]),
            // The produced value is empty, so `sum` stays runnable and the
            // planner may legally pick it again.
            vec![llm_skill("sum", &["x"], &["sum"])],
        );
        let outcome = engine.run(state(json!({"x": 1})), None).await;
        let RunOutcome::Paused { interrupt, .. } = outcome else {
            panic!("expected pause, got {outcome:?}");
        };
        assert_eq!(interrupt, Interrupt::HumanReview);
    }
}
