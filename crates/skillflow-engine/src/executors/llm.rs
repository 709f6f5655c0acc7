//! LLM executor: structured output driven by the skill's declared keys.
//!
//! Message order: a hard application rule (no tools unless explicitly
//! instructed), the skill's system prompt, then a user message carrying the
//! task prompt, the SOP and the rendered input context. The model may invoke
//! the agent-level `http_request` tool over at most two rounds before a
//! final extraction pass against the produces-derived schema.

use serde_json::{Map, Value};
use skillflow_core::Skill;

use crate::context::{EngineContext, ExecutionEnv};
use crate::errors::{EngineError, Result};
use crate::llm::{
    escape_key, run_agent_tool_rounds, safe_serialize, schema_from_keys, unescape_key, ChatMessage,
    ChatRequest, ResponseSchema,
};

const MAX_TOOL_ROUNDS: usize = 2;

const APPLICATION_RULE: &str = "Application rule: Do NOT invoke any tools (including http_request \
REST calls) unless the user or system explicitly instructs or approves it. If not explicitly told, \
solve without tools.";

const TOOL_HINT: &str = "You may call the `http_request` tool for standard REST API calls during \
this skill. This tool is for agent-level lookups and must not be confused with the skill-level \
REST executor used for agent-to-agent callbacks.";

pub async fn execute(
    ctx: &EngineContext,
    skill: &Skill,
    inputs: &Map<String, Value>,
    env: ExecutionEnv<'_>,
) -> Result<Map<String, Value>> {
    let model = match skill.llm_model.as_deref().or(env.llm_model) {
        Some(model) => ctx.models.resolve(Some(model))?,
        None => ctx.models.default_model().to_string(),
    };

    let prompt = skill.prompt.clone().unwrap_or_else(|| {
        format!(
            "Process this input to produce: {}.",
            skill.produces.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    });
    let sop = if env.sop.is_empty() { "N/A" } else { env.sop };
    let rendered_inputs = safe_serialize(&Value::Object(inputs.clone()), 5000);

    let mut messages = vec![ChatMessage::System(APPLICATION_RULE.to_string())];
    if let Some(system_prompt) = &skill.system_prompt {
        messages.push(ChatMessage::System(system_prompt.clone()));
    }
    messages.push(ChatMessage::User(format!(
        "{prompt}\nContext: {sop}\nInput: {rendered_inputs}\n\n{TOOL_HINT}"
    )));

    let (tool_runs, mut history) =
        run_agent_tool_rounds(ctx.chat.as_ref(), &ctx.http, &model, messages, MAX_TOOL_ROUNDS).await?;

    let expected: Vec<String> = skill.all_produces().into_iter().collect();
    let mut extraction = format!(
        "Use the available inputs and any tool results to populate the structured outputs {expected:?}. \
         Return only the structured fields defined by the schema."
    );
    if !tool_runs.is_empty() {
        let runs: Vec<Value> = tool_runs
            .iter()
            .map(|run| serde_json::json!({"tool": run.tool, "args": run.args, "result": run.result}))
            .collect();
        extraction.push_str(&format!(
            "\nTool runs (standard REST agent tools): {}",
            safe_serialize(&Value::Array(runs), 2000)
        ));
    }
    history.push(ChatMessage::User(extraction));

    let schema = schema_from_keys(&skill.produces, &skill.optional_produces);
    let response = ctx
        .chat
        .complete(ChatRequest {
            model,
            messages: history,
            response_schema: Some(ResponseSchema { name: format!("{}_output", escape_key(&skill.name)), schema }),
            enable_tools: false,
        })
        .await?;

    let content = response
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Execution(format!("{}: Failed to extract structured output from LLM.", skill.name))
        })?;
    let parsed: Value = serde_json::from_str(content.trim()).map_err(|e| {
        EngineError::Execution(format!("{}: structured output is not valid JSON: {e}", skill.name))
    })?;
    let Value::Object(fields) = parsed else {
        return Err(EngineError::Execution(format!(
            "{}: structured output must be a JSON object",
            skill.name
        )));
    };

    // Un-escape dotted keys and drop nulls so optional outputs stay absent.
    let mut outputs = Map::new();
    for (key, value) in fields {
        if value.is_null() {
            continue;
        }
        outputs.insert(unescape_key(&key), value);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, ToolCall};
    use crate::test_support::{test_context, RecordingChat};
    use serde_json::json;

    fn skill(produces: &[&str], optional: &[&str]) -> Skill {
        let mut skill: Skill = serde_json::from_value(json!({
            "name": "sum",
            "description": "adds",
            "prompt": "Add the numbers.",
            "system_prompt": "Be precise."
        }))
        .unwrap();
        skill.produces = produces.iter().map(|s| s.to_string()).collect();
        skill.optional_produces = optional.iter().map(|s| s.to_string()).collect();
        skill
    }

    #[tokio::test]
    async fn test_structured_output_mapped_to_produces() {
        let chat = RecordingChat::new(vec![
            // Tool round: no tool calls, straight to extraction.
            ChatResponse { content: Some("ok".into()), tool_calls: vec![] },
            ChatResponse { content: Some(r#"{"sum": 5}"#.into()), tool_calls: vec![] },
        ]);
        let requests = chat.requests();
        let ctx = test_context(chat);
        let inputs = json!({"x": 2, "y": 3}).as_object().cloned().unwrap();
        let out = execute(
            &ctx,
            &skill(&["sum"], &[]),
            &inputs,
            ExecutionEnv { sop: "Compute the sum", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(out["sum"], 5);

        let recorded = requests.lock().unwrap_or_else(|e| e.into_inner());
        // First request exposes tools, second demands the schema.
        assert!(recorded[0].enable_tools);
        assert!(recorded[0].messages.len() >= 3);
        assert!(!recorded[1].enable_tools);
        let schema = recorded[1].response_schema.as_ref().unwrap();
        assert_eq!(schema.schema["required"], json!(["sum"]));
        // The hard application rule leads the message list.
        match &recorded[0].messages[0] {
            ChatMessage::System(text) => assert!(text.contains("Do NOT invoke any tools")),
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dotted_keys_roundtrip_through_escaping() {
        let chat = RecordingChat::new(vec![
            ChatResponse { content: Some("ok".into()), tool_calls: vec![] },
            ChatResponse { content: Some(r#"{"order__total": 9, "notes": null}"#.into()), tool_calls: vec![] },
        ]);
        let ctx = test_context(chat);
        let out = execute(
            &ctx,
            &skill(&["order.total"], &["notes"]),
            &Map::new(),
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(out["order.total"], 9);
        assert!(!out.contains_key("notes"));
    }

    #[tokio::test]
    async fn test_tool_round_results_reach_extraction_prompt() {
        let chat = RecordingChat::new(vec![
            ChatResponse {
                content: None,
                tool_calls: vec![ToolCall { id: "c1".into(), name: "bogus".into(), arguments: json!({}) }],
            },
            ChatResponse { content: Some("done".into()), tool_calls: vec![] },
            ChatResponse { content: Some(r#"{"sum": 1}"#.into()), tool_calls: vec![] },
        ]);
        let requests = chat.requests();
        let ctx = test_context(chat);
        let out = execute(
            &ctx,
            &skill(&["sum"], &[]),
            &Map::new(),
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(out["sum"], 1);
        let recorded = requests.lock().unwrap_or_else(|e| e.into_inner());
        let last = recorded.last().unwrap();
        let extraction_text = last
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatMessage::User(text) => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert!(extraction_text.contains("Tool runs"));
    }

    #[tokio::test]
    async fn test_empty_structured_output_fails() {
        let chat = RecordingChat::new(vec![
            ChatResponse { content: Some("ok".into()), tool_calls: vec![] },
            ChatResponse { content: None, tool_calls: vec![] },
        ]);
        let ctx = test_context(chat);
        let err = execute(
            &ctx,
            &skill(&["sum"], &[]),
            &Map::new(),
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Failed to extract structured output"));
    }

    #[tokio::test]
    async fn test_invalid_skill_model_is_rejected() {
        let chat = RecordingChat::new(vec![]);
        let ctx = test_context(chat);
        let mut s = skill(&["sum"], &[]);
        s.llm_model = Some("gpt-made-up".into());
        let err = execute(
            &ctx,
            &s,
            &Map::new(),
            ExecutionEnv { sop: "sop", thread_id: "t1", ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(_)));
    }
}
