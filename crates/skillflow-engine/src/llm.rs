//! LLM access: the `ChatModel` seam, the OpenAI-backed implementation, the
//! model registry used to validate run requests, and the agent-level
//! `http_request` tool loop available to LLM skills.

use std::collections::BTreeSet;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionToolArgs, ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall,
    FunctionObjectArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::errors::{EngineError, Result};

/// One message in a chat exchange.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant { content: Option<String>, tool_calls: Vec<ToolCall> },
    Tool { tool_call_id: String, content: String },
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Structured-output requirement attached to a request.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub response_schema: Option<ResponseSchema>,
    /// Expose the agent-level `http_request` tool to the model.
    pub enable_tools: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// The seam between the engine and any chat-completion provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse>;
}

/// Registry of LLM models a run may select. Invalid selections reject the run
/// before any work is scheduled.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    default_model: String,
    allowed: BTreeSet<String>,
}

impl ModelRegistry {
    pub fn new(default_model: impl Into<String>, allowed: impl IntoIterator<Item = String>) -> Self {
        let default_model = default_model.into();
        let mut allowed: BTreeSet<String> = allowed.into_iter().collect();
        allowed.insert(default_model.clone());
        Self { default_model, allowed }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Validate a requested model; `None` or blank resolves to the default.
    pub fn resolve(&self, requested: Option<&str>) -> Result<String> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(self.default_model.clone()),
            Some(model) if self.allowed.contains(model) => Ok(model.to_string()),
            Some(model) => Err(EngineError::InvalidModel(format!(
                "'{model}' is not an available model. Available: {}",
                self.allowed.iter().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(
            "gpt-4o",
            ["gpt-4o-mini", "gpt-4.1", "gpt-4.1-mini"].map(String::from),
        )
    }
}

/// Name of the agent-level HTTP tool.
pub const HTTP_REQUEST_TOOL: &str = "http_request";

fn http_request_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "url": {"type": "string", "description": "Absolute URL to call"},
            "method": {"type": "string", "description": "HTTP method such as GET, POST, PUT, PATCH, DELETE"},
            "params": {"type": "object", "description": "Query params"},
            "headers": {"type": "object"},
            "json": {"type": "object", "description": "JSON body to send when applicable"},
            "timeout": {"type": "number", "description": "Per-request timeout in seconds"}
        },
        "required": ["url"]
    })
}

/// ChatModel implementation backed by the OpenAI chat completions API.
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
}

impl OpenAiChatModel {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        Self { client: Client::with_config(config) }
    }
}

impl Default for OpenAiChatModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let converted = match message {
                ChatMessage::System(content) => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content.as_str())
                    .build()
                    .map_err(|e| EngineError::Llm(e.to_string()))?
                    .into(),
                ChatMessage::User(content) => ChatCompletionRequestUserMessageArgs::default()
                    .content(content.as_str())
                    .build()
                    .map_err(|e| EngineError::Llm(e.to_string()))?
                    .into(),
                ChatMessage::Assistant { content, tool_calls } => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    if let Some(content) = content {
                        builder.content(content.as_str());
                    }
                    if !tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCall> = tool_calls
                            .iter()
                            .map(|call| ChatCompletionMessageToolCall {
                                id: call.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: call.name.clone(),
                                    arguments: call.arguments.to_string(),
                                },
                            })
                            .collect();
                        builder.tool_calls(calls);
                    }
                    builder.build().map_err(|e| EngineError::Llm(e.to_string()))?.into()
                }
                ChatMessage::Tool { tool_call_id, content } => {
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(tool_call_id.as_str())
                        .content(content.as_str())
                        .build()
                        .map_err(|e| EngineError::Llm(e.to_string()))?
                        .into()
                }
            };
            messages.push(converted);
        }

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&request.model).temperature(0.0).messages(messages);

        if request.enable_tools {
            let tool = ChatCompletionToolArgs::default()
                .r#type(ChatCompletionToolType::Function)
                .function(
                    FunctionObjectArgs::default()
                        .name(HTTP_REQUEST_TOOL)
                        .description(
                            "Standard REST call for ad-hoc API lookups inside a skill. Distinct \
                             from the skill-level REST executor used for agent-to-agent callbacks.",
                        )
                        .parameters(http_request_tool_schema())
                        .build()
                        .map_err(|e| EngineError::Llm(e.to_string()))?,
                )
                .build()
                .map_err(|e| EngineError::Llm(e.to_string()))?;
            builder.tools(vec![tool]);
        }

        if let Some(schema) = &request.response_schema {
            builder.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    name: schema.name.clone(),
                    description: None,
                    schema: Some(schema.schema.clone()),
                    strict: Some(false),
                },
            });
        }

        let request = builder.build().map_err(|e| EngineError::Llm(e.to_string()))?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| EngineError::Llm(e.to_string()))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Llm("model returned no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments)),
            })
            .collect();

        Ok(ChatResponse { content: choice.message.content, tool_calls })
    }
}

/// Execute one `http_request` tool call. Errors are folded into the returned
/// value so the model can react to them.
pub async fn execute_http_request_tool(client: &reqwest::Client, args: &Value) -> Value {
    let Some(url) = args.get("url").and_then(Value::as_str) else {
        return json!({"error": "http_request requires a 'url' argument"});
    };
    let method = args
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return json!({"error": format!("invalid HTTP method '{method}'")}),
    };
    let timeout = args.get("timeout").and_then(Value::as_f64).unwrap_or(10.0).clamp(0.5, 60.0);

    let mut request = client
        .request(method, url)
        .timeout(std::time::Duration::from_secs_f64(timeout));
    if let Some(Value::Object(params)) = args.get("params") {
        let pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
            .collect();
        request = request.query(&pairs);
    }
    if let Some(Value::Object(headers)) = args.get("headers") {
        for (key, val) in headers {
            if let Some(val) = val.as_str() {
                request = request.header(key, val);
            }
        }
    }
    if let Some(body) = args.get("json") {
        if !body.is_null() {
            request = request.json(body);
        }
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body: Value = if content_type.to_lowercase().contains("application/json") {
                response.json().await.unwrap_or(Value::Null)
            } else {
                let text = response.text().await.unwrap_or_default();
                if text.len() > 2000 {
                    Value::String(format!("{}...(truncated)", &text[..2000]))
                } else {
                    Value::String(text)
                }
            };
            json!({"status": status, "headers": {"content-type": content_type}, "body": body})
        }
        Err(err) => json!({"error": err.to_string()}),
    }
}

/// A completed tool invocation, recorded for the extraction prompt.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tool: String,
    pub args: Value,
    pub result: Value,
}

/// Let the model invoke agent-level tools before producing structured output.
/// Returns the tool run info and the expanded message history.
pub async fn run_agent_tool_rounds(
    chat: &dyn ChatModel,
    http: &reqwest::Client,
    model: &str,
    mut messages: Vec<ChatMessage>,
    max_rounds: usize,
) -> Result<(Vec<ToolRun>, Vec<ChatMessage>)> {
    let mut tool_runs = Vec::new();
    for round in 0..max_rounds {
        let response = chat
            .complete(ChatRequest {
                model: model.to_string(),
                messages: messages.clone(),
                response_schema: None,
                enable_tools: true,
            })
            .await?;
        let tool_calls = response.tool_calls.clone();
        messages.push(ChatMessage::Assistant {
            content: response.content,
            tool_calls: tool_calls.clone(),
        });
        if tool_calls.is_empty() {
            return Ok((tool_runs, messages));
        }
        for call in tool_calls {
            let result = if call.name == HTTP_REQUEST_TOOL {
                execute_http_request_tool(http, &call.arguments).await
            } else {
                json!({"error": format!("Unknown tool '{}'", call.name)})
            };
            tool_runs.push(ToolRun { tool: call.name, args: call.arguments, result: result.clone() });
            messages.push(ChatMessage::Tool {
                tool_call_id: call.id,
                content: safe_serialize(&result, 3000),
            });
        }
        tracing::debug!(round = round + 1, "agent tool round completed");
    }
    tracing::warn!(max_rounds, "reached max tool rounds; proceeding with available context");
    Ok((tool_runs, messages))
}

/// Best-effort JSON serialization with truncation to keep tokens bounded.
pub fn safe_serialize(value: &Value, limit: usize) -> String {
    let rendered = value.to_string();
    if rendered.len() > limit {
        format!("{}...(truncated)", &rendered[..limit])
    } else {
        rendered
    }
}

/// Build a structured-output schema from produced keys. Keys containing dots
/// are escaped (`a.b` → `a__b`) and un-escaped when mapping back.
pub fn schema_from_keys(required: &BTreeSet<String>, optional: &BTreeSet<String>) -> Value {
    let mut properties = Map::new();
    for key in required.iter().chain(optional.iter()) {
        properties.insert(escape_key(key), json!({}));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required.iter().map(|k| escape_key(k)).collect::<Vec<_>>(),
        "additionalProperties": false
    })
}

pub fn escape_key(key: &str) -> String {
    key.replace('.', "__")
}

pub fn unescape_key(key: &str) -> String {
    key.replace("__", ".")
}
