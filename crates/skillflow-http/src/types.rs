//! Request and response bodies for the public API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub thread_id: String,
    pub sop: String,
    #[serde(default)]
    pub initial_data: Option<Map<String, Value>>,
    /// Human-friendly name; defaults to the thread id.
    #[serde(default)]
    pub run_name: Option<String>,
    /// Unique key echoed in the ACK broadcast.
    #[serde(default)]
    pub ack_key: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    /// Webhook invoked when the run reaches terminal status.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Opt-in real-time broadcasts.
    #[serde(default)]
    pub broadcast: bool,
    /// Wait for completion and return the final data store.
    #[serde(default)]
    pub await_response: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RerunRequest {
    #[serde(default)]
    pub ack_key: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub thread_id: String,
    pub skill: String,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub is_paused: bool,
    pub is_human_review: bool,
    pub is_waiting_callback: bool,
    pub next_node: Vec<String>,
    pub active_skill: Option<String>,
    pub data: Map<String, Value>,
    pub history: Vec<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub failed_skill: Option<String>,
}

/// Outbound payload of the simulated partner endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoRestRequest {
    pub skill: String,
    pub thread_id: String,
    pub callback_url: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub sop: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveErrorRequest {
    #[serde(default)]
    pub resolution_notes: Option<String>,
}
