//! Checkpointed per-thread run state and its reserved control keys.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel value of `active_skill` marking the end of a run.
pub const END_SENTINEL: &str = "END";

/// Reserved keys on the data store. Underscore-prefixed keys are invisible to
/// the planner's `available_paths` view.
pub const STATUS_KEY: &str = "_status";
pub const ERROR_KEY: &str = "_error";
pub const FAILED_SKILL_KEY: &str = "_failed_skill";
pub const REST_PENDING_KEY: &str = "_rest_pending";

/// Passive graph nodes at which execution suspends until an external event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    HumanReview,
    AwaitCallback,
}

impl Interrupt {
    pub fn node_name(&self) -> &'static str {
        match self {
            Self::HumanReview => "human_review",
            Self::AwaitCallback => "await_callback",
        }
    }
}

/// Run lifecycle status recorded on run metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable state of one run, checkpointed on every graph transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// The natural-language SOP driving the planner.
    pub layman_sop: String,
    pub data_store: Map<String, Value>,
    /// Append-only human-readable event log.
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_skill: Option<String>,
    /// Ordered executed-skill names, consulted by the loop detector.
    #[serde(default)]
    pub execution_sequence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    /// Advisory: whether per-step progress should be broadcast.
    #[serde(default, rename = "_broadcast")]
    pub broadcast: bool,
    /// Interrupt the graph is paused before, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<Interrupt>,
}

impl RunState {
    pub fn new(thread_id: impl Into<String>, sop: impl Into<String>, initial_data: Map<String, Value>) -> Self {
        Self {
            thread_id: thread_id.into(),
            workspace_id: None,
            layman_sop: sop.into(),
            data_store: initial_data,
            history: vec!["Process Started".to_string()],
            active_skill: None,
            execution_sequence: Vec::new(),
            llm_model: None,
            broadcast: false,
            pending_interrupt: None,
        }
    }

    pub fn push_history(&mut self, entry: impl Into<String>) {
        self.history.push(entry.into());
    }

    /// Skills waiting on a REST callback.
    pub fn rest_pending(&self) -> BTreeSet<String> {
        match self.data_store.get(REST_PENDING_KEY) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn mark_rest_pending(&mut self, skill_name: &str) {
        let mut pending = self.rest_pending();
        pending.insert(skill_name.to_string());
        self.data_store.insert(
            REST_PENDING_KEY.to_string(),
            Value::Array(pending.into_iter().map(Value::String).collect()),
        );
    }

    /// Remove a skill from the pending set; drops the key when empty.
    pub fn clear_rest_pending(&mut self, skill_name: &str) {
        let mut pending = self.rest_pending();
        pending.remove(skill_name);
        if pending.is_empty() {
            self.data_store.remove(REST_PENDING_KEY);
        } else {
            self.data_store.insert(
                REST_PENDING_KEY.to_string(),
                Value::Array(pending.into_iter().map(Value::String).collect()),
            );
        }
    }

    pub fn is_failed(&self) -> bool {
        self.data_store.get(STATUS_KEY).and_then(Value::as_str) == Some("failed")
    }

    pub fn error(&self) -> Option<&str> {
        self.data_store.get(ERROR_KEY).and_then(Value::as_str)
    }

    pub fn failed_skill(&self) -> Option<&str> {
        self.data_store.get(FAILED_SKILL_KEY).and_then(Value::as_str)
    }

    /// Mark the run failed; the only legal next `active_skill` is `END`.
    pub fn fail(&mut self, skill: &str, error: impl Into<String>) {
        self.data_store.insert(ERROR_KEY.into(), Value::String(error.into()));
        self.data_store.insert(FAILED_SKILL_KEY.into(), Value::String(skill.into()));
        self.data_store.insert(STATUS_KEY.into(), Value::String("failed".into()));
    }

    /// History marker recorded after executing a skill.
    pub fn executed_marker(skill: &str, executor: &str) -> String {
        format!("Executed {skill} ({executor})")
    }

    /// History marker recorded when a REST callback completes a skill.
    pub fn callback_marker(skill: &str) -> String {
        format!("Executed {skill} (REST callback)")
    }

    /// Skill names that have been executed, including REST callbacks.
    pub fn completed_skills(&self) -> BTreeSet<String> {
        let mut completed = BTreeSet::new();
        for entry in &self.history {
            if let Some(rest) = entry.strip_prefix("Executed ") {
                let name = rest
                    .rsplit_once(" (")
                    .map(|(name, _)| name)
                    .unwrap_or(rest);
                completed.insert(name.to_string());
            }
        }
        completed
    }

    /// The most recently executed skill, if any.
    pub fn last_executed(&self) -> Option<String> {
        self.history.iter().rev().find_map(|entry| {
            entry.strip_prefix("Executed ").map(|rest| {
                rest.rsplit_once(" (")
                    .map(|(name, _)| name)
                    .unwrap_or(rest)
                    .to_string()
            })
        })
    }
}
