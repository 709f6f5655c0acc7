//! The skill model: a named unit of work with declared inputs and outputs
//! and one of three executors (llm, rest, action).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::Predicate;
use crate::error::CoreError;
use crate::output::OutputSpec;

/// Which engine runs this skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Structured-output LLM call built from the skill's prompt and schema.
    #[default]
    Llm,
    /// Two-phase dispatch to a remote service that completes via callback.
    Rest,
    /// Deterministic action executed by the framework (no LLM).
    Action,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Rest => write!(f, "rest"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Where a skill definition was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    /// Manifest directory on disk; immutable at runtime, visible everywhere.
    #[default]
    Filesystem,
    /// Row in the `dynamic_skills` table, owned by a workspace.
    Database,
}

/// Configuration for the REST executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Remote URL template; `{dot.path}` placeholders render from the input context.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Acknowledgement timeout in seconds (the remote completes via callback).
    #[serde(default = "default_rest_timeout")]
    pub timeout: f64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_rest_timeout() -> f64 {
    15.0
}

/// Types of action executors available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Inline function compiled from UI-authored source, resolved from the
    /// action registry by `{module}.{function}`.
    Function,
    /// Single database query (postgres, mysql, mongodb, redis).
    DataQuery,
    /// Multi-step pipeline with conditionals, parallelism and nested skills.
    DataPipeline,
    /// External script: JSON inputs on stdin, JSON object on stdout.
    Script,
    /// One-shot synchronous HTTP call (distinct from the REST executor).
    HttpCall,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::DataQuery => write!(f, "data_query"),
            Self::DataPipeline => write!(f, "data_pipeline"),
            Self::Script => write!(f, "script"),
            Self::HttpCall => write!(f, "http_call"),
        }
    }
}

/// One step of a data pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Display name; defaults to `step_{idx}` in diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Context keys fed to transform / merge / skill steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Where the produced value lands in the pipeline context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,

    // query steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_config_file: Option<String>,

    // transform steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    // nested skill steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,

    // parallel steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<PipelineStep>,

    // conditionals, legal on any step kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<Predicate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Query,
    Transform,
    Merge,
    Skill,
    Parallel,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Transform => write!(f, "transform"),
            Self::Merge => write!(f, "merge"),
            Self::Skill => write!(f, "skill"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Configuration for action-based skill execution. Actions are deterministic
/// operations executed by the framework, not an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub kind: ActionType,

    // function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Module holding the function; omitted for skill-local auto-discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    // data_query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,

    /// Reference to a credential in the secure vault.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    /// Deprecated skill-local db config file; still honored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_config_file: Option<String>,

    // data_pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<PipelineStep>>,

    // script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    // http_call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Execution timeout in seconds.
    #[serde(default = "default_action_timeout")]
    pub timeout: f64,
}

fn default_action_timeout() -> f64 {
    30.0
}

/// A named unit of work with declared required/produced keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: BTreeSet<String>,
    #[serde(default)]
    pub produces: BTreeSet<String>,
    #[serde(default)]
    pub optional_produces: BTreeSet<String>,
    #[serde(default)]
    pub hitl_enabled: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Task/user-intent prompt for the LLM executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Business rules / SOP prompt; defaults to the manifest body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionConfig>,
    /// Workspace that owns the skill; `None` means filesystem/public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub source: SkillSource,
    /// Registry key: `fs.{name}` for filesystem skills,
    /// `{workspace_code}.{slug}` for database skills.
    #[serde(default)]
    pub module_name: String,
    /// Set when inline code attached to this skill failed to compile. The
    /// skill stays visible and editable but fails at execution time with
    /// this diagnostic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Skill {
    /// Validate the cross-field invariants the registry enforces on load.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidSkill("name must not be empty".into()));
        }
        let overlap: Vec<&String> = self.produces.intersection(&self.optional_produces).collect();
        if !overlap.is_empty() {
            return Err(CoreError::InvalidSkill(format!(
                "skill '{}': produces and optional_produces overlap: {:?}",
                self.name, overlap
            )));
        }
        match self.executor {
            ExecutorKind::Rest if self.rest.is_none() => Err(CoreError::InvalidSkill(format!(
                "skill '{}': executor 'rest' requires a rest config",
                self.name
            ))),
            ExecutorKind::Action if self.action.is_none() => Err(CoreError::InvalidSkill(format!(
                "skill '{}': executor 'action' requires an action config",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// All keys this skill may emit.
    pub fn all_produces(&self) -> BTreeSet<String> {
        self.produces.union(&self.optional_produces).cloned().collect()
    }
}

/// Sanitize a skill name into a module slug: lowercase, runs of
/// non-alphanumerics collapsed to `_`, trimmed at both ends.
pub fn slug(name: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        return Err(CoreError::InvalidSkill(format!(
            "skill name '{name}' yields an empty module slug"
        )));
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(CoreError::InvalidSkill(format!(
            "skill name '{name}' yields a slug starting with a digit"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(name: &str) -> Skill {
        serde_json::from_value(json!({"name": name})).unwrap()
    }

    #[test]
    fn test_skill_defaults() {
        let skill = minimal("sum");
        assert_eq!(skill.executor, ExecutorKind::Llm);
        assert!(skill.enabled);
        assert!(!skill.is_public);
        assert_eq!(skill.source, SkillSource::Filesystem);
    }

    #[test]
    fn test_validate_rejects_produces_overlap() {
        let mut skill = minimal("sum");
        skill.produces.insert("total".into());
        skill.optional_produces.insert("total".into());
        assert!(skill.validate().is_err());
    }

    #[test]
    fn test_validate_requires_matching_executor_config() {
        let mut skill = minimal("remote");
        skill.executor = ExecutorKind::Rest;
        assert!(skill.validate().is_err());
        skill.rest = Some(RestConfig {
            url: "http://partner/task".into(),
            method: default_method(),
            headers: BTreeMap::new(),
            timeout: 15.0,
        });
        assert!(skill.validate().is_ok());
    }

    #[test]
    fn test_action_config_deserializes_tagged_type() {
        let cfg: ActionConfig = serde_json::from_value(json!({
            "type": "data_query",
            "source": "postgres",
            "query": "SELECT 1",
            "credential_ref": "analytics_db"
        }))
        .unwrap();
        assert_eq!(cfg.kind, ActionType::DataQuery);
        assert_eq!(cfg.timeout, 30.0);
    }

    #[test]
    fn test_pipeline_step_roundtrip() {
        let step: PipelineStep = serde_json::from_value(json!({
            "type": "parallel",
            "name": "fanout",
            "steps": [
                {"type": "query", "source": "postgres", "query": "SELECT 1", "output": "a"},
                {"type": "transform", "function": "fmt", "inputs": ["a"], "output": ["b", "c"]}
            ]
        }))
        .unwrap();
        assert_eq!(step.kind, StepKind::Parallel);
        assert_eq!(step.steps.len(), 2);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Financial Analysis Pipeline").unwrap(), "financial_analysis_pipeline");
        assert_eq!(slug("sum").unwrap(), "sum");
        assert_eq!(slug("  weird--Name!! ").unwrap(), "weird_name");
        assert!(slug("42skill").is_err());
        assert!(slug("!!!").is_err());
    }
}
