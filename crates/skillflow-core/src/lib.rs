//! Core data model for the skillflow orchestrator.
//!
//! This crate is I/O-free: it defines the skill model, the dot-notation data
//! store the engine plans against, run state with its reserved control keys,
//! conditional predicates for pipeline steps, loop detection over execution
//! sequences, and the output-mapping rules shared by every executor.

pub mod condition;
pub mod error;
pub mod loop_detect;
pub mod output;
pub mod paths;
pub mod skill;
pub mod state;

pub use condition::{check_step_condition, evaluate_condition, Predicate};
pub use error::CoreError;
pub use loop_detect::detect_infinite_loop;
pub use output::{apply_output_spec, map_produces, OutputSpec};
pub use skill::{
    slug, ActionConfig, ActionType, ExecutorKind, PipelineStep, RestConfig, Skill, SkillSource,
    StepKind,
};
pub use state::{Interrupt, RunState, RunStatus, END_SENTINEL};
