use thiserror::Error;

/// Errors raised by the pure model layer.
///
/// Everything here is fatal for the skill that triggered it: the engine maps
/// these into `_status = "failed"` on the run's data store.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{skill} cannot run. Missing required inputs: {missing}")]
    MissingInputs { skill: String, missing: String },

    #[error("Critical Error: Missing expected keys: {{{missing}}}")]
    MissingOutputs { missing: String },

    #[error("{0}")]
    OutputSpec(String),

    #[error("Missing placeholder value for '{placeholder}' in template: {template}")]
    MissingPlaceholder { placeholder: String, template: String },

    #[error("invalid skill definition: {0}")]
    InvalidSkill(String),
}
