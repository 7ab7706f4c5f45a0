//! Per-concern error enums for the engine itself, as distinct from
//! [`wayforge_types::WorkflowError`] (the activity-facing retry/catch
//! domain). Orchestration, templating and checkpoint I/O each get their own
//! `thiserror` enum rather than a single god-enum, with `#[from]`
//! conversions at the natural seams.

use thiserror::Error;

use wayforge_types::workflow::ValidationError;

/// Errors raised while compiling or evaluating a template/condition/script
/// expression.
#[derive(Debug, Error, Clone)]
pub enum TemplateError {
    #[error("unbalanced '{{' in template: {0}")]
    UnbalancedBrace(String),
    #[error("empty script expression")]
    EmptyExpression,
    #[error("failed to evaluate expression '{expression}': {cause}")]
    Evaluate { expression: String, cause: String },
}

/// Errors raised while saving, loading or deleting a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for execution '{0}'")]
    NotFound(String),
    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("checkpoint backend I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while driving an execution to completion. This is the
/// top-level error type `wayforge-core`'s public API returns.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow definition invalid: {0}")]
    Validation(#[from] ValidationError),

    #[error("step '{0}' references an unknown activity")]
    UnknownActivity(String),

    #[error("reference to unknown step '{0}'")]
    UnknownStep(String),

    #[error("duplicate path label '{0}'")]
    DuplicatePathLabel(String),

    #[error("{0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("output '{name}' reads from undefined path '{path}'")]
    MissingOutputPath { name: String, path: String },

    #[error("output '{name}' variable '{variable}' not found on path '{path}'")]
    MissingOutputVariable {
        name: String,
        path: String,
        variable: String,
    },

    #[error("required input '{0}' was not supplied and has no default")]
    MissingRequiredInput(String),
}
