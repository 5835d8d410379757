use flowpilot_flow_model::ModelError;
use thiserror::Error;

/// Failures that abort a run before or outside normal traversal. A step
/// failing during traversal is not one of these; it is folded into the run
/// result.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("run preparation failed: {0}")]
    Prepare(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("step '{step_id}' failed: {reason}")]
    StepFailed { step_id: String, reason: String },

    #[error("run exceeded its global deadline")]
    GlobalTimeout,

    #[error("traversal exceeded the iteration guard")]
    LoopExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}
