//! Run orchestrator for declarative automation flows.
//!
//! A flow is a graph of steps with labeled edges. The orchestrator walks it:
//! prepare (registry, variables, bindings, target, capture), traverse (one
//! step at a time with retries, branching, loops, and plugin hooks), clean up
//! (capture summary, persistence, registry). The actual browser work lives
//! behind the [`collaborators`] traits; this crate owns only the walk.

pub mod collaborators;
pub mod control;
pub mod errors;
pub mod expr;
pub mod graph;
pub mod orchestrator;
pub mod plugins;
pub mod result;
pub mod retry;
pub mod vars;

pub use collaborators::{
    post_step_wait, quick_nav_check, wait_for_navigation, NoopPrompter, StepCtx, StepError,
    StepExecutor, StepOutcome, TargetOptions, TargetProvisioner, VariablePrompter,
};
pub use control::{eval_condition, ControlDirective};
pub use errors::RunnerError;
pub use expr::{eval_expression, is_truthy};
pub use graph::{DEFAULT_LABEL, ON_ERROR_LABEL};
pub use orchestrator::{Collaborators, Orchestrator, RunOptions, DEFAULT_TIMEOUT_MS};
pub use plugins::{BreakpointPlugin, HookControl, PluginError, PluginManager, RunCx, RunPlugin};
pub use result::{RunResult, RunSummary};
pub use retry::{with_retry, RetryPolicy};
pub use vars::VarStore;
