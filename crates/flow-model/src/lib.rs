//! Flow definition model.
//!
//! A [`Flow`] is the declarative description of a multi-step automation: a
//! directed graph of typed nodes with labeled edges, nested subflows for loop
//! bodies, variable declarations, and optional binding rules constraining the
//! target a flow may run against. Flows are produced by an external
//! authoring/recording process and are read-only for the duration of a run.

pub mod binding;
pub mod errors;
pub mod types;

pub use binding::{Binding, BindingKind};
pub use errors::ModelError;
pub use types::{
    AfterWait, AssertSpec, Backoff, Condition, Edge, Flow, FlowNode, NodePayload, RetrySpec,
    ScriptPhase, SelectorCandidate, Subflow, TargetSelector, Variable, WaitCondition,
};
