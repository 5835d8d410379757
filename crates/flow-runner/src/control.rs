//! Loop directives emitted by control-flow steps.
//!
//! A `foreach` or `while` node does no browser work itself; executing it
//! yields a directive the orchestrator expands into repeated subflow runs.

use flowpilot_core_types::SubflowId;
use flowpilot_flow_model::Condition;

use crate::expr::{eval_expression, is_truthy, loose_eq};
use crate::vars::VarStore;

#[derive(Clone, Debug)]
pub enum ControlDirective {
    /// Run the subflow once per element of the list variable, binding the
    /// current element to `item_var` before each pass.
    Foreach {
        list_var: String,
        item_var: String,
        subflow_id: SubflowId,
    },
    /// Run the subflow while the condition holds, up to `max_iterations`.
    While {
        condition: Condition,
        subflow_id: SubflowId,
        max_iterations: u32,
    },
}

/// Evaluate a loop condition against the current variables. Unparseable
/// expressions and missing variables are false, never errors. The `equals`
/// comparison uses the same loose, textual-form equality as the expression
/// interpreter, so a numeric variable matches its string spelling.
pub fn eval_condition(condition: &Condition, vars: &VarStore) -> bool {
    match condition {
        Condition::Expr { expression } => eval_expression(expression, vars),
        Condition::Var { var, equals } => match vars.get(var) {
            None => false,
            Some(value) => match equals {
                Some(expected) => loose_eq(value, expected),
                None => is_truthy(value),
            },
        },
    }
}
