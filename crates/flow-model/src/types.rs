//! Core flow types

use std::collections::{HashMap, HashSet};

use flowpilot_core_types::{FlowId, NodeId, SubflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binding::Binding;
use crate::errors::ModelError;

/// A complete flow definition. Immutable during a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,

    pub name: String,

    /// Declared run variables, in declaration order.
    #[serde(default)]
    pub variables: Vec<Variable>,

    #[serde(default)]
    pub nodes: Vec<FlowNode>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Loop bodies referenced by `Foreach`/`While` payloads.
    #[serde(default)]
    pub subflows: HashMap<SubflowId, Subflow>,

    /// Rules constraining which target state this flow may run against.
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FlowId(id.into()),
            name: name.into(),
            variables: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            subflows: HashMap::new(),
            bindings: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_subflow(mut self, id: impl Into<String>, subflow: Subflow) -> Self {
        self.subflows.insert(SubflowId(id.into()), subflow);
        self
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Keys of every variable declared `sensitive`.
    pub fn sensitive_keys(&self) -> HashSet<String> {
        self.variables
            .iter()
            .filter(|v| v.sensitive)
            .map(|v| v.key.clone())
            .collect()
    }

    /// Validate structural invariants: node ids unique per scope, edges only
    /// between nodes of the same scope.
    pub fn validate(&self) -> Result<(), ModelError> {
        validate_scope("flow", &self.nodes, &self.edges)?;
        for (id, sub) in &self.subflows {
            validate_scope(&format!("subflow {}", id), &sub.nodes, &sub.edges)?;
        }
        Ok(())
    }
}

fn validate_scope(scope: &str, nodes: &[FlowNode], edges: &[Edge]) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(&node.id) {
            return Err(ModelError::DuplicateNode(
                node.id.0.clone(),
                scope.to_string(),
            ));
        }
    }
    for edge in edges {
        if !seen.contains(&edge.from) {
            return Err(ModelError::DanglingEdge(
                edge.from.0.clone(),
                scope.to_string(),
            ));
        }
        if !seen.contains(&edge.to) {
            return Err(ModelError::DanglingEdge(
                edge.to.0.clone(),
                scope.to_string(),
            ));
        }
    }
    Ok(())
}

/// One step or control construct in the flow graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: NodeId,

    #[serde(flatten)]
    pub payload: NodePayload,

    /// Per-node retry override; no retries when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Capture a screenshot when this node fails after retries.
    #[serde(default = "default_true")]
    pub screenshot_on_fail: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl FlowNode {
    pub fn new(id: impl Into<String>, payload: NodePayload) -> Self {
        Self {
            id: NodeId(id.into()),
            payload,
            retry: None,
            screenshot_on_fail: true,
            timeout_ms: None,
        }
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Short name of the payload kind, used in logs and overlays.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            NodePayload::Navigate { .. } => "navigate",
            NodePayload::Click { .. } => "click",
            NodePayload::Fill { .. } => "fill",
            NodePayload::Key { .. } => "key",
            NodePayload::Scroll { .. } => "scroll",
            NodePayload::Wait { .. } => "wait",
            NodePayload::Assert { .. } => "assert",
            NodePayload::Script { .. } => "script",
            NodePayload::Foreach { .. } => "foreach",
            NodePayload::While { .. } => "while",
        }
    }
}

/// Typed step payloads. The orchestrator never interprets these beyond
/// routing; performing the action is the step executor's job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodePayload {
    Navigate {
        url: String,
    },

    Click {
        target: TargetSelector,
        #[serde(default)]
        wait: AfterWait,
    },

    Fill {
        target: TargetSelector,
        value: String,
    },

    Key {
        keys: String,
    },

    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<TargetSelector>,
        #[serde(default)]
        x: i64,
        #[serde(default)]
        y: i64,
    },

    Wait {
        condition: WaitCondition,
    },

    Assert {
        assert: AssertSpec,
    },

    Script {
        code: String,
        #[serde(default)]
        when: ScriptPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        assign: HashMap<String, String>,
    },

    Foreach {
        list_var: String,
        item_var: String,
        subflow_id: SubflowId,
    },

    While {
        condition: Condition,
        subflow_id: SubflowId,
        max_iterations: u32,
    },
}

/// How a step locates its UI target. Resolution is delegated to the selector
/// engine collaborator; the model only carries the recorded candidates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub ref_hint: Option<String>,

    #[serde(default)]
    pub candidates: Vec<SelectorCandidate>,
}

impl TargetSelector {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            ref_hint: None,
            candidates: vec![SelectorCandidate {
                kind: "css".into(),
                value: selector.into(),
            }],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectorCandidate {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Post-step wait requested by click-like steps.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AfterWait {
    /// Capped quick check for an unplanned navigation.
    #[default]
    QuickCheck,
    /// Suspend until the navigation signal resolves.
    Navigation,
    /// Suspend until network activity goes quiet.
    NetworkIdle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitCondition {
    Text {
        text: String,
        #[serde(default = "default_true")]
        appear: bool,
    },
    Selector {
        selector: String,
        #[serde(default = "default_true")]
        visible: bool,
    },
    NetworkIdle,
    Navigation,
    DelayMs(u64),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertSpec {
    TextPresent(String),
    Exists(String),
    Visible(String),
    Attribute {
        selector: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matches: Option<String>,
    },
}

/// When a script step runs relative to its neighbors. `After` scripts are
/// deferred until the next non-script step completes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptPhase {
    #[default]
    Before,
    After,
}

/// Condition form for `while` directives. Free-form expressions are parsed by
/// a restricted interpreter, never executed as code.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Expr {
        expression: String,
    },
    Var {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<Value>,
    },
}

/// A directed transition. Label `None` or `"default"` is the normal-completion
/// edge; `"onError"` is the failure-recovery edge; other labels are chosen by
/// a step's own result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: NodeId(from.into()),
            to: NodeId(to.into()),
            label: None,
        }
    }

    pub fn labeled(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            from: NodeId(from.into()),
            to: NodeId(to.into()),
            label: Some(label.into()),
        }
    }

    /// Whether this edge is followed on normal completion.
    pub fn is_default(&self) -> bool {
        match self.label.as_deref() {
            None | Some("") | Some("default") => true,
            _ => false,
        }
    }
}

/// A nested `{nodes, edges}` graph executed in fixed default-edge order by
/// loop directives. Intentionally simpler than top-level traversal: no
/// label-based branching inside a subflow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Subflow {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A declared run variable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Sensitive values never appear in externally observable output.
    #[serde(default)]
    pub sensitive: bool,

    /// Required variables with no value are collected from the caller before
    /// traversal starts.
    #[serde(default)]
    pub required: bool,
}

impl Variable {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
            sensitive: false,
            required: false,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Retry budget for a single node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default)]
    pub count: u32,

    #[serde(default)]
    pub interval_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

impl RetrySpec {
    pub fn fixed(count: u32, interval_ms: u64) -> Self {
        Self {
            count,
            interval_ms,
            backoff: Backoff::None,
        }
    }

    pub fn exponential(count: u32, interval_ms: u64) -> Self {
        Self {
            count,
            interval_ms,
            backoff: Backoff::Exp,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    None,
    Exp,
}
