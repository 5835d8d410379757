//! Adjacency structure and edge resolution.
//!
//! Built once per run from the immutable flow definition. Edge selection is
//! label-based: a completed step suggests a label (default `"default"`), the
//! first matching edge wins, and a missing match falls back to the first
//! default edge. No match at all ends traversal, which is a legitimate way
//! for a graph to terminate.

use std::collections::HashMap;

use flowpilot_core_types::NodeId;
use flowpilot_flow_model::{Edge, FlowNode};

/// Label of the failure-recovery edge.
pub const ON_ERROR_LABEL: &str = "onError";

/// Label implied by normal completion.
pub const DEFAULT_LABEL: &str = "default";

pub struct FlowGraph<'a> {
    nodes: &'a [FlowNode],
    by_id: HashMap<&'a NodeId, &'a FlowNode>,
    out_edges: HashMap<&'a NodeId, Vec<&'a Edge>>,
    in_degree: HashMap<&'a NodeId, usize>,
}

impl<'a> FlowGraph<'a> {
    pub fn new(nodes: &'a [FlowNode], edges: &'a [Edge]) -> Self {
        let by_id = nodes.iter().map(|n| (&n.id, n)).collect();
        let mut out_edges: HashMap<&NodeId, Vec<&Edge>> = HashMap::new();
        let mut in_degree: HashMap<&NodeId, usize> =
            nodes.iter().map(|n| (&n.id, 0)).collect();
        for edge in edges {
            out_edges.entry(&edge.from).or_default().push(edge);
            if let Some(count) = in_degree.get_mut(&edge.to) {
                *count += 1;
            }
        }
        Self {
            nodes,
            by_id,
            out_edges,
            in_degree,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&'a FlowNode> {
        self.by_id.get(id).copied()
    }

    /// Resolve the node traversal starts from: an explicitly requested id if
    /// it exists, else the first node with in-degree zero, else the first
    /// declared node.
    pub fn start_node(&self, requested: Option<&NodeId>) -> Option<&'a NodeId> {
        if let Some(id) = requested {
            if let Some(node) = self.by_id.get(id) {
                return Some(&node.id);
            }
        }
        self.nodes
            .iter()
            .find(|n| self.in_degree.get(&n.id).copied().unwrap_or(0) == 0)
            .map(|n| &n.id)
            .or_else(|| self.nodes.first().map(|n| &n.id))
    }

    /// First edge whose label equals `label`, else the first default edge.
    pub fn next_edge(&self, from: &NodeId, label: &str) -> Option<&'a Edge> {
        let edges = self.out_edges.get(from)?;
        edges
            .iter()
            .find(|e| e.label.as_deref().unwrap_or(DEFAULT_LABEL) == label)
            .or_else(|| edges.iter().find(|e| e.is_default()))
            .copied()
    }

    /// The failure-recovery edge out of `from`, if declared.
    pub fn error_edge(&self, from: &NodeId) -> Option<&'a Edge> {
        self.out_edges
            .get(from)?
            .iter()
            .find(|e| e.label.as_deref() == Some(ON_ERROR_LABEL))
            .copied()
    }
}

/// Only the normal-completion edges, preserving declaration order.
pub fn default_edges_only(edges: &[Edge]) -> Vec<&Edge> {
    edges.iter().filter(|e| e.is_default()).collect()
}

/// Kahn topological order over the default edges, breaking ties by node
/// declaration order. Nodes stuck in a cycle are appended in declaration
/// order so the result always covers every node; the precomputed run summary
/// depends on that count being stable.
pub fn topo_order<'a>(nodes: &'a [FlowNode], default_edges: &[&Edge]) -> Vec<&'a FlowNode> {
    let mut in_degree: HashMap<&NodeId, usize> = nodes.iter().map(|n| (&n.id, 0)).collect();
    for edge in default_edges {
        if let Some(count) = in_degree.get_mut(&edge.to) {
            *count += 1;
        }
    }

    let mut visited: HashMap<&NodeId, bool> = nodes.iter().map(|n| (&n.id, false)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    loop {
        let next = nodes.iter().find(|n| {
            !visited.get(&n.id).copied().unwrap_or(true)
                && in_degree.get(&n.id).copied().unwrap_or(0) == 0
        });
        let Some(node) = next else { break };
        visited.insert(&node.id, true);
        order.push(node);
        for edge in default_edges {
            if edge.from == node.id {
                if let Some(count) = in_degree.get_mut(&edge.to) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    // Anything left is part of a default-edge cycle.
    for node in nodes {
        if !visited.get(&node.id).copied().unwrap_or(true) {
            order.push(node);
        }
    }
    order
}
