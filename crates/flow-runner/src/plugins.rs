//! Run lifecycle plugins.
//!
//! Plugins observe a run and can intervene at two points: `before_step` and
//! `on_error` may request a pause, and `on_choose_next_label` may override
//! the edge label a completed step suggested. Every other hook is
//! observational. A failing hook never fails the run; the failure is logged
//! and the remaining plugins still fire.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use flowpilot_core_types::{NodeId, RunId, SubflowId};
use flowpilot_flow_model::{Flow, FlowNode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::vars::VarStore;

/// Shared context handed to every hook.
#[derive(Clone)]
pub struct RunCx {
    pub run_id: RunId,
    pub flow: Arc<Flow>,
    pub vars: Arc<Mutex<VarStore>>,
}

#[derive(Debug, Error)]
#[error("plugin error: {0}")]
pub struct PluginError(pub String);

/// Outcome of an intervening hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookControl {
    Continue,
    Pause,
}

#[async_trait]
pub trait RunPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn run_start(&self, _cx: &RunCx) -> Result<(), PluginError> {
        Ok(())
    }

    /// Fires before a step's side effects. `Pause` suspends the run with the
    /// step not yet executed.
    async fn before_step(&self, _cx: &RunCx, _step: &FlowNode) -> Result<HookControl, PluginError> {
        Ok(HookControl::Continue)
    }

    /// Fires after a step completes successfully. Failed steps go through
    /// `on_error` instead.
    async fn after_step(&self, _cx: &RunCx, _step: &FlowNode) -> Result<(), PluginError> {
        Ok(())
    }

    /// Fires after a step has exhausted its retries. `Pause` suspends the run
    /// instead of following the failure edge.
    async fn on_error(
        &self,
        _cx: &RunCx,
        _step: &FlowNode,
        _error: &str,
    ) -> Result<HookControl, PluginError> {
        Ok(HookControl::Continue)
    }

    async fn on_retry(
        &self,
        _cx: &RunCx,
        _step: &FlowNode,
        _retry_index: u32,
        _error: &str,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// May replace the label a completed step suggested. Return `None` (or an
    /// empty string) to leave the suggestion alone.
    async fn on_choose_next_label(
        &self,
        _cx: &RunCx,
        _step: &FlowNode,
        _suggested: &str,
    ) -> Option<String> {
        None
    }

    async fn subflow_start(&self, _cx: &RunCx, _subflow_id: &SubflowId) -> Result<(), PluginError> {
        Ok(())
    }

    async fn subflow_end(&self, _cx: &RunCx, _subflow_id: &SubflowId) -> Result<(), PluginError> {
        Ok(())
    }

    async fn run_end(&self, _cx: &RunCx) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Ordered plugin list with the dispatch rules baked in.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn RunPlugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn RunPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn run_start(&self, cx: &RunCx) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.run_start(cx).await {
                warn!(plugin = plugin.name(), %err, "run_start hook failed");
            }
        }
    }

    /// First plugin requesting a pause wins; later plugins are not consulted.
    /// A hook error counts as `Continue`.
    pub async fn before_step(&self, cx: &RunCx, step: &FlowNode) -> HookControl {
        for plugin in &self.plugins {
            match plugin.before_step(cx, step).await {
                Ok(HookControl::Pause) => {
                    debug!(plugin = plugin.name(), step = %step.id, "pause requested");
                    return HookControl::Pause;
                }
                Ok(HookControl::Continue) => {}
                Err(err) => {
                    warn!(plugin = plugin.name(), %err, "before_step hook failed");
                }
            }
        }
        HookControl::Continue
    }

    pub async fn after_step(&self, cx: &RunCx, step: &FlowNode) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.after_step(cx, step).await {
                warn!(plugin = plugin.name(), %err, "after_step hook failed");
            }
        }
    }

    pub async fn on_error(&self, cx: &RunCx, step: &FlowNode, error: &str) -> HookControl {
        for plugin in &self.plugins {
            match plugin.on_error(cx, step, error).await {
                Ok(HookControl::Pause) => {
                    debug!(plugin = plugin.name(), step = %step.id, "pause on error");
                    return HookControl::Pause;
                }
                Ok(HookControl::Continue) => {}
                Err(err) => {
                    warn!(plugin = plugin.name(), %err, "on_error hook failed");
                }
            }
        }
        HookControl::Continue
    }

    pub async fn on_retry(&self, cx: &RunCx, step: &FlowNode, retry_index: u32, error: &str) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_retry(cx, step, retry_index, error).await {
                warn!(plugin = plugin.name(), %err, "on_retry hook failed");
            }
        }
    }

    /// First non-empty override wins; otherwise the suggestion stands.
    pub async fn choose_next_label(&self, cx: &RunCx, step: &FlowNode, suggested: &str) -> String {
        for plugin in &self.plugins {
            if let Some(label) = plugin.on_choose_next_label(cx, step, suggested).await {
                if !label.is_empty() {
                    debug!(plugin = plugin.name(), %label, "label overridden");
                    return label;
                }
            }
        }
        suggested.to_string()
    }

    pub async fn subflow_start(&self, cx: &RunCx, subflow_id: &SubflowId) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.subflow_start(cx, subflow_id).await {
                warn!(plugin = plugin.name(), %err, "subflow_start hook failed");
            }
        }
    }

    pub async fn subflow_end(&self, cx: &RunCx, subflow_id: &SubflowId) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.subflow_end(cx, subflow_id).await {
                warn!(plugin = plugin.name(), %err, "subflow_end hook failed");
            }
        }
    }

    pub async fn run_end(&self, cx: &RunCx) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.run_end(cx).await {
                warn!(plugin = plugin.name(), %err, "run_end hook failed");
            }
        }
    }
}

/// Built-in debugging plugin: pauses the run right before any step whose id
/// is in the break set. With an empty set it never intervenes, which makes it
/// a safe default member of every run.
pub struct BreakpointPlugin {
    enabled: bool,
    break_at: HashSet<NodeId>,
}

impl BreakpointPlugin {
    pub fn new(break_at: HashSet<NodeId>) -> Self {
        Self {
            enabled: !break_at.is_empty(),
            break_at,
        }
    }

    pub fn disabled() -> Self {
        Self::new(HashSet::new())
    }
}

#[async_trait]
impl RunPlugin for BreakpointPlugin {
    fn name(&self) -> &str {
        "breakpoint"
    }

    async fn before_step(&self, _cx: &RunCx, step: &FlowNode) -> Result<HookControl, PluginError> {
        if self.enabled && self.break_at.contains(&step.id) {
            return Ok(HookControl::Pause);
        }
        Ok(HookControl::Continue)
    }
}
