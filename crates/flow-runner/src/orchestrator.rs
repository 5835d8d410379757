//! Run orchestration: prepare, traverse, clean up.
//!
//! A run walks the flow graph one step at a time. Completed steps suggest an
//! edge label; failed steps follow their `onError` edge or end traversal.
//! Step failures, the global deadline, and the iteration guard are all folded
//! into the run result rather than surfaced as errors; only a structurally
//! invalid flow aborts before traversal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowpilot_core_types::{NodeId, RunId, SubflowId};
use flowpilot_flow_model::{Flow, FlowNode, NodePayload};
use flowpilot_net_capture::{CaptureOptions, NetworkCapture};
use flowpilot_run_log::{LogSink, LogStatus, RunLogEntry};
use flowpilot_run_registry::{RunRecord, RunRegistry, RunStatus};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{
    post_step_wait, StepCtx, StepError, StepExecutor, StepOutcome, TargetOptions, TargetProvisioner,
    VariablePrompter,
};
use crate::control::{eval_condition, ControlDirective};
use crate::errors::RunnerError;
use crate::graph::{default_edges_only, topo_order, FlowGraph, DEFAULT_LABEL};
use crate::plugins::{BreakpointPlugin, HookControl, PluginManager, RunCx, RunPlugin};
use crate::result::{RunResult, RunSummary};
use crate::retry::{with_retry, RetryPolicy};
use crate::vars::VarStore;

/// Default global deadline for a run.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Traversal stops after this many steps, cycles included.
const MAX_ITERATIONS: usize = 10_000;

#[derive(Clone, Default)]
pub struct RunOptions {
    /// Navigate here before traversal. When absent the URL of the flow's
    /// first navigate step is used, if it has one.
    pub start_url: Option<String>,
    /// Force a fresh navigation even if a suitable target is already open.
    pub refresh: bool,
    pub capture_network: bool,
    /// Include the full log in the run result.
    pub return_logs: bool,
    /// Global deadline; [`DEFAULT_TIMEOUT_MS`] when absent.
    pub timeout_ms: Option<u64>,
    /// Caller-supplied variable values; override declared defaults.
    pub args: Map<String, Value>,
    /// Start traversal here instead of at the graph root.
    pub start_node_id: Option<NodeId>,
    /// Step ids to pause at, wired into the built-in breakpoint plugin.
    pub break_at: HashSet<NodeId>,
    pub plugins: Vec<Arc<dyn RunPlugin>>,
}

/// Everything the orchestrator delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn StepExecutor>,
    pub provisioner: Arc<dyn TargetProvisioner>,
    pub registry: Arc<dyn RunRegistry>,
    pub log: Arc<dyn LogSink>,
    pub capture: Arc<dyn NetworkCapture>,
    pub prompter: Arc<dyn VariablePrompter>,
}

enum StepExec {
    /// A plugin paused the run before the step's side effects.
    Paused,
    Failed { message: String, took_ms: u64 },
    Success { outcome: StepOutcome, took_ms: u64 },
}

enum LoopOutcome {
    Completed,
    Paused,
    DeadlineExceeded,
}

pub struct Orchestrator {
    run_id: RunId,
    flow: Arc<Flow>,
    options: RunOptions,
    collab: Collaborators,
    vars: Arc<Mutex<VarStore>>,
    plugins: PluginManager,
    sensitive: HashSet<String>,
    planned_total: usize,
    failed: usize,
    paused: bool,
    started: Instant,
    started_at_ms: u64,
    deadline: Instant,
    capture_active: bool,
}

impl Orchestrator {
    pub fn new(flow: Flow, mut options: RunOptions, collab: Collaborators) -> Self {
        let vars = Arc::new(Mutex::new(VarStore::from_declarations(
            &flow.variables,
            &options.args,
        )));
        let mut plugin_list = std::mem::take(&mut options.plugins);
        plugin_list.push(Arc::new(BreakpointPlugin::new(options.break_at.clone())));
        let sensitive = flow.sensitive_keys();
        let now = Instant::now();
        Self {
            run_id: RunId::new(),
            flow: Arc::new(flow),
            options,
            collab,
            vars,
            plugins: PluginManager::new(plugin_list),
            sensitive,
            planned_total: 0,
            failed: 0,
            paused: false,
            started: now,
            started_at_ms: 0,
            deadline: now,
            capture_active: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Execute the run to a terminal state. Cleanup always runs, including
    /// for runs that never reach traversal.
    pub async fn run(mut self) -> Result<RunResult, RunnerError> {
        self.flow.validate()?;

        self.started = Instant::now();
        self.started_at_ms = Utc::now().timestamp_millis() as u64;
        let timeout = self.options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        self.deadline = self.started + Duration::from_millis(timeout);

        let result = match self.prepare().await {
            Some(terminal) => terminal,
            None => self.traverse().await,
        };
        self.cleanup(&result).await;
        Ok(result)
    }

    /// Everything before the first step. `Some` is a terminal result that
    /// skips traversal.
    async fn prepare(&mut self) -> Option<RunResult> {
        let flow = self.flow.clone();
        let defaults = default_edges_only(&flow.edges);
        let planned = topo_order(&flow.nodes, &defaults);
        self.planned_total = planned.len();

        // The flow's own first navigation doubles as the start URL unless the
        // caller supplied one. Its template is expanded against an empty
        // environment because no step has run yet.
        let derived = planned.iter().find_map(|node| match &node.payload {
            NodePayload::Navigate { url } => Some(VarStore::new().expand_str(url)),
            _ => None,
        });

        let record = RunRecord::running(
            self.run_id.clone(),
            self.flow.id.clone(),
            self.flow.name.clone(),
        );
        if let Err(err) = self.collab.registry.add(record).await {
            warn!(%err, "run registry rejected the run record");
        }
        info!(run_id = %self.run_id, flow = %self.flow.id, "run starting");

        let cx = self.cx();
        self.plugins.run_start(&cx).await;

        self.collect_missing_variables().await;

        if let Some(terminal) = self.enforce_bindings(derived.as_deref()).await {
            return Some(terminal);
        }

        if self.flow.nodes.is_empty() {
            return Some(self.terminal_failure("graph-check", "flow has no steps").await);
        }

        let target_options = TargetOptions {
            start_url: self.options.start_url.clone().or(derived),
            refresh: self.options.refresh,
        };
        if let Err(err) = self.collab.provisioner.ensure_target(target_options).await {
            warn!(%err, "target provisioning failed; continuing with current target");
        }

        if self.options.capture_network {
            self.capture_active = self.collab.capture.start(CaptureOptions::default()).await;
            if !self.capture_active {
                debug!("network capture unavailable for this run");
            }
        }
        None
    }

    /// Ask the prompter for declared variables that still have no usable
    /// value. A dismissed prompt leaves them unset.
    async fn collect_missing_variables(&self) {
        let needed: Vec<_> = {
            let vars = self.vars.lock().await;
            self.flow
                .variables
                .iter()
                .filter(|v| !vars.has_value(&v.key) && (v.required || v.default.is_none()))
                .cloned()
                .collect()
        };
        if needed.is_empty() {
            return;
        }
        if let Some(values) = self.collab.prompter.collect(&needed).await {
            let mut vars = self.vars.lock().await;
            for (key, value) in values {
                vars.set(&key, value);
            }
        }
    }

    /// Bindings constrain which page a flow may run against. An explicit
    /// start target is the caller's own choice and is exempt; a start URL
    /// derived from the flow's first navigation is checked before anything
    /// runs, since that is where the run will land.
    async fn enforce_bindings(&mut self, derived: Option<&str>) -> Option<RunResult> {
        if self.options.start_url.is_some() || self.flow.bindings.is_empty() {
            return None;
        }
        if let Some(url) = derived {
            if self.flow.bindings.iter().any(|b| b.matches(url)) {
                return None;
            }
            return Some(
                self.terminal_failure(
                    "binding-check",
                    format!("flow is not bound to its start url ({url})"),
                )
                .await,
            );
        }
        let current = self.collab.provisioner.current_target().await;
        let matched = current
            .as_ref()
            .map(|t| self.flow.bindings.iter().any(|b| b.matches(&t.url)))
            .unwrap_or(false);
        if matched {
            return None;
        }
        let at = current.map(|t| t.url).unwrap_or_else(|| "no target".into());
        Some(
            self.terminal_failure(
                "binding-check",
                format!("flow is not bound to the current target ({at})"),
            )
            .await,
        )
    }

    /// A run that failed before its first step. The triggering entry is
    /// returned inline so the caller sees it even without `return_logs`.
    /// No step ran, so the summary counts no failures; only the success flag
    /// carries the verdict.
    async fn terminal_failure(&mut self, step_id: &str, message: impl Into<String>) -> RunResult {
        let entry = RunLogEntry::failed(step_id).with_message(message);
        if let Err(err) = self.collab.log.push(entry.clone()).await {
            warn!(%err, "log sink rejected entry");
        }
        RunResult {
            run_id: self.run_id.clone(),
            success: false,
            summary: RunSummary::new(0, 0, self.started.elapsed().as_millis() as u64),
            outputs: None,
            logs: Some(vec![entry]),
            screenshot_on_failure: None,
            paused: false,
        }
    }

    async fn traverse(&mut self) -> RunResult {
        let flow = self.flow.clone();
        let graph = FlowGraph::new(&flow.nodes, &flow.edges);
        let mut current: Option<NodeId> = graph
            .start_node(self.options.start_node_id.as_ref())
            .cloned();
        let mut deferred: Option<FlowNode> = None;
        let mut iterations = 0usize;

        while let Some(node_id) = current.take() {
            if iterations >= MAX_ITERATIONS {
                self.record_synthetic_failure(
                    "loop-guard",
                    format!("traversal exceeded {MAX_ITERATIONS} steps"),
                )
                .await;
                break;
            }
            iterations += 1;

            if self.deadline_exceeded() {
                self.record_global_timeout().await;
                break;
            }

            let Some(node) = graph.node(&node_id) else {
                break;
            };

            match self.execute_single_step(node).await {
                StepExec::Paused => {
                    self.paused = true;
                    break;
                }
                StepExec::Failed { message, took_ms } => {
                    self.record_step_failure(node, &message, took_ms).await;
                    let cx = self.cx();
                    if self.plugins.on_error(&cx, node, &message).await == HookControl::Pause {
                        self.paused = true;
                        break;
                    }
                    match graph.error_edge(&node.id) {
                        Some(edge) => current = Some(edge.to.clone()),
                        None => break,
                    }
                }
                StepExec::Success { outcome, took_ms } => {
                    if !outcome.already_logged {
                        let entry =
                            RunLogEntry::success(node.id.to_string()).with_took_ms(took_ms);
                        if let Err(err) = self.collab.log.push(entry).await {
                            warn!(%err, "log sink rejected entry");
                        }
                    }
                    let cx = self.cx();
                    self.plugins.after_step(&cx, node).await;

                    // A deferred after-script runs once the step following
                    // it has completed.
                    if let Some(script) = deferred.take() {
                        self.run_deferred_script(&script).await;
                    }
                    deferred = outcome.defer_after_script;

                    if let Some(directive) = &outcome.control {
                        match self.run_loop(directive).await {
                            LoopOutcome::Completed => {}
                            LoopOutcome::Paused => {
                                self.paused = true;
                                break;
                            }
                            LoopOutcome::DeadlineExceeded => {
                                self.record_global_timeout().await;
                                break;
                            }
                        }
                    }

                    let suggested = outcome
                        .next_label
                        .unwrap_or_else(|| DEFAULT_LABEL.to_string());
                    let label = self.plugins.choose_next_label(&cx, node, &suggested).await;
                    match graph.next_edge(&node.id, &label) {
                        Some(edge) => current = Some(edge.to.clone()),
                        None => break,
                    }
                }
            }
        }

        if !self.paused {
            if let Some(script) = deferred.take() {
                self.run_deferred_script(&script).await;
            }
        }

        self.assemble_result().await
    }

    /// One step with retries. Pause is checked before any side effect.
    async fn execute_single_step(&self, node: &FlowNode) -> StepExec {
        let cx = self.cx();
        if self.plugins.before_step(&cx, node).await == HookControl::Pause {
            info!(step = %node.id, "run paused before step");
            return StepExec::Paused;
        }

        self.collab
            .log
            .overlay(&format!("{} {}", node.kind(), node.id))
            .await;

        let started = Instant::now();
        let policy = node
            .retry
            .as_ref()
            .map(RetryPolicy::from)
            .unwrap_or_default();
        let step_ctx = StepCtx {
            run_id: self.run_id.clone(),
            vars: self.vars.clone(),
            log: self.collab.log.clone(),
        };
        let executor = self.collab.executor.clone();
        let provisioner = self.collab.provisioner.clone();
        let log = self.collab.log.clone();
        let plugins = self.plugins.clone();
        let retry_cx = cx.clone();

        let result = with_retry(
            &policy,
            || {
                let executor = executor.clone();
                let provisioner = provisioner.clone();
                let ctx = step_ctx.clone();
                async move {
                    // The pre-step URL anchors the post-step wait; a retry
                    // re-captures it.
                    let prev_url = provisioner
                        .current_target()
                        .await
                        .map(|t| t.url)
                        .unwrap_or_default();
                    let outcome = executor.execute(&ctx, node).await?;
                    post_step_wait(provisioner.as_ref(), &ctx, node, &prev_url).await?;
                    Ok(outcome)
                }
            },
            |index, err: &StepError| {
                let message = err.to_string();
                let log = log.clone();
                let plugins = plugins.clone();
                let cx = retry_cx.clone();
                async move {
                    debug!(step = %node.id, index, "retrying step");
                    let entry = RunLogEntry::retrying(node.id.to_string(), message.clone());
                    if let Err(err) = log.push(entry).await {
                        warn!(%err, "log sink rejected entry");
                    }
                    plugins.on_retry(&cx, node, index, &message).await;
                }
            },
        )
        .await;

        let took_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                self.vars
                    .lock()
                    .await
                    .apply_result(outcome.save_as.as_ref(), &outcome.assign);
                StepExec::Success { outcome, took_ms }
            }
            Err(err) => StepExec::Failed {
                message: err.to_string(),
                took_ms,
            },
        }
    }

    async fn record_step_failure(&mut self, node: &FlowNode, message: &str, took_ms: u64) {
        self.failed += 1;
        let entry = RunLogEntry::failed(node.id.to_string())
            .with_message(message)
            .with_took_ms(took_ms);
        if let Err(err) = self.collab.log.push(entry).await {
            warn!(%err, "log sink rejected entry");
        }
        if node.screenshot_on_fail {
            self.collab.log.screenshot_on_failure().await;
        }
        warn!(step = %node.id, message, "step failed");
    }

    async fn record_synthetic_failure(&mut self, step_id: &str, message: impl Into<String>) {
        self.failed += 1;
        let entry = RunLogEntry::failed(step_id).with_message(message);
        if let Err(err) = self.collab.log.push(entry).await {
            warn!(%err, "log sink rejected entry");
        }
    }

    async fn record_global_timeout(&mut self) {
        warn!(run_id = %self.run_id, "run exceeded its global deadline");
        self.record_synthetic_failure("global-timeout", "run exceeded its global deadline")
            .await;
    }

    fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Expand a loop directive into repeated subflow runs. A pause anywhere
    /// inside aborts the whole loop; a failed subflow step does not.
    async fn run_loop(&mut self, directive: &ControlDirective) -> LoopOutcome {
        match directive {
            ControlDirective::Foreach {
                list_var,
                item_var,
                subflow_id,
            } => {
                let items = {
                    let vars = self.vars.lock().await;
                    match vars.get(list_var) {
                        Some(Value::Array(items)) => items.clone(),
                        _ => {
                            debug!(list_var, "foreach over a non-list expands to nothing");
                            Vec::new()
                        }
                    }
                };
                for item in items {
                    self.vars.lock().await.set(item_var, item);
                    match self.run_subflow(subflow_id).await {
                        LoopOutcome::Completed => {}
                        other => return other,
                    }
                }
                LoopOutcome::Completed
            }
            ControlDirective::While {
                condition,
                subflow_id,
                max_iterations,
            } => {
                // The declared limit is literal: zero runs the body zero
                // times.
                let mut iteration = 0;
                while iteration < *max_iterations {
                    let holds = {
                        let vars = self.vars.lock().await;
                        eval_condition(condition, &vars)
                    };
                    if !holds {
                        break;
                    }
                    match self.run_subflow(subflow_id).await {
                        LoopOutcome::Completed => {}
                        other => return other,
                    }
                    iteration += 1;
                }
                LoopOutcome::Completed
            }
        }
    }

    /// Subflows run their steps in default-edge order, without branching.
    async fn run_subflow(&mut self, subflow_id: &SubflowId) -> LoopOutcome {
        let flow = self.flow.clone();
        let Some(subflow) = flow.subflows.get(subflow_id) else {
            warn!(subflow = %subflow_id, "unknown subflow; skipping");
            return LoopOutcome::Completed;
        };
        let cx = self.cx();
        self.plugins.subflow_start(&cx, subflow_id).await;

        let defaults = default_edges_only(&subflow.edges);
        let order: Vec<FlowNode> = topo_order(&subflow.nodes, &defaults)
            .into_iter()
            .cloned()
            .collect();

        let mut outcome = LoopOutcome::Completed;
        let mut deferred: Option<FlowNode> = None;
        for node in &order {
            if self.deadline_exceeded() {
                outcome = LoopOutcome::DeadlineExceeded;
                break;
            }
            match self.execute_single_step(node).await {
                StepExec::Paused => {
                    self.paused = true;
                    outcome = LoopOutcome::Paused;
                    break;
                }
                StepExec::Failed { message, took_ms } => {
                    self.record_step_failure(node, &message, took_ms).await;
                    if self.plugins.on_error(&cx, node, &message).await == HookControl::Pause {
                        self.paused = true;
                        outcome = LoopOutcome::Paused;
                        break;
                    }
                }
                StepExec::Success {
                    outcome: step_outcome,
                    took_ms,
                } => {
                    if !step_outcome.already_logged {
                        let entry =
                            RunLogEntry::success(node.id.to_string()).with_took_ms(took_ms);
                        if let Err(err) = self.collab.log.push(entry).await {
                            warn!(%err, "log sink rejected entry");
                        }
                    }
                    self.plugins.after_step(&cx, node).await;
                    if let Some(script) = deferred.take() {
                        self.run_deferred_script(&script).await;
                    }
                    deferred = step_outcome.defer_after_script;
                    if step_outcome.control.is_some() {
                        warn!(step = %node.id, "nested loop directives are ignored inside subflows");
                    }
                }
            }
        }

        if matches!(outcome, LoopOutcome::Completed) {
            if let Some(script) = deferred.take() {
                self.run_deferred_script(&script).await;
            }
        }
        self.plugins.subflow_end(&cx, subflow_id).await;
        outcome
    }

    /// Deferred after-scripts are best-effort: a failure is logged but does
    /// not fail the run.
    async fn run_deferred_script(&self, node: &FlowNode) {
        let ctx = StepCtx {
            run_id: self.run_id.clone(),
            vars: self.vars.clone(),
            log: self.collab.log.clone(),
        };
        match self.collab.executor.execute(&ctx, node).await {
            Ok(outcome) => {
                self.vars
                    .lock()
                    .await
                    .apply_result(outcome.save_as.as_ref(), &outcome.assign);
                if !outcome.already_logged {
                    let entry = RunLogEntry::success(node.id.to_string());
                    if let Err(err) = self.collab.log.push(entry).await {
                        warn!(%err, "log sink rejected entry");
                    }
                }
            }
            Err(err) => {
                warn!(step = %node.id, %err, "deferred script failed");
                let entry =
                    RunLogEntry::failed(node.id.to_string()).with_message(err.to_string());
                if let Err(err) = self.collab.log.push(entry).await {
                    warn!(%err, "log sink rejected entry");
                }
            }
        }
    }

    async fn assemble_result(&mut self) -> RunResult {
        let took_ms = self.started.elapsed().as_millis() as u64;
        let logs = self.collab.log.logs();
        let screenshot = logs
            .iter()
            .find(|e| e.status == LogStatus::Failed && e.screenshot.is_some())
            .and_then(|e| e.screenshot.clone());
        let outputs = Some(self.vars.lock().await.redacted_snapshot(&self.sensitive));
        RunResult {
            run_id: self.run_id.clone(),
            success: !self.paused && self.failed == 0,
            summary: RunSummary::new(self.planned_total, self.failed, took_ms),
            outputs,
            logs: self.options.return_logs.then_some(logs),
            screenshot_on_failure: screenshot,
            paused: self.paused,
        }
    }

    /// Always runs, whatever state the run ended in. Every part is
    /// best-effort.
    async fn cleanup(&mut self, result: &RunResult) {
        if self.capture_active {
            let summary = self.collab.capture.stop().await;
            let network = serde_json::to_value(&summary).unwrap_or(Value::Null);
            let entry =
                RunLogEntry::new("network-capture", LogStatus::Success).with_network(network);
            if let Err(err) = self.collab.log.push(entry).await {
                warn!(%err, "log sink rejected entry");
            }
        }

        let cx = self.cx();
        self.plugins.run_end(&cx).await;

        if !result.paused {
            if let Err(err) = self
                .collab
                .log
                .persist(&self.flow.id, self.started_at_ms, result.success)
                .await
            {
                warn!(%err, "run log persist failed");
            }
        }

        let status = if result.paused {
            RunStatus::Stopped
        } else if self.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if let Err(err) = self.collab.registry.update(&self.run_id, status).await {
            warn!(%err, "run registry update failed");
        }
        // Paused runs keep their record so they can be found and resumed.
        if !result.paused {
            if let Err(err) = self.collab.registry.remove(&self.run_id).await {
                warn!(%err, "run registry remove failed");
            }
        }
        info!(run_id = %self.run_id, success = result.success, paused = result.paused, "run finished");
    }

    fn cx(&self) -> RunCx {
        RunCx {
            run_id: self.run_id.clone(),
            flow: self.flow.clone(),
            vars: self.vars.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoopPrompter, StepError};
    use crate::plugins::PluginError;
    use async_trait::async_trait;
    use flowpilot_core_types::TargetDescriptor;
    use flowpilot_flow_model::{
        AfterWait, Binding, Condition, Edge, Flow, RetrySpec, Subflow, TargetSelector, Variable,
        WaitCondition,
    };
    use flowpilot_net_capture::{MemoryCapture, NoopCapture};
    use flowpilot_run_log::MemoryLogSink;
    use flowpilot_run_registry::InMemoryRunRegistry;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Fail,
        FailFirst(AtomicU32),
        Label(String),
        SaveAs(String, Value),
        Defer(FlowNode),
        NavigateTo(String),
    }

    #[derive(Default)]
    struct MockExecutor {
        behaviors: HashMap<String, Behavior>,
        executed: SyncMutex<Vec<String>>,
        watch_var: Option<String>,
        watched: SyncMutex<Vec<Value>>,
        target: Option<Arc<FixedTarget>>,
    }

    impl MockExecutor {
        fn with_behavior(mut self, step_id: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(step_id.to_string(), behavior);
            self
        }

        fn watching(mut self, var: &str) -> Self {
            self.watch_var = Some(var.to_string());
            self
        }

        /// Share the provisioner so navigate steps move the mock target.
        fn with_target(mut self, target: Arc<FixedTarget>) -> Self {
            self.target = Some(target);
            self
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for MockExecutor {
        async fn execute(&self, ctx: &StepCtx, step: &FlowNode) -> Result<StepOutcome, StepError> {
            self.executed.lock().push(step.id.to_string());
            if let Some(watch) = &self.watch_var {
                if let Some(value) = ctx.vars.lock().await.get(watch) {
                    self.watched.lock().push(value.clone());
                }
            }
            match &step.payload {
                NodePayload::Navigate { url } => {
                    let expanded = ctx.vars.lock().await.expand_str(url);
                    if let Some(target) = &self.target {
                        target.set(expanded);
                    }
                }
                NodePayload::Foreach {
                    list_var,
                    item_var,
                    subflow_id,
                } => {
                    return Ok(StepOutcome::ok().with_control(ControlDirective::Foreach {
                        list_var: list_var.clone(),
                        item_var: item_var.clone(),
                        subflow_id: subflow_id.clone(),
                    }))
                }
                NodePayload::While {
                    condition,
                    subflow_id,
                    max_iterations,
                } => {
                    return Ok(StepOutcome::ok().with_control(ControlDirective::While {
                        condition: condition.clone(),
                        subflow_id: subflow_id.clone(),
                        max_iterations: *max_iterations,
                    }))
                }
                NodePayload::Wait {
                    condition: WaitCondition::DelayMs(ms),
                } => tokio::time::sleep(Duration::from_millis(*ms)).await,
                _ => {}
            }
            match self.behaviors.get(&step.id.to_string()) {
                None => Ok(StepOutcome::ok()),
                Some(Behavior::Fail) => Err(StepError::new("element not found")),
                Some(Behavior::FailFirst(remaining)) => {
                    if remaining.load(Ordering::SeqCst) > 0 {
                        remaining.fetch_sub(1, Ordering::SeqCst);
                        Err(StepError::new("transient failure"))
                    } else {
                        Ok(StepOutcome::ok())
                    }
                }
                Some(Behavior::Label(label)) => Ok(StepOutcome::ok().with_label(label.clone())),
                Some(Behavior::SaveAs(key, value)) => Ok(StepOutcome {
                    save_as: Some((key.clone(), value.clone())),
                    ..Default::default()
                }),
                Some(Behavior::Defer(node)) => Ok(StepOutcome {
                    defer_after_script: Some(node.clone()),
                    ..Default::default()
                }),
                Some(Behavior::NavigateTo(url)) => {
                    if let Some(target) = &self.target {
                        target.set(url.clone());
                    }
                    Ok(StepOutcome::ok())
                }
            }
        }
    }

    struct FixedTarget {
        current: SyncMutex<Option<String>>,
    }

    impl FixedTarget {
        fn at(url: Option<&str>) -> Self {
            Self {
                current: SyncMutex::new(url.map(str::to_string)),
            }
        }

        fn set(&self, url: impl Into<String>) {
            *self.current.lock() = Some(url.into());
        }
    }

    #[async_trait]
    impl TargetProvisioner for FixedTarget {
        async fn ensure_target(
            &self,
            options: TargetOptions,
        ) -> Result<TargetDescriptor, StepError> {
            if let Some(url) = options.start_url {
                if options.refresh || self.current.lock().is_none() {
                    self.set(url);
                }
            }
            Ok(self
                .current
                .lock()
                .clone()
                .map(TargetDescriptor::new)
                .unwrap_or_else(|| TargetDescriptor::new("about:blank")))
        }

        async fn current_target(&self) -> Option<TargetDescriptor> {
            self.current.lock().clone().map(TargetDescriptor::new)
        }
    }

    struct Harness {
        log: Arc<MemoryLogSink>,
        registry: Arc<InMemoryRunRegistry>,
        collab: Collaborators,
    }

    fn harness(executor: Arc<MockExecutor>, current_url: Option<&str>) -> Harness {
        harness_at(executor, Arc::new(FixedTarget::at(current_url)))
    }

    fn harness_at(executor: Arc<MockExecutor>, provisioner: Arc<FixedTarget>) -> Harness {
        let log = Arc::new(MemoryLogSink::new());
        let registry = Arc::new(InMemoryRunRegistry::new());
        let collab = Collaborators {
            executor,
            provisioner,
            registry: registry.clone(),
            log: log.clone(),
            capture: Arc::new(NoopCapture),
            prompter: Arc::new(NoopPrompter),
        };
        Harness {
            log,
            registry,
            collab,
        }
    }

    fn step(id: &str) -> FlowNode {
        FlowNode::new(id, NodePayload::Key { keys: "Enter".into() })
    }

    fn linear_flow(ids: &[&str]) -> Flow {
        let mut flow = Flow::new("f1", "test flow");
        for id in ids {
            flow = flow.with_node(step(id));
        }
        for pair in ids.windows(2) {
            flow = flow.with_edge(Edge::new(pair[0], pair[1]));
        }
        flow
    }

    #[tokio::test]
    async fn linear_flow_completes() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let orch = Orchestrator::new(
            linear_flow(&["a", "b", "c"]),
            RunOptions {
                return_logs: true,
                ..Default::default()
            },
            h.collab.clone(),
        );
        let run_id = orch.run_id().clone();
        let result = orch.run().await.unwrap();

        assert!(result.success);
        assert!(!result.paused);
        assert_eq!(result.summary.total, 3);
        assert_eq!(result.summary.success, 3);
        assert_eq!(result.summary.failed, 0);
        assert_eq!(executor.executed(), vec!["a", "b", "c"]);
        assert_eq!(result.logs.unwrap().len(), 3);
        assert!(result.outputs.is_some());
        // Finished runs leave no registry record behind.
        assert!(h.registry.get(&run_id).is_none());
        assert_eq!(h.log.persisted().map(|(_, _, ok)| ok), Some(true));
    }

    #[tokio::test]
    async fn failure_follows_error_edge() {
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Fail));
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "recovering")
            .with_node(step("a"))
            .with_node(step("b"))
            .with_node(step("recover"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::labeled("a", "recover", "onError"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(executor.executed(), vec!["a", "recover"]);
    }

    #[tokio::test]
    async fn failure_without_recovery_stops_traversal() {
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Fail));
        let h = harness(executor.clone(), None);
        let result = Orchestrator::new(linear_flow(&["a", "b"]), RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(executor.executed(), vec!["a"]);
        let logs = h.log.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn retry_recovers_transient_failures() {
        let executor = Arc::new(
            MockExecutor::default().with_behavior("a", Behavior::FailFirst(AtomicU32::new(2))),
        );
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "flaky")
            .with_node(step("a").with_retry(RetrySpec::fixed(3, 0)));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a", "a", "a"]);
        let logs = h.log.logs();
        let retrying = logs.iter().filter(|e| e.status == LogStatus::Retrying).count();
        assert_eq!(retrying, 2);
        assert_eq!(logs.last().unwrap().status, LogStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_step_failed() {
        let executor = Arc::new(
            MockExecutor::default().with_behavior("a", Behavior::FailFirst(AtomicU32::new(9))),
        );
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "flaky")
            .with_node(step("a").with_retry(RetrySpec::fixed(1, 0)));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(executor.executed(), vec!["a", "a"]);
        let logs = h.log.logs();
        assert_eq!(logs.iter().filter(|e| e.status == LogStatus::Retrying).count(), 1);
        assert_eq!(logs.last().unwrap().status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn breakpoint_pauses_before_side_effects() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let orch = Orchestrator::new(
            linear_flow(&["a", "b", "c"]),
            RunOptions {
                break_at: [NodeId::from("b")].into(),
                ..Default::default()
            },
            h.collab,
        );
        let run_id = orch.run_id().clone();
        let result = orch.run().await.unwrap();

        assert!(result.paused);
        assert!(!result.success);
        // The paused step never executed.
        assert_eq!(executor.executed(), vec!["a"]);
        // Paused runs keep their registry record and skip persistence.
        let record = h.registry.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Stopped);
        assert!(h.log.persisted().is_none());
    }

    struct PauseOnError;

    #[async_trait]
    impl RunPlugin for PauseOnError {
        fn name(&self) -> &str {
            "pause-on-error"
        }
        async fn on_error(
            &self,
            _cx: &RunCx,
            _step: &FlowNode,
            _error: &str,
        ) -> Result<HookControl, PluginError> {
            Ok(HookControl::Pause)
        }
    }

    #[tokio::test]
    async fn error_hook_can_pause_instead_of_recovering() {
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Fail));
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "pausing")
            .with_node(step("a"))
            .with_node(step("recover"))
            .with_edge(Edge::labeled("a", "recover", "onError"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                plugins: vec![Arc::new(PauseOnError)],
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.paused);
        // The recovery edge was never followed.
        assert_eq!(executor.executed(), vec!["a"]);
    }

    struct AfterStepCounter(AtomicU32);

    #[async_trait]
    impl RunPlugin for AfterStepCounter {
        fn name(&self) -> &str {
            "after-step-counter"
        }
        async fn after_step(&self, _cx: &RunCx, _step: &FlowNode) -> Result<(), PluginError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn after_step_hooks_fire_on_success_only() {
        let counter = Arc::new(AfterStepCounter(AtomicU32::new(0)));
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Fail));
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "recovering")
            .with_node(step("a"))
            .with_node(step("recover"))
            .with_edge(Edge::labeled("a", "recover", "onError"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                plugins: vec![counter.clone()],
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(executor.executed(), vec!["a", "recover"]);
        // Only the recovering step succeeded; the failed step went through
        // on_error instead.
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct LabelOverride(String);

    #[async_trait]
    impl RunPlugin for LabelOverride {
        fn name(&self) -> &str {
            "label-override"
        }
        async fn on_choose_next_label(
            &self,
            _cx: &RunCx,
            _step: &FlowNode,
            _suggested: &str,
        ) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn step_suggested_label_routes_traversal() {
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Label("yes".into())));
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "branching")
            .with_node(step("a"))
            .with_node(step("b"))
            .with_node(step("c"))
            .with_edge(Edge::labeled("a", "b", "yes"))
            .with_edge(Edge::new("a", "c"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn plugin_label_override_beats_the_suggestion() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "branching")
            .with_node(step("a"))
            .with_node(step("b"))
            .with_node(step("c"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::labeled("a", "c", "alt"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                plugins: vec![Arc::new(LabelOverride("alt".into()))],
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a", "c"]);
    }

    fn foreach_flow() -> Flow {
        Flow::new("f1", "looping")
            .with_node(FlowNode::new(
                "loop",
                NodePayload::Foreach {
                    list_var: "items".into(),
                    item_var: "it".into(),
                    subflow_id: SubflowId("sf".into()),
                },
            ))
            .with_subflow(
                "sf",
                Subflow {
                    nodes: vec![step("s1")],
                    edges: vec![],
                },
            )
    }

    #[tokio::test]
    async fn foreach_binds_each_item_in_order() {
        let executor = Arc::new(MockExecutor::default().watching("it"));
        let h = harness(executor.clone(), None);
        let mut args = Map::new();
        args.insert("items".into(), json!(["x", "y", "z"]));
        let result = Orchestrator::new(
            foreach_flow(),
            RunOptions {
                args,
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["loop", "s1", "s1", "s1"]);
        // Each pass saw its own element bound before the subflow ran.
        assert_eq!(
            *executor.watched.lock(),
            vec![json!("x"), json!("y"), json!("z")]
        );
    }

    #[tokio::test]
    async fn foreach_over_missing_list_runs_zero_times() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let result = Orchestrator::new(foreach_flow(), RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["loop"]);
    }

    #[tokio::test]
    async fn foreach_subflow_failure_continues_remaining_items() {
        let executor =
            Arc::new(MockExecutor::default().with_behavior("s1", Behavior::Fail));
        let h = harness(executor.clone(), None);
        let mut args = Map::new();
        args.insert("items".into(), json!([1, 2]));
        let result = Orchestrator::new(
            foreach_flow(),
            RunOptions {
                args,
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.failed, 2);
        // Both passes ran despite the failures.
        assert_eq!(executor.executed(), vec!["loop", "s1", "s1"]);
    }

    fn while_flow(condition: Condition, max_iterations: u32) -> Flow {
        Flow::new("f1", "looping")
            .with_node(FlowNode::new(
                "loop",
                NodePayload::While {
                    condition,
                    subflow_id: SubflowId("sf".into()),
                    max_iterations,
                },
            ))
            .with_subflow(
                "sf",
                Subflow {
                    nodes: vec![step("s1")],
                    edges: vec![],
                },
            )
    }

    #[tokio::test]
    async fn while_loop_respects_its_iteration_cap() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let condition = Condition::Expr {
            expression: "true".into(),
        };
        let result = Orchestrator::new(while_flow(condition, 3), RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["loop", "s1", "s1", "s1"]);
    }

    #[tokio::test]
    async fn while_loop_with_zero_max_iterations_never_runs_the_body() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let condition = Condition::Expr {
            expression: "true".into(),
        };
        let result = Orchestrator::new(while_flow(condition, 0), RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        // The declared limit is literal; the body never ran.
        assert_eq!(executor.executed(), vec!["loop"]);
    }

    #[tokio::test]
    async fn while_loop_stops_when_the_condition_turns_false() {
        let executor = Arc::new(
            MockExecutor::default().with_behavior("s1", Behavior::SaveAs("more".into(), json!(false))),
        );
        let h = harness(executor.clone(), None);
        let condition = Condition::Var {
            var: "more".into(),
            equals: None,
        };
        let mut args = Map::new();
        args.insert("more".into(), json!(true));
        let result = Orchestrator::new(
            while_flow(condition, 50),
            RunOptions {
                args,
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["loop", "s1"]);
    }

    #[tokio::test]
    async fn pause_inside_a_subflow_aborts_the_whole_loop() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let mut args = Map::new();
        args.insert("items".into(), json!(["x", "y", "z"]));
        let result = Orchestrator::new(
            foreach_flow(),
            RunOptions {
                args,
                break_at: [NodeId::from("s1")].into(),
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.paused);
        // First pass pauses before s1; no further passes run.
        assert_eq!(executor.executed(), vec!["loop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn global_deadline_records_a_synthetic_timeout_entry() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "slow")
            .with_node(FlowNode::new(
                "slow",
                NodePayload::Wait {
                    condition: WaitCondition::DelayMs(200),
                },
            ))
            .with_node(step("after"))
            .with_edge(Edge::new("slow", "after"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                timeout_ms: Some(50),
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(executor.executed(), vec!["slow"]);
        let logs = h.log.logs();
        let timeout_entry = logs.iter().find(|e| e.step_id == "global-timeout").unwrap();
        assert_eq!(timeout_entry.status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn runaway_cycle_hits_the_iteration_guard() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let flow = Flow::new("f1", "cycle")
            .with_node(step("a"))
            .with_node(step("b"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(executor.executed().len(), 10_000);
        assert_eq!(h.log.logs().last().unwrap().step_id, "loop-guard");
    }

    #[tokio::test]
    async fn empty_flow_is_a_terminal_failure() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let orch = Orchestrator::new(Flow::new("f1", "empty"), RunOptions::default(), h.collab);
        let run_id = orch.run_id().clone();
        let result = orch.run().await.unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.total, 0);
        // No step ran, so nothing is counted as failed.
        assert_eq!(result.summary.failed, 0);
        assert!(result.outputs.is_none());
        let logs = result.logs.unwrap();
        assert_eq!(logs[0].step_id, "graph-check");
        assert!(h.registry.get(&run_id).is_none());
    }

    #[tokio::test]
    async fn binding_mismatch_blocks_the_run() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), Some("https://other.site/path"));
        let flow = linear_flow(&["a"]).with_binding(Binding::domain("example.com"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.total, 0);
        assert_eq!(result.summary.failed, 0);
        assert_eq!(result.logs.unwrap()[0].step_id, "binding-check");
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn binding_match_allows_the_run() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), Some("https://app.example.com/dash"));
        let flow = linear_flow(&["a"]).with_binding(Binding::domain("example.com"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a"]);
    }

    #[tokio::test]
    async fn derived_start_url_matching_a_binding_allows_the_run() {
        let provisioner = Arc::new(FixedTarget::at(Some("https://other.site/")));
        let executor =
            Arc::new(MockExecutor::default().with_target(provisioner.clone()));
        let h = harness_at(executor.clone(), provisioner);
        let flow = Flow::new("f1", "navigating")
            .with_node(FlowNode::new(
                "n1",
                NodePayload::Navigate {
                    url: "https://example.com/login".into(),
                },
            ))
            .with_binding(Binding::domain("example.com"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["n1"]);
    }

    #[tokio::test]
    async fn derived_start_url_off_binding_blocks_the_run() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), Some("https://app.example.com/"));
        let flow = Flow::new("f1", "navigating")
            .with_node(FlowNode::new(
                "n1",
                NodePayload::Navigate {
                    url: "https://elsewhere.io/start".into(),
                },
            ))
            .with_binding(Binding::domain("example.com"));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        // The run lands on the derived URL, so that is what the bindings see.
        assert!(!result.success);
        assert_eq!(result.logs.unwrap()[0].step_id, "binding-check");
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn explicit_start_target_is_exempt_from_bindings() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), Some("https://other.site/"));
        let flow = linear_flow(&["a"]).with_binding(Binding::domain("example.com"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                start_url: Some("https://elsewhere.io/".into()),
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn click_awaiting_navigation_fails_when_the_page_stays_put() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), Some("https://app.example.com/"));
        let flow = Flow::new("f1", "clicking").with_node(
            FlowNode::new(
                "go",
                NodePayload::Click {
                    target: TargetSelector::css("#go"),
                    wait: AfterWait::Navigation,
                },
            )
            .with_timeout_ms(400),
        );
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.failed, 1);
        let logs = h.log.logs();
        let entry = logs.last().unwrap();
        assert_eq!(entry.status, LogStatus::Failed);
        assert!(entry.message.as_deref().unwrap_or("").contains("navigation"));
    }

    #[tokio::test]
    async fn click_awaiting_navigation_succeeds_once_the_page_moves() {
        let provisioner = Arc::new(FixedTarget::at(Some("https://app.example.com/")));
        let executor = Arc::new(
            MockExecutor::default()
                .with_target(provisioner.clone())
                .with_behavior(
                    "go",
                    Behavior::NavigateTo("https://app.example.com/next".into()),
                ),
        );
        let h = harness_at(executor.clone(), provisioner);
        let flow = Flow::new("f1", "clicking").with_node(FlowNode::new(
            "go",
            NodePayload::Click {
                target: TargetSelector::css("#go"),
                wait: AfterWait::Navigation,
            },
        ));
        let result = Orchestrator::new(flow, RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["go"]);
    }

    #[tokio::test]
    async fn sensitive_variables_never_reach_outputs() {
        let executor = Arc::new(MockExecutor::default());
        let h = harness(executor.clone(), None);
        let flow = linear_flow(&["a"])
            .with_variable(Variable::new("token").sensitive())
            .with_variable(Variable::new("user").with_default(json!("alice")));
        let mut args = Map::new();
        args.insert("token".into(), json!("hunter2"));
        let result = Orchestrator::new(
            flow,
            RunOptions {
                args,
                ..Default::default()
            },
            h.collab,
        )
        .run()
        .await
        .unwrap();

        let outputs = result.outputs.unwrap();
        assert!(!outputs.contains_key("token"));
        assert_eq!(outputs.get("user"), Some(&json!("alice")));
    }

    struct StubPrompter(Map<String, Value>);

    #[async_trait]
    impl VariablePrompter for StubPrompter {
        async fn collect(&self, _needed: &[Variable]) -> Option<Map<String, Value>> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn prompter_supplies_required_variables() {
        let executor = Arc::new(MockExecutor::default());
        let log = Arc::new(MemoryLogSink::new());
        let mut supplied = Map::new();
        supplied.insert("user".into(), json!("alice"));
        let collab = Collaborators {
            executor: executor.clone(),
            provisioner: Arc::new(FixedTarget::at(None)),
            registry: Arc::new(InMemoryRunRegistry::new()),
            log,
            capture: Arc::new(NoopCapture),
            prompter: Arc::new(StubPrompter(supplied)),
        };
        let flow = linear_flow(&["a"]).with_variable(Variable::new("user").required());
        let result = Orchestrator::new(flow, RunOptions::default(), collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outputs.unwrap().get("user"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn deferred_script_runs_after_the_following_step() {
        let after = FlowNode::new(
            "after1",
            NodePayload::Script {
                code: "return 1".into(),
                when: flowpilot_flow_model::ScriptPhase::After,
                save_as: None,
                assign: HashMap::new(),
            },
        );
        let executor =
            Arc::new(MockExecutor::default().with_behavior("a", Behavior::Defer(after)));
        let h = harness(executor.clone(), None);
        let result = Orchestrator::new(linear_flow(&["a", "b"]), RunOptions::default(), h.collab)
            .run()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executed(), vec!["a", "b", "after1"]);
    }

    #[tokio::test]
    async fn capture_summary_lands_in_the_log_but_not_the_result() {
        let executor = Arc::new(MockExecutor::default());
        let log = Arc::new(MemoryLogSink::new());
        let collab = Collaborators {
            executor,
            provisioner: Arc::new(FixedTarget::at(None)),
            registry: Arc::new(InMemoryRunRegistry::new()),
            log: log.clone(),
            capture: Arc::new(MemoryCapture::new()),
            prompter: Arc::new(NoopPrompter),
        };
        let result = Orchestrator::new(
            linear_flow(&["a"]),
            RunOptions {
                capture_network: true,
                return_logs: true,
                ..Default::default()
            },
            collab,
        )
        .run()
        .await
        .unwrap();

        // The summary entry is appended during cleanup, after the result's
        // log snapshot was taken.
        assert!(result
            .logs
            .unwrap()
            .iter()
            .all(|e| e.step_id != "network-capture"));
        assert!(log.logs().iter().any(|e| e.step_id == "network-capture"));
    }
}
