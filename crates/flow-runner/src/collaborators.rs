//! Seams between the orchestrator and its environment.
//!
//! The orchestrator never touches a browser directly. Step execution, target
//! (page) provisioning, and variable prompting all go through these traits so
//! the traversal logic runs identically against a real automation backend, a
//! dry-run simulator, or the mocks in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowpilot_core_types::{RunId, TargetDescriptor};
use flowpilot_flow_model::{AfterWait, FlowNode, NodePayload, Variable};
use flowpilot_run_log::LogSink;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::control::ControlDirective;
use crate::vars::VarStore;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Context a step executes in. Variables are shared because retries and
/// after-scripts mutate them mid-step.
#[derive(Clone)]
pub struct StepCtx {
    pub run_id: RunId,
    pub vars: Arc<Mutex<VarStore>>,
    pub log: Arc<dyn LogSink>,
}

/// What a successfully executed step tells the orchestrator.
#[derive(Default)]
pub struct StepOutcome {
    /// Edge label to follow next; `None` means the default label.
    pub next_label: Option<String>,
    /// Loop directive, for control-flow steps.
    pub control: Option<ControlDirective>,
    /// Set when the executor already pushed its own log entry.
    pub already_logged: bool,
    /// Whole-result variable capture (`saveAs`).
    pub save_as: Option<(String, Value)>,
    /// Field-to-variable captures (`assign`).
    pub assign: Vec<(String, Value)>,
    /// An `after`-phase script to run once the next step has completed.
    pub defer_after_script: Option<FlowNode>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.next_label = Some(label.into());
        self
    }

    pub fn with_control(mut self, control: ControlDirective) -> Self {
        self.control = Some(control);
        self
    }
}

/// Executes one step against the automation backend.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepCtx, step: &FlowNode) -> Result<StepOutcome, StepError>;
}

#[derive(Clone, Debug, Default)]
pub struct TargetOptions {
    /// Navigate here if no usable target exists (or unconditionally with
    /// `refresh`).
    pub start_url: Option<String>,
    /// Force a fresh navigation even when a target is already open.
    pub refresh: bool,
}

/// Provides and tracks the page a run operates on.
#[async_trait]
pub trait TargetProvisioner: Send + Sync {
    async fn ensure_target(&self, options: TargetOptions) -> Result<TargetDescriptor, StepError>;

    /// The page currently attached, if any.
    async fn current_target(&self) -> Option<TargetDescriptor>;

    /// Best-effort settle after an action that may trigger loading.
    async fn wait_for_idle(&self, _budget: Duration) {}
}

/// Navigation budget for steps that declare no timeout of their own.
const NAV_TIMEOUT_MS: u64 = 10_000;

/// Poll until the target's URL differs from `prev_url`. Used after actions
/// that are expected to navigate.
pub async fn wait_for_navigation(
    provisioner: &dyn TargetProvisioner,
    prev_url: &str,
    timeout: Duration,
) -> Result<TargetDescriptor, StepError> {
    wait_until(provisioner, timeout, |url| url != prev_url).await
}

/// Short opportunistic check for a navigation that may or may not happen.
/// Never an error; a quiet page is a valid answer.
pub async fn quick_nav_check(provisioner: &dyn TargetProvisioner, prev_url: &str) {
    let _ = wait_for_navigation(provisioner, prev_url, Duration::from_millis(600)).await;
}

/// Post-step settle policy, keyed off the step payload. A navigation step
/// must observe its new page before the step counts as done; so must a click
/// that declares a navigation wait. Other clicks get the quick check.
///
/// `prev_url` is the target URL captured before the step ran. Runs inside the
/// step's retry envelope, so a missed navigation fails that attempt.
pub async fn post_step_wait(
    provisioner: &dyn TargetProvisioner,
    ctx: &StepCtx,
    step: &FlowNode,
    prev_url: &str,
) -> Result<(), StepError> {
    match &step.payload {
        NodePayload::Navigate { url } => {
            // Re-navigating to the page we are already on never changes the
            // URL, so arriving at the destination also counts.
            let destination = ctx.vars.lock().await.expand_str(url);
            wait_until(provisioner, nav_budget(step), |url| {
                url != prev_url || url == destination
            })
            .await?;
            Ok(())
        }
        NodePayload::Click { wait, .. } => match wait {
            AfterWait::Navigation => {
                wait_for_navigation(provisioner, prev_url, nav_budget(step)).await?;
                Ok(())
            }
            AfterWait::NetworkIdle => {
                provisioner.wait_for_idle(nav_budget(step)).await;
                Ok(())
            }
            AfterWait::QuickCheck => {
                quick_nav_check(provisioner, prev_url).await;
                Ok(())
            }
        },
        _ => Ok(()),
    }
}

fn nav_budget(step: &FlowNode) -> Duration {
    Duration::from_millis(step.timeout_ms.unwrap_or(NAV_TIMEOUT_MS))
}

async fn wait_until(
    provisioner: &dyn TargetProvisioner,
    timeout: Duration,
    arrived: impl Fn(&str) -> bool,
) -> Result<TargetDescriptor, StepError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(target) = provisioner.current_target().await {
            if arrived(&target.url) {
                return Ok(target);
            }
        }
        if Instant::now() >= deadline {
            return Err(StepError::new(format!(
                "navigation did not occur within {}ms",
                timeout.as_millis()
            )));
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Collects values for variables the run still needs. `None` means the
/// prompt was dismissed.
#[async_trait]
pub trait VariablePrompter: Send + Sync {
    async fn collect(&self, needed: &[Variable]) -> Option<Map<String, Value>>;
}

/// Prompter for headless contexts: asks nothing, supplies nothing.
pub struct NoopPrompter;

#[async_trait]
impl VariablePrompter for NoopPrompter {
    async fn collect(&self, _needed: &[Variable]) -> Option<Map<String, Value>> {
        None
    }
}
