//! Dry-run simulation backend.
//!
//! Executes flows against a virtual page: navigations update a URL, input
//! steps expand their templates and succeed, waits elapse, asserts hold.
//! Useful for validating a flow's control structure (branching, loops,
//! retries, bindings) without a browser attached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowpilot_core_types::TargetDescriptor;
use flowpilot_flow_model::{FlowNode, NodePayload, ScriptPhase, WaitCondition};
use flowpilot_runner::{
    ControlDirective, StepCtx, StepError, StepExecutor, StepOutcome, TargetOptions,
    TargetProvisioner,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;
use url::Url;

/// Simulated waits are capped so a recorded long delay cannot stall a
/// dry run.
const MAX_SIM_DELAY_MS: u64 = 2_000;

/// Tracks the virtual page the simulation is "on".
#[derive(Default)]
pub struct SimTargetProvisioner {
    current: Mutex<Option<TargetDescriptor>>,
}

impl SimTargetProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current(url: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(Some(TargetDescriptor::new(url))),
        }
    }

    fn set(&self, url: String) {
        debug!(%url, "virtual navigation");
        *self.current.lock() = Some(TargetDescriptor::new(url));
    }
}

#[async_trait]
impl TargetProvisioner for SimTargetProvisioner {
    async fn ensure_target(&self, options: TargetOptions) -> Result<TargetDescriptor, StepError> {
        if let Some(url) = options.start_url {
            if options.refresh || self.current.lock().is_none() {
                self.set(url);
            }
        } else if self.current.lock().is_none() {
            self.set("about:blank".to_string());
        }
        Ok(self
            .current
            .lock()
            .clone()
            .unwrap_or_else(|| TargetDescriptor::new("about:blank")))
    }

    async fn current_target(&self) -> Option<TargetDescriptor> {
        self.current.lock().clone()
    }
}

/// Step executor over the virtual page.
pub struct SimStepExecutor {
    target: Arc<SimTargetProvisioner>,
}

impl SimStepExecutor {
    pub fn new(target: Arc<SimTargetProvisioner>) -> Self {
        Self { target }
    }

    fn run_script(
        &self,
        save_as: &Option<String>,
        assign: &std::collections::HashMap<String, String>,
    ) -> StepOutcome {
        // The simulation has no script engine; every script "returns" a
        // fixed ok result that captures can pick fields from.
        let result = json!({ "ok": true });
        let mut outcome = StepOutcome::ok();
        if let Some(name) = save_as {
            outcome.save_as = Some((name.clone(), result.clone()));
        }
        for (field, var) in assign {
            let value = result.get(field).cloned().unwrap_or(Value::Null);
            outcome.assign.push((var.clone(), value));
        }
        outcome
    }
}

#[async_trait]
impl StepExecutor for SimStepExecutor {
    async fn execute(&self, ctx: &StepCtx, step: &FlowNode) -> Result<StepOutcome, StepError> {
        match &step.payload {
            NodePayload::Navigate { url } => {
                let expanded = ctx.vars.lock().await.expand_str(url);
                Url::parse(&expanded)
                    .map_err(|e| StepError::new(format!("invalid url '{expanded}': {e}")))?;
                self.target.set(expanded);
                Ok(StepOutcome::ok())
            }
            NodePayload::Click { target, .. } => {
                debug!(step = %step.id, selector = ?target.ref_hint, "simulated click");
                Ok(StepOutcome::ok())
            }
            NodePayload::Fill { value, .. } => {
                let expanded = ctx.vars.lock().await.expand_str(value);
                debug!(step = %step.id, chars = expanded.len(), "simulated fill");
                Ok(StepOutcome::ok())
            }
            NodePayload::Key { keys } => {
                debug!(step = %step.id, keys, "simulated key press");
                Ok(StepOutcome::ok())
            }
            NodePayload::Scroll { x, y, .. } => {
                debug!(step = %step.id, x, y, "simulated scroll");
                Ok(StepOutcome::ok())
            }
            NodePayload::Wait { condition } => {
                if let WaitCondition::DelayMs(ms) = condition {
                    sleep(Duration::from_millis((*ms).min(MAX_SIM_DELAY_MS))).await;
                }
                Ok(StepOutcome::ok())
            }
            // The virtual page satisfies every assertion.
            NodePayload::Assert { .. } => Ok(StepOutcome::ok()),
            NodePayload::Script {
                when,
                save_as,
                assign,
                ..
            } => {
                if *when == ScriptPhase::After {
                    let mut deferred = step.clone();
                    if let NodePayload::Script { when, .. } = &mut deferred.payload {
                        *when = ScriptPhase::Before;
                    }
                    return Ok(StepOutcome {
                        defer_after_script: Some(deferred),
                        ..Default::default()
                    });
                }
                Ok(self.run_script(save_as, assign))
            }
            NodePayload::Foreach {
                list_var,
                item_var,
                subflow_id,
            } => Ok(StepOutcome::ok().with_control(ControlDirective::Foreach {
                list_var: list_var.clone(),
                item_var: item_var.clone(),
                subflow_id: subflow_id.clone(),
            })),
            NodePayload::While {
                condition,
                subflow_id,
                max_iterations,
            } => Ok(StepOutcome::ok().with_control(ControlDirective::While {
                condition: condition.clone(),
                subflow_id: subflow_id.clone(),
                max_iterations: *max_iterations,
            })),
        }
    }
}
