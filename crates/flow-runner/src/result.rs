//! Terminal run outcome.

use flowpilot_core_types::RunId;
use flowpilot_run_log::RunLogEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Planned step count, fixed at prepare time from the default ordering.
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub took_ms: u64,
}

impl RunSummary {
    pub fn new(total: usize, failed: usize, took_ms: u64) -> Self {
        Self {
            total,
            success: total.saturating_sub(failed),
            failed,
            took_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: RunId,
    /// True only when the run neither paused nor recorded a failed step.
    pub success: bool,
    pub summary: RunSummary,
    /// Redacted variable snapshot. Absent for runs that never started
    /// traversal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<RunLogEntry>>,
    /// Screenshot of the first failed step, when one was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_on_failure: Option<String>,
    pub paused: bool,
}
