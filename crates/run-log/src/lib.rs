//! Append-only run log.
//!
//! The orchestrator records one [`RunLogEntry`] per step attempt outcome plus
//! a handful of synthetic entries (`global-timeout`, `binding-check`,
//! `network-capture`). Sinks are best-effort collaborators: a failing sink
//! must never fail the run.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use flowpilot_core_types::FlowId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Retrying,
    Failed,
}

/// One ordered entry in the run log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub step_id: String,

    pub status: LogStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub took_ms: Option<u64>,

    /// Base64 screenshot attached to failed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,

    /// Network capture snippets attached to the capture summary entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
}

impl RunLogEntry {
    pub fn success(step_id: impl Into<String>) -> Self {
        Self::new(step_id, LogStatus::Success)
    }

    pub fn retrying(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(step_id, LogStatus::Retrying).with_message(message)
    }

    pub fn failed(step_id: impl Into<String>) -> Self {
        Self::new(step_id, LogStatus::Failed)
    }

    pub fn new(step_id: impl Into<String>, status: LogStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            message: None,
            took_ms: None,
            screenshot: None,
            network: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_took_ms(mut self, took_ms: u64) -> Self {
        self.took_ms = Some(took_ms);
        self
    }

    pub fn with_network(mut self, network: Value) -> Self {
        self.network = Some(network);
        self
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-only ordered log of a run.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn push(&self, entry: RunLogEntry) -> Result<(), LogError>;

    fn logs(&self) -> Vec<RunLogEntry>;

    /// Attach a screenshot to the most recent failed entry. Best-effort.
    async fn screenshot_on_failure(&self);

    /// Fire-and-forget progress line for a live overlay, if any.
    async fn overlay(&self, _message: &str) {}

    /// Flush the log at cleanup.
    async fn persist(&self, flow_id: &FlowId, started_at_ms: u64, succeeded: bool)
        -> Result<(), LogError>;
}

/// Source of failure screenshots, injected into the in-memory sink.
#[async_trait]
pub trait ScreenshotSource: Send + Sync {
    async fn capture(&self) -> Option<String>;
}

/// In-memory sink used by tests and the CLI.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<RunLogEntry>>,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
    persisted: Mutex<Option<(FlowId, u64, bool)>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_screenshots(source: Arc<dyn ScreenshotSource>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            screenshots: Some(source),
            persisted: Mutex::new(None),
        }
    }

    /// What `persist` recorded, if it ran.
    pub fn persisted(&self) -> Option<(FlowId, u64, bool)> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn push(&self, entry: RunLogEntry) -> Result<(), LogError> {
        debug!(step_id = %entry.step_id, status = ?entry.status, "run log entry");
        self.entries.lock().push(entry);
        Ok(())
    }

    fn logs(&self) -> Vec<RunLogEntry> {
        self.entries.lock().clone()
    }

    async fn screenshot_on_failure(&self) {
        let Some(source) = &self.screenshots else {
            return;
        };
        let Some(image) = source.capture().await else {
            return;
        };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|e| e.status == LogStatus::Failed)
        {
            entry.screenshot = Some(image);
        }
    }

    async fn persist(
        &self,
        flow_id: &FlowId,
        started_at_ms: u64,
        succeeded: bool,
    ) -> Result<(), LogError> {
        *self.persisted.lock() = Some((flow_id.clone(), started_at_ms, succeeded));
        Ok(())
    }
}
