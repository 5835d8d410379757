//! Per-run network activity capture.
//!
//! Capture is optional and strictly best-effort: `start` may decline, `stop`
//! summarizes whatever was observed. The orchestrator folds the summary into a
//! single run log entry at cleanup.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Options handed to `start`. Defaults mirror a whole-run capture window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub include_static: bool,
    pub max_capture_ms: u64,
    pub inactivity_timeout_ms: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            include_static: false,
            max_capture_ms: 3 * 60_000,
            inactivity_timeout_ms: 0,
        }
    }
}

/// One captured request, already reduced to the fields worth logging.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnippet {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub took_ms: u64,
}

/// Summary produced by `stop`. Snippets are capped at
/// [`CaptureSummary::MAX_SNIPPETS`] api-style (XHR/fetch) calls.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub request_count: u64,
    pub snippets: Vec<RequestSnippet>,
}

impl CaptureSummary {
    pub const MAX_SNIPPETS: usize = 10;
}

#[async_trait]
pub trait NetworkCapture: Send + Sync {
    /// Try to start capturing. `false` means capture is unavailable; the run
    /// continues without it.
    async fn start(&self, options: CaptureOptions) -> bool;

    async fn stop(&self) -> CaptureSummary;
}

/// Capture facility that never starts.
pub struct NoopCapture;

#[async_trait]
impl NetworkCapture for NoopCapture {
    async fn start(&self, _options: CaptureOptions) -> bool {
        false
    }

    async fn stop(&self) -> CaptureSummary {
        CaptureSummary::default()
    }
}

/// In-memory capture fed by the embedding test or simulator.
#[derive(Default)]
pub struct MemoryCapture {
    active: Mutex<bool>,
    requests: Mutex<Vec<RequestSnippet>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request observed while capture is active.
    pub fn record(&self, snippet: RequestSnippet) {
        if *self.active.lock() {
            self.requests.lock().push(snippet);
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock()
    }
}

#[async_trait]
impl NetworkCapture for MemoryCapture {
    async fn start(&self, options: CaptureOptions) -> bool {
        debug!(
            include_static = options.include_static,
            max_capture_ms = options.max_capture_ms,
            "starting network capture"
        );
        *self.active.lock() = true;
        true
    }

    async fn stop(&self) -> CaptureSummary {
        *self.active.lock() = false;
        let requests = std::mem::take(&mut *self.requests.lock());
        let request_count = requests.len() as u64;
        let snippets = requests
            .into_iter()
            .take(CaptureSummary::MAX_SNIPPETS)
            .collect();
        CaptureSummary {
            request_count,
            snippets,
        }
    }
}
