//! Run registry.
//!
//! Best-effort persistence of in-flight run metadata. The orchestrator
//! registers a run at prepare time, updates its status at cleanup, and removes
//! the record unless the run was paused (paused records stay visible so a
//! later resume can find them). Registry failures must never fail a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowpilot_core_types::{FlowId, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// Paused by a plugin hook; the run is halted but not failed.
    Stopped,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub flow_id: FlowId,
    pub name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn running(id: RunId, flow_id: FlowId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            flow_id,
            name: name.into(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run {0} not found")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn add(&self, record: RunRecord) -> Result<(), RegistryError>;

    async fn update(&self, id: &RunId, status: RunStatus) -> Result<(), RegistryError>;

    async fn remove(&self, id: &RunId) -> Result<(), RegistryError>;
}

/// Dashmap-backed registry shared between concurrently executing runs.
#[derive(Default)]
pub struct InMemoryRunRegistry {
    records: DashMap<RunId, RunRecord>,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &RunId) -> Option<RunRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> Vec<RunRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }
}

#[async_trait]
impl RunRegistry for InMemoryRunRegistry {
    async fn add(&self, record: RunRecord) -> Result<(), RegistryError> {
        debug!(run_id = %record.id, flow_id = %record.flow_id, "registering run");
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, id: &RunId, status: RunStatus) -> Result<(), RegistryError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.0.clone()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn remove(&self, id: &RunId) -> Result<(), RegistryError> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.0.clone()))
    }
}

/// Registry that forgets everything; used when persistence is not wanted.
pub struct NoopRunRegistry;

#[async_trait]
impl RunRegistry for NoopRunRegistry {
    async fn add(&self, _record: RunRecord) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn update(&self, _id: &RunId, _status: RunStatus) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn remove(&self, _id: &RunId) -> Result<(), RegistryError> {
        Ok(())
    }
}
