//! Suspended-execution checkpoints
//!
//! A checkpoint captures everything needed to reconstitute a suspended
//! execution: the values already produced, the caller's inputs, and where
//! the scheduler stopped. Serialized as JSON (the same tagged wire format
//! as values), so a checkpoint written by one process resumes in another.

use crate::dag::{DataNodeId, ModuleNodeId};
use crate::executor::ExecutionState;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Checkpoint lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Suspended,
    Resumed,
}

/// The persisted layout of a suspended execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub status: CheckpointStatus,
    /// Module node the scheduler stopped at
    pub suspended_at: u64,
    /// Free-form condition an external driver waits on before resuming
    pub resume_condition: Option<String>,
    /// Data node id -> already-produced value
    pub completed_data: BTreeMap<u64, Value>,
    /// The original caller inputs
    pub inputs: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionCheckpoint {
    /// Capture a suspended execution's progress
    pub fn capture(
        execution_id: Uuid,
        pipeline_name: impl Into<String>,
        state: &ExecutionState,
        suspended_at: ModuleNodeId,
        resume_condition: Option<String>,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        ExecutionCheckpoint {
            execution_id,
            pipeline_name: pipeline_name.into(),
            status: CheckpointStatus::Suspended,
            suspended_at: suspended_at.0,
            resume_condition,
            completed_data: state
                .completed_data()
                .into_iter()
                .map(|(id, value)| (id.0, value))
                .collect(),
            inputs,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed values keyed by data node id
    pub fn completed(&self) -> BTreeMap<DataNodeId, Value> {
        self.completed_data
            .iter()
            .map(|(id, value)| (DataNodeId(*id), value.clone()))
            .collect()
    }

    /// Mark the checkpoint as consumed by a resume
    pub fn mark_resumed(&mut self) {
        self.status = CheckpointStatus::Resumed;
        self.updated_at = Utc::now();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
