//! Execution state
//!
//! The incrementally-produced, terminal artifact of a run: per-data-node
//! values and per-module statuses.

use crate::dag::{DagSpec, DataNodeId, ModuleNodeId};
use crate::types::SemType;
use crate::value::Value;
use std::collections::BTreeMap;

/// Lifecycle status of a DAG node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    Pending,
    Running,
    /// Completed successfully in the given wall time
    Fired { duration_ms: u64 },
    Failed { error: String },
    /// Never ran: upstream failed, execution cancelled, or input missing
    /// under a Skip policy
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Fired { .. } | NodeStatus::Failed { .. } | NodeStatus::Skipped
        )
    }
}

/// One data-node slot: declared type, value once produced, status
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub ty: SemType,
    pub value: Option<Value>,
    pub status: NodeStatus,
}

/// Complete run-time state of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub data: BTreeMap<DataNodeId, DataEntry>,
    pub module_status: BTreeMap<ModuleNodeId, NodeStatus>,
}

impl ExecutionState {
    /// Fresh state for a DAG: everything pending, literal seeds already
    /// materialized
    pub fn for_dag(dag: &DagSpec) -> Self {
        let data = dag
            .data
            .values()
            .map(|spec| {
                let entry = match &spec.seed {
                    Some(value) => DataEntry {
                        ty: spec.ty.clone(),
                        value: Some(value.clone()),
                        status: NodeStatus::Fired { duration_ms: 0 },
                    },
                    None => DataEntry {
                        ty: spec.ty.clone(),
                        value: None,
                        status: NodeStatus::Pending,
                    },
                };
                (spec.id, entry)
            })
            .collect();
        let module_status = dag
            .modules
            .keys()
            .map(|id| (*id, NodeStatus::Pending))
            .collect();
        ExecutionState {
            data,
            module_status,
        }
    }

    pub fn value_of(&self, id: DataNodeId) -> Option<&Value> {
        self.data.get(&id).and_then(|entry| entry.value.as_ref())
    }

    pub fn set_value(&mut self, id: DataNodeId, value: Value, status: NodeStatus) {
        if let Some(entry) = self.data.get_mut(&id) {
            entry.value = Some(value);
            entry.status = status;
        }
    }

    pub fn set_data_status(&mut self, id: DataNodeId, status: NodeStatus) {
        if let Some(entry) = self.data.get_mut(&id) {
            entry.status = status;
        }
    }

    pub fn set_module_status(&mut self, id: ModuleNodeId, status: NodeStatus) {
        self.module_status.insert(id, status);
    }

    pub fn module_status_of(&self, id: ModuleNodeId) -> Option<&NodeStatus> {
        self.module_status.get(&id)
    }

    /// Data values already produced, keyed by node; the checkpoint payload
    pub fn completed_data(&self) -> BTreeMap<DataNodeId, Value> {
        self.data
            .iter()
            .filter_map(|(id, entry)| entry.value.clone().map(|v| (*id, v)))
            .collect()
    }
}
