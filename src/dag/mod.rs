//! # Executable DAG
//!
//! The lowered form of an [`crate::ir::IRPipeline`]: a bipartite graph of
//! **module nodes** (operations) and **data nodes** (typed value edges).
//! `in_edges` connect data to the modules consuming it, `out_edges` connect
//! modules to the data they produce.
//!
//! A `DagSpec` is produced once per compilation and shared read-only by any
//! number of concurrent executions; all run-time state lives in
//! [`crate::executor::ExecutionState`].

use crate::ir::{HigherOrderOp, IRError, ModuleCallOptions, TypedLambda};
use crate::types::SemType;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Module node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleNodeId(pub u64);

impl fmt::Display for ModuleNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Data node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataNodeId(pub u64);

impl fmt::Display for DataNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A structural operation synthesized from a non-call IR node, executed by
/// the built-in evaluator rather than a registry callable
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralOp {
    Merge,
    Project { fields: Vec<String> },
    FieldAccess { field: String },
    Conditional,
    And,
    Or,
    Not,
    Guard,
    Coalesce,
    Branch { arm_count: usize },
    StringInterpolation { parts: Vec<String> },
    HigherOrder { op: HigherOrderOp, lambda: TypedLambda },
    ListLiteral { element_count: usize },
}

/// What a module node executes
#[derive(Debug, Clone, PartialEq)]
pub enum DagOpKind {
    /// Call a module resolved against the registry at execution time
    Registered { module: String },
    /// Evaluate a synthesized structural operation in-process
    Structural(StructuralOp),
}

/// One operation node of the DAG
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleNodeSpec {
    pub id: ModuleNodeId,
    /// Registered name, or an internal `__`-prefixed name for structural ops
    pub name: String,
    pub op: DagOpKind,
    /// Parameter name -> type
    pub consumes: BTreeMap<String, SemType>,
    /// Output port -> type
    pub produces: BTreeMap<String, SemType>,
    /// Resilience options carried over from the IR call site
    pub options: ModuleCallOptions,
    /// Data node evaluated on demand when all retries fail
    pub fallback: Option<DataNodeId>,
    /// Not fired with its layer; fires on first downstream demand. Set for
    /// `lazy_eval` call sites and for fallback-only subgraphs.
    pub lazy: bool,
}

/// One value edge of the DAG
#[derive(Debug, Clone, PartialEq)]
pub struct DataNodeSpec {
    pub id: DataNodeId,
    pub ty: SemType,
    /// Public input name, when this node is fed by the caller
    pub input_name: Option<String>,
    /// Pre-seeded literal value (literals have no producing module)
    pub seed: Option<Value>,
    /// Producer output port this node captures; `None` captures the whole
    /// result value
    pub port: Option<String>,
    /// Downstream module -> the parameter names this node feeds there
    pub consumers: BTreeMap<ModuleNodeId, BTreeSet<String>>,
}

/// DAG-level metadata
#[derive(Debug, Clone, PartialEq)]
pub struct DagMetadata {
    /// Pipeline name this DAG was lowered from
    pub name: String,
}

/// Structural failure in a lowered DAG
#[derive(Debug, Clone, thiserror::Error)]
pub enum DagError {
    #[error("edge references unknown node: {detail}")]
    InvalidEdge { detail: String },

    #[error("public input name '{name}' is not unique")]
    DuplicateInputName { name: String },

    #[error("module {module} consumes {expected:?} but is fed {actual:?}")]
    ConsumesMismatch {
        module: ModuleNodeId,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("declared output '{name}' is not bound to a data node")]
    UnboundOutput { name: String },
}

/// The complete lowered pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct DagSpec {
    pub metadata: DagMetadata,
    pub modules: BTreeMap<ModuleNodeId, ModuleNodeSpec>,
    pub data: BTreeMap<DataNodeId, DataNodeSpec>,
    /// data -> consuming module
    pub in_edges: BTreeSet<(DataNodeId, ModuleNodeId)>,
    /// module -> produced data
    pub out_edges: BTreeSet<(ModuleNodeId, DataNodeId)>,
    /// Declared output names, in declaration order
    pub outputs: Vec<String>,
    /// Output name -> terminating data node
    pub output_bindings: BTreeMap<String, DataNodeId>,
}

impl DagSpec {
    /// The module producing a data node, if any (inputs and literal seeds
    /// have none)
    pub fn producer_of(&self, data: DataNodeId) -> Option<ModuleNodeId> {
        self.out_edges
            .iter()
            .find(|(_, d)| *d == data)
            .map(|(m, _)| *m)
    }

    /// Data nodes feeding a module
    pub fn inputs_of(&self, module: ModuleNodeId) -> Vec<DataNodeId> {
        self.in_edges
            .iter()
            .filter(|(_, m)| *m == module)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Data nodes a module produces
    pub fn outputs_of(&self, module: ModuleNodeId) -> Vec<DataNodeId> {
        self.out_edges
            .iter()
            .filter(|(m, _)| *m == module)
            .map(|(_, d)| *d)
            .collect()
    }

    /// Public input name -> declared type
    pub fn input_schema(&self) -> BTreeMap<String, SemType> {
        self.data
            .values()
            .filter_map(|d| d.input_name.clone().map(|name| (name, d.ty.clone())))
            .collect()
    }

    /// Declared output name -> type
    pub fn output_schema(&self) -> BTreeMap<String, SemType> {
        self.output_bindings
            .iter()
            .filter_map(|(name, data)| {
                self.data.get(data).map(|d| (name.clone(), d.ty.clone()))
            })
            .collect()
    }

    /// Module-to-module dependencies via the shared data nodes
    fn module_dependencies(&self) -> BTreeMap<ModuleNodeId, BTreeSet<ModuleNodeId>> {
        let producer: BTreeMap<DataNodeId, ModuleNodeId> =
            self.out_edges.iter().map(|(m, d)| (*d, *m)).collect();

        let mut deps: BTreeMap<ModuleNodeId, BTreeSet<ModuleNodeId>> =
            self.modules.keys().map(|id| (*id, BTreeSet::new())).collect();
        for (data, module) in &self.in_edges {
            if let Some(p) = producer.get(data) {
                if let Some(set) = deps.get_mut(module) {
                    set.insert(*p);
                }
            }
        }
        deps
    }

    /// Topological layers over module nodes; layer N depends only on
    /// layers < N, nodes within a layer may run concurrently
    pub fn module_layers(&self) -> Result<Vec<Vec<ModuleNodeId>>, IRError> {
        let deps = self.module_dependencies();
        let mut layers = Vec::new();
        let mut placed: BTreeSet<ModuleNodeId> = BTreeSet::new();

        while placed.len() < self.modules.len() {
            let layer: Vec<ModuleNodeId> = deps
                .iter()
                .filter(|(id, d)| !placed.contains(id) && d.is_subset(&placed))
                .map(|(id, _)| *id)
                .collect();
            if layer.is_empty() {
                return Err(IRError::CycleDetected {
                    remaining: self.modules.len() - placed.len(),
                });
            }
            placed.extend(layer.iter().copied());
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Topological depth of each module, for the priority tiebreak
    pub fn module_depths(&self) -> Result<BTreeMap<ModuleNodeId, usize>, IRError> {
        let mut depths = BTreeMap::new();
        for (depth, layer) in self.module_layers()?.into_iter().enumerate() {
            for id in layer {
                depths.insert(id, depth);
            }
        }
        Ok(depths)
    }

    /// Check every structural invariant
    pub fn validate(&self) -> Result<(), DagError> {
        for (data, module) in &self.in_edges {
            if !self.data.contains_key(data) || !self.modules.contains_key(module) {
                return Err(DagError::InvalidEdge {
                    detail: format!("in-edge ({data}, {module})"),
                });
            }
        }
        for (module, data) in &self.out_edges {
            if !self.modules.contains_key(module) || !self.data.contains_key(data) {
                return Err(DagError::InvalidEdge {
                    detail: format!("out-edge ({module}, {data})"),
                });
            }
        }

        let mut seen_inputs = BTreeSet::new();
        for d in self.data.values() {
            if let Some(name) = &d.input_name {
                if !seen_inputs.insert(name.clone()) {
                    return Err(DagError::DuplicateInputName { name: name.clone() });
                }
            }
        }

        // The consumer labels reaching each module must be exactly its
        // consumes key set
        for (id, module) in &self.modules {
            let mut fed: BTreeSet<String> = BTreeSet::new();
            for data in self.inputs_of(*id) {
                if let Some(d) = self.data.get(&data) {
                    if let Some(params) = d.consumers.get(id) {
                        fed.extend(params.iter().cloned());
                    }
                }
            }
            let expected: BTreeSet<String> = module.consumes.keys().cloned().collect();
            if fed != expected {
                return Err(DagError::ConsumesMismatch {
                    module: *id,
                    expected: expected.into_iter().collect(),
                    actual: fed.into_iter().collect(),
                });
            }
        }

        for name in &self.outputs {
            match self.output_bindings.get(name) {
                Some(data) if self.data.contains_key(data) => {}
                _ => return Err(DagError::UnboundOutput { name: name.clone() }),
            }
        }
        Ok(())
    }
}
