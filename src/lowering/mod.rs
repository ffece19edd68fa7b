//! # Lowering
//!
//! `IRPipeline` -> [`DagSpec`]. Every IR node becomes either a data node
//! (inputs, literals) or a module node plus its produced data nodes:
//!
//! - `Input` lowers to a data node carrying the public input name
//! - `Literal` lowers to a pre-seeded data node (no producing module)
//! - `ModuleCall` lowers to exactly one module node carrying the declared
//!   schemas and options, with one data node per produced output port
//! - every structural operation lowers to a synthesized module node with an
//!   internal `__`-prefixed name, executed by the built-in evaluator
//!
//! Fallback subgraphs lower like any other nodes, but modules reachable
//! only through fallback references are marked lazy so they fire on demand
//! rather than with their layer.

use crate::dag::{
    DagMetadata, DagOpKind, DagSpec, DataNodeId, DataNodeSpec, ModuleNodeId, ModuleNodeSpec,
    StructuralOp,
};
use crate::ir::{IRError, IRNode, IROp, IRPipeline, ModuleCallOptions, NodeId};
use crate::registry::ModuleRegistry;
use crate::types::SemType;
use std::collections::{BTreeMap, BTreeSet};

/// Failure while lowering a validated pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoweringError {
    #[error("module '{name}' vanished from the registry between build and lowering")]
    UnknownModule { name: String },

    #[error(transparent)]
    Ir(#[from] IRError),

    #[error(transparent)]
    Dag(#[from] crate::dag::DagError),
}

/// Lower an optimized pipeline against the registry snapshot
pub fn lower(pipeline: &IRPipeline, registry: &ModuleRegistry) -> Result<DagSpec, LoweringError> {
    Lowerer::new(registry).lower(pipeline)
}

struct Lowerer<'r> {
    registry: &'r ModuleRegistry,
    next_module: u64,
    next_data: u64,
    modules: BTreeMap<ModuleNodeId, ModuleNodeSpec>,
    data: BTreeMap<DataNodeId, DataNodeSpec>,
    in_edges: BTreeSet<(DataNodeId, ModuleNodeId)>,
    out_edges: BTreeSet<(ModuleNodeId, DataNodeId)>,
    /// IR node -> the data node carrying its value
    node_output: BTreeMap<NodeId, DataNodeId>,
}

impl<'r> Lowerer<'r> {
    fn new(registry: &'r ModuleRegistry) -> Self {
        Lowerer {
            registry,
            next_module: 0,
            next_data: 0,
            modules: BTreeMap::new(),
            data: BTreeMap::new(),
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
            node_output: BTreeMap::new(),
        }
    }

    fn fresh_module(&mut self) -> ModuleNodeId {
        let id = ModuleNodeId(self.next_module);
        self.next_module += 1;
        id
    }

    fn fresh_data(&mut self, ty: SemType) -> DataNodeId {
        let id = DataNodeId(self.next_data);
        self.next_data += 1;
        self.data.insert(
            id,
            DataNodeSpec {
                id,
                ty,
                input_name: None,
                seed: None,
                port: None,
                consumers: BTreeMap::new(),
            },
        );
        id
    }

    fn connect_input(&mut self, data: DataNodeId, module: ModuleNodeId, param: &str) {
        self.in_edges.insert((data, module));
        if let Some(spec) = self.data.get_mut(&data) {
            spec.consumers
                .entry(module)
                .or_default()
                .insert(param.to_string());
        }
    }

    /// Modules reachable from the outputs without crossing a fallback edge
    /// fire eagerly; everything else is demand-driven
    fn eager_ir_nodes(pipeline: &IRPipeline) -> BTreeSet<NodeId> {
        let mut eager = BTreeSet::new();
        let mut stack: Vec<NodeId> = pipeline
            .outputs
            .iter()
            .filter_map(|name| pipeline.bindings.get(name))
            .copied()
            .collect();

        while let Some(id) = stack.pop() {
            if !eager.insert(id) {
                continue;
            }
            let Some(node) = pipeline.nodes.get(&id) else {
                continue;
            };
            match &node.op {
                IROp::ModuleCall { args, .. } => {
                    // The fallback edge is deliberately not followed
                    stack.extend(args.values().copied());
                }
                _ => stack.extend(node.dependencies()),
            }
        }
        eager
    }

    fn lower(mut self, pipeline: &IRPipeline) -> Result<DagSpec, LoweringError> {
        let order = pipeline.topological_order()?;
        let eager = Self::eager_ir_nodes(pipeline);

        for id in order {
            let node = &pipeline.nodes[&id];
            self.lower_node(node, eager.contains(&id))?;
        }

        let output_bindings = pipeline
            .outputs
            .iter()
            .filter_map(|name| {
                pipeline
                    .bindings
                    .get(name)
                    .and_then(|ir| self.node_output.get(ir))
                    .map(|data| (name.clone(), *data))
            })
            .collect();

        let dag = DagSpec {
            metadata: DagMetadata {
                name: pipeline.name.clone(),
            },
            modules: self.modules,
            data: self.data,
            in_edges: self.in_edges,
            out_edges: self.out_edges,
            outputs: pipeline.outputs.clone(),
            output_bindings,
        };
        tracing::debug!(
            pipeline = %pipeline.name,
            modules = dag.modules.len(),
            data = dag.data.len(),
            "lowered"
        );
        Ok(dag)
    }

    fn lower_node(&mut self, node: &IRNode, eager: bool) -> Result<(), LoweringError> {
        match &node.op {
            IROp::Input { name } => {
                let data = self.fresh_data(node.output_type.clone());
                if let Some(spec) = self.data.get_mut(&data) {
                    spec.input_name = Some(name.clone());
                }
                self.node_output.insert(node.id, data);
                Ok(())
            }

            IROp::Literal { value } => {
                let data = self.fresh_data(node.output_type.clone());
                if let Some(spec) = self.data.get_mut(&data) {
                    spec.seed = Some(value.clone());
                }
                self.node_output.insert(node.id, data);
                Ok(())
            }

            IROp::ModuleCall {
                module,
                args,
                options,
                ..
            } => self.lower_call(node, module, args, options, eager),

            IROp::Merge { left, right } => self.lower_structural(
                node,
                "__merge".to_string(),
                StructuralOp::Merge,
                vec![("left", *left), ("right", *right)],
                eager,
            ),

            IROp::Project { source, fields } => self.lower_structural(
                node,
                format!("__project[{}]", fields.join(",")),
                StructuralOp::Project {
                    fields: fields.clone(),
                },
                vec![("source", *source)],
                eager,
            ),

            IROp::FieldAccess { source, field } => self.lower_structural(
                node,
                format!("__field[{field}]"),
                StructuralOp::FieldAccess {
                    field: field.clone(),
                },
                vec![("source", *source)],
                eager,
            ),

            IROp::Conditional {
                cond,
                then_branch,
                else_branch,
            } => self.lower_structural(
                node,
                "__conditional".to_string(),
                StructuralOp::Conditional,
                vec![("cond", *cond), ("then", *then_branch), ("else", *else_branch)],
                eager,
            ),

            IROp::And { left, right } => self.lower_structural(
                node,
                "__and".to_string(),
                StructuralOp::And,
                vec![("left", *left), ("right", *right)],
                eager,
            ),

            IROp::Or { left, right } => self.lower_structural(
                node,
                "__or".to_string(),
                StructuralOp::Or,
                vec![("left", *left), ("right", *right)],
                eager,
            ),

            IROp::Not { operand } => self.lower_structural(
                node,
                "__not".to_string(),
                StructuralOp::Not,
                vec![("value", *operand)],
                eager,
            ),

            IROp::Guard { expr, cond } => self.lower_structural(
                node,
                "__guard".to_string(),
                StructuralOp::Guard,
                vec![("value", *expr), ("cond", *cond)],
                eager,
            ),

            IROp::Coalesce { left, right } => self.lower_structural(
                node,
                "__coalesce".to_string(),
                StructuralOp::Coalesce,
                vec![("left", *left), ("right", *right)],
                eager,
            ),

            IROp::Branch { arms, otherwise } => {
                let mut params = Vec::with_capacity(arms.len() * 2 + 1);
                let mut names = Vec::with_capacity(arms.len() * 2 + 1);
                for (i, (cond, value)) in arms.iter().enumerate() {
                    names.push((format!("cond{i}"), *cond));
                    names.push((format!("value{i}"), *value));
                }
                names.push(("otherwise".to_string(), *otherwise));
                params.extend(names.iter().map(|(n, id)| (n.as_str(), *id)));
                self.lower_structural(
                    node,
                    "__branch".to_string(),
                    StructuralOp::Branch {
                        arm_count: arms.len(),
                    },
                    params,
                    eager,
                )
            }

            IROp::StringInterpolation { parts, exprs } => {
                let names: Vec<(String, NodeId)> = exprs
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (format!("expr{i}"), *id))
                    .collect();
                let params: Vec<(&str, NodeId)> =
                    names.iter().map(|(n, id)| (n.as_str(), *id)).collect();
                self.lower_structural(
                    node,
                    "__interp".to_string(),
                    StructuralOp::StringInterpolation {
                        parts: parts.clone(),
                    },
                    params,
                    eager,
                )
            }

            IROp::HigherOrder { op, source, lambda } => self.lower_structural(
                node,
                format!("__{op}"),
                StructuralOp::HigherOrder {
                    op: *op,
                    lambda: lambda.clone(),
                },
                vec![("source", *source)],
                eager,
            ),

            IROp::ListLiteral { elements } => {
                let names: Vec<(String, NodeId)> = elements
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (format!("item{i}"), *id))
                    .collect();
                let params: Vec<(&str, NodeId)> =
                    names.iter().map(|(n, id)| (n.as_str(), *id)).collect();
                self.lower_structural(
                    node,
                    "__list".to_string(),
                    StructuralOp::ListLiteral {
                        element_count: elements.len(),
                    },
                    params,
                    eager,
                )
            }
        }
    }

    /// One module node per IR module-call; one data node per produce port,
    /// plus a whole-record node for multi-output modules (the value the IR
    /// node's consumers see)
    fn lower_call(
        &mut self,
        node: &IRNode,
        module_name: &str,
        args: &BTreeMap<String, NodeId>,
        options: &ModuleCallOptions,
        eager: bool,
    ) -> Result<(), LoweringError> {
        let module = self
            .registry
            .get(module_name)
            .ok_or_else(|| LoweringError::UnknownModule {
                name: module_name.to_string(),
            })?;

        let module_id = self.fresh_module();

        for (param, arg) in args {
            let data = self.node_output[arg];
            self.connect_input(data, module_id, param);
        }

        let multi_output = module.produces.len() > 1;
        for (port, ty) in &module.produces {
            let data = self.fresh_data(ty.clone());
            if let Some(spec) = self.data.get_mut(&data) {
                spec.port = Some(port.clone());
            }
            self.out_edges.insert((module_id, data));
            if !multi_output {
                self.node_output.insert(node.id, data);
            }
        }
        if multi_output {
            let record = self.fresh_data(node.output_type.clone());
            self.out_edges.insert((module_id, record));
            self.node_output.insert(node.id, record);
        }

        let fallback = options
            .fallback
            .map(|ir_id| self.node_output[&ir_id]);

        self.modules.insert(
            module_id,
            ModuleNodeSpec {
                id: module_id,
                name: module_name.to_string(),
                op: DagOpKind::Registered {
                    module: module_name.to_string(),
                },
                consumes: module.consumes.clone(),
                produces: module.produces.clone(),
                options: options.clone(),
                fallback,
                lazy: options.lazy_eval.unwrap_or(false) || !eager,
            },
        );
        Ok(())
    }

    fn lower_structural(
        &mut self,
        node: &IRNode,
        name: String,
        op: StructuralOp,
        params: Vec<(&str, NodeId)>,
        eager: bool,
    ) -> Result<(), LoweringError> {
        let module_id = self.fresh_module();

        let mut consumes = BTreeMap::new();
        for (param, ir_dep) in &params {
            let data = self.node_output[ir_dep];
            let ty = self
                .data
                .get(&data)
                .map(|d| d.ty.clone())
                .unwrap_or(SemType::Unit);
            consumes.insert((*param).to_string(), ty);
            self.connect_input(data, module_id, param);
        }

        let out = self.fresh_data(node.output_type.clone());
        self.out_edges.insert((module_id, out));
        self.node_output.insert(node.id, out);

        self.modules.insert(
            module_id,
            ModuleNodeSpec {
                id: module_id,
                name,
                op: DagOpKind::Structural(op),
                consumes,
                produces: [("out".to_string(), node.output_type.clone())]
                    .into_iter()
                    .collect(),
                options: ModuleCallOptions::default(),
                fallback: None,
                lazy: !eager,
            },
        );
        Ok(())
    }
}
