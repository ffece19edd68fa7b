//! # Pipeline IR
//!
//! Intermediate representation for compiled pipelines: a flat arena of
//! [`IRNode`]s keyed by [`NodeId`], with explicit dependency edges derived
//! from each operation's payload.
//!
//! ```text
//! Typed expressions -> [IR Builder] -> IRPipeline -> [Optimizer] -> [Lowering]
//! ```
//!
//! The arena encoding (integer ids, no owned child pointers) removes
//! pointer-cycle hazards, keeps structural equality a pure function of
//! payload + indices, and serializes cleanly for checkpoints. Cycles are
//! impossible to express through the builder; [`IRPipeline::topological_order`]
//! still detects them and raises [`IRError::CycleDetected`] as a bug guard.

use crate::types::SemType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

// ============================================================================
// Identifiers and spans
// ============================================================================

/// Globally-unique IR node identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Byte range in the surface source, carried for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

// ============================================================================
// Module call options
// ============================================================================

/// Inter-retry delay growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// What happens after a module exhausts retries and has no fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorStrategy {
    /// Fail the execution; downstream nodes are skipped
    #[default]
    Propagate,
    /// Drop the output; dependents observe a missing input
    Skip,
    /// Like Skip, but the error is recorded and execution continues
    Log,
    /// Produce a type-compatible sentinel value
    Wrap,
}

/// Call-site resilience options for a module call
///
/// All fields are optional; an unset field means the policy is disabled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleCallOptions {
    /// Total attempts after the first failure (0 disables retry)
    pub retry: Option<u32>,
    /// Wall-clock deadline per attempt
    pub timeout_ms: Option<u64>,
    /// Initial delay before the first retry
    pub delay_ms: Option<u64>,
    /// Inter-retry delay growth
    pub backoff: Option<BackoffStrategy>,
    /// IR node producing the value used when all retries fail
    pub fallback: Option<NodeId>,
    /// Positive TTL enables result caching keyed by (module, inputs)
    pub cache_ms: Option<u64>,
    /// Cache backend selector; defaults to the shared in-memory backend
    pub cache_backend: Option<String>,
    /// Token-bucket size for this module
    pub throttle_count: Option<u32>,
    /// Token-bucket refill window in milliseconds
    pub throttle_per_ms: Option<u64>,
    /// Max in-flight invocations of this module
    pub concurrency: Option<u32>,
    /// Error-handling strategy after retries and fallback
    pub on_error: Option<ErrorStrategy>,
    /// Defer evaluation until a dependent consumer demands the output
    pub lazy_eval: Option<bool>,
    /// Scheduler priority (100 critical .. 20 low, default 50)
    pub priority: Option<u8>,
}

impl ModuleCallOptions {
    /// True when every policy field is unset
    pub fn is_empty(&self) -> bool {
        *self == ModuleCallOptions::default()
    }
}

// ============================================================================
// IR node types
// ============================================================================

/// Higher-order collection operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HigherOrderOp {
    Filter,
    Map,
    All,
    Any,
    SortBy,
}

impl fmt::Display for HigherOrderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HigherOrderOp::Filter => "filter",
            HigherOrderOp::Map => "map",
            HigherOrderOp::All => "all",
            HigherOrderOp::Any => "any",
            HigherOrderOp::SortBy => "sortBy",
        };
        f.write_str(s)
    }
}

/// A typed lambda carried by a higher-order node
///
/// The body is a self-contained nested IR graph with its own node map and
/// output id; parameters appear inside the body as `Input` nodes named
/// after the parameter. No `NodeId` is shared between the outer graph and
/// a lambda body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedLambda {
    /// Parameter names and types, in declaration order
    pub params: Vec<(String, SemType)>,
    /// Private body graph
    pub nodes: BTreeMap<NodeId, IRNode>,
    /// Designated output node of the body
    pub output: NodeId,
    /// Declared return type
    pub return_type: SemType,
}

/// The operation performed by an IR node
///
/// Every pass must handle every variant explicitly; when adding a node kind,
/// the compiler's exhaustiveness checks walk you through each match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IROp {
    /// External input port
    Input { name: String },

    /// Literal value
    Literal { value: Value },

    /// Call to a registered module
    ModuleCall {
        /// Fully-qualified registered module name (resolved by the builder)
        module: String,
        /// Local alias from the call site, for diagnostics
        alias: Option<String>,
        /// Parameter name -> producing node
        args: BTreeMap<String, NodeId>,
        /// Resilience options; `options.fallback` is a dependency
        options: ModuleCallOptions,
    },

    /// Record widening: disjoint union of two records
    Merge { left: NodeId, right: NodeId },

    /// Record narrowing to a field subset
    Project { source: NodeId, fields: Vec<String> },

    /// Single record field
    FieldAccess { source: NodeId, field: String },

    /// Two-way conditional
    Conditional {
        cond: NodeId,
        then_branch: NodeId,
        else_branch: NodeId,
    },

    /// Short-circuit boolean AND
    And { left: NodeId, right: NodeId },

    /// Short-circuit boolean OR
    Or { left: NodeId, right: NodeId },

    /// Boolean negation
    Not { operand: NodeId },

    /// `expr when cond` -> Optional(inner)
    Guard { expr: NodeId, cond: NodeId },

    /// First-present choice; left must be Optional, short-circuit
    Coalesce { left: NodeId, right: NodeId },

    /// Ordered multi-way conditional with a required otherwise arm
    Branch {
        arms: Vec<(NodeId, NodeId)>,
        otherwise: NodeId,
    },

    /// String interpolation; `parts.len() == exprs.len() + 1`
    StringInterpolation {
        parts: Vec<String>,
        exprs: Vec<NodeId>,
    },

    /// Higher-order collection operation with a nested lambda graph
    HigherOrder {
        op: HigherOrderOp,
        source: NodeId,
        lambda: TypedLambda,
    },

    /// List construction from element nodes
    ListLiteral { elements: Vec<NodeId> },
}

/// One node of the IR graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IRNode {
    pub id: NodeId,
    /// Declared output type, checked against the operation's typing rule
    pub output_type: SemType,
    pub span: Option<Span>,
    pub op: IROp,
}

impl IRNode {
    /// Node ids this node reads from, in evaluation order
    ///
    /// A module call's fallback counts as a dependency: the fallback
    /// subgraph must be alive and lowered alongside the call.
    pub fn dependencies(&self) -> Vec<NodeId> {
        match &self.op {
            IROp::Input { .. } | IROp::Literal { .. } => Vec::new(),
            IROp::ModuleCall { args, options, .. } => {
                let mut deps: Vec<NodeId> = args.values().copied().collect();
                if let Some(fallback) = options.fallback {
                    deps.push(fallback);
                }
                deps
            }
            IROp::Merge { left, right }
            | IROp::And { left, right }
            | IROp::Or { left, right }
            | IROp::Coalesce { left, right } => vec![*left, *right],
            IROp::Project { source, .. } | IROp::FieldAccess { source, .. } => vec![*source],
            IROp::Conditional {
                cond,
                then_branch,
                else_branch,
            } => vec![*cond, *then_branch, *else_branch],
            IROp::Not { operand } => vec![*operand],
            IROp::Guard { expr, cond } => vec![*expr, *cond],
            IROp::Branch { arms, otherwise } => {
                let mut deps = Vec::with_capacity(arms.len() * 2 + 1);
                for (cond, value) in arms {
                    deps.push(*cond);
                    deps.push(*value);
                }
                deps.push(*otherwise);
                deps
            }
            IROp::StringInterpolation { exprs, .. } => exprs.clone(),
            IROp::HigherOrder { source, .. } => vec![*source],
            IROp::ListLiteral { elements } => elements.clone(),
        }
    }

    /// Short operation name for display and canonical keys
    pub fn op_name(&self) -> &'static str {
        match &self.op {
            IROp::Input { .. } => "Input",
            IROp::Literal { .. } => "Literal",
            IROp::ModuleCall { .. } => "ModuleCall",
            IROp::Merge { .. } => "Merge",
            IROp::Project { .. } => "Project",
            IROp::FieldAccess { .. } => "FieldAccess",
            IROp::Conditional { .. } => "Conditional",
            IROp::And { .. } => "And",
            IROp::Or { .. } => "Or",
            IROp::Not { .. } => "Not",
            IROp::Guard { .. } => "Guard",
            IROp::Coalesce { .. } => "Coalesce",
            IROp::Branch { .. } => "Branch",
            IROp::StringInterpolation { .. } => "StringInterpolation",
            IROp::HigherOrder { .. } => "HigherOrder",
            IROp::ListLiteral { .. } => "ListLiteral",
        }
    }

    /// Rewrite every node reference through `resolve`
    ///
    /// Lambda bodies are self-contained graphs and are left untouched.
    pub fn map_references(&mut self, resolve: &impl Fn(NodeId) -> NodeId) {
        match &mut self.op {
            IROp::Input { .. } | IROp::Literal { .. } => {}
            IROp::ModuleCall { args, options, .. } => {
                for dep in args.values_mut() {
                    *dep = resolve(*dep);
                }
                if let Some(fallback) = &mut options.fallback {
                    *fallback = resolve(*fallback);
                }
            }
            IROp::Merge { left, right }
            | IROp::And { left, right }
            | IROp::Or { left, right }
            | IROp::Coalesce { left, right } => {
                *left = resolve(*left);
                *right = resolve(*right);
            }
            IROp::Project { source, .. }
            | IROp::FieldAccess { source, .. }
            | IROp::HigherOrder { source, .. } => {
                *source = resolve(*source);
            }
            IROp::Conditional {
                cond,
                then_branch,
                else_branch,
            } => {
                *cond = resolve(*cond);
                *then_branch = resolve(*then_branch);
                *else_branch = resolve(*else_branch);
            }
            IROp::Not { operand } => {
                *operand = resolve(*operand);
            }
            IROp::Guard { expr, cond } => {
                *expr = resolve(*expr);
                *cond = resolve(*cond);
            }
            IROp::Branch { arms, otherwise } => {
                for (cond, value) in arms.iter_mut() {
                    *cond = resolve(*cond);
                    *value = resolve(*value);
                }
                *otherwise = resolve(*otherwise);
            }
            IROp::StringInterpolation { exprs, .. } => {
                for expr in exprs.iter_mut() {
                    *expr = resolve(*expr);
                }
            }
            IROp::ListLiteral { elements } => {
                for elem in elements.iter_mut() {
                    *elem = resolve(*elem);
                }
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Structural failure in the IR or during a transformation
///
/// These indicate compiler bugs, not user errors; they abort compilation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IRError {
    #[error("cycle detected: {remaining} nodes form a dependency cycle")]
    CycleDetected { remaining: usize },

    #[error("node {node} references missing node {missing}")]
    MissingNode { node: NodeId, missing: NodeId },

    #[error("declared output '{name}' has no variable binding")]
    UnboundOutput { name: String },

    #[error("input node {node} is not registered in the pipeline input list")]
    UnregisteredInput { node: NodeId },

    #[error("type rule violated at node {node}: {detail}")]
    TypeRule { node: NodeId, detail: String },
}

// ============================================================================
// IRPipeline
// ============================================================================

/// A complete IR dataflow graph for one pipeline
///
/// Immutable once built; every optimizer pass produces a new pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IRPipeline {
    /// Pipeline name (compilation cache key)
    pub name: String,
    /// All nodes, including fallback and intermediate subgraphs
    pub nodes: BTreeMap<NodeId, IRNode>,
    /// Ids of every `Input` node
    pub inputs: Vec<NodeId>,
    /// Declared output names, in declaration order
    pub outputs: Vec<String>,
    /// Variable name -> producing node; covers at least every output name
    pub bindings: BTreeMap<String, NodeId>,
}

impl IRPipeline {
    /// Number of nodes in the graph
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Dependencies of a node by id; empty when the id is unknown
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(IRNode::dependencies)
            .unwrap_or_default()
    }

    /// Kahn's algorithm over the dependency graph
    ///
    /// Deterministic: among ready nodes, smaller ids come first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IRError> {
        let mut in_degree: BTreeMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        for (id, node) in &self.nodes {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(IRError::MissingNode {
                        node: *id,
                        missing: dep,
                    });
                }
                *in_degree.entry(*id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(*id);
            }
        }

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.iter().next().copied() {
            ready.remove(&id);
            order.push(id);
            if let Some(users) = dependents.get(&id) {
                for user in users {
                    let deg = in_degree
                        .get_mut(user)
                        .expect("dependent tracked without in-degree");
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*user);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(IRError::CycleDetected {
                remaining: self.nodes.len() - order.len(),
            });
        }
        Ok(order)
    }

    /// Topological layering: layer N nodes depend only on layers < N
    ///
    /// Nodes within a layer are mutually independent and may run
    /// concurrently.
    pub fn topological_layers(&self) -> Result<Vec<Vec<NodeId>>, IRError> {
        let mut remaining_deps: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            let deps: BTreeSet<NodeId> = node.dependencies().into_iter().collect();
            for dep in &deps {
                if !self.nodes.contains_key(dep) {
                    return Err(IRError::MissingNode {
                        node: *id,
                        missing: *dep,
                    });
                }
            }
            remaining_deps.insert(*id, deps);
        }

        let mut layers = Vec::new();
        let mut placed: BTreeSet<NodeId> = BTreeSet::new();

        while placed.len() < self.nodes.len() {
            let layer: Vec<NodeId> = remaining_deps
                .iter()
                .filter(|(id, deps)| !placed.contains(id) && deps.is_subset(&placed))
                .map(|(id, _)| *id)
                .collect();

            if layer.is_empty() {
                return Err(IRError::CycleDetected {
                    remaining: self.nodes.len() - placed.len(),
                });
            }
            placed.extend(layer.iter().copied());
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Check every structural invariant and typing rule
    pub fn validate(&self) -> Result<(), IRError> {
        // Referenced ids exist (also exercised by the topological walk)
        for (id, node) in &self.nodes {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(IRError::MissingNode {
                        node: *id,
                        missing: dep,
                    });
                }
            }
        }

        // Bindings cover every declared output
        for name in &self.outputs {
            let target = self
                .bindings
                .get(name)
                .ok_or_else(|| IRError::UnboundOutput { name: name.clone() })?;
            if !self.nodes.contains_key(target) {
                return Err(IRError::UnboundOutput { name: name.clone() });
            }
        }

        // Every Input node is registered, and every registered input exists
        for (id, node) in &self.nodes {
            if matches!(node.op, IROp::Input { .. }) && !self.inputs.contains(id) {
                return Err(IRError::UnregisteredInput { node: *id });
            }
        }
        for id in &self.inputs {
            match self.nodes.get(id) {
                Some(node) if matches!(node.op, IROp::Input { .. }) => {}
                _ => return Err(IRError::UnregisteredInput { node: *id }),
            }
        }

        // Acyclicity
        self.topological_order()?;

        // Typing rules
        for node in self.nodes.values() {
            self.check_node_types(node)?;
        }
        Ok(())
    }

    fn ty(&self, id: NodeId) -> &SemType {
        &self.nodes[&id].output_type
    }

    #[allow(clippy::too_many_lines)]
    fn check_node_types(&self, node: &IRNode) -> Result<(), IRError> {
        let fail = |detail: String| IRError::TypeRule {
            node: node.id,
            detail,
        };
        let require_bool = |id: NodeId, role: &str| -> Result<(), IRError> {
            if self.ty(id).is_boolean() {
                Ok(())
            } else {
                Err(fail(format!("{role} must be Boolean, got {}", self.ty(id))))
            }
        };

        match &node.op {
            IROp::Input { .. } | IROp::ModuleCall { .. } => Ok(()),
            IROp::Literal { value } => {
                if value.matches_type(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "literal value of type {} declared as {}",
                        value.sem_type(),
                        node.output_type
                    )))
                }
            }
            IROp::Merge { left, right } => {
                let widened = self
                    .ty(*left)
                    .widen_records(self.ty(*right))
                    .map_err(|e| fail(e.to_string()))?;
                if widened.equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "merge widens to {widened}, declared {}",
                        node.output_type
                    )))
                }
            }
            IROp::Project { source, fields } => {
                let projected = self
                    .ty(*source)
                    .project(fields)
                    .map_err(|e| fail(e.to_string()))?;
                if projected.equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "projection yields {projected}, declared {}",
                        node.output_type
                    )))
                }
            }
            IROp::FieldAccess { source, field } => {
                let field_ty = self
                    .ty(*source)
                    .field_type(field)
                    .map_err(|e| fail(e.to_string()))?;
                if field_ty.equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "field '{field}' has type {field_ty}, declared {}",
                        node.output_type
                    )))
                }
            }
            IROp::Conditional {
                cond,
                then_branch,
                else_branch,
            } => {
                require_bool(*cond, "condition")?;
                for (role, branch) in [("then", then_branch), ("else", else_branch)] {
                    if !self.ty(*branch).equivalent(&node.output_type) {
                        return Err(fail(format!(
                            "{role} branch has type {}, declared {}",
                            self.ty(*branch),
                            node.output_type
                        )));
                    }
                }
                Ok(())
            }
            IROp::And { left, right } | IROp::Or { left, right } => {
                require_bool(*left, "left operand")?;
                require_bool(*right, "right operand")?;
                require_bool(node.id, "result")
            }
            IROp::Not { operand } => {
                require_bool(*operand, "operand")?;
                require_bool(node.id, "result")
            }
            IROp::Guard { expr, cond } => {
                require_bool(*cond, "guard condition")?;
                let expected = SemType::Optional(Box::new(self.ty(*expr).clone()));
                if expected.equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "guard yields {expected}, declared {}",
                        node.output_type
                    )))
                }
            }
            IROp::Coalesce { left, right } => {
                let inner = self.ty(*left).optional_inner().ok_or_else(|| {
                    fail(format!(
                        "coalesce left must be Optional, got {}",
                        self.ty(*left)
                    ))
                })?;
                if !inner.equivalent(&node.output_type) {
                    return Err(fail(format!(
                        "coalesce inner type {inner} does not match declared {}",
                        node.output_type
                    )));
                }
                if self.ty(*right).equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "coalesce right has type {}, declared {}",
                        self.ty(*right),
                        node.output_type
                    )))
                }
            }
            IROp::Branch { arms, otherwise } => {
                for (cond, value) in arms {
                    require_bool(*cond, "branch condition")?;
                    if !self.ty(*value).equivalent(&node.output_type) {
                        return Err(fail(format!(
                            "branch arm has type {}, declared {}",
                            self.ty(*value),
                            node.output_type
                        )));
                    }
                }
                if self.ty(*otherwise).equivalent(&node.output_type) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "otherwise arm has type {}, declared {}",
                        self.ty(*otherwise),
                        node.output_type
                    )))
                }
            }
            IROp::StringInterpolation { parts, exprs } => {
                if parts.len() != exprs.len() + 1 {
                    return Err(fail(format!(
                        "interpolation needs parts = exprs + 1, got {} parts / {} exprs",
                        parts.len(),
                        exprs.len()
                    )));
                }
                for expr in exprs {
                    match self.ty(*expr) {
                        SemType::String | SemType::Int | SemType::Float | SemType::Boolean => {}
                        other => {
                            return Err(fail(format!(
                                "interpolated expression must be primitive, got {other}"
                            )));
                        }
                    }
                }
                if node.output_type.equivalent(&SemType::String) {
                    Ok(())
                } else {
                    Err(fail(format!(
                        "interpolation yields String, declared {}",
                        node.output_type
                    )))
                }
            }
            IROp::HigherOrder { op, source, lambda } => {
                let elem = match self.ty(*source) {
                    SemType::List(elem) => elem.as_ref().clone(),
                    other => {
                        return Err(fail(format!(
                            "higher-order source must be a List, got {other}"
                        )));
                    }
                };
                match lambda.params.as_slice() {
                    [(_, param_ty)] if param_ty.equivalent(&elem) => {}
                    [(_, param_ty)] => {
                        return Err(fail(format!(
                            "lambda parameter type {param_ty} does not match element type {elem}"
                        )));
                    }
                    params => {
                        return Err(fail(format!(
                            "lambda must take exactly one parameter, got {}",
                            params.len()
                        )));
                    }
                }
                let expect = |ok: bool, detail: String| if ok { Ok(()) } else { Err(fail(detail)) };
                match op {
                    HigherOrderOp::Filter => {
                        expect(
                            lambda.return_type.is_boolean(),
                            "filter lambda must return Boolean".to_string(),
                        )?;
                        expect(
                            self.ty(*source).equivalent(&node.output_type),
                            format!("filter preserves {}, declared {}", self.ty(*source), node.output_type),
                        )
                    }
                    HigherOrderOp::Map => {
                        let expected = SemType::List(Box::new(lambda.return_type.clone()));
                        expect(
                            expected.equivalent(&node.output_type),
                            format!("map yields {expected}, declared {}", node.output_type),
                        )
                    }
                    HigherOrderOp::All | HigherOrderOp::Any => {
                        expect(
                            lambda.return_type.is_boolean(),
                            format!("{op} lambda must return Boolean"),
                        )?;
                        expect(
                            node.output_type.is_boolean(),
                            format!("{op} yields Boolean, declared {}", node.output_type),
                        )
                    }
                    HigherOrderOp::SortBy => {
                        let comparable = matches!(
                            lambda.return_type,
                            SemType::Int | SemType::Float | SemType::String | SemType::Boolean
                        );
                        expect(
                            comparable,
                            format!("sortBy key must be comparable, got {}", lambda.return_type),
                        )?;
                        expect(
                            self.ty(*source).equivalent(&node.output_type),
                            format!("sortBy preserves {}, declared {}", self.ty(*source), node.output_type),
                        )
                    }
                }
            }
            IROp::ListLiteral { elements } => {
                let elem = match &node.output_type {
                    SemType::List(elem) => elem.as_ref(),
                    other => {
                        return Err(fail(format!("list literal declared as non-list {other}")));
                    }
                };
                for element in elements {
                    if !self.ty(*element).equivalent(elem) {
                        return Err(fail(format!(
                            "list element has type {}, expected {elem}",
                            self.ty(*element)
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Transformation helpers (the only mutation surface for passes)
    // ------------------------------------------------------------------

    /// Map each node through `f`, producing a new pipeline
    pub fn transform_nodes(&self, f: impl Fn(&IRNode) -> IRNode) -> IRPipeline {
        let mut out = self.clone();
        out.nodes = self.nodes.values().map(|n| {
            let node = f(n);
            (node.id, node)
        }).collect();
        out
    }

    /// Keep only nodes satisfying `p`; input list is pruned to survivors
    pub fn filter_nodes(&self, p: impl Fn(&IRNode) -> bool) -> IRPipeline {
        let mut out = self.clone();
        out.nodes = self
            .nodes
            .iter()
            .filter(|(_, node)| p(node))
            .map(|(id, node)| (*id, node.clone()))
            .collect();
        out.inputs.retain(|id| out.nodes.contains_key(id));
        out
    }

    /// Rewrite every reference per `rewrites`, including variable bindings
    /// and module-call fallbacks; chains (`a -> b`, `b -> c`) resolve fully.
    pub fn replace_references(&self, rewrites: &BTreeMap<NodeId, NodeId>) -> IRPipeline {
        let resolve = |mut id: NodeId| {
            let mut hops = 0;
            while let Some(next) = rewrites.get(&id) {
                id = *next;
                hops += 1;
                assert!(hops <= rewrites.len(), "rewrite map contains a cycle");
            }
            id
        };

        let mut out = self.clone();
        for node in out.nodes.values_mut() {
            node.map_references(&resolve);
        }
        for target in out.bindings.values_mut() {
            *target = resolve(*target);
        }
        out
    }

    /// Pretty print the graph in topological order for debugging
    pub fn pretty_print(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let order = match self.topological_order() {
            Ok(order) => order,
            Err(e) => return format!("<invalid pipeline: {e}>"),
        };
        let _ = writeln!(out, "pipeline {} ({} nodes)", self.name, self.nodes.len());
        for id in order {
            let node = &self.nodes[&id];
            let deps = node.dependencies();
            let _ = writeln!(
                out,
                "  {id}: {} : {} <- {:?}",
                node.op_name(),
                node.output_type,
                deps.iter().map(ToString::to_string).collect::<Vec<_>>()
            );
        }
        for name in &self.outputs {
            if let Some(target) = self.bindings.get(name) {
                let _ = writeln!(out, "  out {name} = {target}");
            }
        }
        out
    }
}

// ============================================================================
// Tests
// ============================================================================
