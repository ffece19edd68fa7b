//! # IR Builder
//!
//! Typed expression tree -> [`IRPipeline`]. The surface parser and type
//! checker live outside this crate; what arrives here is a [`PipelineDef`]:
//! ordered let-bindings of typed expressions plus the declared output names.
//!
//! ```text
//! PipelineDef (typed expressions) -> [IR Builder] -> IRPipeline -> Optimizer
//! ```
//!
//! Builder guarantees:
//! - every construct gets a fresh [`NodeId`]; let-bound expressions are
//!   shared by id, never re-encoded
//! - exactly one `Input` node per distinct external port
//! - module names resolve against the registry (short or fully qualified),
//!   argument records type-check against the declared `consumes` schema,
//!   and the node's output type comes from `produces`
//! - fallback expressions become subgraphs of the same arena with their
//!   root id recorded in the call options
//! - lambda bodies build as self-contained nested graphs; no id crosses
//!   the lambda boundary

use crate::ir::{
    BackoffStrategy, ErrorStrategy, HigherOrderOp, IRNode, IROp, IRPipeline, ModuleCallOptions,
    NodeId, Span, TypedLambda,
};
use crate::registry::ModuleRegistry;
use crate::types::SemType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Typed expression input
// ============================================================================

/// Call-site options as they appear in the surface program; the fallback is
/// still an expression at this stage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallOptionsExpr {
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub backoff: Option<BackoffStrategy>,
    pub fallback: Option<Box<TypedExpr>>,
    pub cache_ms: Option<u64>,
    pub cache_backend: Option<String>,
    pub throttle_count: Option<u32>,
    pub throttle_per_ms: Option<u64>,
    pub concurrency: Option<u32>,
    pub on_error: Option<ErrorStrategy>,
    pub lazy_eval: Option<bool>,
    pub priority: Option<u8>,
}

/// A single-parameter typed lambda expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaExpr {
    pub param: String,
    pub param_type: SemType,
    pub body: Box<TypedExpr>,
}

/// A typed expression as produced by the external parser/type-checker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedExpr {
    pub kind: ExprKind,
    pub span: Option<Span>,
}

impl TypedExpr {
    pub fn new(kind: ExprKind) -> Self {
        TypedExpr { kind, span: None }
    }

    pub fn with_span(kind: ExprKind, span: Span) -> Self {
        TypedExpr {
            kind,
            span: Some(span),
        }
    }
}

/// Expression shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// External input port
    Input { name: String, ty: SemType },
    /// Literal value
    Literal { value: Value },
    /// Reference to an earlier let binding
    Var { name: String },
    /// Module call with named arguments and options
    Call {
        module: String,
        alias: Option<String>,
        args: Vec<(String, TypedExpr)>,
        options: CallOptionsExpr,
    },
    Merge {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Project {
        source: Box<TypedExpr>,
        fields: Vec<String>,
    },
    Field {
        source: Box<TypedExpr>,
        field: String,
    },
    If {
        cond: Box<TypedExpr>,
        then_branch: Box<TypedExpr>,
        else_branch: Box<TypedExpr>,
    },
    And {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Or {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Not { operand: Box<TypedExpr> },
    /// `expr when cond`
    Guard {
        expr: Box<TypedExpr>,
        cond: Box<TypedExpr>,
    },
    Coalesce {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Branch {
        arms: Vec<(TypedExpr, TypedExpr)>,
        otherwise: Box<TypedExpr>,
    },
    Interpolate {
        parts: Vec<String>,
        exprs: Vec<TypedExpr>,
    },
    HigherOrder {
        op: HigherOrderOp,
        source: Box<TypedExpr>,
        lambda: LambdaExpr,
    },
    ListLit {
        elements: Vec<TypedExpr>,
        elem_type: SemType,
    },
}

/// A complete pipeline program: ordered bindings plus declared outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    /// Let-bindings in declaration order
    pub bindings: Vec<(String, TypedExpr)>,
    /// Declared output names; each must be bound
    pub outputs: Vec<String>,
}

impl PipelineDef {
    /// Structural digest of the program, used to key the compilation cache
    pub fn source_hash(&self) -> String {
        let canonical =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"));
        crate::hash::fingerprint(&canonical)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Categories of compile failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    UnknownModule,
    ParamMismatch,
    TypeMismatch,
    DuplicateOutput,
    UnboundVariable,
}

impl std::fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompileErrorKind::UnknownModule => "unknown module",
            CompileErrorKind::ParamMismatch => "parameter mismatch",
            CompileErrorKind::TypeMismatch => "type mismatch",
            CompileErrorKind::DuplicateOutput => "duplicate output",
            CompileErrorKind::UnboundVariable => "unbound variable",
        };
        f.write_str(s)
    }
}

/// One compile diagnostic
#[derive(Debug, Clone, thiserror::Error)]
#[error("compile error ({kind}): {detail}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub span: Option<Span>,
    pub detail: String,
}

impl CompileError {
    fn new(kind: CompileErrorKind, span: Option<Span>, detail: impl Into<String>) -> Self {
        CompileError {
            kind,
            span,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds an [`IRPipeline`] from a [`PipelineDef`], resolving module names
/// against the registry
pub struct IRBuilder<'r> {
    registry: &'r ModuleRegistry,
    next_id: u64,
    nodes: BTreeMap<NodeId, IRNode>,
    input_ports: BTreeMap<String, NodeId>,
    env: BTreeMap<String, NodeId>,
}

impl<'r> IRBuilder<'r> {
    pub fn new(registry: &'r ModuleRegistry) -> Self {
        IRBuilder {
            registry,
            next_id: 0,
            nodes: BTreeMap::new(),
            input_ports: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Build the pipeline; diagnostics are collected per binding so one bad
    /// binding does not mask errors in the others
    pub fn build(mut self, def: &PipelineDef) -> Result<IRPipeline, Vec<CompileError>> {
        let mut errors = Vec::new();

        // Duplicate declared outputs
        for (i, name) in def.outputs.iter().enumerate() {
            if def.outputs[..i].contains(name) {
                errors.push(CompileError::new(
                    CompileErrorKind::DuplicateOutput,
                    None,
                    format!("output '{name}' declared more than once"),
                ));
            }
        }

        for (name, expr) in &def.bindings {
            if self.env.contains_key(name) {
                errors.push(CompileError::new(
                    CompileErrorKind::DuplicateOutput,
                    expr.span,
                    format!("binding '{name}' defined more than once"),
                ));
                continue;
            }
            match self.build_expr(expr) {
                Ok(id) => {
                    self.env.insert(name.clone(), id);
                }
                Err(e) => errors.push(e),
            }
        }

        for name in &def.outputs {
            if !self.env.contains_key(name) {
                errors.push(CompileError::new(
                    CompileErrorKind::UnboundVariable,
                    None,
                    format!("declared output '{name}' is never bound"),
                ));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let pipeline = IRPipeline {
            name: def.name.clone(),
            nodes: self.nodes,
            inputs: self.input_ports.values().copied().collect(),
            outputs: def.outputs.clone(),
            bindings: self.env,
        };
        tracing::debug!(
            pipeline = %pipeline.name,
            nodes = pipeline.node_count(),
            inputs = pipeline.inputs.len(),
            "ir_built"
        );
        Ok(pipeline)
    }

    fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, output_type: SemType, span: Option<Span>, op: IROp) -> NodeId {
        let id = self.fresh();
        self.nodes.insert(
            id,
            IRNode {
                id,
                output_type,
                span,
                op,
            },
        );
        id
    }

    fn node_type(&self, id: NodeId) -> &SemType {
        &self.nodes[&id].output_type
    }

    #[allow(clippy::too_many_lines)]
    fn build_expr(&mut self, expr: &TypedExpr) -> Result<NodeId, CompileError> {
        let span = expr.span;
        let mismatch = |detail: String| CompileError::new(CompileErrorKind::TypeMismatch, span, detail);

        match &expr.kind {
            ExprKind::Input { name, ty } => {
                if let Some(existing) = self.input_ports.get(name) {
                    let existing_ty = self.node_type(*existing);
                    if !existing_ty.equivalent(ty) {
                        return Err(mismatch(format!(
                            "input '{name}' used as both {existing_ty} and {ty}"
                        )));
                    }
                    return Ok(*existing);
                }
                let id = self.insert(ty.clone(), span, IROp::Input { name: name.clone() });
                self.input_ports.insert(name.clone(), id);
                Ok(id)
            }

            ExprKind::Literal { value } => {
                Ok(self.insert(value.sem_type(), span, IROp::Literal { value: value.clone() }))
            }

            // Shared by id, not re-encoded
            ExprKind::Var { name } => self.env.get(name).copied().ok_or_else(|| {
                CompileError::new(
                    CompileErrorKind::UnboundVariable,
                    span,
                    format!("variable '{name}' is not bound"),
                )
            }),

            ExprKind::Call {
                module,
                alias,
                args,
                options,
            } => self.build_call(module, alias.as_deref(), args, options, span),

            ExprKind::Merge { left, right } => {
                let left_id = self.build_expr(left)?;
                let right_id = self.build_expr(right)?;
                let ty = self
                    .node_type(left_id)
                    .widen_records(self.node_type(right_id))
                    .map_err(|e| mismatch(e.to_string()))?;
                Ok(self.insert(ty, span, IROp::Merge { left: left_id, right: right_id }))
            }

            ExprKind::Project { source, fields } => {
                let source_id = self.build_expr(source)?;
                let ty = self
                    .node_type(source_id)
                    .project(fields)
                    .map_err(|e| mismatch(e.to_string()))?;
                Ok(self.insert(
                    ty,
                    span,
                    IROp::Project {
                        source: source_id,
                        fields: fields.clone(),
                    },
                ))
            }

            ExprKind::Field { source, field } => {
                let source_id = self.build_expr(source)?;
                let ty = self
                    .node_type(source_id)
                    .field_type(field)
                    .map_err(|e| mismatch(e.to_string()))?;
                Ok(self.insert(
                    ty,
                    span,
                    IROp::FieldAccess {
                        source: source_id,
                        field: field.clone(),
                    },
                ))
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_id = self.build_boolean(cond, "condition")?;
                let then_id = self.build_expr(then_branch)?;
                let else_id = self.build_expr(else_branch)?;
                let then_ty = self.node_type(then_id).clone();
                let else_ty = self.node_type(else_id);
                if !then_ty.equivalent(else_ty) {
                    return Err(mismatch(format!(
                        "conditional branches disagree: {then_ty} vs {else_ty}"
                    )));
                }
                Ok(self.insert(
                    then_ty,
                    span,
                    IROp::Conditional {
                        cond: cond_id,
                        then_branch: then_id,
                        else_branch: else_id,
                    },
                ))
            }

            ExprKind::And { left, right } => {
                let left_id = self.build_boolean(left, "left operand of 'and'")?;
                let right_id = self.build_boolean(right, "right operand of 'and'")?;
                Ok(self.insert(SemType::Boolean, span, IROp::And { left: left_id, right: right_id }))
            }

            ExprKind::Or { left, right } => {
                let left_id = self.build_boolean(left, "left operand of 'or'")?;
                let right_id = self.build_boolean(right, "right operand of 'or'")?;
                Ok(self.insert(SemType::Boolean, span, IROp::Or { left: left_id, right: right_id }))
            }

            ExprKind::Not { operand } => {
                let operand_id = self.build_boolean(operand, "operand of 'not'")?;
                Ok(self.insert(SemType::Boolean, span, IROp::Not { operand: operand_id }))
            }

            ExprKind::Guard { expr: inner, cond } => {
                let expr_id = self.build_expr(inner)?;
                let cond_id = self.build_boolean(cond, "guard condition")?;
                let inner_ty = self.node_type(expr_id).clone();
                Ok(self.insert(
                    SemType::Optional(Box::new(inner_ty)),
                    span,
                    IROp::Guard {
                        expr: expr_id,
                        cond: cond_id,
                    },
                ))
            }

            ExprKind::Coalesce { left, right } => {
                let left_id = self.build_expr(left)?;
                let right_id = self.build_expr(right)?;
                let inner = self
                    .node_type(left_id)
                    .optional_inner()
                    .cloned()
                    .ok_or_else(|| {
                        mismatch(format!(
                            "coalesce left side must be Optional, got {}",
                            self.node_type(left_id)
                        ))
                    })?;
                let right_ty = self.node_type(right_id);
                if !right_ty.equivalent(&inner) {
                    return Err(mismatch(format!(
                        "coalesce right side has type {right_ty}, expected {inner}"
                    )));
                }
                Ok(self.insert(inner, span, IROp::Coalesce { left: left_id, right: right_id }))
            }

            ExprKind::Branch { arms, otherwise } => {
                let mut built_arms = Vec::with_capacity(arms.len());
                for (cond, value) in arms {
                    let cond_id = self.build_boolean(cond, "branch condition")?;
                    let value_id = self.build_expr(value)?;
                    built_arms.push((cond_id, value_id));
                }
                let otherwise_id = self.build_expr(otherwise)?;
                let result_ty = self.node_type(otherwise_id).clone();
                for (_, value_id) in &built_arms {
                    let arm_ty = self.node_type(*value_id);
                    if !arm_ty.equivalent(&result_ty) {
                        return Err(mismatch(format!(
                            "branch arms disagree: {arm_ty} vs {result_ty}"
                        )));
                    }
                }
                Ok(self.insert(
                    result_ty,
                    span,
                    IROp::Branch {
                        arms: built_arms,
                        otherwise: otherwise_id,
                    },
                ))
            }

            ExprKind::Interpolate { parts, exprs } => {
                if parts.len() != exprs.len() + 1 {
                    return Err(mismatch(format!(
                        "interpolation needs one more part than expressions, got {} parts / {} expressions",
                        parts.len(),
                        exprs.len()
                    )));
                }
                let mut expr_ids = Vec::with_capacity(exprs.len());
                for e in exprs {
                    let id = self.build_expr(e)?;
                    match self.node_type(id) {
                        SemType::String | SemType::Int | SemType::Float | SemType::Boolean => {}
                        other => {
                            return Err(mismatch(format!(
                                "interpolated expression must be primitive, got {other}"
                            )));
                        }
                    }
                    expr_ids.push(id);
                }
                Ok(self.insert(
                    SemType::String,
                    span,
                    IROp::StringInterpolation {
                        parts: parts.clone(),
                        exprs: expr_ids,
                    },
                ))
            }

            ExprKind::HigherOrder { op, source, lambda } => {
                let source_id = self.build_expr(source)?;
                let elem = match self.node_type(source_id) {
                    SemType::List(elem) => elem.as_ref().clone(),
                    other => {
                        return Err(mismatch(format!(
                            "{op} source must be a List, got {other}"
                        )));
                    }
                };
                if !lambda.param_type.equivalent(&elem) {
                    return Err(mismatch(format!(
                        "lambda parameter '{}' has type {}, element type is {elem}",
                        lambda.param, lambda.param_type
                    )));
                }
                let built = self.build_lambda(lambda)?;
                let output_type = match op {
                    HigherOrderOp::Filter | HigherOrderOp::SortBy => {
                        let comparable = matches!(
                            built.return_type,
                            SemType::Int | SemType::Float | SemType::String | SemType::Boolean
                        );
                        if *op == HigherOrderOp::Filter && !built.return_type.is_boolean() {
                            return Err(mismatch(format!(
                                "filter lambda must return Boolean, got {}",
                                built.return_type
                            )));
                        }
                        if *op == HigherOrderOp::SortBy && !comparable {
                            return Err(mismatch(format!(
                                "sortBy key must be comparable, got {}",
                                built.return_type
                            )));
                        }
                        self.node_type(source_id).clone()
                    }
                    HigherOrderOp::Map => SemType::List(Box::new(built.return_type.clone())),
                    HigherOrderOp::All | HigherOrderOp::Any => {
                        if !built.return_type.is_boolean() {
                            return Err(mismatch(format!(
                                "{op} lambda must return Boolean, got {}",
                                built.return_type
                            )));
                        }
                        SemType::Boolean
                    }
                };
                Ok(self.insert(
                    output_type,
                    span,
                    IROp::HigherOrder {
                        op: *op,
                        source: source_id,
                        lambda: built,
                    },
                ))
            }

            ExprKind::ListLit { elements, elem_type } => {
                let mut element_ids = Vec::with_capacity(elements.len());
                for element in elements {
                    let id = self.build_expr(element)?;
                    let ty = self.node_type(id);
                    if !ty.equivalent(elem_type) {
                        return Err(mismatch(format!(
                            "list element has type {ty}, expected {elem_type}"
                        )));
                    }
                    element_ids.push(id);
                }
                Ok(self.insert(
                    SemType::List(Box::new(elem_type.clone())),
                    span,
                    IROp::ListLiteral { elements: element_ids },
                ))
            }
        }
    }

    fn build_boolean(&mut self, expr: &TypedExpr, role: &str) -> Result<NodeId, CompileError> {
        let id = self.build_expr(expr)?;
        let ty = self.node_type(id);
        if ty.is_boolean() {
            Ok(id)
        } else {
            Err(CompileError::new(
                CompileErrorKind::TypeMismatch,
                expr.span,
                format!("{role} must be Boolean, got {ty}"),
            ))
        }
    }

    fn build_call(
        &mut self,
        module_name: &str,
        alias: Option<&str>,
        args: &[(String, TypedExpr)],
        options: &CallOptionsExpr,
        span: Option<Span>,
    ) -> Result<NodeId, CompileError> {
        let resolved = self.registry.resolve_name(module_name).ok_or_else(|| {
            CompileError::new(
                CompileErrorKind::UnknownModule,
                span,
                format!("no module named '{module_name}' is registered"),
            )
        })?;
        let module = self
            .registry
            .get(&resolved)
            .ok_or_else(|| {
                CompileError::new(
                    CompileErrorKind::UnknownModule,
                    span,
                    format!("module '{resolved}' disappeared during compilation"),
                )
            })?;

        // Build arguments, then check them against the declared schema
        let mut arg_ids: BTreeMap<String, NodeId> = BTreeMap::new();
        for (param, arg_expr) in args {
            if arg_ids.contains_key(param) {
                return Err(CompileError::new(
                    CompileErrorKind::ParamMismatch,
                    span,
                    format!("parameter '{param}' supplied more than once to '{module_name}'"),
                ));
            }
            let id = self.build_expr(arg_expr)?;
            arg_ids.insert(param.clone(), id);
        }

        for (param, expected) in &module.consumes {
            match arg_ids.get(param) {
                None => {
                    return Err(CompileError::new(
                        CompileErrorKind::ParamMismatch,
                        span,
                        format!("missing parameter '{param}' for module '{resolved}'"),
                    ));
                }
                Some(id) => {
                    let actual = self.node_type(*id);
                    if !actual.equivalent(expected) {
                        return Err(CompileError::new(
                            CompileErrorKind::TypeMismatch,
                            span,
                            format!(
                                "parameter '{param}' of '{resolved}' expects {expected}, got {actual}"
                            ),
                        ));
                    }
                }
            }
        }
        for param in arg_ids.keys() {
            if !module.consumes.contains_key(param) {
                return Err(CompileError::new(
                    CompileErrorKind::ParamMismatch,
                    span,
                    format!("module '{resolved}' has no parameter '{param}'"),
                ));
            }
        }

        let output_type = module.output_type();

        // Wrap needs a type-compatible sentinel shape
        if options.on_error == Some(ErrorStrategy::Wrap) && !wrappable(&output_type) {
            return Err(CompileError::new(
                CompileErrorKind::TypeMismatch,
                span,
                format!(
                    "on_error=wrap requires an Optional or error-union output, '{resolved}' produces {output_type}"
                ),
            ));
        }

        // The fallback expression joins the same arena; its root id rides
        // in the options
        let fallback_id = match &options.fallback {
            Some(fallback_expr) => {
                let id = self.build_expr(fallback_expr)?;
                let fallback_ty = self.node_type(id);
                if !fallback_ty.equivalent(&output_type) {
                    return Err(CompileError::new(
                        CompileErrorKind::TypeMismatch,
                        span,
                        format!(
                            "fallback for '{resolved}' has type {fallback_ty}, expected {output_type}"
                        ),
                    ));
                }
                Some(id)
            }
            None => None,
        };

        let ir_options = ModuleCallOptions {
            retry: options.retry,
            timeout_ms: options.timeout_ms,
            delay_ms: options.delay_ms,
            backoff: options.backoff,
            fallback: fallback_id,
            cache_ms: options.cache_ms,
            cache_backend: options.cache_backend.clone(),
            throttle_count: options.throttle_count,
            throttle_per_ms: options.throttle_per_ms,
            concurrency: options.concurrency,
            on_error: options.on_error,
            lazy_eval: options.lazy_eval,
            priority: options.priority,
        };

        Ok(self.insert(
            output_type,
            span,
            IROp::ModuleCall {
                module: resolved,
                alias: alias.map(ToString::to_string),
                args: arg_ids,
                options: ir_options,
            },
        ))
    }

    /// Build a lambda body as a self-contained nested graph
    ///
    /// The outer node map, environment, and input ports are swapped out for
    /// the duration, so lambda ids and names cannot leak either way. Ids
    /// still come from the shared counter, keeping them globally unique.
    fn build_lambda(&mut self, lambda: &LambdaExpr) -> Result<TypedLambda, CompileError> {
        let saved_nodes = std::mem::take(&mut self.nodes);
        let saved_env = std::mem::take(&mut self.env);
        let saved_ports = std::mem::take(&mut self.input_ports);

        let param_id = self.insert(
            lambda.param_type.clone(),
            None,
            IROp::Input {
                name: lambda.param.clone(),
            },
        );
        self.input_ports.insert(lambda.param.clone(), param_id);
        self.env.insert(lambda.param.clone(), param_id);

        let result = self.build_expr(&lambda.body);

        let body_nodes = std::mem::replace(&mut self.nodes, saved_nodes);
        self.env = saved_env;
        self.input_ports = saved_ports;

        let output = result?;
        let return_type = body_nodes[&output].output_type.clone();
        Ok(TypedLambda {
            params: vec![(lambda.param.clone(), lambda.param_type.clone())],
            nodes: body_nodes,
            output,
            return_type,
        })
    }
}

/// A sentinel value can be produced for optionals and for unions carrying
/// an `error` variant
fn wrappable(ty: &SemType) -> bool {
    match ty {
        SemType::Optional(_) => true,
        SemType::Union(variants) => variants.iter().any(|(name, _)| name == "error"),
        _ => false,
    }
}
