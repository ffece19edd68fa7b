//! Structural-op and lambda evaluation
//!
//! Synthesized module nodes (`__merge`, `__conditional`, `__filter`, ...)
//! are executed here instead of through a registry callable. Higher-order
//! nodes evaluate their lambda body, a self-contained nested IR graph,
//! once per source element; module calls inside a lambda invoke the
//! registry directly, without call-site policies.
//!
//! Short-circuit: `__and`, `__or`, and `__coalesce` read their left
//! operand first and produce the determined result even when the
//! right-hand input is absent (its producer failed or was skipped).

use crate::dag::StructuralOp;
use crate::ir::{HigherOrderOp, IRNode, IROp, NodeId, TypedLambda};
use crate::registry::{ModuleError, ModuleErrorKind, ModuleRegistry};
use crate::types::SemType;
use crate::value::Value;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn missing(name: &str) -> ModuleError {
    ModuleError::new(
        ModuleErrorKind::RuntimeError,
        format!("missing input '{name}'"),
    )
}

fn required<'a>(
    params: &'a BTreeMap<String, Option<Value>>,
    name: &str,
) -> Result<&'a Value, ModuleError> {
    params
        .get(name)
        .and_then(Option::as_ref)
        .ok_or_else(|| missing(name))
}

fn required_bool(
    params: &BTreeMap<String, Option<Value>>,
    name: &str,
) -> Result<bool, ModuleError> {
    required(params, name)?.as_bool().ok_or_else(|| {
        ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("input '{name}' must be Boolean"),
        )
    })
}

fn render_primitive(value: &Value) -> Result<String, ModuleError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(x) => Ok(x.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("cannot interpolate non-primitive {}", other.sem_type()),
        )),
    }
}

fn record_fields(value: &Value, role: &str) -> Result<Vec<(String, Value)>, ModuleError> {
    match value {
        Value::Record(fields) => Ok(fields.clone()),
        other => Err(ModuleError::new(
            ModuleErrorKind::TypeError,
            format!("{role} must be a Record, got {}", other.sem_type()),
        )),
    }
}

/// Evaluate one synthesized structural operation
pub async fn eval_structural(
    op: &StructuralOp,
    params: &BTreeMap<String, Option<Value>>,
    output_type: &SemType,
    registry: &ModuleRegistry,
) -> Result<Value, ModuleError> {
    match op {
        StructuralOp::Merge => {
            let mut fields = record_fields(required(params, "left")?, "merge left")?;
            fields.extend(record_fields(required(params, "right")?, "merge right")?);
            Ok(Value::Record(fields))
        }

        StructuralOp::Project { fields } => {
            let source = record_fields(required(params, "source")?, "projection source")?;
            let mut projected = Vec::with_capacity(fields.len());
            for name in fields {
                let value = source
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        ModuleError::new(
                            ModuleErrorKind::TypeError,
                            format!("projected field '{name}' absent"),
                        )
                    })?;
                projected.push((name.clone(), value));
            }
            Ok(Value::Record(projected))
        }

        StructuralOp::FieldAccess { field } => {
            required(params, "source")?
                .field(field)
                .cloned()
                .ok_or_else(|| {
                    ModuleError::new(
                        ModuleErrorKind::TypeError,
                        format!("field '{field}' absent"),
                    )
                })
        }

        StructuralOp::Conditional => {
            let branch = if required_bool(params, "cond")? { "then" } else { "else" };
            Ok(required(params, branch)?.clone())
        }

        StructuralOp::And => {
            if !required_bool(params, "left")? {
                return Ok(Value::Boolean(false));
            }
            Ok(Value::Boolean(required_bool(params, "right")?))
        }

        StructuralOp::Or => {
            if required_bool(params, "left")? {
                return Ok(Value::Boolean(true));
            }
            Ok(Value::Boolean(required_bool(params, "right")?))
        }

        StructuralOp::Not => Ok(Value::Boolean(!required_bool(params, "value")?)),

        StructuralOp::Guard => {
            let inner_type = output_type
                .optional_inner()
                .cloned()
                .unwrap_or(SemType::Unit);
            if required_bool(params, "cond")? {
                Ok(Value::Some(Box::new(required(params, "value")?.clone())))
            } else {
                Ok(Value::None(inner_type))
            }
        }

        StructuralOp::Coalesce => match required(params, "left")? {
            Value::Some(inner) => Ok(inner.as_ref().clone()),
            Value::None(_) => Ok(required(params, "right")?.clone()),
            other => Err(ModuleError::new(
                ModuleErrorKind::TypeError,
                format!("coalesce left must be Optional, got {}", other.sem_type()),
            )),
        },

        StructuralOp::Branch { arm_count } => {
            for i in 0..*arm_count {
                if required_bool(params, &format!("cond{i}"))? {
                    return Ok(required(params, &format!("value{i}"))?.clone());
                }
            }
            Ok(required(params, "otherwise")?.clone())
        }

        StructuralOp::StringInterpolation { parts } => {
            let mut out = String::new();
            for (i, part) in parts.iter().enumerate() {
                out.push_str(part);
                if i + 1 < parts.len() {
                    out.push_str(&render_primitive(required(params, &format!("expr{i}"))?)?);
                }
            }
            Ok(Value::String(out))
        }

        StructuralOp::ListLiteral { element_count } => {
            let elem_type = match output_type {
                SemType::List(elem) => elem.as_ref().clone(),
                _ => SemType::Unit,
            };
            let mut items = Vec::with_capacity(*element_count);
            for i in 0..*element_count {
                items.push(required(params, &format!("item{i}"))?.clone());
            }
            Ok(Value::List {
                items,
                elem_type,
            })
        }

        StructuralOp::HigherOrder { op, lambda } => {
            let source = required(params, "source")?;
            eval_higher_order(*op, lambda, source, registry).await
        }
    }
}

/// Apply a higher-order operation over a source list
async fn eval_higher_order(
    op: HigherOrderOp,
    lambda: &TypedLambda,
    source: &Value,
    registry: &ModuleRegistry,
) -> Result<Value, ModuleError> {
    let (items, elem_type) = match source {
        Value::List { items, elem_type } => (items, elem_type.clone()),
        other => {
            return Err(ModuleError::new(
                ModuleErrorKind::TypeError,
                format!("{op} source must be a List, got {}", other.sem_type()),
            ));
        }
    };
    let order = lambda_topo_order(&lambda.nodes)?;

    match op {
        HigherOrderOp::Filter => {
            let mut kept = Vec::new();
            for item in items {
                if lambda_bool(lambda, &order, item, registry).await? {
                    kept.push(item.clone());
                }
            }
            Ok(Value::List {
                items: kept,
                elem_type,
            })
        }
        HigherOrderOp::Map => {
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(eval_lambda(lambda, &order, item, registry).await?);
            }
            Ok(Value::List {
                items: mapped,
                elem_type: lambda.return_type.clone(),
            })
        }
        HigherOrderOp::All => {
            for item in items {
                if !lambda_bool(lambda, &order, item, registry).await? {
                    return Ok(Value::Boolean(false));
                }
            }
            Ok(Value::Boolean(true))
        }
        HigherOrderOp::Any => {
            for item in items {
                if lambda_bool(lambda, &order, item, registry).await? {
                    return Ok(Value::Boolean(true));
                }
            }
            Ok(Value::Boolean(false))
        }
        HigherOrderOp::SortBy => {
            let mut keyed = Vec::with_capacity(items.len());
            for item in items {
                let key = eval_lambda(lambda, &order, item, registry).await?;
                keyed.push((key, item.clone()));
            }
            keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b));
            Ok(Value::List {
                items: keyed.into_iter().map(|(_, item)| item).collect(),
                elem_type,
            })
        }
    }
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

async fn lambda_bool(
    lambda: &TypedLambda,
    order: &[NodeId],
    element: &Value,
    registry: &ModuleRegistry,
) -> Result<bool, ModuleError> {
    eval_lambda(lambda, order, element, registry)
        .await?
        .as_bool()
        .ok_or_else(|| {
            ModuleError::new(
                ModuleErrorKind::TypeError,
                "lambda was expected to return Boolean".to_string(),
            )
        })
}

/// Kahn order over a lambda's private node map; a cycle here is a compiler
/// bug surfaced as a runtime error rather than a panic
fn lambda_topo_order(nodes: &BTreeMap<NodeId, IRNode>) -> Result<Vec<NodeId>, ModuleError> {
    let mut remaining: BTreeMap<NodeId, Vec<NodeId>> = nodes
        .iter()
        .map(|(id, node)| (*id, node.dependencies()))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while !remaining.is_empty() {
        let ready: Vec<NodeId> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| !remaining.contains_key(d)))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return Err(ModuleError::new(
                ModuleErrorKind::RuntimeError,
                "cycle in lambda body graph".to_string(),
            ));
        }
        for id in ready {
            remaining.remove(&id);
            order.push(id);
        }
    }
    Ok(order)
}

/// Evaluate a lambda body for one element, binding the parameter to it
fn eval_lambda<'a>(
    lambda: &'a TypedLambda,
    order: &'a [NodeId],
    element: &'a Value,
    registry: &'a ModuleRegistry,
) -> BoxFuture<'a, Result<Value, ModuleError>> {
    async move {
        let param_name = lambda
            .params
            .first()
            .map(|(name, _)| name.as_str())
            .unwrap_or_default();
        let mut values: BTreeMap<NodeId, Value> = BTreeMap::new();

        for id in order {
            let node = lambda.nodes.get(id).ok_or_else(|| {
                ModuleError::new(
                    ModuleErrorKind::RuntimeError,
                    format!("lambda body references unknown node {id}"),
                )
            })?;
            let value = eval_lambda_node(node, param_name, element, &values, registry).await?;
            values.insert(*id, value);
        }

        values.remove(&lambda.output).ok_or_else(|| {
            ModuleError::new(
                ModuleErrorKind::RuntimeError,
                "lambda body produced no output".to_string(),
            )
        })
    }
    .boxed()
}

async fn eval_lambda_node(
    node: &IRNode,
    param_name: &str,
    element: &Value,
    values: &BTreeMap<NodeId, Value>,
    registry: &ModuleRegistry,
) -> Result<Value, ModuleError> {
    let get = |id: &NodeId| -> Result<&Value, ModuleError> {
        values.get(id).ok_or_else(|| {
            ModuleError::new(
                ModuleErrorKind::RuntimeError,
                format!("lambda node {id} evaluated out of order"),
            )
        })
    };
    let get_bool = |id: &NodeId| -> Result<bool, ModuleError> {
        get(id)?.as_bool().ok_or_else(|| {
            ModuleError::new(ModuleErrorKind::TypeError, "expected Boolean".to_string())
        })
    };

    match &node.op {
        IROp::Input { name } => {
            if name == param_name {
                Ok(element.clone())
            } else {
                Err(ModuleError::new(
                    ModuleErrorKind::RuntimeError,
                    format!("lambda references unknown parameter '{name}'"),
                ))
            }
        }
        IROp::Literal { value } => Ok(value.clone()),
        IROp::ModuleCall { module, args, .. } => {
            let resolved = registry.get(module).ok_or_else(|| {
                ModuleError::new(
                    ModuleErrorKind::NotFound,
                    format!("module '{module}' is not registered"),
                )
            })?;
            let mut fields = Vec::with_capacity(args.len());
            for (param, dep) in args {
                fields.push((param.clone(), get(dep)?.clone()));
            }
            resolved.invoke(Value::Record(fields)).await
        }
        IROp::Merge { left, right } => {
            let mut fields = record_fields(get(left)?, "merge left")?;
            fields.extend(record_fields(get(right)?, "merge right")?);
            Ok(Value::Record(fields))
        }
        IROp::Project { source, fields } => {
            let source = record_fields(get(source)?, "projection source")?;
            let mut projected = Vec::with_capacity(fields.len());
            for name in fields {
                let value = source
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        ModuleError::new(
                            ModuleErrorKind::TypeError,
                            format!("projected field '{name}' absent"),
                        )
                    })?;
                projected.push((name.clone(), value));
            }
            Ok(Value::Record(projected))
        }
        IROp::FieldAccess { source, field } => {
            get(source)?.field(field).cloned().ok_or_else(|| {
                ModuleError::new(
                    ModuleErrorKind::TypeError,
                    format!("field '{field}' absent"),
                )
            })
        }
        IROp::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            let selected = if get_bool(cond)? { then_branch } else { else_branch };
            Ok(get(selected)?.clone())
        }
        IROp::And { left, right } => {
            Ok(Value::Boolean(get_bool(left)? && get_bool(right)?))
        }
        IROp::Or { left, right } => {
            Ok(Value::Boolean(get_bool(left)? || get_bool(right)?))
        }
        IROp::Not { operand } => Ok(Value::Boolean(!get_bool(operand)?)),
        IROp::Guard { expr, cond } => {
            if get_bool(cond)? {
                Ok(Value::Some(Box::new(get(expr)?.clone())))
            } else {
                let inner = node
                    .output_type
                    .optional_inner()
                    .cloned()
                    .unwrap_or(SemType::Unit);
                Ok(Value::None(inner))
            }
        }
        IROp::Coalesce { left, right } => match get(left)? {
            Value::Some(inner) => Ok(inner.as_ref().clone()),
            Value::None(_) => Ok(get(right)?.clone()),
            other => Err(ModuleError::new(
                ModuleErrorKind::TypeError,
                format!("coalesce left must be Optional, got {}", other.sem_type()),
            )),
        },
        IROp::Branch { arms, otherwise } => {
            for (cond, value) in arms {
                if get_bool(cond)? {
                    return Ok(get(value)?.clone());
                }
            }
            Ok(get(otherwise)?.clone())
        }
        IROp::StringInterpolation { parts, exprs } => {
            let mut out = String::new();
            for (i, part) in parts.iter().enumerate() {
                out.push_str(part);
                if let Some(expr) = exprs.get(i) {
                    out.push_str(&render_primitive(get(expr)?)?);
                }
            }
            Ok(Value::String(out))
        }
        IROp::HigherOrder { op, source, lambda: nested } => {
            eval_higher_order(*op, nested, get(source)?, registry).await
        }
        IROp::ListLiteral { elements } => {
            let elem_type = match &node.output_type {
                SemType::List(elem) => elem.as_ref().clone(),
                _ => SemType::Unit,
            };
            let mut items = Vec::with_capacity(elements.len());
            for element_id in elements {
                items.push(get(element_id)?.clone());
            }
            Ok(Value::List { items, elem_type })
        }
    }
}
