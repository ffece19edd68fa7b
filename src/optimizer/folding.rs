//! Constant folding
//!
//! Walks nodes in topological order carrying a map of already-folded
//! values. A foldable node is rewritten in place to a `Literal` with the
//! same id and output type, so no reference rewriting is needed; the
//! now-dead operands are collected by the DCE pass that follows.
//!
//! Foldable shapes:
//! - `Literal`
//! - boolean `And`/`Or`/`Not` (short-circuit honored: `and(false, _)` and
//!   `or(true, _)` fold without the other operand)
//! - `Conditional` with a folded condition and folded selected branch
//! - `StringInterpolation` whose expressions all folded to primitives
//! - `ModuleCall`s on the pure built-in whitelist with all arguments
//!   folded; division/modulo by zero refuses to fold so the runtime
//!   observes it

use super::OptimizationPass;
use crate::builtins;
use crate::ir::{IRError, IRNode, IROp, IRPipeline, NodeId};
use crate::value::Value;
use std::collections::BTreeMap;

pub struct ConstantFolding;

impl ConstantFolding {
    fn render_primitive(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(x) => Some(x.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The folded value of `node`, if it folds given what folded so far
    fn fold_node(node: &IRNode, folded: &BTreeMap<NodeId, Value>) -> Option<Value> {
        let get_bool = |id: &NodeId| folded.get(id).and_then(Value::as_bool);

        match &node.op {
            IROp::Literal { value } => Some(value.clone()),

            IROp::Not { operand } => get_bool(operand).map(|b| Value::Boolean(!b)),

            IROp::And { left, right } => match get_bool(left) {
                Some(false) => Some(Value::Boolean(false)),
                Some(true) => get_bool(right).map(Value::Boolean),
                None => None,
            },

            IROp::Or { left, right } => match get_bool(left) {
                Some(true) => Some(Value::Boolean(true)),
                Some(false) => get_bool(right).map(Value::Boolean),
                None => None,
            },

            IROp::Conditional {
                cond,
                then_branch,
                else_branch,
            } => {
                let selected = if get_bool(cond)? { then_branch } else { else_branch };
                folded.get(selected).cloned()
            }

            IROp::StringInterpolation { parts, exprs } => {
                let mut rendered = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    rendered.push(Self::render_primitive(folded.get(expr)?)?);
                }
                let mut out = String::new();
                for (i, part) in parts.iter().enumerate() {
                    out.push_str(part);
                    if let Some(r) = rendered.get(i) {
                        out.push_str(r);
                    }
                }
                Some(Value::String(out))
            }

            IROp::ModuleCall { module, args, .. } => {
                if !builtins::is_foldable(module) {
                    return None;
                }
                let mut arg_values: BTreeMap<String, Value> = BTreeMap::new();
                for (param, dep) in args {
                    arg_values.insert(param.clone(), folded.get(dep)?.clone());
                }
                builtins::try_fold(module, &arg_values)
            }

            // Structural and effectful shapes never fold
            IROp::Input { .. }
            | IROp::Merge { .. }
            | IROp::Project { .. }
            | IROp::FieldAccess { .. }
            | IROp::Guard { .. }
            | IROp::Coalesce { .. }
            | IROp::Branch { .. }
            | IROp::HigherOrder { .. }
            | IROp::ListLiteral { .. } => None,
        }
    }
}

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&self, pipeline: &IRPipeline) -> Result<IRPipeline, IRError> {
        let order = pipeline.topological_order()?;
        let mut folded: BTreeMap<NodeId, Value> = BTreeMap::new();
        let mut out = pipeline.clone();
        let mut rewritten = 0usize;

        for id in order {
            let node = &out.nodes[&id];
            let Some(value) = Self::fold_node(node, &folded) else {
                continue;
            };

            if !matches!(node.op, IROp::Literal { .. }) {
                let node = out.nodes.get_mut(&id).expect("walked id exists");
                node.op = IROp::Literal {
                    value: value.clone(),
                };
                rewritten += 1;
            }
            folded.insert(id, value);
        }

        if rewritten > 0 {
            tracing::debug!(
                pipeline = %pipeline.name,
                rewritten,
                "folding_rewrote_nodes"
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SemType;

    fn literal(id: u64, value: Value) -> IRNode {
        IRNode {
            id: NodeId(id),
            output_type: value.sem_type(),
            span: None,
            op: IROp::Literal { value },
        }
    }

    fn node(id: u64, output_type: SemType, op: IROp) -> IRNode {
        IRNode {
            id: NodeId(id),
            output_type,
            span: None,
            op,
        }
    }

    fn pipeline(nodes: Vec<IRNode>, outputs: Vec<(&str, u64)>) -> IRPipeline {
        let inputs = nodes
            .iter()
            .filter(|n| matches!(n.op, IROp::Input { .. }))
            .map(|n| n.id)
            .collect();
        IRPipeline {
            name: "fold_test".to_string(),
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            inputs,
            outputs: outputs.iter().map(|(n, _)| (*n).to_string()).collect(),
            bindings: outputs
                .into_iter()
                .map(|(n, id)| (n.to_string(), NodeId(id)))
                .collect(),
        }
    }

    fn folded_value(p: &IRPipeline, id: u64) -> Option<Value> {
        match &p.nodes[&NodeId(id)].op {
            IROp::Literal { value } => Some(value.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_boolean_ops_fold() {
        let p = pipeline(
            vec![
                literal(1, Value::Boolean(true)),
                literal(2, Value::Boolean(false)),
                node(3, SemType::Boolean, IROp::And { left: NodeId(1), right: NodeId(2) }),
                node(4, SemType::Boolean, IROp::Or { left: NodeId(1), right: NodeId(2) }),
                node(5, SemType::Boolean, IROp::Not { operand: NodeId(2) }),
            ],
            vec![("a", 3), ("b", 4), ("c", 5)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert_eq!(folded_value(&out, 3), Some(Value::Boolean(false)));
        assert_eq!(folded_value(&out, 4), Some(Value::Boolean(true)));
        assert_eq!(folded_value(&out, 5), Some(Value::Boolean(true)));
    }

    #[test]
    fn test_short_circuit_folds_without_other_operand() {
        // and(false, <input>) folds even though the input never folds
        let p = pipeline(
            vec![
                literal(1, Value::Boolean(false)),
                node(2, SemType::Boolean, IROp::Input { name: "x".to_string() }),
                node(3, SemType::Boolean, IROp::And { left: NodeId(1), right: NodeId(2) }),
                literal(4, Value::Boolean(true)),
                node(5, SemType::Boolean, IROp::Or { left: NodeId(4), right: NodeId(2) }),
            ],
            vec![("a", 3), ("b", 5)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert_eq!(folded_value(&out, 3), Some(Value::Boolean(false)));
        assert_eq!(folded_value(&out, 5), Some(Value::Boolean(true)));
        // The unfolded operand is untouched; DCE collects it later
        assert!(matches!(out.nodes[&NodeId(2)].op, IROp::Input { .. }));
    }

    #[test]
    fn test_conditional_folds_selected_branch_only() {
        let p = pipeline(
            vec![
                literal(1, Value::Boolean(true)),
                literal(2, Value::Int(10)),
                node(3, SemType::Int, IROp::Input { name: "x".to_string() }),
                node(
                    4,
                    SemType::Int,
                    IROp::Conditional {
                        cond: NodeId(1),
                        then_branch: NodeId(2),
                        else_branch: NodeId(3),
                    },
                ),
            ],
            vec![("r", 4)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        // Selected branch is folded; the unselected input is irrelevant
        assert_eq!(folded_value(&out, 4), Some(Value::Int(10)));
    }

    #[test]
    fn test_conditional_with_unfolded_selected_branch_stays() {
        let p = pipeline(
            vec![
                literal(1, Value::Boolean(false)),
                literal(2, Value::Int(10)),
                node(3, SemType::Int, IROp::Input { name: "x".to_string() }),
                node(
                    4,
                    SemType::Int,
                    IROp::Conditional {
                        cond: NodeId(1),
                        then_branch: NodeId(2),
                        else_branch: NodeId(3),
                    },
                ),
            ],
            vec![("r", 4)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert!(matches!(out.nodes[&NodeId(4)].op, IROp::Conditional { .. }));
    }

    #[test]
    fn test_interpolation_folds_primitives() {
        let p = pipeline(
            vec![
                literal(1, Value::Int(3)),
                literal(2, Value::String("items".to_string())),
                node(
                    3,
                    SemType::String,
                    IROp::StringInterpolation {
                        parts: vec!["found ".to_string(), " ".to_string(), String::new()],
                        exprs: vec![NodeId(1), NodeId(2)],
                    },
                ),
            ],
            vec![("r", 3)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert_eq!(
            folded_value(&out, 3),
            Some(Value::String("found 3 items".to_string()))
        );
    }

    #[test]
    fn test_whitelisted_call_folds() {
        let p = pipeline(
            vec![
                literal(1, Value::Int(2)),
                literal(2, Value::Int(3)),
                node(
                    3,
                    SemType::Int,
                    IROp::ModuleCall {
                        module: "math.add".to_string(),
                        alias: None,
                        args: BTreeMap::from([
                            ("a".to_string(), NodeId(1)),
                            ("b".to_string(), NodeId(2)),
                        ]),
                        options: Default::default(),
                    },
                ),
            ],
            vec![("r", 3)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert_eq!(folded_value(&out, 3), Some(Value::Int(5)));
        // Id and type are preserved
        assert_eq!(out.nodes[&NodeId(3)].output_type, SemType::Int);
    }

    #[test]
    fn test_division_by_zero_never_folds() {
        let p = pipeline(
            vec![
                literal(1, Value::Int(1)),
                literal(2, Value::Int(0)),
                node(
                    3,
                    SemType::Int,
                    IROp::ModuleCall {
                        module: "math.div".to_string(),
                        alias: None,
                        args: BTreeMap::from([
                            ("a".to_string(), NodeId(1)),
                            ("b".to_string(), NodeId(2)),
                        ]),
                        options: Default::default(),
                    },
                ),
            ],
            vec![("r", 3)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert!(matches!(out.nodes[&NodeId(3)].op, IROp::ModuleCall { .. }));
    }

    #[test]
    fn test_non_whitelisted_call_never_folds() {
        let p = pipeline(
            vec![
                literal(1, Value::Int(1)),
                node(
                    2,
                    SemType::Int,
                    IROp::ModuleCall {
                        module: "net.fetch".to_string(),
                        alias: None,
                        args: BTreeMap::from([("a".to_string(), NodeId(1))]),
                        options: Default::default(),
                    },
                ),
            ],
            vec![("r", 2)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert!(matches!(out.nodes[&NodeId(2)].op, IROp::ModuleCall { .. }));
    }

    #[test]
    fn test_folds_cascade_through_the_walk() {
        // add(add(1, 2), 4) folds fully in one pass
        let mk_add = |id: u64, a: u64, b: u64| {
            node(
                id,
                SemType::Int,
                IROp::ModuleCall {
                    module: "math.add".to_string(),
                    alias: None,
                    args: BTreeMap::from([
                        ("a".to_string(), NodeId(a)),
                        ("b".to_string(), NodeId(b)),
                    ]),
                    options: Default::default(),
                },
            )
        };
        let p = pipeline(
            vec![
                literal(1, Value::Int(1)),
                literal(2, Value::Int(2)),
                literal(3, Value::Int(4)),
                mk_add(4, 1, 2),
                mk_add(5, 4, 3),
            ],
            vec![("r", 5)],
        );
        let out = ConstantFolding.run(&p).unwrap();
        assert_eq!(folded_value(&out, 5), Some(Value::Int(7)));
    }
}
