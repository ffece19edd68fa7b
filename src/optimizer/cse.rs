//! Common-subexpression elimination
//!
//! Walks nodes in topological order, keyed by a canonical rendering of
//! (operation, payload, dependency ids after substitution through the
//! running rewrite map, output type). The first node with a given key
//! becomes the representative; later duplicates are redirected to it via
//! `replace_references` and dropped.
//!
//! Not candidates:
//! - `Input` nodes (two ports are never the same value source)
//! - `ModuleCall`s with observable effects: a call is deduplicated only
//!   when it is a whitelisted pure built-in or carries a positive
//!   `cache_ms`. Options identity is part of the key, so differently
//!   retried or timed calls stay distinct.

use super::OptimizationPass;
use crate::builtins;
use crate::ir::{IRError, IRNode, IROp, IRPipeline, NodeId};
use std::collections::{BTreeMap, HashMap};

pub struct CommonSubexpressionElimination;

impl CommonSubexpressionElimination {
    fn eligible(node: &IRNode) -> bool {
        match &node.op {
            IROp::Input { .. } => false,
            IROp::ModuleCall {
                module, options, ..
            } => builtins::is_foldable(module) || options.cache_ms.map_or(false, |ttl| ttl > 0),
            _ => true,
        }
    }

    /// Canonical key: operation payload with every reference substituted
    /// through the rewrite map, plus the output type. Deterministic because
    /// all payload maps are ordered.
    fn canonical_key(node: &IRNode, rewrites: &BTreeMap<NodeId, NodeId>) -> String {
        let resolve = |mut id: NodeId| {
            while let Some(next) = rewrites.get(&id) {
                id = *next;
            }
            id
        };
        let mut probe = node.clone();
        probe.map_references(&resolve);
        format!("{}|{:?}|{:?}", node.op_name(), probe.op, node.output_type)
    }
}

impl OptimizationPass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn run(&self, pipeline: &IRPipeline) -> Result<IRPipeline, IRError> {
        let order = pipeline.topological_order()?;
        let mut representatives: HashMap<String, NodeId> = HashMap::new();
        let mut rewrites: BTreeMap<NodeId, NodeId> = BTreeMap::new();

        for id in order {
            let node = &pipeline.nodes[&id];
            if !Self::eligible(node) {
                continue;
            }
            let key = Self::canonical_key(node, &rewrites);
            match representatives.get(&key) {
                Some(rep) => {
                    rewrites.insert(id, *rep);
                }
                None => {
                    representatives.insert(key, id);
                }
            }
        }

        if rewrites.is_empty() {
            return Ok(pipeline.clone());
        }

        let redirected = pipeline.replace_references(&rewrites);
        let out = redirected.filter_nodes(|node| !rewrites.contains_key(&node.id));
        tracing::debug!(
            pipeline = %pipeline.name,
            merged = rewrites.len(),
            "cse_merged_nodes"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::register_builtins;
    use crate::ir_builder::{CallOptionsExpr, ExprKind, IRBuilder, PipelineDef, TypedExpr};
    use crate::registry::ModuleRegistry;
    use crate::types::SemType;
    use crate::value::Value;

    fn build(bindings: Vec<(&str, TypedExpr)>, outputs: Vec<&str>) -> IRPipeline {
        let registry = ModuleRegistry::new();
        register_builtins(&registry).expect("builtins register");
        let def = PipelineDef {
            name: "cse_test".to_string(),
            bindings: bindings
                .into_iter()
                .map(|(n, e)| (n.to_string(), e))
                .collect(),
            outputs: outputs.into_iter().map(ToString::to_string).collect(),
        };
        IRBuilder::new(&registry).build(&def).expect("builds")
    }

    fn input(name: &str) -> TypedExpr {
        TypedExpr::new(ExprKind::Input {
            name: name.to_string(),
            ty: SemType::String,
        })
    }

    fn upper(arg: TypedExpr) -> TypedExpr {
        TypedExpr::new(ExprKind::Call {
            module: "upper".to_string(),
            alias: None,
            args: vec![("value".to_string(), arg)],
            options: CallOptionsExpr::default(),
        })
    }

    fn count_calls(p: &IRPipeline, module: &str) -> usize {
        p.nodes
            .values()
            .filter(|n| matches!(&n.op, IROp::ModuleCall { module: m, .. } if m == module))
            .count()
    }

    #[test]
    fn test_duplicate_pure_calls_merge() {
        // a = upper(x); b = upper(x) -> a single call feeds both bindings
        let p = build(
            vec![("a", upper(input("x"))), ("b", upper(input("x")))],
            vec!["a", "b"],
        );
        assert_eq!(count_calls(&p, "str.upper"), 2);

        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(count_calls(&out, "str.upper"), 1);
        assert_eq!(out.bindings["a"], out.bindings["b"]);
        out.validate().unwrap();
    }

    #[test]
    fn test_inputs_never_merge() {
        let p = build(
            vec![("a", input("x")), ("b", input("y"))],
            vec!["a", "b"],
        );
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(out.inputs.len(), 2);
    }

    #[test]
    fn test_effectful_calls_do_not_merge() {
        // A module that is neither pure nor cached must stay duplicated
        let registry = ModuleRegistry::new();
        register_builtins(&registry).expect("builtins register");
        let fetch = crate::registry::Module::new(
            crate::registry::ModuleMetadata {
                name: "net.fetch".to_string(),
                description: String::new(),
                version: "1.0.0".to_string(),
            },
            [("url".to_string(), SemType::String)].into_iter().collect(),
            [("body".to_string(), SemType::String)].into_iter().collect(),
            std::sync::Arc::new(|input| Box::pin(async move { Ok(input) })),
        );
        registry.register("net.fetch", fetch).unwrap();

        let call = |opts: CallOptionsExpr| {
            TypedExpr::new(ExprKind::Call {
                module: "net.fetch".to_string(),
                alias: None,
                args: vec![("url".to_string(), input("x"))],
                options: opts,
            })
        };
        let def = PipelineDef {
            name: "cse_test".to_string(),
            bindings: vec![
                ("a".to_string(), call(CallOptionsExpr::default())),
                ("b".to_string(), call(CallOptionsExpr::default())),
            ],
            outputs: vec!["a".to_string(), "b".to_string()],
        };
        let p = IRBuilder::new(&registry).build(&def).unwrap();
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(count_calls(&out, "net.fetch"), 2);

        // With a cache policy the same call becomes a candidate
        let cached = CallOptionsExpr {
            cache_ms: Some(60_000),
            ..CallOptionsExpr::default()
        };
        let def = PipelineDef {
            name: "cse_test".to_string(),
            bindings: vec![
                ("a".to_string(), call(cached.clone())),
                ("b".to_string(), call(cached)),
            ],
            outputs: vec!["a".to_string(), "b".to_string()],
        };
        let p = IRBuilder::new(&registry).build(&def).unwrap();
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(count_calls(&out, "net.fetch"), 1);
    }

    #[test]
    fn test_options_identity_keeps_calls_distinct() {
        let with_retry = CallOptionsExpr {
            cache_ms: Some(60_000),
            retry: Some(3),
            ..CallOptionsExpr::default()
        };
        let without_retry = CallOptionsExpr {
            cache_ms: Some(60_000),
            ..CallOptionsExpr::default()
        };
        let mk = |opts: CallOptionsExpr| {
            TypedExpr::new(ExprKind::Call {
                module: "upper".to_string(),
                alias: None,
                args: vec![("value".to_string(), input("x"))],
                options: opts,
            })
        };
        let p = build(
            vec![("a", mk(with_retry)), ("b", mk(without_retry))],
            vec!["a", "b"],
        );
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(count_calls(&out, "str.upper"), 2);
    }

    #[test]
    fn test_substitution_cascades_through_consumers() {
        // concat(upper(x), upper(x)) twice: inner calls merge first, making
        // the outer calls identical in the same walk
        let outer = |a: TypedExpr, b: TypedExpr| {
            TypedExpr::new(ExprKind::Call {
                module: "concat".to_string(),
                alias: None,
                args: vec![("a".to_string(), a), ("b".to_string(), b)],
                options: CallOptionsExpr::default(),
            })
        };
        let p = build(
            vec![
                ("a", outer(upper(input("x")), upper(input("x")))),
                ("b", outer(upper(input("x")), upper(input("x")))),
            ],
            vec!["a", "b"],
        );
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(count_calls(&out, "str.upper"), 1);
        assert_eq!(count_calls(&out, "str.concat"), 1);
        out.validate().unwrap();
    }

    #[test]
    fn test_distinct_literals_do_not_merge() {
        let p = build(
            vec![
                ("a", TypedExpr::new(ExprKind::Literal { value: Value::Int(1) })),
                ("b", TypedExpr::new(ExprKind::Literal { value: Value::Int(2) })),
            ],
            vec!["a", "b"],
        );
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(out.node_count(), 2);
    }

    #[test]
    fn test_identical_literals_merge() {
        let p = build(
            vec![
                ("a", TypedExpr::new(ExprKind::Literal { value: Value::Int(7) })),
                ("b", TypedExpr::new(ExprKind::Literal { value: Value::Int(7) })),
            ],
            vec!["a", "b"],
        );
        let out = CommonSubexpressionElimination.run(&p).unwrap();
        assert_eq!(out.node_count(), 1);
        assert_eq!(out.bindings["a"], out.bindings["b"]);
    }
}
