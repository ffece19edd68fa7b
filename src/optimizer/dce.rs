//! Dead-code elimination
//!
//! Liveness is the transitive closure of `dependencies()` seeded from the
//! binding of every declared output. Everything else is dropped, including
//! `Input` nodes no output reaches; the pipeline's input list shrinks with
//! them.

use super::OptimizationPass;
use crate::ir::{IRError, IRPipeline, NodeId};
use std::collections::BTreeSet;

pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, pipeline: &IRPipeline) -> Result<IRPipeline, IRError> {
        let mut live: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack: Vec<NodeId> = pipeline
            .outputs
            .iter()
            .filter_map(|name| pipeline.bindings.get(name))
            .copied()
            .collect();

        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            for dep in pipeline.dependencies_of(id) {
                if !pipeline.nodes.contains_key(&dep) {
                    return Err(IRError::MissingNode {
                        node: id,
                        missing: dep,
                    });
                }
                stack.push(dep);
            }
        }

        let mut out = pipeline.filter_nodes(|node| live.contains(&node.id));
        // Bindings for intermediate names whose node died go with it;
        // output bindings are live by construction
        out.bindings.retain(|_, target| live.contains(target));

        if out.node_count() != pipeline.node_count() {
            tracing::debug!(
                pipeline = %pipeline.name,
                removed = pipeline.node_count() - out.node_count(),
                "dce_removed_nodes"
            );
        }
        Ok(out)
    }
}
