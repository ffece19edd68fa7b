//! # IR Optimizer
//!
//! Pass framework and fixpoint driver. Passes are pure functions
//! `IRPipeline -> IRPipeline` applied in a fixed order:
//!
//! ```text
//! IRPipeline -> [constant folding] -> [CSE] -> [DCE] -> ... repeat ... -> IRPipeline
//! ```
//!
//! DCE runs last so the dead outputs of earlier passes are collected in the
//! same sweep. The driver repeats the full sequence until the node-count and
//! node-id set stop changing or `max_iterations` is reached.
//!
//! Passes mutate dataflow only through [`IRPipeline::replace_references`]
//! and [`IRPipeline::filter_nodes`]; nodes themselves are rewritten in
//! place only by folding (which preserves ids).

mod cse;
mod dce;
mod folding;

pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use folding::ConstantFolding;

use crate::ir::{IRError, IRPipeline, NodeId};
use std::collections::BTreeSet;

/// A single optimization pass
pub trait OptimizationPass {
    /// Stable pass name for statistics and tracing
    fn name(&self) -> &'static str;

    /// Produce the optimized pipeline; must preserve observable semantics
    fn run(&self, pipeline: &IRPipeline) -> Result<IRPipeline, IRError>;
}

/// Which passes run, and how hard the driver iterates
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub enable_folding: bool,
    pub enable_cse: bool,
    pub enable_dce: bool,
    /// Full-sequence repetitions before giving up on a fixpoint
    pub max_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            enable_folding: true,
            enable_cse: true,
            enable_dce: true,
            max_iterations: 3,
        }
    }
}

impl OptimizerConfig {
    /// Iterate harder; useful for deeply folded pipelines
    pub fn aggressive() -> Self {
        OptimizerConfig {
            max_iterations: 10,
            ..OptimizerConfig::default()
        }
    }

    /// Disable every pass; the driver returns its input unchanged
    pub fn disabled() -> Self {
        OptimizerConfig {
            enable_folding: false,
            enable_cse: false,
            enable_dce: false,
            max_iterations: 3,
        }
    }
}

/// What an optimization run did
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationStats {
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub eliminated: usize,
    /// Eliminated as a percentage of the input node count
    pub elimination_pct: f64,
    /// Full sequences actually run
    pub iterations: usize,
    /// Names of the passes that ran, in order
    pub passes: Vec<&'static str>,
}

impl OptimizationStats {
    fn unchanged(node_count: usize) -> Self {
        OptimizationStats {
            nodes_before: node_count,
            nodes_after: node_count,
            eliminated: 0,
            elimination_pct: 0.0,
            iterations: 0,
            passes: Vec::new(),
        }
    }
}

/// Fixpoint driver over the configured passes
pub struct Optimizer {
    config: OptimizerConfig,
    passes: Vec<Box<dyn OptimizationPass + Send + Sync>>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let mut passes: Vec<Box<dyn OptimizationPass + Send + Sync>> = Vec::new();
        if config.enable_folding {
            passes.push(Box::new(ConstantFolding));
        }
        if config.enable_cse {
            passes.push(Box::new(CommonSubexpressionElimination));
        }
        if config.enable_dce {
            passes.push(Box::new(DeadCodeElimination));
        }
        Optimizer { config, passes }
    }

    /// Optimize to fixpoint
    pub fn optimize(
        &self,
        pipeline: IRPipeline,
    ) -> Result<(IRPipeline, OptimizationStats), IRError> {
        let nodes_before = pipeline.node_count();
        if self.passes.is_empty() {
            return Ok((pipeline, OptimizationStats::unchanged(nodes_before)));
        }

        let mut current = pipeline;
        let mut iterations = 0;

        for _ in 0..self.config.max_iterations {
            let signature = Self::signature(&current);
            for pass in &self.passes {
                current = pass.run(&current)?;
            }
            iterations += 1;

            if Self::signature(&current) == signature {
                break;
            }
        }

        let nodes_after = current.node_count();
        let eliminated = nodes_before.saturating_sub(nodes_after);
        let stats = OptimizationStats {
            nodes_before,
            nodes_after,
            eliminated,
            elimination_pct: if nodes_before == 0 {
                0.0
            } else {
                eliminated as f64 * 100.0 / nodes_before as f64
            },
            iterations,
            passes: self.passes.iter().map(|p| p.name()).collect(),
        };
        tracing::info!(
            pipeline = %current.name,
            nodes_before,
            nodes_after,
            iterations,
            "optimized"
        );
        Ok((current, stats))
    }

    fn signature(pipeline: &IRPipeline) -> (usize, BTreeSet<NodeId>) {
        (
            pipeline.node_count(),
            pipeline.nodes.keys().copied().collect(),
        )
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::new(OptimizerConfig::default())
    }
}
