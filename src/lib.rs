//! # Constellation Engine
//!
//! A type-checked dataflow orchestration runtime: declarative pipeline
//! programs compile into a typed IR graph, optimize to a fixpoint, lower
//! to an executable DAG, and execute in parallel layers with per-module
//! resilience policies (retry, timeout, fallback, throttle, cache, lazy
//! evaluation, priority).
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Pipeline program (typed expressions)
//!     ↓
//! [IR Builder]            → IRPipeline (arena graph, type-checked)
//!     ↓
//! [Constant Folding]      → pure built-ins evaluated at compile time
//!     ↓
//! [CSE]                   → duplicate subexpressions merged
//!     ↓
//! [DCE]                   → nodes unreachable from outputs dropped
//!     ↓  (repeated to fixpoint)
//! [Lowering]              → DagSpec (bipartite module/data graph)
//!     ↓
//! [Executor]              → layered parallel evaluation + events
//!     ↓
//! Output record
//! ```
//!
//! The compilation cache short-circuits the build/optimize/lower chain
//! when the pipeline source and the module registry are unchanged.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use constellation_engine::{Engine, EngineConfig, PipelineDef};
//!
//! let engine = Engine::new(&EngineConfig::default());
//!
//! let compiled = engine.compile(&def)?;
//! let report = engine.run(&compiled, inputs, Default::default()).await;
//! let outputs = report.outcome?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | Semantic types and the structural type algebra |
//! | `value` | Runtime values and the tagged JSON wire format |
//! | `registry` | Module registration, namespacing, callables |
//! | `builtins` | Pure built-in modules + folding whitelist |
//! | `ir` | Arena IR graph, topological sort/layers, validation |
//! | `ir_builder` | Typed expressions → IRPipeline |
//! | `optimizer` | Pass framework: folding, CSE, DCE to fixpoint |
//! | `dag` | Executable bipartite DAG model |
//! | `lowering` | IRPipeline → DagSpec |
//! | `executor` | Layered parallel execution with resilience policies |
//! | `compile_cache` | Hash-validated LRU cache of compile outputs |
//! | `checkpoint` | Suspended-execution persistence layout |
//! | `engine` | Compiler/Engine facade wiring the handles together |

// Core data model
pub mod types;
pub mod value;

// Module registry and built-ins
pub mod builtins;
pub mod registry;

// Compiler pipeline
pub mod ir;
pub mod ir_builder;
pub mod optimizer;
pub mod dag;
pub mod lowering;

// Runtime
pub mod executor;
pub mod checkpoint;

// Caching and configuration
pub mod compile_cache;
pub mod config;

// Facade
pub mod engine;

// Utilities
mod hash;

// Re-export the main types for convenience
pub use config::{EngineConfig, LoggingConfig, init_tracing};
pub use engine::{CompileFailure, CompileOutput, Compiler, Engine};
pub use executor::{
    CancelToken, EventListener, ExecutionError, ExecutionEvent, ExecutionOptions,
    ExecutionReport, ExecutionState, Executor, ExecutorConfig, InputError, InputErrorKind,
    NodeStatus,
};
pub use checkpoint::ExecutionCheckpoint;
pub use compile_cache::{CacheStats, CompilationCache};
pub use dag::{DagSpec, DataNodeId, ModuleNodeId};
pub use ir::{
    BackoffStrategy, ErrorStrategy, HigherOrderOp, IRError, IRNode, IROp, IRPipeline,
    ModuleCallOptions, NodeId, Span, TypedLambda,
};
pub use ir_builder::{
    CallOptionsExpr, CompileError, CompileErrorKind, ExprKind, IRBuilder, LambdaExpr,
    PipelineDef, TypedExpr,
};
pub use lowering::{lower, LoweringError};
pub use optimizer::{OptimizationPass, OptimizationStats, Optimizer, OptimizerConfig};
pub use registry::{
    Module, ModuleError, ModuleErrorKind, ModuleMetadata, ModuleRegistry, ModuleSchema,
    RegistryError,
};
pub use types::{SemType, TypeError, TypeErrorKind};
pub use value::{Value, WireError};
