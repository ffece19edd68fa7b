//! Engine facade
//!
//! Ties the process-wide handles together: module registry, compilation
//! cache, value-cache backends, optimizer, and executor. Subsystems
//! receive these as explicit handles; nothing imports a global.
//!
//! ```text
//! PipelineDef -> [Compiler] -> CompileOutput -+-> [Executor] -> outputs
//!                     ^                       |
//!              CompilationCache  <------------+  (short-circuits
//!                                                 build/optimize/lower)
//! ```

use crate::compile_cache::{CacheStats, CompilationCache};
use crate::config::EngineConfig;
use crate::dag::DagSpec;
use crate::executor::{
    CacheBackends, ExecutionOptions, ExecutionReport, Executor, ExecutorConfig,
};
use crate::ir::IRError;
use crate::ir_builder::{CompileError, IRBuilder, PipelineDef};
use crate::lowering::{lower, LoweringError};
use crate::optimizer::{OptimizationStats, Optimizer, OptimizerConfig};
use crate::registry::{Module, ModuleRegistry, RegistryError};
use crate::types::SemType;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a successful compilation produces
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub dag: Arc<DagSpec>,
    /// Public input name -> declared type
    pub input_schema: BTreeMap<String, SemType>,
    /// Declared output name -> type
    pub output_schema: BTreeMap<String, SemType>,
    pub source_hash: String,
    pub registry_hash: String,
    pub optimization: OptimizationStats,
}

/// Why a compilation failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileFailure {
    /// User-facing diagnostics from the IR builder
    #[error("compilation failed with {} error(s)", .0.len())]
    Diagnostics(Vec<CompileError>),

    /// An optimizer pass or validation broke an invariant; a bug, not a
    /// user error
    #[error(transparent)]
    Optimization(#[from] IRError),

    #[error(transparent)]
    Lowering(#[from] LoweringError),
}

impl From<Vec<CompileError>> for CompileFailure {
    fn from(errors: Vec<CompileError>) -> Self {
        CompileFailure::Diagnostics(errors)
    }
}

/// Build -> validate -> optimize -> validate -> lower, with the
/// compilation cache short-circuiting the whole chain
pub struct Compiler {
    registry: Arc<ModuleRegistry>,
    cache: Arc<CompilationCache<Arc<CompileOutput>>>,
    optimizer: Optimizer,
}

impl Compiler {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        cache: Arc<CompilationCache<Arc<CompileOutput>>>,
        optimizer_config: OptimizerConfig,
    ) -> Self {
        Compiler {
            registry,
            cache,
            optimizer: Optimizer::new(optimizer_config),
        }
    }

    pub fn compile(&self, def: &PipelineDef) -> Result<Arc<CompileOutput>, CompileFailure> {
        let source_hash = def.source_hash();
        let registry_hash = self.registry.registry_hash();

        if let Some(hit) = self.cache.get(&def.name, &source_hash, &registry_hash) {
            tracing::debug!(pipeline = %def.name, "compile_cache_hit");
            return Ok(hit);
        }

        let pipeline = IRBuilder::new(&self.registry).build(def)?;
        pipeline.validate()?;

        let (optimized, stats) = self.optimizer.optimize(pipeline)?;
        // Invariants must hold after every transformation
        optimized.validate()?;

        let dag = lower(&optimized, &self.registry)?;
        dag.validate().map_err(LoweringError::from)?;

        let output = Arc::new(CompileOutput {
            input_schema: dag.input_schema(),
            output_schema: dag.output_schema(),
            dag: Arc::new(dag),
            source_hash: source_hash.clone(),
            registry_hash: registry_hash.clone(),
            optimization: stats,
        });
        self.cache
            .put(&def.name, &source_hash, &registry_hash, Arc::clone(&output));
        tracing::info!(
            pipeline = %def.name,
            modules = output.dag.modules.len(),
            eliminated = output.optimization.eliminated,
            "compiled"
        );
        Ok(output)
    }
}

/// The top-level runtime: compile pipelines, run them, introspect caches
pub struct Engine {
    registry: Arc<ModuleRegistry>,
    compile_cache: Arc<CompilationCache<Arc<CompileOutput>>>,
    backends: Arc<CacheBackends>,
    compiler: Compiler,
    executor: Executor,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let registry = Arc::new(ModuleRegistry::new());
        Self::with_registry(config, registry)
    }

    /// Build over an existing registry (e.g. one pre-loaded by a provider
    /// bridge). Built-ins are registered if absent.
    pub fn with_registry(config: &EngineConfig, registry: Arc<ModuleRegistry>) -> Self {
        if registry.get("math.add").is_none() {
            // Ignore collisions: a partial builtin set means the caller
            // installed their own variants
            let _ = crate::builtins::register_builtins(&registry);
        }

        let compile_cache = Arc::new(CompilationCache::new(
            config.compile_cache.max_entries,
            config.compile_cache.max_age(),
        ));
        let backends = Arc::new(CacheBackends::new());
        let compiler = Compiler::new(
            Arc::clone(&registry),
            Arc::clone(&compile_cache),
            OptimizerConfig::from(&config.optimizer),
        );
        let executor = Executor::new(
            Arc::clone(&registry),
            Arc::clone(&backends),
            ExecutorConfig::from(&config.executor),
        );

        Engine {
            registry,
            compile_cache,
            backends,
            compiler,
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn register_module(&self, name: &str, module: Module) -> Result<(), RegistryError> {
        self.registry.register(name, module)
    }

    /// Value-cache backend registry (the `cache_backend` selector space)
    pub fn cache_backends(&self) -> &Arc<CacheBackends> {
        &self.backends
    }

    pub fn compile(&self, def: &PipelineDef) -> Result<Arc<CompileOutput>, CompileFailure> {
        self.compiler.compile(def)
    }

    pub async fn run(
        &self,
        compiled: &CompileOutput,
        inputs: BTreeMap<String, Value>,
        options: ExecutionOptions,
    ) -> ExecutionReport {
        self.executor
            .execute(Arc::clone(&compiled.dag), inputs, options)
            .await
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    // Cache introspection

    pub fn cache_stats(&self) -> CacheStats {
        self.compile_cache.stats()
    }

    pub fn invalidate(&self, name: &str) {
        self.compile_cache.invalidate(name);
    }

    pub fn invalidate_all(&self) {
        self.compile_cache.invalidate_all();
    }
}
