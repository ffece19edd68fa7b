//! # DAG Executor
//!
//! Layered parallel evaluation of a [`DagSpec`] with per-module resilience
//! policies.
//!
//! ## Scheduling model
//!
//! Topological layers are computed once; each layer fans its runnable
//! module nodes out as concurrent tasks on the shared worker pool and is
//! awaited before the next layer starts. Within a layer, the runnable set
//! is ordered by (priority desc, depth asc, id asc) before worker permits
//! are acquired, so priority decides who runs first when nodes outnumber
//! workers; it never reorders dependency constraints.
//!
//! Each module node fires at most once per execution: a per-node
//! `OnceCell` is both the single-producer guarantee and the memo for
//! lazy/demand-driven firing (lazy nodes skip their layer and fire on the
//! first downstream demand, including the output-collection demand).
//!
//! ## Firing procedure
//!
//! gather inputs -> result cache -> throttle token + concurrency permit
//! (held across retries and fallback) -> retry loop with backoff and
//! per-attempt deadline -> fallback subgraph -> `on_error` strategy.
//!
//! Cancellation is cooperative: every scheduling decision and every
//! backoff sleep checks the shared token; a top-level deadline trips the
//! same path.

mod cancel;
mod eval;
mod events;
mod policy;
mod state;
mod value_cache;

pub use cancel::CancelToken;
pub use events::{EventListener, EventSink, ExecutionEvent};
pub use policy::{backoff_delay, LimiterMap, ModuleLimiter, MAX_BACKOFF};
pub use state::{DataEntry, ExecutionState, NodeStatus};
pub use value_cache::{cache_key, CacheBackends, InMemoryValueCache, ValueCacheBackend};

use crate::checkpoint::ExecutionCheckpoint;
use crate::dag::{DagOpKind, DagSpec, DataNodeId, ModuleNodeId, ModuleNodeSpec};
use crate::ir::ErrorStrategy;
use crate::registry::{ModuleError, ModuleErrorKind, ModuleRegistry};
use crate::types::SemType;
use crate::value::Value;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use uuid::Uuid;

// ============================================================================
// Errors and configuration
// ============================================================================

/// Input-record validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputErrorKind {
    Missing,
    TypeMismatch,
    /// An input name the pipeline does not declare
    Unexpected,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("input '{name}': {kind:?}")]
pub struct InputError {
    pub kind: InputErrorKind,
    pub name: String,
}

/// Terminal execution failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("input validation failed ({})", .0.len())]
    InvalidInput(Vec<InputError>),

    #[error("module '{module}' failed: {error}")]
    Module {
        module: String,
        error: ModuleError,
    },

    #[error("module '{module}' is missing a required input")]
    MissingInput { module: String },

    #[error("declared output '{name}' was never produced")]
    MissingOutput { name: String },

    #[error("execution cancelled")]
    Cancelled,
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Max concurrently firing module nodes
    pub worker_threads: usize,
    /// Priority assumed when a call site sets none
    pub default_priority: u8,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            worker_threads: num_cpus::get().max(2),
            default_priority: 50,
        }
    }
}

/// Per-run options
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    pub listeners: Vec<EventListener>,
    /// External cancellation; the run creates its own token when absent
    pub cancel: Option<CancelToken>,
    /// Top-level deadline; expiry takes the cancellation path
    pub deadline: Option<Duration>,
}

/// Everything a finished run reports
#[derive(Debug)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub outcome: Result<BTreeMap<String, Value>, ExecutionError>,
    pub state: ExecutionState,
    pub duration: Duration,
}

// ============================================================================
// Executor
// ============================================================================

/// Shared executor: worker pool, per-module limiters, cache backends
pub struct Executor {
    registry: Arc<ModuleRegistry>,
    backends: Arc<CacheBackends>,
    limiters: Arc<LimiterMap>,
    workers: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        backends: Arc<CacheBackends>,
        config: ExecutorConfig,
    ) -> Self {
        Executor {
            workers: Arc::new(Semaphore::new(config.worker_threads.max(1))),
            limiters: Arc::new(LimiterMap::new()),
            registry,
            backends,
            config,
        }
    }

    /// Run a DAG with the given input record
    pub async fn execute(
        &self,
        dag: Arc<DagSpec>,
        inputs: BTreeMap<String, Value>,
        options: ExecutionOptions,
    ) -> ExecutionReport {
        self.run(dag, inputs, options, None).await
    }

    /// Reconstitute a suspended execution and continue scheduling
    pub async fn resume(
        &self,
        dag: Arc<DagSpec>,
        checkpoint: &ExecutionCheckpoint,
        options: ExecutionOptions,
    ) -> ExecutionReport {
        self.run(
            dag,
            checkpoint.inputs.clone(),
            options,
            Some(checkpoint.completed()),
        )
        .await
    }

    /// Capture a suspended execution's progress for persistence
    pub fn checkpoint(
        execution_id: Uuid,
        pipeline_name: &str,
        state: &ExecutionState,
        suspended_at: ModuleNodeId,
        resume_condition: Option<String>,
        inputs: BTreeMap<String, Value>,
    ) -> ExecutionCheckpoint {
        ExecutionCheckpoint::capture(
            execution_id,
            pipeline_name,
            state,
            suspended_at,
            resume_condition,
            inputs,
        )
    }

    fn validate_inputs(
        dag: &DagSpec,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<(), Vec<InputError>> {
        let schema = dag.input_schema();
        let mut errors = Vec::new();

        for (name, ty) in &schema {
            match inputs.get(name) {
                None => errors.push(InputError {
                    kind: InputErrorKind::Missing,
                    name: name.clone(),
                }),
                Some(value) if !value.matches_type(ty) => errors.push(InputError {
                    kind: InputErrorKind::TypeMismatch,
                    name: name.clone(),
                }),
                Some(_) => {}
            }
        }
        for name in inputs.keys() {
            if !schema.contains_key(name) {
                errors.push(InputError {
                    kind: InputErrorKind::Unexpected,
                    name: name.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn run(
        &self,
        dag: Arc<DagSpec>,
        inputs: BTreeMap<String, Value>,
        options: ExecutionOptions,
        resume_data: Option<BTreeMap<DataNodeId, Value>>,
    ) -> ExecutionReport {
        let execution_id = Uuid::new_v4();
        let started = Instant::now();

        if let Err(errors) = Self::validate_inputs(&dag, &inputs) {
            return ExecutionReport {
                execution_id,
                outcome: Err(ExecutionError::InvalidInput(errors)),
                state: ExecutionState::for_dag(&dag),
                duration: started.elapsed(),
            };
        }

        // Seed state: literals (via for_dag), caller inputs, resume data
        let mut state = ExecutionState::for_dag(&dag);
        for spec in dag.data.values() {
            if let Some(name) = &spec.input_name {
                if let Some(value) = inputs.get(name) {
                    state.set_value(spec.id, value.clone(), NodeStatus::Fired { duration_ms: 0 });
                }
            }
        }
        if let Some(resumed) = &resume_data {
            for (id, value) in resumed {
                state.set_value(*id, value.clone(), NodeStatus::Fired { duration_ms: 0 });
            }
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        let events = EventSink::new(options.listeners.clone());

        // Per-node single-fire cells; modules whose outputs were restored
        // from a checkpoint are pre-completed
        let mut cells: BTreeMap<ModuleNodeId, OnceCell<Result<(), ExecutionError>>> =
            BTreeMap::new();
        for (id, _) in &dag.modules {
            let restored = resume_data.is_some()
                && !dag.outputs_of(*id).is_empty()
                && dag
                    .outputs_of(*id)
                    .iter()
                    .all(|data| state.value_of(*data).is_some());
            if restored {
                state.set_module_status(*id, NodeStatus::Fired { duration_ms: 0 });
                cells.insert(*id, OnceCell::new_with(Some(Ok(()))));
            } else {
                cells.insert(*id, OnceCell::new());
            }
        }

        let ctx = Arc::new(ExecContext {
            dag: Arc::clone(&dag),
            registry: Arc::clone(&self.registry),
            backends: Arc::clone(&self.backends),
            limiters: Arc::clone(&self.limiters),
            workers: Arc::clone(&self.workers),
            state: Mutex::new(state),
            cells,
            cancel: cancel.clone(),
            events: events.clone(),
            default_priority: self.config.default_priority,
        });

        events.emit(&ExecutionEvent::ExecutionStart {
            execution_id,
            dag_name: dag.metadata.name.clone(),
        });
        tracing::info!(
            execution = %execution_id,
            pipeline = %dag.metadata.name,
            modules = dag.modules.len(),
            "execution_start"
        );

        // Deadline watchdog trips the cancellation path
        let watchdog = options.deadline.map(|deadline| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            })
        });

        let outcome = self.drive(&ctx).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // Whatever never ran is skipped
        {
            let mut state = ctx.state.lock();
            let pending: Vec<ModuleNodeId> = state
                .module_status
                .iter()
                .filter(|(_, status)| !status.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in pending {
                state.set_module_status(id, NodeStatus::Skipped);
            }
            let pending_data: Vec<DataNodeId> = state
                .data
                .iter()
                .filter(|(_, entry)| !entry.status.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in pending_data {
                state.set_data_status(id, NodeStatus::Skipped);
            }
        }

        let duration = started.elapsed();
        let cancelled = matches!(outcome, Err(ExecutionError::Cancelled));
        if cancelled {
            events.emit(&ExecutionEvent::ExecutionCancelled { execution_id });
        } else {
            events.emit(&ExecutionEvent::ExecutionComplete {
                execution_id,
                succeeded: outcome.is_ok(),
                duration_ms: duration.as_millis() as u64,
            });
        }
        tracing::info!(
            execution = %execution_id,
            succeeded = outcome.is_ok(),
            duration_ms = duration.as_millis() as u64,
            "execution_finished"
        );

        let state = ctx.state.lock().clone();
        ExecutionReport {
            execution_id,
            outcome,
            state,
            duration,
        }
    }

    /// Layered push scheduling, then demand-driven output collection
    async fn drive(
        &self,
        ctx: &Arc<ExecContext>,
    ) -> Result<BTreeMap<String, Value>, ExecutionError> {
        let layers = ctx
            .dag
            .module_layers()
            .expect("validated DagSpec is acyclic");
        let depths = ctx
            .dag
            .module_depths()
            .expect("validated DagSpec is acyclic");

        let mut first_error: Option<ExecutionError> = None;

        'layers: for layer in layers {
            if ctx.cancel.is_cancelled() || first_error.is_some() {
                break 'layers;
            }

            let mut runnable: Vec<ModuleNodeId> = layer
                .into_iter()
                .filter(|id| !ctx.dag.modules[id].lazy)
                .collect();
            // Priority desc, then shallower first, then id
            runnable.sort_by_key(|id| {
                let spec = &ctx.dag.modules[id];
                let priority = spec.options.priority.unwrap_or(ctx.default_priority);
                (std::cmp::Reverse(priority), depths[id], *id)
            });

            // Permits are granted here, in priority order, so priority
            // decides who starts first when nodes outnumber workers
            let mut handles = Vec::with_capacity(runnable.len());
            for id in runnable {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let permit = Arc::clone(&ctx.workers)
                    .acquire_owned()
                    .await
                    .expect("worker semaphore never closes");
                let ctx = Arc::clone(ctx);
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    fire(ctx, id).await
                }));
            }

            for result in join_all(handles).await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(join_error) => {
                        // A panicking module task is an invariant violation
                        std::panic::panic_any(join_error.to_string());
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if ctx.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        // Collect outputs; demanding fires any lazy tail
        let mut outputs = BTreeMap::new();
        for name in &ctx.dag.outputs {
            let data = ctx.dag.output_bindings.get(name).copied().ok_or_else(|| {
                ExecutionError::MissingOutput { name: name.clone() }
            })?;
            match demand(Arc::clone(ctx), data).await? {
                Some(value) => {
                    outputs.insert(name.clone(), value);
                }
                None => {
                    if ctx.cancel.is_cancelled() {
                        return Err(ExecutionError::Cancelled);
                    }
                    return Err(ExecutionError::MissingOutput { name: name.clone() });
                }
            }
        }
        Ok(outputs)
    }
}

// ============================================================================
// Execution context and firing
// ============================================================================

struct ExecContext {
    dag: Arc<DagSpec>,
    registry: Arc<ModuleRegistry>,
    backends: Arc<CacheBackends>,
    limiters: Arc<LimiterMap>,
    workers: Arc<Semaphore>,
    state: Mutex<ExecutionState>,
    cells: BTreeMap<ModuleNodeId, OnceCell<Result<(), ExecutionError>>>,
    cancel: CancelToken,
    events: EventSink,
    default_priority: u8,
}

/// Single-producer-per-node entry point; the OnceCell memoizes the outcome
/// for demand-driven (lazy, fallback) firing
fn fire(ctx: Arc<ExecContext>, id: ModuleNodeId) -> BoxFuture<'static, Result<(), ExecutionError>> {
    async move {
        let cell = &ctx.cells[&id];
        cell.get_or_init(|| fire_inner(Arc::clone(&ctx), id))
            .await
            .clone()
    }
    .boxed()
}

/// Read a data node's value, firing its producer on demand if needed
async fn demand(
    ctx: Arc<ExecContext>,
    data: DataNodeId,
) -> Result<Option<Value>, ExecutionError> {
    if let Some(value) = ctx.state.lock().value_of(data).cloned() {
        return Ok(Some(value));
    }
    let Some(producer) = ctx.dag.producer_of(data) else {
        return Ok(None);
    };
    {
        let state = ctx.state.lock();
        if let Some(status) = state.module_status_of(producer) {
            if status.is_terminal() {
                return Ok(state.value_of(data).cloned());
            }
        }
    }
    fire(Arc::clone(&ctx), producer).await?;
    Ok(ctx.state.lock().value_of(data).cloned())
}

async fn fire_inner(ctx: Arc<ExecContext>, id: ModuleNodeId) -> Result<(), ExecutionError> {
    let spec = &ctx.dag.modules[&id];

    if ctx.cancel.is_cancelled() {
        ctx.state.lock().set_module_status(id, NodeStatus::Skipped);
        return Ok(());
    }

    // 1. Gather inputs, demanding lazy producers
    let mut params: BTreeMap<String, Option<Value>> =
        spec.consumes.keys().map(|p| (p.clone(), None)).collect();
    for data in ctx.dag.inputs_of(id) {
        let value = demand(Arc::clone(&ctx), data).await?;
        if let Some(labels) = ctx
            .dag
            .data
            .get(&data)
            .and_then(|d| d.consumers.get(&id))
        {
            for label in labels {
                params.insert(label.clone(), value.clone());
            }
        }
    }

    let missing_inputs = params.values().any(Option::is_none);
    if missing_inputs && !tolerates_missing(spec) {
        return handle_missing_input(&ctx, id, spec);
    }

    ctx.state.lock().set_module_status(id, NodeStatus::Running);
    ctx.events.emit(&ExecutionEvent::ModuleStart {
        module: id,
        name: spec.name.clone(),
    });
    let started = Instant::now();

    // The concurrency permit (when any) is held until this function
    // returns, covering retries and the fallback evaluation
    let (result, _permit_guard) = match &spec.op {
        DagOpKind::Structural(op) => {
            let output_type = spec
                .produces
                .values()
                .next()
                .cloned()
                .unwrap_or(SemType::Unit);
            (
                eval::eval_structural(op, &params, &output_type, &ctx.registry).await,
                None,
            )
        }
        DagOpKind::Registered { module } => fire_registered(&ctx, spec, module, &params).await,
    };

    match result {
        Ok(value) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            store_result(&ctx, id, spec, value, duration_ms);
            ctx.events.emit(&ExecutionEvent::ModuleComplete {
                module: id,
                name: spec.name.clone(),
                duration_ms,
            });
            Ok(())
        }
        Err(error) => {
            if ctx.cancel.is_cancelled() && error.kind == ModuleErrorKind::Cancelled {
                ctx.state.lock().set_module_status(id, NodeStatus::Skipped);
                ctx.events.emit(&ExecutionEvent::ModuleFailed {
                    module: id,
                    name: spec.name.clone(),
                    error: error.to_string(),
                });
                return Ok(());
            }
            // 5. All retries exhausted: fallback, then on_error
            if let Some(fallback_data) = spec.fallback {
                if let Some(value) = demand(Arc::clone(&ctx), fallback_data).await? {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(module = %spec.name, "fallback_salvaged_failure");
                    store_result(&ctx, id, spec, value, duration_ms);
                    ctx.events.emit(&ExecutionEvent::ModuleComplete {
                        module: id,
                        name: spec.name.clone(),
                        duration_ms,
                    });
                    return Ok(());
                }
            }
            handle_failure(&ctx, id, spec, error)
        }
    }
}

/// Steps 2-4 of the firing procedure for a registry-backed module
///
/// Returns the concurrency permit alongside the outcome so the caller can
/// keep it held through fallback evaluation.
async fn fire_registered(
    ctx: &Arc<ExecContext>,
    spec: &ModuleNodeSpec,
    module_name: &str,
    params: &BTreeMap<String, Option<Value>>,
) -> (
    Result<Value, ModuleError>,
    Option<tokio::sync::OwnedSemaphorePermit>,
) {
    let Some(module) = ctx.registry.get(module_name) else {
        return (
            Err(ModuleError::new(
                ModuleErrorKind::NotFound,
                format!("module '{module_name}' is not registered"),
            )),
            None,
        );
    };

    let input_record = Value::Record(
        params
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    value.clone().unwrap_or(Value::Unit),
                )
            })
            .collect(),
    );

    // 2. Result cache
    let ttl = spec.options.cache_ms.filter(|ms| *ms > 0);
    let backend = ttl.map(|_| ctx.backends.resolve(spec.options.cache_backend.as_deref()));
    let key = ttl.map(|_| cache_key(module_name, &input_record));
    if let (Some(backend), Some(key)) = (&backend, &key) {
        if let Some(hit) = backend.get(key) {
            tracing::debug!(module = %spec.name, "module_cache_hit");
            return (Ok(hit), None);
        }
    }

    // 3. Throttle token before the first attempt; concurrency permit held
    // across every attempt and the fallback
    let limiter = ctx.limiters.limiter_for(module_name, &spec.options);
    if !limiter.acquire_token(&ctx.cancel).await {
        return (
            Err(ModuleError::new(
                ModuleErrorKind::Cancelled,
                "cancelled while throttled".to_string(),
            )),
            None,
        );
    }
    let permit = limiter.acquire_permit().await;

    // 4. Attempts
    let retries = spec.options.retry.unwrap_or(0);
    let backoff = spec.options.backoff.unwrap_or_default();
    let mut last_error = ModuleError::runtime("module produced no attempts".to_string());

    for attempt in 0..=retries {
        if let Some(delay_ms) = spec.options.delay_ms.filter(|ms| *ms > 0) {
            let wait = backoff_delay(delay_ms, backoff, attempt);
            if !ctx.cancel.sleep(wait).await {
                return (
                    Err(ModuleError::new(
                        ModuleErrorKind::Cancelled,
                        "cancelled during backoff".to_string(),
                    )),
                    permit,
                );
            }
        }
        if ctx.cancel.is_cancelled() {
            return (
                Err(ModuleError::new(
                    ModuleErrorKind::Cancelled,
                    "cancelled before attempt".to_string(),
                )),
                permit,
            );
        }

        let invocation = module.invoke(input_record.clone());
        let outcome = match spec.options.timeout_ms {
            Some(timeout_ms) => {
                tokio::select! {
                    result = tokio::time::timeout(Duration::from_millis(timeout_ms), invocation) => {
                        result.unwrap_or_else(|_| {
                            Err(ModuleError::new(
                                ModuleErrorKind::Timeout,
                                format!("attempt exceeded {timeout_ms} ms"),
                            ))
                        })
                    }
                    () = ctx.cancel.cancelled() => Err(ModuleError::new(
                        ModuleErrorKind::Cancelled,
                        "cancelled in flight".to_string(),
                    )),
                }
            }
            None => {
                tokio::select! {
                    result = invocation => result,
                    () = ctx.cancel.cancelled() => Err(ModuleError::new(
                        ModuleErrorKind::Cancelled,
                        "cancelled in flight".to_string(),
                    )),
                }
            }
        };

        match outcome {
            Ok(value) => {
                if let (Some(backend), Some(key), Some(ttl)) = (&backend, &key, ttl) {
                    backend.put(key.clone(), value.clone(), Duration::from_millis(ttl));
                }
                return (Ok(value), permit);
            }
            Err(error) => {
                if error.kind == ModuleErrorKind::Cancelled {
                    return (Err(error), permit);
                }
                tracing::debug!(
                    module = %spec.name,
                    attempt,
                    error = %error,
                    "module_attempt_failed"
                );
                last_error = error;
            }
        }
    }
    (Err(last_error), permit)
}

/// Short-circuit ops produce a result from the left operand alone
fn tolerates_missing(spec: &ModuleNodeSpec) -> bool {
    use crate::dag::StructuralOp;
    matches!(
        spec.op,
        DagOpKind::Structural(
            StructuralOp::And | StructuralOp::Or | StructuralOp::Coalesce
        )
    )
}

fn handle_missing_input(
    ctx: &Arc<ExecContext>,
    id: ModuleNodeId,
    spec: &ModuleNodeSpec,
) -> Result<(), ExecutionError> {
    let strategy = spec.options.on_error.unwrap_or_default();
    match strategy {
        ErrorStrategy::Propagate => {
            ctx.state.lock().set_module_status(
                id,
                NodeStatus::Failed {
                    error: "missing input".to_string(),
                },
            );
            Err(ExecutionError::MissingInput {
                module: spec.name.clone(),
            })
        }
        ErrorStrategy::Skip | ErrorStrategy::Log => {
            if strategy == ErrorStrategy::Log {
                tracing::warn!(module = %spec.name, "module_skipped_missing_input");
            }
            ctx.state.lock().set_module_status(id, NodeStatus::Skipped);
            Ok(())
        }
        ErrorStrategy::Wrap => {
            match sentinel_for(spec, "missing input") {
                Some(value) => {
                    store_result(ctx, id, spec, value, 0);
                    Ok(())
                }
                None => {
                    ctx.state.lock().set_module_status(
                        id,
                        NodeStatus::Failed {
                            error: "missing input".to_string(),
                        },
                    );
                    Err(ExecutionError::MissingInput {
                        module: spec.name.clone(),
                    })
                }
            }
        }
    }
}

/// Apply `on_error` after retries and fallback are exhausted
fn handle_failure(
    ctx: &Arc<ExecContext>,
    id: ModuleNodeId,
    spec: &ModuleNodeSpec,
    error: ModuleError,
) -> Result<(), ExecutionError> {
    ctx.state.lock().set_module_status(
        id,
        NodeStatus::Failed {
            error: error.to_string(),
        },
    );

    let strategy = spec.options.on_error.unwrap_or_default();
    match strategy {
        ErrorStrategy::Propagate => {
            ctx.events.emit(&ExecutionEvent::ModuleFailed {
                module: id,
                name: spec.name.clone(),
                error: error.to_string(),
            });
            // Stop in-flight siblings promptly
            ctx.cancel.cancel();
            Err(ExecutionError::Module {
                module: spec.name.clone(),
                error,
            })
        }
        ErrorStrategy::Skip | ErrorStrategy::Log => {
            if strategy == ErrorStrategy::Log {
                tracing::warn!(module = %spec.name, error = %error, "module_failed_continuing");
            }
            ctx.events.emit(&ExecutionEvent::ModuleFailed {
                module: id,
                name: spec.name.clone(),
                error: error.to_string(),
            });
            Ok(())
        }
        ErrorStrategy::Wrap => match sentinel_for(spec, &error.message) {
            Some(value) => {
                store_result(ctx, id, spec, value, 0);
                ctx.events.emit(&ExecutionEvent::ModuleComplete {
                    module: id,
                    name: spec.name.clone(),
                    duration_ms: 0,
                });
                Ok(())
            }
            None => {
                ctx.events.emit(&ExecutionEvent::ModuleFailed {
                    module: id,
                    name: spec.name.clone(),
                    error: error.to_string(),
                });
                ctx.cancel.cancel();
                Err(ExecutionError::Module {
                    module: spec.name.clone(),
                    error,
                })
            }
        },
    }
}

/// A type-compatible error sentinel: `None` for optionals, the `error`
/// variant for unions carrying one with a String payload. Anything else
/// degrades to propagation.
fn sentinel_for(spec: &ModuleNodeSpec, message: &str) -> Option<Value> {
    let output = spec.produces.values().next()?;
    match output {
        SemType::Optional(inner) => Some(Value::None(inner.as_ref().clone())),
        SemType::Union(variants) => {
            let (_, payload) = variants.iter().find(|(name, _)| name == "error")?;
            if matches!(payload, SemType::String) {
                Some(Value::Union {
                    variant: "error".to_string(),
                    value: Box::new(Value::String(message.to_string())),
                    union_type: output.clone(),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Write a firing's result into every produced data node, extracting
/// per-port fields for multi-output modules
fn store_result(
    ctx: &Arc<ExecContext>,
    id: ModuleNodeId,
    spec: &ModuleNodeSpec,
    value: Value,
    duration_ms: u64,
) {
    let multi_output = spec.produces.len() > 1;
    let mut state = ctx.state.lock();
    for data in ctx.dag.outputs_of(id) {
        let Some(data_spec) = ctx.dag.data.get(&data) else {
            continue;
        };
        let stored = match (&data_spec.port, multi_output) {
            (Some(port), true) => value.field(port).cloned().unwrap_or_else(|| value.clone()),
            _ => value.clone(),
        };
        state.set_value(data, stored, NodeStatus::Fired { duration_ms });
    }
    state.set_module_status(id, NodeStatus::Fired { duration_ms });
}
