//! Executor integration tests
//!
//! End-to-end scenarios over compiled pipelines: parallel fan-out, retry
//! with backoff, fallbacks, error strategies, caching, priority, and
//! cancellation.

use constellation_engine::executor::ExecutionOptions;
use constellation_engine::{
    CallOptionsExpr, CancelToken, Engine, EngineConfig, ErrorStrategy, ExecutionError,
    ExecutionEvent, ExprKind, Module, ModuleError, ModuleErrorKind, ModuleMetadata, NodeStatus,
    PipelineDef, SemType, TypedExpr, Value,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn input(name: &str, ty: SemType) -> TypedExpr {
    TypedExpr::new(ExprKind::Input {
        name: name.to_string(),
        ty,
    })
}

fn int_lit(v: i64) -> TypedExpr {
    TypedExpr::new(ExprKind::Literal {
        value: Value::Int(v),
    })
}

fn call(module: &str, args: Vec<(&str, TypedExpr)>, options: CallOptionsExpr) -> TypedExpr {
    TypedExpr::new(ExprKind::Call {
        module: module.to_string(),
        alias: None,
        args: args
            .into_iter()
            .map(|(n, e)| (n.to_string(), e))
            .collect(),
        options,
    })
}

fn def(name: &str, bindings: Vec<(&str, TypedExpr)>, outputs: Vec<&str>) -> PipelineDef {
    PipelineDef {
        name: name.to_string(),
        bindings: bindings
            .into_iter()
            .map(|(n, e)| (n.to_string(), e))
            .collect(),
        outputs: outputs.into_iter().map(ToString::to_string).collect(),
    }
}

fn inputs(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(n, v)| (n.to_string(), v))
        .collect()
}

/// A module that sleeps, then echoes its `x` parameter
fn sleep_module(name: &str, sleep_ms: u64) -> Module {
    Module::new(
        ModuleMetadata {
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        },
        [("x".to_string(), SemType::Int)].into_iter().collect(),
        [("out".to_string(), SemType::Int)].into_iter().collect(),
        Arc::new(move |record| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                record
                    .field("x")
                    .cloned()
                    .ok_or_else(|| ModuleError::runtime("no x"))
            })
        }),
    )
}

/// A module that fails until `succeed_on_attempt` (1-based), then echoes
fn flaky_module(name: &str, succeed_on_attempt: u32, attempts: Arc<AtomicU32>) -> Module {
    Module::new(
        ModuleMetadata {
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        },
        [("x".to_string(), SemType::Int)].into_iter().collect(),
        [("out".to_string(), SemType::Int)].into_iter().collect(),
        Arc::new(move |record| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if attempt < succeed_on_attempt {
                    Err(ModuleError::runtime(format!("attempt {attempt} fails")))
                } else {
                    record
                        .field("x")
                        .cloned()
                        .ok_or_else(|| ModuleError::runtime("no x"))
                }
            })
        }),
    )
}

fn collecting_listener() -> (
    Arc<Mutex<Vec<ExecutionEvent>>>,
    constellation_engine::EventListener,
) {
    let events: Arc<Mutex<Vec<ExecutionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: constellation_engine::EventListener =
        Arc::new(move |event: &ExecutionEvent| sink.lock().push(event.clone()));
    (events, listener)
}

#[tokio::test]
async fn test_simple_fold_executes_to_literal() {
    // out r; r = add(2, 3): folding reduces to one literal, DCE removes
    // the module node, execution yields {r: 5}
    let engine = Engine::new(&EngineConfig::default());
    let compiled = engine
        .compile(&def(
            "fold",
            vec![("r", call("add", vec![("a", int_lit(2)), ("b", int_lit(3))], Default::default()))],
            vec!["r"],
        ))
        .unwrap();

    assert_eq!(compiled.dag.modules.len(), 0);
    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::Int(5));
}

#[tokio::test]
async fn test_parallel_fan_out_runs_concurrently() {
    // a = m1(x); b = m2(x), each sleeping 100 ms: total well under the
    // 200 ms a serial run would need, and one layer holds both
    let engine = Engine::new(&EngineConfig::default());
    engine
        .register_module("slow.m1", sleep_module("slow.m1", 100))
        .unwrap();
    engine
        .register_module("slow.m2", sleep_module("slow.m2", 100))
        .unwrap();

    let compiled = engine
        .compile(&def(
            "fanout",
            vec![
                ("a", call("slow.m1", vec![("x", input("x", SemType::Int))], Default::default())),
                ("b", call("slow.m2", vec![("x", input("x", SemType::Int))], Default::default())),
            ],
            vec!["a", "b"],
        ))
        .unwrap();

    let layers = compiled.dag.module_layers().unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].len(), 2);

    let started = Instant::now();
    let report = engine
        .run(
            &compiled,
            inputs(vec![("x", Value::Int(7))]),
            ExecutionOptions::default(),
        )
        .await;
    let elapsed = started.elapsed();

    let outputs = report.outcome.unwrap();
    assert_eq!(outputs["a"], Value::Int(7));
    assert_eq!(outputs["b"], Value::Int(7));
    assert!(
        elapsed < Duration::from_millis(180),
        "parallel execution took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_retry_with_linear_backoff_succeeds_silently() {
    // Fails twice, succeeds on the third attempt. Linear backoff with a
    // 10 ms initial delay waits 10 + 20 + 30 ms across the attempts.
    // Intermediate attempts emit no events; the terminal status is Fired.
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("flaky.m", flaky_module("flaky.m", 3, Arc::clone(&attempts)))
        .unwrap();

    let options = CallOptionsExpr {
        retry: Some(3),
        delay_ms: Some(10),
        backoff: Some(constellation_engine::BackoffStrategy::Linear),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "retry",
            vec![("r", call("flaky.m", vec![("x", int_lit(9))], options))],
            vec!["r"],
        ))
        .unwrap();

    let (events, listener) = collecting_listener();
    let started = Instant::now();
    let report = engine
        .run(
            &compiled,
            BTreeMap::new(),
            ExecutionOptions {
                listeners: vec![listener],
                ..ExecutionOptions::default()
            },
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(report.outcome.unwrap()["r"], Value::Int(9));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(
        elapsed >= Duration::from_millis(55),
        "backoff waits were skipped: {elapsed:?}"
    );

    let events = events.lock();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::ModuleFailed { .. })),
        "intermediate attempts must not emit failure events"
    );
    let completes = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::ModuleComplete { name, .. } if name == "flaky.m"))
        .count();
    assert_eq!(completes, 1);
}

#[tokio::test]
async fn test_fallback_salvages_exhausted_retries() {
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    // Never succeeds within 2 attempts
    engine
        .register_module("doomed.m", flaky_module("doomed.m", 99, Arc::clone(&attempts)))
        .unwrap();

    let options = CallOptionsExpr {
        retry: Some(1),
        fallback: Some(Box::new(int_lit(-1))),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "fallback",
            vec![("r", call("doomed.m", vec![("x", int_lit(5))], options))],
            vec!["r"],
        ))
        .unwrap();

    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::Int(-1));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fallback_not_evaluated_on_success() {
    // The fallback subgraph is demand-driven: a successful primary never
    // invokes it
    let engine = Engine::new(&EngineConfig::default());
    let primary_attempts = Arc::new(AtomicU32::new(0));
    let fallback_attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("ok.m", flaky_module("ok.m", 1, Arc::clone(&primary_attempts)))
        .unwrap();
    engine
        .register_module(
            "fb.m",
            flaky_module("fb.m", 1, Arc::clone(&fallback_attempts)),
        )
        .unwrap();

    let options = CallOptionsExpr {
        fallback: Some(Box::new(call(
            "fb.m",
            vec![("x", int_lit(0))],
            Default::default(),
        ))),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "lazy_fallback",
            vec![("r", call("ok.m", vec![("x", int_lit(4))], options))],
            vec!["r"],
        ))
        .unwrap();

    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::Int(4));
    assert_eq!(primary_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(fallback_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_guard_produces_optional_output() {
    let engine = Engine::new(&EngineConfig::default());
    let guard = TypedExpr::new(ExprKind::Guard {
        expr: Box::new(input("value", SemType::Int)),
        cond: Box::new(input("cond", SemType::Boolean)),
    });
    let compiled = engine
        .compile(&def("guard", vec![("r", guard)], vec!["r"]))
        .unwrap();
    assert_eq!(
        compiled.output_schema["r"],
        SemType::Optional(Box::new(SemType::Int))
    );

    let report = engine
        .run(
            &compiled,
            inputs(vec![("value", Value::Int(3)), ("cond", Value::Boolean(false))]),
            ExecutionOptions::default(),
        )
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::None(SemType::Int));

    let report = engine
        .run(
            &compiled,
            inputs(vec![("value", Value::Int(3)), ("cond", Value::Boolean(true))]),
            ExecutionOptions::default(),
        )
        .await;
    assert_eq!(
        report.outcome.unwrap()["r"],
        Value::Some(Box::new(Value::Int(3)))
    );
}

#[tokio::test]
async fn test_cache_hit_skips_second_invocation() {
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("cached.m", flaky_module("cached.m", 1, Arc::clone(&attempts)))
        .unwrap();

    let options = CallOptionsExpr {
        cache_ms: Some(60_000),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "cached",
            vec![("r", call("cached.m", vec![("x", input("x", SemType::Int))], options))],
            vec!["r"],
        ))
        .unwrap();

    let run_inputs = inputs(vec![("x", Value::Int(11))]);
    let first = engine
        .run(&compiled, run_inputs.clone(), ExecutionOptions::default())
        .await;
    assert_eq!(first.outcome.unwrap()["r"], Value::Int(11));

    let (events, listener) = collecting_listener();
    let second = engine
        .run(
            &compiled,
            run_inputs,
            ExecutionOptions {
                listeners: vec![listener],
                ..ExecutionOptions::default()
            },
        )
        .await;
    assert_eq!(second.outcome.unwrap()["r"], Value::Int(11));

    // The callable ran once; the second run served from cache but still
    // emitted its ModuleStart with a near-zero duration
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let events = events.lock();
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::ModuleStart { name, .. } if name == "cached.m")));
    let cached_duration = events.iter().find_map(|e| match e {
        ExecutionEvent::ModuleComplete { name, duration_ms, .. } if name == "cached.m" => {
            Some(*duration_ms)
        }
        _ => None,
    });
    assert!(cached_duration.expect("complete event") < 5);
}

#[tokio::test]
async fn test_propagate_failure_skips_downstream() {
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("bad.m", flaky_module("bad.m", 99, Arc::clone(&attempts)))
        .unwrap();

    // r = add(bad(x), 1): the failure propagates, add is skipped
    let bad = call("bad.m", vec![("x", int_lit(1))], Default::default());
    let sum = call("add", vec![("a", bad), ("b", int_lit(1))], Default::default());
    let compiled = engine
        .compile(&def("propagate", vec![("r", sum)], vec!["r"]))
        .unwrap();

    let (events, listener) = collecting_listener();
    let report = engine
        .run(
            &compiled,
            BTreeMap::new(),
            ExecutionOptions {
                listeners: vec![listener],
                ..ExecutionOptions::default()
            },
        )
        .await;

    assert!(matches!(
        report.outcome,
        Err(ExecutionError::Module { ref module, .. }) if module == "bad.m"
    ));
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ExecutionEvent::ModuleFailed { name, .. } if name == "bad.m")));

    // The downstream add module never fired
    let add_status = compiled
        .dag
        .modules
        .values()
        .find(|m| m.name == "math.add")
        .map(|m| report.state.module_status[&m.id].clone())
        .expect("add module present");
    assert_eq!(add_status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_skip_strategy_continues_without_output() {
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("bad.m", flaky_module("bad.m", 99, Arc::clone(&attempts)))
        .unwrap();

    let options = CallOptionsExpr {
        on_error: Some(ErrorStrategy::Skip),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "skip",
            vec![
                ("a", call("bad.m", vec![("x", int_lit(1))], options)),
                ("b", int_lit(2)),
            ],
            vec!["a", "b"],
        ))
        .unwrap();

    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    // The skipped module's output is absent, so the run reports it
    assert!(matches!(
        report.outcome,
        Err(ExecutionError::MissingOutput { ref name }) if name == "a"
    ));
}

#[tokio::test]
async fn test_wrap_strategy_produces_none_sentinel() {
    let engine = Engine::new(&EngineConfig::default());
    // Output type Optional(Int) makes Wrap legal
    let failing = Module::new(
        ModuleMetadata {
            name: "opt.m".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        },
        [("x".to_string(), SemType::Int)].into_iter().collect(),
        [(
            "out".to_string(),
            SemType::Optional(Box::new(SemType::Int)),
        )]
        .into_iter()
        .collect(),
        Arc::new(|_| {
            Box::pin(async {
                Err(ModuleError::new(
                    ModuleErrorKind::RuntimeError,
                    "always fails",
                ))
            })
        }),
    );
    engine.register_module("opt.m", failing).unwrap();

    let options = CallOptionsExpr {
        on_error: Some(ErrorStrategy::Wrap),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "wrap",
            vec![("r", call("opt.m", vec![("x", int_lit(1))], options))],
            vec!["r"],
        ))
        .unwrap();

    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::None(SemType::Int));
}

#[tokio::test]
async fn test_timeout_is_a_module_error() {
    let engine = Engine::new(&EngineConfig::default());
    engine
        .register_module("slow.m", sleep_module("slow.m", 5_000))
        .unwrap();

    let options = CallOptionsExpr {
        timeout_ms: Some(30),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "timeout",
            vec![("r", call("slow.m", vec![("x", int_lit(1))], options))],
            vec!["r"],
        ))
        .unwrap();

    let started = Instant::now();
    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    match report.outcome {
        Err(ExecutionError::Module { error, .. }) => {
            assert_eq!(error.kind, ModuleErrorKind::Timeout);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_terminates_promptly() {
    let engine = Engine::new(&EngineConfig::default());
    engine
        .register_module("slow.m", sleep_module("slow.m", 10_000))
        .unwrap();

    let compiled = engine
        .compile(&def(
            "cancel",
            vec![("r", call("slow.m", vec![("x", int_lit(1))], Default::default()))],
            vec!["r"],
        ))
        .unwrap();

    let token = CancelToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let (events, listener) = collecting_listener();
    let started = Instant::now();
    let report = engine
        .run(
            &compiled,
            BTreeMap::new(),
            ExecutionOptions {
                listeners: vec![listener],
                cancel: Some(token),
                ..ExecutionOptions::default()
            },
        )
        .await;

    assert!(matches!(report.outcome, Err(ExecutionError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ExecutionEvent::ExecutionCancelled { .. })));
}

#[tokio::test]
async fn test_deadline_takes_the_cancellation_path() {
    let engine = Engine::new(&EngineConfig::default());
    engine
        .register_module("slow.m", sleep_module("slow.m", 10_000))
        .unwrap();

    let compiled = engine
        .compile(&def(
            "deadline",
            vec![("r", call("slow.m", vec![("x", int_lit(1))], Default::default()))],
            vec!["r"],
        ))
        .unwrap();

    let report = engine
        .run(
            &compiled,
            BTreeMap::new(),
            ExecutionOptions {
                deadline: Some(Duration::from_millis(50)),
                ..ExecutionOptions::default()
            },
        )
        .await;
    assert!(matches!(report.outcome, Err(ExecutionError::Cancelled)));
}

#[tokio::test]
async fn test_priority_orders_starts_under_contention() {
    // One worker, three independent modules: starts must follow priority
    let mut config = EngineConfig::default();
    config.executor.worker_threads = 1;
    let engine = Engine::new(&config);
    for name in ["p.low", "p.mid", "p.high"] {
        engine.register_module(name, sleep_module(name, 5)).unwrap();
    }

    let with_priority = |module: &str, priority: u8| {
        call(
            module,
            vec![("x", input("x", SemType::Int))],
            CallOptionsExpr {
                priority: Some(priority),
                ..CallOptionsExpr::default()
            },
        )
    };
    let compiled = engine
        .compile(&def(
            "priority",
            vec![
                ("a", with_priority("p.low", 20)),
                ("b", with_priority("p.high", 100)),
                ("c", with_priority("p.mid", 50)),
            ],
            vec!["a", "b", "c"],
        ))
        .unwrap();

    let (events, listener) = collecting_listener();
    let report = engine
        .run(
            &compiled,
            inputs(vec![("x", Value::Int(1))]),
            ExecutionOptions {
                listeners: vec![listener],
                ..ExecutionOptions::default()
            },
        )
        .await;
    report.outcome.unwrap();

    let starts: Vec<String> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::ModuleStart { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec!["p.high", "p.mid", "p.low"]);
}

#[tokio::test]
async fn test_event_ordering_happens_before() {
    // For the chain m1 -> m2: Start(m1) < Complete(m1) < Start(m2), with
    // ExecutionStart first and ExecutionComplete last
    let engine = Engine::new(&EngineConfig::default());
    engine
        .register_module("chain.m1", sleep_module("chain.m1", 5))
        .unwrap();
    engine
        .register_module("chain.m2", sleep_module("chain.m2", 5))
        .unwrap();

    let first = call("chain.m1", vec![("x", input("x", SemType::Int))], Default::default());
    let second = call("chain.m2", vec![("x", first)], Default::default());
    let compiled = engine
        .compile(&def("chain", vec![("r", second)], vec!["r"]))
        .unwrap();

    let (events, listener) = collecting_listener();
    let report = engine
        .run(
            &compiled,
            inputs(vec![("x", Value::Int(1))]),
            ExecutionOptions {
                listeners: vec![listener],
                ..ExecutionOptions::default()
            },
        )
        .await;
    report.outcome.unwrap();

    let events = events.lock();
    assert!(matches!(events.first(), Some(ExecutionEvent::ExecutionStart { .. })));
    assert!(matches!(events.last(), Some(ExecutionEvent::ExecutionComplete { succeeded: true, .. })));

    let position = |pred: &dyn Fn(&ExecutionEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("event present")
    };
    let start_m1 = position(&|e| matches!(e, ExecutionEvent::ModuleStart { name, .. } if name == "chain.m1"));
    let complete_m1 = position(&|e| matches!(e, ExecutionEvent::ModuleComplete { name, .. } if name == "chain.m1"));
    let start_m2 = position(&|e| matches!(e, ExecutionEvent::ModuleStart { name, .. } if name == "chain.m2"));
    assert!(start_m1 < complete_m1);
    assert!(complete_m1 < start_m2);
}

#[tokio::test]
async fn test_input_validation_rejects_bad_records() {
    let engine = Engine::new(&EngineConfig::default());
    let compiled = engine
        .compile(&def(
            "validate",
            vec![("r", input("x", SemType::Int))],
            vec!["r"],
        ))
        .unwrap();

    // Missing
    let report = engine
        .run(&compiled, BTreeMap::new(), ExecutionOptions::default())
        .await;
    match report.outcome {
        Err(ExecutionError::InvalidInput(errors)) => {
            assert_eq!(errors[0].kind, constellation_engine::InputErrorKind::Missing);
        }
        other => panic!("expected input error, got {other:?}"),
    }

    // Wrong type
    let report = engine
        .run(
            &compiled,
            inputs(vec![("x", Value::String("no".to_string()))]),
            ExecutionOptions::default(),
        )
        .await;
    match report.outcome {
        Err(ExecutionError::InvalidInput(errors)) => {
            assert_eq!(
                errors[0].kind,
                constellation_engine::InputErrorKind::TypeMismatch
            );
        }
        other => panic!("expected type mismatch, got {other:?}"),
    }

    // Extra unmapped input
    let report = engine
        .run(
            &compiled,
            inputs(vec![("x", Value::Int(1)), ("ghost", Value::Int(2))]),
            ExecutionOptions::default(),
        )
        .await;
    match report.outcome {
        Err(ExecutionError::InvalidInput(errors)) => {
            assert!(errors
                .iter()
                .any(|e| e.kind == constellation_engine::InputErrorKind::Unexpected));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_checkpoint_resume_skips_completed_work() {
    let engine = Engine::new(&EngineConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    engine
        .register_module("step.m", flaky_module("step.m", 1, Arc::clone(&attempts)))
        .unwrap();

    let first = call("step.m", vec![("x", input("x", SemType::Int))], Default::default());
    let second = call("add", vec![("a", first), ("b", int_lit(1))], Default::default());
    let compiled = engine
        .compile(&def("resume", vec![("r", second)], vec!["r"]))
        .unwrap();

    let run_inputs = inputs(vec![("x", Value::Int(10))]);
    let report = engine
        .run(&compiled, run_inputs.clone(), ExecutionOptions::default())
        .await;
    assert_eq!(report.outcome.unwrap()["r"], Value::Int(11));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Checkpoint the finished state and resume: the module must not
    // re-fire because its outputs are already present
    let step_id = compiled
        .dag
        .modules
        .values()
        .find(|m| m.name == "step.m")
        .map(|m| m.id)
        .expect("module present");
    let checkpoint = constellation_engine::Executor::checkpoint(
        report.execution_id,
        "resume",
        &report.state,
        step_id,
        None,
        run_inputs,
    );

    let resumed = engine
        .executor()
        .resume(
            Arc::clone(&compiled.dag),
            &checkpoint,
            ExecutionOptions::default(),
        )
        .await;
    assert_eq!(resumed.outcome.unwrap()["r"], Value::Int(11));
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        1,
        "restored module must not re-fire"
    );
}
