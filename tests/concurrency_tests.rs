//! Concurrency tests
//!
//! A `DagSpec` is shared read-only by concurrent executions; per-module
//! concurrency permits and throttle tokens are process-wide and scoped to
//! a single firing.

use constellation_engine::executor::ExecutionOptions;
use constellation_engine::{
    CallOptionsExpr, Engine, EngineConfig, ExprKind, Module, ModuleError, ModuleMetadata,
    PipelineDef, SemType, TypedExpr, Value,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn call(module: &str, options: CallOptionsExpr) -> TypedExpr {
    TypedExpr::new(ExprKind::Call {
        module: module.to_string(),
        alias: None,
        args: vec![(
            "x".to_string(),
            TypedExpr::new(ExprKind::Input {
                name: "x".to_string(),
                ty: SemType::Int,
            }),
        )],
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

fn inputs(x: i64) -> BTreeMap<String, Value> {
    [("x".to_string(), Value::Int(x))].into_iter().collect()
}

/// Tracks the peak number of concurrent invocations
fn tracking_module(name: &str, in_flight: Arc<AtomicU32>, peak: Arc<AtomicU32>) -> Module {
    Module::new(
        ModuleMetadata {
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
        },
        [("x".to_string(), SemType::Int)].into_iter().collect(),
        [("out".to_string(), SemType::Int)].into_iter().collect(),
        Arc::new(move |record| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                record
                    .field("x")
                    .cloned()
                    .ok_or_else(|| ModuleError::runtime("no x"))
            })
        }),
    )
}

#[tokio::test]
async fn test_concurrent_executions_share_one_dag() {
    let engine = Arc::new(Engine::new(&EngineConfig::default()));
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    engine
        .register_module(
            "track.m",
            tracking_module("track.m", in_flight, Arc::clone(&peak)),
        )
        .unwrap();

    let compiled = engine
        .compile(&def(
            "shared",
            vec![("r", call("track.m", CallOptionsExpr::default()))],
            vec!["r"],
        ))
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        let compiled = Arc::clone(&compiled);
        handles.push(tokio::spawn(async move {
            engine
                .run(&compiled, inputs(i), ExecutionOptions::default())
                .await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let report = handle.await.expect("join");
        assert_eq!(report.outcome.unwrap()["r"], Value::Int(i as i64));
    }
    // All eight executions really overlapped
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_concurrency_option_bounds_in_flight_calls() {
    let engine = Arc::new(Engine::new(&EngineConfig::default()));
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    engine
        .register_module(
            "bounded.m",
            tracking_module("bounded.m", in_flight, Arc::clone(&peak)),
        )
        .unwrap();

    let options = CallOptionsExpr {
        concurrency: Some(2),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "bounded",
            vec![("r", call("bounded.m", options))],
            vec!["r"],
        ))
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let engine = Arc::clone(&engine);
        let compiled = Arc::clone(&compiled);
        handles.push(tokio::spawn(async move {
            engine
                .run(&compiled, inputs(i), ExecutionOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").outcome.unwrap();
    }

    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "concurrency=2 exceeded: peak {}",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_throttle_spaces_out_firings() {
    let engine = Arc::new(Engine::new(&EngineConfig::default()));
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    engine
        .register_module(
            "throttled.m",
            tracking_module("throttled.m", in_flight, peak),
        )
        .unwrap();

    // 1 token per 50 ms: four executions need at least ~150 ms of refills
    let options = CallOptionsExpr {
        throttle_count: Some(1),
        throttle_per_ms: Some(50),
        ..CallOptionsExpr::default()
    };
    let compiled = engine
        .compile(&def(
            "throttled",
            vec![("r", call("throttled.m", options))],
            vec!["r"],
        ))
        .unwrap();

    let started = Instant::now();
    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = Arc::clone(&engine);
        let compiled = Arc::clone(&compiled);
        handles.push(tokio::spawn(async move {
            engine
                .run(&compiled, inputs(i), ExecutionOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").outcome.unwrap();
    }
    assert!(
        started.elapsed() >= Duration::from_millis(120),
        "throttle did not space firings: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_compile_cache_is_thread_safe() {
    let engine = Arc::new(Engine::new(&EngineConfig::default()));
    let d = Arc::new(def(
        "cached_compile",
        vec![(
            "r",
            TypedExpr::new(ExprKind::Literal {
                value: Value::Int(1),
            }),
        )],
        vec!["r"],
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let d = Arc::clone(&d);
        handles.push(tokio::spawn(async move { engine.compile(&d).unwrap() }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let stats = engine.cache_stats();
    assert_eq!(stats.size, 1);
    assert!(stats.hits + stats.misses >= 8);
}

#[tokio::test]
async fn test_registry_mutation_during_execution() {
    // Registering unrelated modules while a pipeline runs must not
    // disturb the running execution
    let engine = Arc::new(Engine::new(&EngineConfig::default()));
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    engine
        .register_module("busy.m", tracking_module("busy.m", in_flight, peak))
        .unwrap();

    let compiled = engine
        .compile(&def(
            "mutating",
            vec![("r", call("busy.m", CallOptionsExpr::default()))],
            vec!["r"],
        ))
        .unwrap();

    let runner = {
        let engine = Arc::clone(&engine);
        let compiled = Arc::clone(&compiled);
        tokio::spawn(async move {
            engine
                .run(&compiled, inputs(42), ExecutionOptions::default())
                .await
        })
    };

    for i in 0..5 {
        let name = format!("transient.m{i}");
        let module = Module::new(
            ModuleMetadata {
                name: name.clone(),
                description: String::new(),
                version: "0.0.1".to_string(),
            },
            BTreeMap::new(),
            [("out".to_string(), SemType::Unit)].into_iter().collect(),
            Arc::new(|_| Box::pin(async { Ok(Value::Unit) })),
        );
        engine.register_module(&name, module).unwrap();
        engine.registry().deregister(&name);
    }

    let report = runner.await.expect("join");
    assert_eq!(report.outcome.unwrap()["r"], Value::Int(42));
}
