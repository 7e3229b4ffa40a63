//! Integration Tests for Schedulers
//!
//! These tests verify cancellation on lost interest, cooperative
//! suspension, failure propagation between suppliers and waiters, and the
//! single-threaded mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use geocalc_core::logging::init_test_logging;
use geocalc_core::{
    CalcContext, EngineConfig, EngineContext, EngineError, Expr, FailType, Failure, FnOperator,
    Node, NotificationCode, Operator, Result, TaskOutcome, TaskStatus, Value, ValueClass,
};

const ONE_NUMBER: [ValueClass; 1] = [ValueClass::Numeric];

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Runs until it is released, checking for cancellation and suspension.
#[derive(Default)]
struct Gated {
    started: AtomicBool,
    released: AtomicBool,
}

impl Operator for Gated {
    fn arg_classes(&self) -> &[ValueClass] {
        &ONE_NUMBER
    }

    fn result_class(&self, _args: &[ValueClass]) -> Result<ValueClass> {
        Ok(ValueClass::Float64)
    }

    fn calc_result(&self, args: &[Arc<Node>], cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>> {
        self.started.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            if cx.cancel_if_out_of_interest() {
                return Ok(TaskOutcome::Cancelled);
            }
            thread::sleep(Duration::from_millis(1));
        }
        if cx.must_suspend() {
            return Ok(TaskOutcome::Suspended);
        }
        Ok(TaskOutcome::Done(Value::Float64(args[0].value()?.as_f64()? * 2.0)))
    }
}

fn engine_with_gate(config: EngineConfig) -> (Arc<EngineContext>, Arc<Gated>) {
    init_test_logging();
    let engine = EngineContext::new(config).unwrap();
    let gate = Arc::new(Gated::default());
    engine.registry().register("gated", gate.clone());
    (engine, gate)
}

/// Test that a running calculation stops once nobody wants its result.
#[test]
fn lost_interest_cancels_running_calculation() {
    let (engine, gate) = engine_with_gate(EngineConfig::default());
    let controller = engine.controller(&Expr::parse("(gated 21)").unwrap()).unwrap();
    let interest = controller.hold_interest();

    let future = controller.calc_result(None).unwrap();
    let scheduler = future.scheduler().cloned().unwrap();
    wait_for("the operator to start", || gate.started.load(Ordering::SeqCst));

    drop(interest);
    assert_eq!(scheduler.join(), TaskStatus::Cancelled);

    let node = future.node();
    assert_eq!(node.lock_count(), 0);
    assert!(!node.is_data_ready());
    assert!(!node.is_failed());
    assert!(controller.scheduler().is_none());
}

/// Test that a suspended calculation resumes and completes.
#[test]
fn suspended_calculation_resumes() {
    let (engine, gate) = engine_with_gate(EngineConfig::default());
    let controller = engine.controller(&Expr::parse("(gated 21)").unwrap()).unwrap();
    let _interest = controller.hold_interest();

    let future = controller.calc_result(None).unwrap();
    let scheduler = future.scheduler().cloned().unwrap();
    wait_for("the operator to start", || gate.started.load(Ordering::SeqCst));

    engine.request_suspend();
    gate.released.store(true, Ordering::SeqCst);
    wait_for("the suspension", || scheduler.status() == TaskStatus::Suspended);
    assert!(!future.is_ready());
    // The write lock is kept while suspended.
    assert_eq!(future.node().lock_count(), -1);

    engine.resume();
    assert_eq!(future.value().unwrap(), Value::Float64(42.0));
    assert_eq!(scheduler.status(), TaskStatus::Done);
}

/// Test that a failing supplier fails its waiters with the cause attached.
#[test]
fn supplier_failure_propagates() {
    for config in [EngineConfig::single_threaded(), EngineConfig::default()] {
        init_test_logging();
        let engine = EngineContext::new(config).unwrap();
        engine.registry().register(
            "boom",
            FnOperator::new(&ONE_NUMBER, ValueClass::Float64, |_| {
                Err(Failure::data("boom exploded").into())
            })
            .into_arc(),
        );
        engine.registry().register(
            "neg",
            FnOperator::new(&ONE_NUMBER, ValueClass::Float64, |v| {
                Ok(Value::Float64(-v[0].as_f64()?))
            })
            .into_arc(),
        );

        let controller = engine.controller(&Expr::parse("(neg (boom 1))").unwrap()).unwrap();
        let _interest = controller.hold_interest();
        let err = controller
            .calc_result(None)
            .and_then(|future| future.value())
            .unwrap_err();

        assert_eq!(err.fail_type(), Some(FailType::Data));
        assert!(err.to_string().contains("boom exploded"), "{err}");
        // Meta info is still available for a data failure.
        assert_eq!(controller.make_result().unwrap().class(), ValueClass::Float64);
    }
}

/// Test that a panicking operator becomes a data failure.
#[test]
fn operator_panic_is_contained() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine.registry().register(
        "explode",
        FnOperator::new(&ONE_NUMBER, ValueClass::Float64, |_| -> Result<Value> {
            panic!("kaboom")
        })
        .into_arc(),
    );
    let err = engine.evaluate("(explode 1)").unwrap_err();
    assert!(err.to_string().contains("operator panicked: kaboom"), "{err}");
}

/// Test that single-threaded mode computes on the requesting thread.
#[test]
fn single_threaded_mode_runs_inline() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::default();
    let recorder = seen.clone();
    engine.registry().register(
        "half",
        FnOperator::new(&ONE_NUMBER, ValueClass::Float64, move |v| {
            recorder.lock().unwrap().push(thread::current().id());
            Ok(Value::Float64(v[0].as_f64()? / 2.0))
        })
        .into_arc(),
    );

    assert_eq!(engine.evaluate("(half (half 8))").unwrap(), Value::Float64(2.0));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|id| *id == thread::current().id()));
    assert_eq!(engine.hub().running_count(), 0);
}

/// Cancels its own scheduler and still claims success.
struct Abandoning;

impl Operator for Abandoning {
    fn arg_classes(&self) -> &[ValueClass] {
        &ONE_NUMBER
    }

    fn result_class(&self, _args: &[ValueClass]) -> Result<ValueClass> {
        Ok(ValueClass::Float64)
    }

    fn calc_result(&self, args: &[Arc<Node>], cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>> {
        assert!(cx.scheduler().cancel_if_no_interest_or_forced(true));
        Ok(TaskOutcome::Done(args[0].value()?))
    }
}

/// Test that a result finished after a forced cancel is never published.
#[test]
fn forced_cancel_during_run_publishes_nothing() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine.registry().register("abandon", Arc::new(Abandoning));
    let published: Arc<Mutex<Vec<String>>> = Arc::default();
    let recorder = published.clone();
    let _subscription = engine.notifications().subscribe(None, move |node, code| {
        if code == NotificationCode::DataReady {
            recorder.lock().unwrap().push(node.name().to_string());
        }
    });

    let err = engine.evaluate("(abandon 7)").unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)), "{err}");

    let controller = engine.controller(&"(abandon 7)".parse().unwrap()).unwrap();
    assert!(controller.result().map_or(true, |node| !node.is_data_ready()));
    assert!(controller.scheduler().is_none());
    assert!(published.lock().unwrap().is_empty());
    assert_eq!(engine.hub().running_count(), 0);
}

/// Test that cancel-all stays in effect until it is reset.
#[test]
fn cancel_all_is_sticky() {
    let (engine, gate) = engine_with_gate(EngineConfig::single_threaded());
    gate.released.store(true, Ordering::SeqCst);

    engine.cancel_all();
    assert!(matches!(engine.evaluate("(gated 1)"), Err(EngineError::Cancelled(_))));
    assert!(matches!(engine.evaluate("(gated 1)"), Err(EngineError::Cancelled(_))));

    engine.reset_cancel_all();
    assert_eq!(engine.evaluate("(gated 1)").unwrap(), Value::Float64(2.0));
}

/// Test that shutdown cancels queued work and is idempotent.
#[test]
fn shutdown_is_idempotent() {
    let (engine, _) = engine_with_gate(EngineConfig::default());
    engine.shutdown();
    engine.shutdown();
    assert!(engine.is_shut_down());
    assert_eq!(engine.hub().scheduled_count(), 0);
}
