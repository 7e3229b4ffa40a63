//! Integration Tests for the Result Cache
//!
//! These tests verify that expressions share one controller per key, that
//! results are computed once and reused, and that changes to items make
//! dependent results recompute.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use geocalc_core::clock::{ChangeSourceLock, DetermineChangeLock};
use geocalc_core::logging::init_test_logging;
use geocalc_core::{
    ArgPolicy, CalcContext, EngineConfig, EngineContext, ExplainContext, Expr, FailType, Failure,
    FnOperator, GroupPolicy, Node, Operator, OperatorGroup, Result, TaskOutcome, Value, ValueClass,
};

fn engine_with_sum(config: EngineConfig) -> (Arc<EngineContext>, Arc<AtomicUsize>) {
    init_test_logging();
    let engine = EngineContext::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine.registry().register(
        "sum",
        FnOperator::new(
            &[ValueClass::Numeric, ValueClass::Numeric],
            ValueClass::Float64,
            move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Float64(args[0].as_f64()? + args[1].as_f64()?))
            },
        )
        .into_arc(),
    );
    for (name, value) in [("a", 2.0), ("b", 3.0)] {
        let item = engine.create_item(name, ValueClass::Float64).unwrap();
        engine.set_value(&item, Value::Float64(value)).unwrap();
    }
    (engine, calls)
}

/// Test that concurrent lookups of one key end up with the same controller.
#[test]
fn one_controller_per_key() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let expr = Expr::parse("(sum a (sum b 1))").unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let expr = expr.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.controller(&expr).unwrap()
            })
        })
        .collect();
    let controllers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for controller in &controllers[1..] {
        assert!(Arc::ptr_eq(&controllers[0], controller));
    }
    // (sum a (sum b 1)), a, (sum b 1), b, 1
    assert_eq!(engine.cache().len(), 5);
}

/// Test that the cache entry goes away with the last controller handle.
#[test]
fn dropped_controllers_leave_the_cache() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    assert_eq!(engine.cache().len(), 3);
    drop(controller);
    assert!(engine.cache().is_empty());
}

/// Test that two threads asking for the same result share one calculation.
#[test]
fn shared_result_is_computed_once() {
    let (engine, calls) = engine_with_sum(EngineConfig::default());
    let controller = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    let _interest = controller.hold_interest();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let controller = controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _interest = controller.hold_interest();
                barrier.wait();
                controller.calc_result(None).unwrap().value().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Value::Float64(5.0));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test that an unchanged result is reused and a changed input recomputes.
#[test]
fn changed_input_recomputes() {
    let (engine, calls) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    let _interest = controller.hold_interest();

    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(5.0));
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(5.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.set_item_value("a", Value::Float64(10.0)).unwrap();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(13.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test that explicit invalidation forgets the result.
#[test]
fn invalidate_forces_recalculation() {
    let (engine, calls) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a 1)").unwrap()).unwrap();
    let _interest = controller.hold_interest();

    controller.calc_result(None).unwrap().wait().unwrap();
    controller.invalidate();
    assert!(controller.result().is_none());

    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(3.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test that calculating without interest is refused.
#[test]
fn calculation_requires_interest() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    let err = controller.calc_result(None).unwrap_err();
    assert!(err.to_string().contains("without interest"));
}

/// Test that interest flows to arguments and that losing it drops data.
#[test]
fn interest_is_paired_and_releases_data() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    let arg = engine.controller(&Expr::symbol("a")).unwrap();

    let first = controller.hold_interest();
    let second = controller.hold_interest();
    assert_eq!(controller.interest_count(), 2);
    assert_eq!(arg.interest_count(), 1);

    let node = controller.calc_result(None).unwrap().wait().unwrap();
    assert!(node.is_data_ready());
    assert_eq!(node.interest_count(), 1);

    drop(first);
    assert!(node.is_data_ready());
    drop(second);
    assert_eq!(controller.interest_count(), 0);
    assert_eq!(arg.interest_count(), 0);
    assert!(!node.is_data_ready());
    // Configuration items keep their data.
    assert!(engine.find_item("a").unwrap().is_data_ready());
}

/// Test overload selection by argument class.
#[test]
fn overloads_dispatch_on_argument_class() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine.registry().register(
        "classify",
        FnOperator::new(&[ValueClass::Float64], ValueClass::String, |_| Ok(Value::from("float")))
            .into_arc(),
    );
    engine.registry().register(
        "classify",
        FnOperator::new(&[ValueClass::Integer], ValueClass::String, |_| Ok(Value::from("integer")))
            .into_arc(),
    );
    let count = engine.create_item("count", ValueClass::Int32).unwrap();
    engine.set_value(&count, Value::Int32(3)).unwrap();

    assert_eq!(engine.evaluate("(classify count)").unwrap(), Value::from("integer"));
    assert_eq!(engine.evaluate("(classify 1.5)").unwrap(), Value::from("float"));

    let err = engine.evaluate("(classify \"text\")").unwrap_err();
    assert_eq!(err.fail_type(), Some(FailType::MetaInfo));
}

/// Test that an unknown operator name fails at meta-info level.
#[test]
fn unknown_operator_is_reported() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let err = engine.evaluate("(frobnicate a)").unwrap_err();
    assert!(err
        .to_string()
        .contains("There is no implemented operator for operator name 'frobnicate'"));
    assert_eq!(err.fail_type(), Some(FailType::MetaInfo));
}

/// Test that a missing item names the argument it was used as.
#[test]
fn missing_item_names_the_argument() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let err = engine.evaluate("(sum a missing)").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("argument 2 (missing)"), "{message}");
    assert!(message.contains("Cannot find Item missing"), "{message}");
}

/// Test that a failed symbol resolves once the item is created.
#[test]
fn created_item_revalidates_failed_symbol() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum a late)").unwrap()).unwrap();
    let _interest = controller.hold_interest();
    assert!(controller.calc_result(None).is_err());

    engine.create_item("late", ValueClass::Float64).unwrap();
    engine.set_item_value("late", Value::Float64(40.0)).unwrap();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(42.0));
}

/// Test that groups able to explain their values record a trace.
#[test]
fn explain_records_visited_calls() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine
        .registry()
        .register_group(OperatorGroup::new("scale").with_policy(GroupPolicy {
            can_explain_value: true,
            ..GroupPolicy::default()
        }))
        .unwrap();
    engine.registry().register(
        "scale",
        FnOperator::new(&[ValueClass::Numeric, ValueClass::Numeric], ValueClass::Float64, |v| {
            Ok(Value::Float64(v[0].as_f64()? * v[1].as_f64()?))
        })
        .into_arc(),
    );

    let controller = engine.controller(&Expr::parse("(scale (scale 2 3) 4)").unwrap()).unwrap();
    let _interest = controller.hold_interest();
    let mut explain = ExplainContext::new();
    let value = controller.calc_result(Some(&mut explain)).unwrap().value().unwrap();

    assert_eq!(value, Value::Float64(24.0));
    assert_eq!(explain.render(), "(scale (scale 2 3) 4) [calc]\n  (scale 2 3) [calc]\n");
}

/// Test that groups which do not cache get a private controller per lookup.
#[test]
fn uncached_groups_are_not_shared() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine
        .registry()
        .register_group(OperatorGroup::new("now").with_policy(GroupPolicy {
            dont_cache_result: true,
            ..GroupPolicy::default()
        }))
        .unwrap();
    let expr = Expr::parse("(now 1)").unwrap();
    let first = engine.controller(&expr).unwrap();
    let second = engine.controller(&expr).unwrap();
    assert!(!first.is_shared());
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(engine.cache().get_existing(&expr).is_none());
}

/// Test that a change two call levels down recomputes the whole chain.
#[test]
fn change_propagates_through_nested_calls() {
    let (engine, calls) = engine_with_sum(EngineConfig::single_threaded());
    let controller = engine.controller(&Expr::parse("(sum 10 (sum b 1))").unwrap()).unwrap();
    let _interest = controller.hold_interest();

    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(14.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    engine.set_item_value("b", Value::Float64(5.0)).unwrap();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(16.0));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // An unrelated change leaves the chain alone.
    engine.set_item_value("a", Value::Float64(0.0)).unwrap();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(16.0));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

/// Test that mutations inside a change-source scope carry its timestamp.
#[test]
fn change_source_scope_stamps_mutations() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let a = engine.find_item("a").unwrap();
    let source = engine.clock().last_ts();
    {
        let _scope = ChangeSourceLock::new(source);
        engine.set_value(&a, Value::Float64(7.0)).unwrap();
        engine.create_item("derived", ValueClass::Float64).unwrap();
    }
    assert_eq!(a.last_change(), source);
    assert_eq!(engine.find_item("derived").unwrap().last_change(), source);
    assert_eq!(engine.clock().peek_ts(), source);

    // Outside the scope the next change opens a new frame.
    engine.set_value(&a, Value::Float64(8.0)).unwrap();
    assert!(a.last_change() > source);
}

/// Test that a determine scope never opens a new frame.
#[test]
fn determine_scope_reuses_the_last_frame() {
    let (engine, _) = engine_with_sum(EngineConfig::single_threaded());
    let b = engine.find_item("b").unwrap();
    let last = engine.clock().last_ts();
    {
        let _determine = DetermineChangeLock::new();
        engine.set_value(&b, Value::Float64(9.0)).unwrap();
    }
    assert_eq!(b.last_change(), last);
    assert_eq!(engine.clock().peek_ts(), last);
}

/// Picks its second or third argument depending on the first.
struct Pick;

const PICK_ARGS: [ValueClass; 3] = [ValueClass::Bool, ValueClass::Numeric, ValueClass::Numeric];

impl Operator for Pick {
    fn arg_classes(&self) -> &[ValueClass] {
        &PICK_ARGS
    }

    fn result_class(&self, _args: &[ValueClass]) -> Result<ValueClass> {
        Ok(ValueClass::Float64)
    }

    fn calc_result(&self, args: &[Arc<Node>], _cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>> {
        let chosen = if args[0].value()? == Value::Bool(true) { &args[1] } else { &args[2] };
        Ok(TaskOutcome::Done(chosen.value()?))
    }
}

/// Test that dynamic policies only calculate the argument the first one selects.
#[test]
fn dynamic_policy_skips_unselected_arguments() {
    init_test_logging();
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    engine.registry().register(
        "tick",
        FnOperator::new(&[ValueClass::Numeric], ValueClass::Float64, move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Float64(v[0].as_f64()?))
        })
        .into_arc(),
    );
    engine
        .registry()
        .register_group(OperatorGroup::new("pick").with_dynamic_policy(Arc::new(
            |index: usize, first: Option<&Value>| match (index, first) {
                (0, _) => ArgPolicy::CalcAlways,
                (1, Some(Value::Bool(true))) | (2, Some(Value::Bool(false))) => ArgPolicy::CalcAsResult,
                _ => ArgPolicy::CalcNever,
            },
        )))
        .unwrap();
    engine.registry().register("pick", Arc::new(Pick));
    let flag = engine.create_item("flag", ValueClass::Bool).unwrap();
    engine.set_value(&flag, Value::Bool(true)).unwrap();

    let controller = engine.controller(&Expr::parse("(pick flag (tick 1) (tick 2))").unwrap()).unwrap();
    let _interest = controller.hold_interest();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(1.0));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    let skipped = engine.cache().get_existing(&Expr::parse("(tick 2)").unwrap()).unwrap();
    assert!(!skipped.result().unwrap().is_data_ready());

    engine.set_value(&flag, Value::Bool(false)).unwrap();
    assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(2.0));
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

/// Test that CalcAlways arguments are calculated while resolving meta info.
#[test]
fn calc_always_arguments_are_ready_with_meta_info() {
    let (engine, calls) = engine_with_sum(EngineConfig::single_threaded());
    engine
        .registry()
        .register_group(OperatorGroup::new("describe").with_arg_policies(&[ArgPolicy::CalcAlways]))
        .unwrap();
    engine.registry().register(
        "describe",
        FnOperator::new(&[ValueClass::Any], ValueClass::String, |_| Ok(Value::from("described")))
            .into_arc(),
    );
    engine.registry().register(
        "boom",
        FnOperator::new(&[ValueClass::Numeric], ValueClass::Float64, |_| {
            Err(Failure::data("boom exploded").into())
        })
        .into_arc(),
    );

    let controller = engine.controller(&Expr::parse("(describe (sum a b))").unwrap()).unwrap();
    assert_eq!(controller.make_result().unwrap().class(), ValueClass::String);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let arg = engine.cache().get_existing(&Expr::parse("(sum a b)").unwrap()).unwrap();
    assert!(arg.result().unwrap().is_data_ready());
    assert_eq!(arg.interest_count(), 1);

    let failing = engine.controller(&Expr::parse("(describe (boom 1))").unwrap()).unwrap();
    let err = failing.make_result().unwrap_err();
    assert_eq!(err.fail_type(), Some(FailType::MetaInfo));
    assert!(err.to_string().contains("argument 1 ((boom 1))"), "{err}");
}

/// Test that transient results are forgotten once nobody is interested.
#[test]
fn transient_results_are_forgotten() {
    let (engine, calls) = engine_with_sum(EngineConfig::single_threaded());
    engine
        .registry()
        .register_group(OperatorGroup::new("scratch").with_policy(GroupPolicy {
            is_transient: true,
            ..GroupPolicy::default()
        }))
        .unwrap();
    engine.registry().register(
        "scratch",
        FnOperator::new(&[ValueClass::Numeric], ValueClass::Float64, |v| {
            Ok(Value::Float64(v[0].as_f64()? * 10.0))
        })
        .into_arc(),
    );

    let transient = engine.controller(&Expr::parse("(scratch (sum a b))").unwrap()).unwrap();
    let kept = engine.controller(&Expr::parse("(sum a b)").unwrap()).unwrap();
    {
        let _interest = transient.hold_interest();
        assert_eq!(transient.calc_result(None).unwrap().value().unwrap(), Value::Float64(50.0));
    }
    assert!(transient.result().is_none());
    assert!(kept.result().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
