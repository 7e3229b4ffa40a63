//! Benchmarks for expression evaluation

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use geocalc_core::{EngineConfig, EngineContext, Expr, FnOperator, Value, ValueClass};
use std::sync::Arc;

/// Engine with an `add` operator and two configuration items.
fn setup_engine() -> Arc<EngineContext> {
    let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
    engine.registry().register(
        "add",
        FnOperator::new(&[ValueClass::Numeric, ValueClass::Numeric], ValueClass::Float64, |v| {
            Ok(Value::Float64(v[0].as_f64()? + v[1].as_f64()?))
        })
        .into_arc(),
    );
    for (name, value) in [("x", 1.5), ("y", 2.5)] {
        let item = engine.create_item(name, ValueClass::Float64).unwrap();
        engine.set_value(&item, Value::Float64(value)).unwrap();
    }
    engine
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("expr_parse", |b| {
        b.iter(|| {
            let expr = Expr::parse(black_box("(add (add x y) (add x 2))")).unwrap();
            black_box(expr);
        })
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let engine = setup_engine();

    c.bench_function("evaluate_cold", |b| {
        b.iter(|| {
            let value = engine.evaluate(black_box("(add (add x y) 3)")).unwrap();
            black_box(value);
        })
    });

    let expr = Expr::parse("(add (add x y) 3)").unwrap();
    let controller = engine.controller(&expr).unwrap();
    let _interest = controller.hold_interest();
    controller.calc_result(None).unwrap().wait().unwrap();

    c.bench_function("evaluate_hot", |b| {
        b.iter(|| {
            let value = controller.calc_result(None).unwrap().value().unwrap();
            black_box(value);
        })
    });
}

criterion_group!(benches, bench_parse, bench_evaluate);
criterion_main!(benches);
