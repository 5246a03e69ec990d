//! Compilation throughput benchmarks.
//!
//! Measures end-to-end tree-to-bytecode latency for the shapes the fast
//! path exists for: small arithmetic lambdas, nullable-lifted operators,
//! and closure-carrying trees.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_compiler::{compile_lambda, Options};
use ember_core::{Ty, Value};
use ember_tree::{Expr, ExprKind, LambdaExpr, Var};
use std::sync::Arc;

fn lambda_of(params: Vec<Arc<Var>>, body: ember_tree::ExprRef) -> Arc<LambdaExpr> {
    match &Expr::lambda("bench", params, body).kind {
        ExprKind::Lambda(l) => l.clone(),
        _ => unreachable!(),
    }
}

/// `(a, b) => a * b + a - b`
fn arithmetic_tree() -> Arc<LambdaExpr> {
    let a = Var::new("a", Ty::Int);
    let b = Var::new("b", Ty::Int);
    let body = Expr::sub(
        Expr::add(
            Expr::mul(Expr::param(&a), Expr::param(&b)),
            Expr::param(&a),
        ),
        Expr::param(&b),
    );
    lambda_of(vec![a, b], body)
}

/// `(a) => a + 1` over `int?`, exercising the lifted emission path.
fn lifted_tree() -> Arc<LambdaExpr> {
    let a = Var::new("a", Ty::nullable(Ty::Int));
    let body = Expr::add(Expr::param(&a), Expr::constant(Value::Int(1)));
    lambda_of(vec![a], body)
}

/// `() => { let x = 1; () => x }` - a capture, a cell, a nested unit.
fn closure_tree() -> Arc<LambdaExpr> {
    let x = Var::new("x", Ty::Int);
    let inner = Expr::lambda("inner", vec![], Expr::param(&x));
    let body = Expr::block(
        vec![x.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(1))),
            inner,
        ],
    );
    lambda_of(vec![], body)
}

fn bench_compile(c: &mut Criterion) {
    let options = Options::default();
    let mut group = c.benchmark_group("compile");
    for (name, tree) in [
        ("arithmetic", arithmetic_tree()),
        ("lifted", lifted_tree()),
        ("closure", closure_tree()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &tree, |bench, tree| {
            bench.iter(|| compile_lambda(black_box(tree), &options).unwrap());
        });
    }
    group.finish();
}

criterion_group!(compile_benches, bench_compile);
criterion_main!(compile_benches);
