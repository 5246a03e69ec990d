//! Closure-cell semantics: captures share storage between the enclosing
//! artifact and nested artifacts, relays reach through intermediate
//! lambdas, and captured parameters live in cells.

use ember_core::{Ty, Value};
use ember_tree::{Expr, ExprKind, ExprRef, Var, VarRef};
use ember_vm::{compile, CompiledFn, Options};

// =============================================================================
// Test Helpers
// =============================================================================

fn compile_fn(params: Vec<VarRef>, body: ExprRef) -> CompiledFn {
    let tree = Expr::lambda("test", params, body);
    let ExprKind::Lambda(lambda) = &tree.kind else {
        unreachable!()
    };
    compile(lambda, Options::default()).expect("compile error")
}

// =============================================================================
// Shared mutation
// =============================================================================

#[test]
fn inner_mutation_is_visible_to_the_outer_lambda() {
    // { x = 1; inner(); x } where inner does x = x + 41. Cell sharing,
    // not copy capture: the outer body observes 42.
    let x = Var::new("x", Ty::Int);
    let inner = Expr::lambda(
        "inner",
        vec![],
        Expr::assign(
            Expr::param(&x),
            Expr::add(Expr::param(&x), Expr::constant(Value::Int(41))),
        ),
    );
    let body = Expr::block(
        vec![x.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(1))),
            Expr::invoke(inner, vec![], Ty::Int),
            Expr::param(&x),
        ],
    );
    let f = compile_fn(vec![], body);
    assert_eq!(f.call(vec![]).unwrap(), Value::Int(42));
}

#[test]
fn two_closures_share_one_cell() {
    // An incrementer and a reader over the same captured variable.
    let x = Var::new("x", Ty::Int);
    let bump = Expr::lambda(
        "bump",
        vec![],
        Expr::assign(
            Expr::param(&x),
            Expr::add(Expr::param(&x), Expr::constant(Value::Int(1))),
        ),
    );
    let read = Expr::lambda("read", vec![], Expr::param(&x));
    let body = Expr::block(
        vec![x.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(0))),
            Expr::invoke(bump.clone(), vec![], Ty::Int),
            Expr::invoke(bump, vec![], Ty::Int),
            Expr::invoke(read, vec![], Ty::Int),
        ],
    );
    let f = compile_fn(vec![], body);
    assert_eq!(f.call(vec![]).unwrap(), Value::Int(2));
}

#[test]
fn capture_relays_through_an_intermediate_lambda() {
    // outer x; middle never touches x but returns an inner that does.
    let x = Var::new("x", Ty::Int);
    let inner = Expr::lambda(
        "inner",
        vec![],
        Expr::assign(
            Expr::param(&x),
            Expr::add(Expr::param(&x), Expr::constant(Value::Int(1))),
        ),
    );
    let middle = Expr::lambda("middle", vec![], inner);
    let body = Expr::block(
        vec![x.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(10))),
            Expr::invoke(
                Expr::invoke(middle, vec![], Ty::Func),
                vec![],
                Ty::Int,
            ),
            Expr::param(&x),
        ],
    );
    let f = compile_fn(vec![], body);
    assert_eq!(f.call(vec![]).unwrap(), Value::Int(11));
}

#[test]
fn captured_parameter_is_shared_with_the_closure() {
    // (seed) => { inner(); seed } with inner doing seed = seed * 2.
    let seed = Var::new("seed", Ty::Int);
    let inner = Expr::lambda(
        "inner",
        vec![],
        Expr::assign(
            Expr::param(&seed),
            Expr::mul(Expr::param(&seed), Expr::constant(Value::Int(2))),
        ),
    );
    let body = Expr::seq(vec![
        Expr::invoke(inner, vec![], Ty::Int),
        Expr::param(&seed),
    ]);
    let f = compile_fn(vec![seed], body);
    assert_eq!(f.call(vec![Value::Int(21)]).unwrap(), Value::Int(42));
}

// =============================================================================
// Returned closures
// =============================================================================

#[test]
fn returned_closure_keeps_its_cells_alive() {
    // () => { n = 40; (d) => n + d } - invoking the returned closure
    // after the outer frame is gone still sees the cell.
    let n = Var::new("n", Ty::Int);
    let d = Var::new("d", Ty::Int);
    let inner = Expr::lambda(
        "adder",
        vec![d.clone()],
        Expr::add(Expr::param(&n), Expr::param(&d)),
    );
    let body = Expr::block(
        vec![n.clone()],
        vec![
            Expr::assign(Expr::param(&n), Expr::constant(Value::Int(40))),
            inner,
        ],
    );
    let f = compile_fn(vec![], body);

    let closure = f.call(vec![]).unwrap();
    let Value::Closure(adder) = closure else {
        panic!("expected a closure result");
    };
    assert_eq!(adder.invoke(vec![Value::Int(2)]).unwrap(), Value::Int(42));
    assert_eq!(adder.invoke(vec![Value::Int(5)]).unwrap(), Value::Int(45));
}

#[test]
fn closures_from_separate_invocations_do_not_share_cells() {
    // Each outer invocation materializes a fresh cell collection.
    let x = Var::new("x", Ty::Int);
    let bump = Expr::lambda(
        "bump",
        vec![],
        Expr::assign(
            Expr::param(&x),
            Expr::add(Expr::param(&x), Expr::constant(Value::Int(1))),
        ),
    );
    let body = Expr::block(
        vec![x.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(0))),
            bump,
        ],
    );
    let f = compile_fn(vec![], body);

    let Value::Closure(first) = f.call(vec![]).unwrap() else {
        panic!("expected a closure");
    };
    let Value::Closure(second) = f.call(vec![]).unwrap() else {
        panic!("expected a closure");
    };
    assert_eq!(first.invoke(vec![]).unwrap(), Value::Int(1));
    assert_eq!(first.invoke(vec![]).unwrap(), Value::Int(2));
    // The second invocation's cell started fresh.
    assert_eq!(second.invoke(vec![]).unwrap(), Value::Int(1));
}
