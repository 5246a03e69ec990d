//! Assignment semantics: compound targets, increment/decrement forms,
//! single evaluation of receivers, and by-reference value-type mutation.

use ember_core::{NativeFn, StructTy, Ty, Value};
use ember_tree::{Expr, ExprKind, ExprRef, Var, VarRef};
use ember_vm::{compile, CompiledFn, Options};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

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

fn int_pair_struct() -> Arc<StructTy> {
    StructTy::new(
        "Pair",
        false,
        vec![("a".into(), Ty::Int), ("b".into(), Ty::Int)],
    )
}

// =============================================================================
// Simple and compound variable assignment
// =============================================================================

#[test]
fn assignment_yields_the_assigned_value() {
    let x = Var::new("x", Ty::Int);
    let body = Expr::block(
        vec![x.clone()],
        vec![Expr::assign(Expr::param(&x), Expr::constant(Value::Int(5)))],
    );
    let f = compile_fn(vec![], body);
    assert_eq!(f.call(vec![]).unwrap(), Value::Int(5));
}

#[test]
fn compound_assign_to_parameter() {
    let x = Var::new("x", Ty::Int);
    let body = Expr::add_assign(Expr::param(&x), Expr::constant(Value::Int(33)));
    let f = compile_fn(vec![x], body);
    assert_eq!(f.call(vec![Value::Int(9)]).unwrap(), Value::Int(42));
}

#[test]
fn pre_and_post_increment_of_a_local() {
    let x = Var::new("x", Ty::Int);
    // { x = 9; post = x++; pre = ++x; pre * 100 + post }
    let post = Var::new("post", Ty::Int);
    let pre = Var::new("pre", Ty::Int);
    let body = Expr::block(
        vec![x.clone(), post.clone(), pre.clone()],
        vec![
            Expr::assign(Expr::param(&x), Expr::constant(Value::Int(9))),
            Expr::assign(Expr::param(&post), Expr::post_increment(Expr::param(&x))),
            Expr::assign(Expr::param(&pre), Expr::pre_increment(Expr::param(&x))),
            Expr::add(
                Expr::mul(Expr::param(&pre), Expr::constant(Value::Int(100))),
                Expr::param(&post),
            ),
        ],
    );
    let f = compile_fn(vec![], body);
    // post-increment sees 9, then x is 10, pre-increment delivers 11.
    assert_eq!(f.call(vec![]).unwrap(), Value::Int(1109));
}

// =============================================================================
// Array element targets (Issue 352 shapes)
// =============================================================================

#[test]
fn array_element_assign() {
    let a = Var::new("a", Ty::array(Ty::Int));
    let body = Expr::seq(vec![Expr::assign(
        Expr::index(Expr::param(&a), Expr::constant(Value::Int(2))),
        Expr::constant(Value::Int(33)),
    )]);
    let f = compile_fn(vec![a], body);

    let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(9)]);
    f.call(vec![arr.clone()]).unwrap();
    let Value::Array(arr) = arr else { unreachable!() };
    assert_eq!(arr.get(2).unwrap(), Value::Int(33));
}

#[test]
fn array_element_add_assign() {
    let a = Var::new("a", Ty::array(Ty::Int));
    let body = Expr::add_assign(
        Expr::index(Expr::param(&a), Expr::constant(Value::Int(2))),
        Expr::constant(Value::Int(33)),
    );
    let f = compile_fn(vec![a], body);

    let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(9)]);
    assert_eq!(f.call(vec![arr.clone()]).unwrap(), Value::Int(42));
    let Value::Array(arr) = arr else { unreachable!() };
    assert_eq!(arr.get(2).unwrap(), Value::Int(42));
}

#[test]
fn side_effecting_index_runs_exactly_once_per_execution() {
    let calls = Arc::new(AtomicI64::new(0));
    let counter = calls.clone();
    let next_index = NativeFn::new("next_index", 0, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Int(0))
    });

    let a = Var::new("a", Ty::array(Ty::Int));
    let body = Expr::add_assign(
        Expr::index(Expr::param(&a), Expr::call(next_index, vec![], Ty::Int)),
        Expr::constant(Value::Int(1)),
    );
    let f = compile_fn(vec![a], body);

    let arr = Value::array(vec![Value::Int(0)]);
    f.call(vec![arr.clone()]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "index evaluated once");
    f.call(vec![arr]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "once per execution");
}

// =============================================================================
// Member targets
// =============================================================================

#[test]
fn object_member_add_assign() {
    let ty = StructTy::new("Counter", true, vec![("n".into(), Ty::Int)]);
    let c = Var::new("c", Ty::Struct(ty.clone()));
    let body = Expr::add_assign(
        Expr::field(Expr::param(&c), "n"),
        Expr::constant(Value::Int(40)),
    );
    let f = compile_fn(vec![c], body);

    let obj = Value::obj(ty, vec![Value::Int(2)]);
    assert_eq!(f.call(vec![obj.clone()]).unwrap(), Value::Int(42));
    let Value::Obj(obj) = obj else { unreachable!() };
    assert_eq!(obj.get_field(0).unwrap(), Value::Int(42));
}

#[test]
fn nullable_member_add_assign_leaves_null_null() {
    // box.d += 5 with a null nullable field keeps the target null and
    // produces null.
    let ty = StructTy::new("NBox", true, vec![("d".into(), Ty::nullable(Ty::Int))]);
    let b = Var::new("b", Ty::Struct(ty.clone()));
    let body = Expr::add_assign(
        Expr::field(Expr::param(&b), "d"),
        Expr::constant_of(Value::Int(5), Ty::nullable(Ty::Int)),
    );
    let f = compile_fn(vec![b], body);

    let null_box = Value::obj(ty.clone(), vec![Value::Null]);
    assert_eq!(f.call(vec![null_box.clone()]).unwrap(), Value::Null);
    let Value::Obj(o) = null_box else { unreachable!() };
    assert_eq!(o.get_field(0).unwrap(), Value::Null);

    let full_box = Value::obj(ty, vec![Value::Int(37)]);
    assert_eq!(f.call(vec![full_box.clone()]).unwrap(), Value::Int(42));
    let Value::Obj(o) = full_box else { unreachable!() };
    assert_eq!(o.get_field(0).unwrap(), Value::Int(42));
}

#[test]
fn nullable_member_post_increment_returns_old_value() {
    let ty = StructTy::new("NBox2", true, vec![("d".into(), Ty::nullable(Ty::Int))]);
    let b = Var::new("b", Ty::Struct(ty.clone()));
    let body = Expr::post_increment(Expr::field(Expr::param(&b), "d"));
    let f = compile_fn(vec![b], body);

    let full = Value::obj(ty.clone(), vec![Value::Int(9)]);
    assert_eq!(f.call(vec![full.clone()]).unwrap(), Value::Int(9));
    let Value::Obj(o) = full else { unreachable!() };
    assert_eq!(o.get_field(0).unwrap(), Value::Int(10));

    // Null flows through both the result and the target.
    let null_box = Value::obj(ty, vec![Value::Null]);
    assert_eq!(f.call(vec![null_box.clone()]).unwrap(), Value::Null);
    let Value::Obj(o) = null_box else { unreachable!() };
    assert_eq!(o.get_field(0).unwrap(), Value::Null);
}

// =============================================================================
// By-reference value types (Issue 352 ref-struct shapes)
// =============================================================================

#[test]
fn byref_struct_field_pre_increment_mutates_caller_storage() {
    let pair = int_pair_struct();
    let v = Var::by_ref("v", Ty::Struct(pair.clone()));
    let body = Expr::pre_increment(Expr::field(Expr::param(&v), "a"));
    let f = compile_fn(vec![v], body);

    let cell = Value::cell(Value::struct_val(
        pair,
        vec![Value::Int(9), Value::Int(5)],
    ));
    assert_eq!(f.call(vec![cell.clone()]).unwrap(), Value::Int(10));

    let Value::Cell(c) = cell else { unreachable!() };
    let Value::Struct(s) = c.lock().clone() else {
        unreachable!()
    };
    assert_eq!(s.fields[0], Value::Int(10), "caller sees the increment");
    assert_eq!(s.fields[1], Value::Int(5), "sibling field untouched");
}

#[test]
fn byvalue_struct_parameter_mutation_stays_local() {
    // The same increment through a by-value parameter mutates the
    // callee's copy only.
    let pair = int_pair_struct();
    let v = Var::new("v", Ty::Struct(pair.clone()));
    let body = Expr::pre_increment(Expr::field(Expr::param(&v), "a"));
    let f = compile_fn(vec![v], body);

    let arg = Value::struct_val(pair, vec![Value::Int(9), Value::Int(5)]);
    assert_eq!(f.call(vec![arg.clone()]).unwrap(), Value::Int(10));
    let Value::Struct(s) = arg else { unreachable!() };
    assert_eq!(s.fields[0], Value::Int(9), "caller's copy unchanged");
}

#[test]
fn byref_plain_parameter_assignment_writes_through() {
    let x = Var::by_ref("x", Ty::Int);
    let body = Expr::assign(Expr::param(&x), Expr::constant(Value::Int(42)));
    let f = compile_fn(vec![x], body);

    let cell = Value::cell(Value::Int(0));
    assert_eq!(f.call(vec![cell.clone()]).unwrap(), Value::Int(42));
    let Value::Cell(c) = cell else { unreachable!() };
    assert_eq!(c.lock().clone(), Value::Int(42));
}
