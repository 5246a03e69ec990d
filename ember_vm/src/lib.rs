//! The Ember stack virtual machine and executable binding.
//!
//! This crate turns a compiled [`CodeUnit`](ember_compiler::CodeUnit)
//! into an invocable artifact and executes it. The usual entry point is
//! [`compile`], which runs the fast tree-to-bytecode compiler and binds
//! the result:
//!
//! ```
//! use ember_core::{Ty, Value};
//! use ember_tree::{Expr, ExprKind, Var};
//! use ember_vm::{compile, Options};
//!
//! let x = Var::new("x", Ty::Int);
//! let tree = Expr::lambda("double", vec![x.clone()],
//!     Expr::add(Expr::param(&x), Expr::param(&x)));
//! let ExprKind::Lambda(lambda) = &tree.kind else { unreachable!() };
//!
//! let f = compile(lambda, Options::default()).unwrap();
//! assert_eq!(f.call(vec![Value::Int(21)]).unwrap(), Value::Int(42));
//! ```
//!
//! On a refusal (`CompileError::is_refusal()`), callers fall back to
//! their reference compiler; the refusal never leaves partial state.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod artifact;
mod interp;

pub use artifact::CompiledFn;
pub use ember_compiler::{disassemble, CompileError, NotSupported, Options};

use ember_tree::LambdaExpr;
use std::sync::Arc;
use tracing::debug;

/// Compile a lambda tree and bind it into a callable artifact.
pub fn compile(lambda: &Arc<LambdaExpr>, options: Options) -> Result<CompiledFn, CompileError> {
    let unit = ember_compiler::compile_lambda(lambda, &options)?;
    debug!(name = %unit.name, "binding executable");
    Ok(CompiledFn::bind(unit))
}
