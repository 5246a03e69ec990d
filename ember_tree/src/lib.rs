//! Immutable expression tree model.
//!
//! Trees are built by a front end (or directly by tests), shared as
//! [`ExprRef`] arcs, and consumed read-only by the compiler. A sub-node
//! may be reachable from several parents; the tree is a DAG, never a
//! cycle, and the compiler re-emits a shared node at each occurrence.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod expr;

pub use expr::{
    AssignOp, BinaryOp, CatchClause, Expr, ExprKind, ExprRef, LabelRef, LabelTarget, LambdaExpr,
    SwitchCase, UnaryOp, Var, VarRef,
};
