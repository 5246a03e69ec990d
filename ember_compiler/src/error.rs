//! Compile error taxonomy.
//!
//! Three failure families, per the engine contract:
//!
//! - **Refusals** ([`CompileError::NotSupported`]): the tree contains a
//!   construct this compiler does not implement. A first-class outcome,
//!   not a defect; callers fall back to their reference compiler. No
//!   partially emitted state is reachable after a refusal.
//! - **Definitional errors**: the input tree is malformed (undefined
//!   variable, duplicate or unresolved label). Never silently patched.
//! - **Internal invariant violations**: an engine defect (negative stack
//!   depth, out-of-range branch target), fatal to the one compilation.

use ember_core::Ty;
use ember_tree::{BinaryOp, UnaryOp};
use std::sync::Arc;
use thiserror::Error;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Why a tree was refused.
#[derive(Error, Debug, Clone)]
pub enum NotSupported {
    /// A node kind outside the supported set.
    #[error("node kind {0}")]
    Node(&'static str),

    /// A binary operator applied to a type it is not implemented for.
    #[error("operator {op:?} on operand type {ty}")]
    Operator {
        /// The operator.
        op: BinaryOp,
        /// The offending operand type.
        ty: Ty,
    },

    /// A unary operator applied to a type it is not implemented for.
    #[error("unary operator {op:?} on operand type {ty}")]
    UnaryOperator {
        /// The operator.
        op: UnaryOp,
        /// The offending operand type.
        ty: Ty,
    },

    /// A conversion with no emission strategy.
    #[error("conversion from {from} to {to}")]
    Conversion {
        /// Source type.
        from: Ty,
        /// Target type.
        to: Ty,
    },

    /// A tail-qualified call in a context where tail semantics cannot be
    /// honored.
    #[error("tail call inside a protected region")]
    TailCallInProtectedRegion,

    /// A tail-qualified call whose value is not the lambda's return
    /// value.
    #[error("tail call outside return position")]
    TailCallPosition,

    /// A goto whose target lies inside a protected region the jump does
    /// not start in.
    #[error("jump into a protected region")]
    JumpIntoProtectedRegion,

    /// An assignment target shape with no address strategy.
    #[error("assignment target {0}")]
    AssignTarget(&'static str),

    /// A switch scrutinee type with no comparison strategy.
    #[error("switch over type {0}")]
    SwitchScrutinee(Ty),
}

/// A failed compilation.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    /// Unsupported-construct refusal; fall back to the reference
    /// compiler.
    #[error("not supported: {0}")]
    NotSupported(#[from] NotSupported),

    /// A variable referenced but declared in no enclosing scope.
    #[error("variable '{name}' is not defined in any enclosing scope")]
    UndefinedVariable {
        /// The variable's surface name.
        name: Arc<str>,
    },

    /// A label defined more than once in its lambda.
    #[error("label '{name}' is defined more than once")]
    DuplicateLabel {
        /// The label's surface name.
        name: Arc<str>,
    },

    /// A label referenced but never defined.
    #[error("label '{name}' is referenced but never defined")]
    UnresolvedLabel {
        /// The label's surface name.
        name: Arc<str>,
    },

    /// An engine defect detected defensively.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl CompileError {
    /// Whether this outcome is an unsupported-construct refusal (fall
    /// back) rather than a malformed tree or an engine defect.
    pub fn is_refusal(&self) -> bool {
        matches!(self, CompileError::NotSupported(_))
    }
}
