//! Runtime error definitions.
//!
//! One unified error enum covers every fault the VM or a native function
//! can raise. Faults are catchable inside compiled code only by
//! filterless catch handlers; values thrown explicitly travel in
//! [`RuntimeError::Thrown`] and match catch filters by runtime type.

use crate::value::Value;
use thiserror::Error;

/// Result type for VM execution and native calls.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A runtime failure during execution of compiled code.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// Integer division or remainder by zero.
    #[error("attempted to divide by zero")]
    DivideByZero,

    /// A nullable value was unwrapped while null.
    #[error("nullable value is null")]
    NullValue,

    /// Array index outside the array bounds.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// The offending index.
        index: i64,
        /// The array length.
        len: usize,
    },

    /// A value had an unexpected runtime shape.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the operation required.
        expected: &'static str,
        /// What was actually on the stack.
        found: &'static str,
    },

    /// A callable was invoked with the wrong number of arguments.
    #[error("expected {expected} argument(s), got {got}")]
    ArityMismatch {
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// A value thrown by compiled code, unwound past the artifact boundary
    /// or still in flight toward a handler.
    #[error("uncaught exception: {0:?}")]
    Thrown(Value),

    /// An internal VM invariant was violated. Indicates an engine defect,
    /// never user input.
    #[error("vm invariant violated: {0}")]
    Invariant(&'static str),
}

impl RuntimeError {
    /// Whether this error is an explicitly thrown value (as opposed to a
    /// VM fault).
    pub fn is_thrown(&self) -> bool {
        matches!(self, RuntimeError::Thrown(_))
    }
}
