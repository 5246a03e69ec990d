//! Core definitions shared by the Ember compiler and VM.
//!
//! This crate is the leaf of the workspace: it defines the managed value
//! universe ([`Value`] and its shared-reference wrappers), the static type
//! model ([`Ty`]), native function descriptors, and the unified runtime
//! error type. Both `ember_compiler` (constant pools, type pools) and
//! `ember_vm` (execution) build on these types.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod error;
pub mod ty;
pub mod value;

pub use error::{RuntimeError, RuntimeResult};
pub use ty::{FieldDef, StructTy, Ty};
pub use value::{Addr, ArrayRef, Callable, CellRef, ClosureRef, NativeFn, ObjRef, StructVal, Value};
