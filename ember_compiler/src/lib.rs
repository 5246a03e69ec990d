//! Direct expression-tree to stack-bytecode compiler.
//!
//! This crate compiles an immutable [`ember_tree`] lambda straight to
//! linear bytecode for the Ember stack VM, in a single forward pass with
//! a two-pass label fixup — no intermediate representation. It trades
//! completeness for a clean abort: a construct outside the supported set
//! produces a typed refusal the caller can use to fall back to a
//! general-purpose reference compiler.
//!
//! # Architecture
//!
//! ```text
//! Tree → Scope & Closure Analysis → Code Generation → CodeUnit
//! ```
//!
//! # Key Types
//!
//! - [`compile_lambda`] / [`Options`] - the front door
//! - [`CodeUnit`] - compiled lambda with bytecode and metadata
//! - [`CodeBuilder`] - emission, pools, labels, stack-depth bookkeeping
//! - [`Instruction`] / [`Opcode`] - 32-bit stack-machine instructions
//! - [`CompileError`] / [`NotSupported`] - definitional errors vs.
//!   refusals

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod bytecode;
pub mod codegen;
pub mod error;
pub mod scope;

pub use bytecode::{
    disassemble, CodeBuilder, CodeUnit, ExceptionEntry, HandlerKind, Instruction, Label, Opcode,
    SwitchTable,
};
pub use codegen::{compile_lambda, Options};
pub use error::{CompileError, CompileResult, NotSupported};
pub use scope::{Analysis, ScopeAnalyzer, ScopeInfo, Storage};
