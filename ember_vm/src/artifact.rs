//! Executable binding: from a finished code unit to a callable artifact.
//!
//! `CompiledFn` binds an instruction sequence, its constant pool, and a
//! closure-cell collection into one invocable value. The artifact is
//! immutable after construction and safe to invoke concurrently; every
//! call builds a fresh frame. Nested lambdas become `CompiledFn`s too,
//! created by `MakeClosure` at run time with the enclosing frame's cells
//! selected by the unit's capture map.

use crate::interp::execute;
use ember_compiler::CodeUnit;
use ember_core::{Callable, CellRef, RuntimeResult, Value};
use std::fmt;
use std::sync::Arc;

/// A compiled, callable lambda.
pub struct CompiledFn {
    unit: Arc<CodeUnit>,
    /// Cells captured from the enclosing frame; empty for a root
    /// artifact.
    cells: Vec<CellRef>,
}

impl CompiledFn {
    /// Bind a root code unit into a callable artifact.
    ///
    /// Root units capture nothing; a unit with a non-empty capture map
    /// can only be instantiated by `MakeClosure` inside a running frame.
    pub fn bind(unit: Arc<CodeUnit>) -> CompiledFn {
        debug_assert!(
            unit.captures.is_empty(),
            "root artifact bound from a capturing unit"
        );
        CompiledFn {
            unit,
            cells: Vec::new(),
        }
    }

    /// Instantiate a nested unit over captured cells.
    pub(crate) fn with_cells(unit: Arc<CodeUnit>, cells: Vec<CellRef>) -> CompiledFn {
        CompiledFn { unit, cells }
    }

    /// The bound code unit.
    pub fn unit(&self) -> &Arc<CodeUnit> {
        &self.unit
    }

    /// Invoke with positional arguments. A by-reference parameter
    /// receives a [`Value::Cell`]; the callee writes the caller's
    /// storage through it.
    pub fn call(&self, args: Vec<Value>) -> RuntimeResult<Value> {
        execute(&self.unit, args, &self.cells)
    }
}

impl Callable for CompiledFn {
    fn invoke(&self, args: Vec<Value>) -> RuntimeResult<Value> {
        self.call(args)
    }
}

impl fmt::Debug for CompiledFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledFn({}/{})", self.unit.name, self.unit.arity)
    }
}
