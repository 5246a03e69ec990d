//! Finished code units.
//!
//! A [`CodeUnit`] is the immutable output of one lambda compilation:
//! instructions, pools, slot counts, the capture map for closures, the
//! exception table, and the stack-depth bound the VM sizes its operand
//! stack with. Nested lambdas compile to nested units referenced by
//! `MakeClosure`.

use super::instruction::Instruction;
use ember_core::{NativeFn, Ty, Value};
use std::fmt::Write as _;
use std::sync::Arc;

/// What a protected-region table entry does when it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// Transfer to a catch handler. The VM pushes the exception value
    /// before entering the handler.
    Catch {
        /// Type-pool index of the filter; `None` catches everything,
        /// including runtime faults.
        filter: Option<u16>,
    },
    /// Transfer to the unwind copy of a finally block; `EndFinally`
    /// resumes the suspended unwind.
    Finally,
}

/// One protected-region entry. Entries are ordered innermost-first; the
/// VM takes the first entry covering the faulting pc whose filter
/// matches. The table is consulted only while unwinding; normal control
/// flow never reads it.
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    /// First protected instruction.
    pub start: u16,
    /// One past the last protected instruction.
    pub end: u16,
    /// Handler entry point.
    pub handler: u16,
    /// Operand-stack depth at region entry; the VM truncates to this
    /// before transferring.
    pub depth: u16,
    /// Catch vs. finally.
    pub kind: HandlerKind,
}

/// A dense jump table for integral switches.
#[derive(Debug, Clone)]
pub struct SwitchTable {
    /// Case value of `targets[0]`.
    pub base: i64,
    /// Branch targets for `base..base + targets.len()`.
    pub targets: Box<[u16]>,
    /// Branch target for out-of-range scrutinees.
    pub default: u16,
}

/// A compiled lambda: the unit the Executable Builder binds and the VM
/// executes. Immutable after construction.
#[derive(Debug)]
pub struct CodeUnit {
    /// Name, for diagnostics and disassembly.
    pub name: Arc<str>,
    /// Declared parameter count.
    pub arity: u16,
    /// Per-parameter by-reference flags.
    pub param_byref: Box<[bool]>,
    /// Declared return type.
    pub ret_ty: Ty,
    /// The instruction sequence.
    pub instructions: Box<[Instruction]>,
    /// Constant pool.
    pub constants: Box<[Value]>,
    /// Type pool (conversion targets, catch filters, constructed types).
    pub types: Box<[Ty]>,
    /// Native-function pool.
    pub natives: Box<[Arc<NativeFn>]>,
    /// Nested compiled lambdas.
    pub nested: Box<[Arc<CodeUnit>]>,
    /// Local slot count (declared variables plus compiler temporaries).
    pub local_count: u16,
    /// Closure cells this unit materializes per invocation (cellvars).
    pub cell_count: u16,
    /// For each captured variable, the enclosing frame's cell slot to
    /// share. Captured cells sit after the unit's own cells.
    pub captures: Box<[u16]>,
    /// `(arg_slot, cell_slot)` pairs: captured parameters copied into
    /// their cells at frame entry.
    pub cell_params: Box<[(u16, u16)]>,
    /// Switch jump tables.
    pub switch_tables: Box<[SwitchTable]>,
    /// Protected-region table, innermost-first.
    pub exception_table: Box<[ExceptionEntry]>,
    /// Maximum operand-stack depth; the VM pre-sizes to this.
    pub max_stack: u16,
}

/// Render a code unit for diagnostics. Write-only tooling: nothing
/// behavioral depends on the output.
pub fn disassemble(unit: &CodeUnit) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "unit {} (arity {}, locals {}, cells {}+{}, max stack {})",
        unit.name,
        unit.arity,
        unit.local_count,
        unit.cell_count,
        unit.captures.len(),
        unit.max_stack
    );
    for (pc, inst) in unit.instructions.iter().enumerate() {
        let _ = writeln!(out, "  {pc:4}: {inst}");
    }
    if !unit.exception_table.is_empty() {
        let _ = writeln!(out, "  exception table:");
        for e in unit.exception_table.iter() {
            let _ = writeln!(
                out,
                "    [{}, {}) -> {} depth {} {:?}",
                e.start, e.end, e.handler, e.depth, e.kind
            );
        }
    }
    for nested in unit.nested.iter() {
        out.push_str(&disassemble(nested));
    }
    out
}
