//! Code builder: instruction emission and label resolution.
//!
//! `CodeBuilder` provides the append-only emission surface the code
//! generator drives:
//!
//! - instruction append with smallest-encoding constant selection
//! - constant/type/native pools with deduplication
//! - scratch-local allocation with a free list
//! - label creation, binding, and a forward-reference fixup table whose
//!   provisional branch operands are patched in place at `finish`
//! - running and maximum stack-depth bookkeeping
//!
//! Depth bookkeeping is defensive, not user-facing: an append that would
//! drive the depth negative, or a branch whose depth disagrees with its
//! target, poisons the builder, and `finish` reports an internal
//! invariant violation instead of producing a unit.

use super::code::{CodeUnit, ExceptionEntry, SwitchTable};
use super::instruction::{Instruction, Opcode};
use crate::error::{CompileError, CompileResult};
use ember_core::{NativeFn, Ty, Value};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A label for branch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A forward reference to a label that needs patching.
#[derive(Debug)]
struct ForwardRef {
    /// Instruction index containing the provisional operand.
    at: usize,
    /// The referenced label.
    label: Label,
}

/// Key type for constant deduplication. Only scalar constants
/// deduplicate; composite values keep one pool slot per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Unit,
    Null,
    Bool(bool),
    Int(i64),
    /// Float bits for exact comparison.
    Float(u64),
    Str(Arc<str>),
}

impl ConstKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Unit => Some(ConstKey::Unit),
            Value::Null => Some(ConstKey::Null),
            Value::Bool(b) => Some(ConstKey::Bool(*b)),
            Value::Int(n) => Some(ConstKey::Int(*n)),
            Value::Float(n) => Some(ConstKey::Float(n.to_bits())),
            Value::Str(s) => Some(ConstKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// A switch jump table whose targets are still labels.
#[derive(Debug)]
struct PendingSwitch {
    base: i64,
    targets: Vec<Label>,
    default: Label,
}

/// Builder for one code unit.
pub struct CodeBuilder {
    name: Arc<str>,
    arity: u16,
    param_byref: Vec<bool>,
    ret_ty: Ty,

    instructions: Vec<Instruction>,

    constants: Vec<Value>,
    constant_map: FxHashMap<ConstKey, u16>,
    types: Vec<Ty>,
    type_map: FxHashMap<Ty, u16>,
    natives: Vec<Arc<NativeFn>>,
    native_map: FxHashMap<usize, u16>,
    nested: Vec<Arc<CodeUnit>>,

    /// Declared locals plus scratch temporaries.
    local_count: u16,
    /// Freed scratch slots available for reuse.
    free_temps: Vec<u16>,

    next_label: u32,
    label_names: FxHashMap<Label, Arc<str>>,
    bound: FxHashMap<Label, u16>,
    bound_depth: FxHashMap<Label, u16>,
    forward_refs: Vec<ForwardRef>,
    /// Depth expected at a label, recorded by branches emitted before the
    /// label was bound.
    pending_depth: FxHashMap<Label, u16>,

    switch_tables: Vec<PendingSwitch>,
    exception_entries: Vec<ExceptionEntry>,

    cell_count: u16,
    captures: Vec<u16>,
    cell_params: Vec<(u16, u16)>,

    depth: u16,
    max_depth: u16,
    reachable: bool,
    poisoned: Option<&'static str>,
}

impl CodeBuilder {
    /// Create a builder for a lambda with the given signature.
    pub fn new(name: impl Into<Arc<str>>, param_byref: Vec<bool>, ret_ty: Ty) -> Self {
        Self {
            name: name.into(),
            arity: param_byref.len() as u16,
            param_byref,
            ret_ty,
            instructions: Vec::new(),
            constants: Vec::new(),
            constant_map: FxHashMap::default(),
            types: Vec::new(),
            type_map: FxHashMap::default(),
            natives: Vec::new(),
            native_map: FxHashMap::default(),
            nested: Vec::new(),
            local_count: 0,
            free_temps: Vec::new(),
            next_label: 0,
            label_names: FxHashMap::default(),
            bound: FxHashMap::default(),
            bound_depth: FxHashMap::default(),
            forward_refs: Vec::new(),
            pending_depth: FxHashMap::default(),
            switch_tables: Vec::new(),
            exception_entries: Vec::new(),
            cell_count: 0,
            captures: Vec::new(),
            cell_params: Vec::new(),
            depth: 0,
            max_depth: 0,
            reachable: true,
            poisoned: None,
        }
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Reserve a local slot for a declared variable.
    pub fn alloc_local(&mut self) -> u16 {
        let slot = self.local_count;
        self.local_count = self
            .local_count
            .checked_add(1)
            .expect("local slot overflow");
        slot
    }

    /// Allocate a scratch temporary, reusing a freed slot when one
    /// exists.
    pub fn alloc_temp(&mut self) -> u16 {
        self.free_temps.pop().unwrap_or_else(|| self.alloc_local())
    }

    /// Return a scratch temporary to the free list.
    pub fn free_temp(&mut self, slot: u16) {
        self.free_temps.push(slot);
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Add a constant, deduplicating scalars, and return its pool index.
    pub fn add_const(&mut self, value: Value) -> u16 {
        if let Some(key) = ConstKey::from_value(&value) {
            if let Some(&idx) = self.constant_map.get(&key) {
                return idx;
            }
            let idx = self.constants.len() as u16;
            self.constants.push(value);
            self.constant_map.insert(key, idx);
            idx
        } else {
            let idx = self.constants.len() as u16;
            self.constants.push(value);
            idx
        }
    }

    /// Add a type to the type pool and return its index.
    pub fn add_type(&mut self, ty: Ty) -> u16 {
        if let Some(&idx) = self.type_map.get(&ty) {
            return idx;
        }
        let idx = self.types.len() as u16;
        self.types.push(ty.clone());
        self.type_map.insert(ty, idx);
        idx
    }

    /// Add a native function to the pool and return its index.
    pub fn add_native(&mut self, f: &Arc<NativeFn>) -> u16 {
        let key = Arc::as_ptr(f) as usize;
        if let Some(&idx) = self.native_map.get(&key) {
            return idx;
        }
        let idx = self.natives.len() as u16;
        self.natives.push(f.clone());
        self.native_map.insert(key, idx);
        idx
    }

    /// Add a nested compiled unit and return its index.
    pub fn add_nested(&mut self, unit: Arc<CodeUnit>) -> u16 {
        let idx = self.nested.len() as u16;
        self.nested.push(unit);
        idx
    }

    // =========================================================================
    // Closure metadata
    // =========================================================================

    /// Record the closure-cell layout produced by scope analysis.
    pub fn set_cells(&mut self, cell_count: u16, captures: Vec<u16>, cell_params: Vec<(u16, u16)>) {
        self.cell_count = cell_count;
        self.captures = captures;
        self.cell_params = cell_params;
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn poison(&mut self, reason: &'static str) {
        if self.poisoned.is_none() {
            self.poisoned = Some(reason);
        }
    }

    /// Append one instruction, updating the depth bookkeeping.
    /// Instructions appended while the current point is unreachable
    /// (after an unconditional terminator, before the next label) are
    /// dropped.
    pub fn emit(&mut self, op: Opcode, aux: u8, imm: u16) {
        if !self.reachable || self.poisoned.is_some() {
            return;
        }
        if self.instructions.len() >= u16::MAX as usize {
            self.poison("code unit exceeds 65535 instructions");
            return;
        }
        let (pops, pushes) = op.stack_effect(aux, imm);
        if self.depth < pops {
            self.poison("operand stack underflow");
            return;
        }
        self.depth = self.depth - pops + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        self.instructions.push(Instruction::new(op, aux, imm));
        if op.is_terminator() {
            self.reachable = false;
        }
    }

    /// Append an instruction with no operands.
    pub fn emit_op(&mut self, op: Opcode) {
        self.emit(op, 0, 0);
    }

    /// Append an instruction with only an imm16 operand.
    pub fn emit_i(&mut self, op: Opcode, imm: u16) {
        self.emit(op, 0, imm);
    }

    /// Push a constant with the smallest legal encoding.
    pub fn push_value(&mut self, value: &Value) {
        match value {
            Value::Unit => self.emit_op(Opcode::PushUnit),
            Value::Null => self.emit_op(Opcode::PushNull),
            Value::Bool(true) => self.emit_op(Opcode::PushTrue),
            Value::Bool(false) => self.emit_op(Opcode::PushFalse),
            Value::Int(n) if i16::try_from(*n).is_ok() => {
                self.emit_i(Opcode::PushInt, *n as i16 as u16);
            }
            other => {
                let idx = self.add_const(other.clone());
                self.emit_i(Opcode::PushConst, idx);
            }
        }
    }

    // =========================================================================
    // Labels and branches
    // =========================================================================

    /// Create a fresh unbound label.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Create a fresh label carrying a diagnostic name.
    pub fn create_named_label(&mut self, name: Arc<str>) -> Label {
        let label = self.create_label();
        self.label_names.insert(label, name);
        label
    }

    fn label_name(&self, label: Label) -> Arc<str> {
        self.label_names
            .get(&label)
            .cloned()
            .unwrap_or_else(|| Arc::from(format!("L{}", label.0)))
    }

    /// Bind a label to the current position. Binding a label twice is a
    /// compile error.
    pub fn bind_label(&mut self, label: Label) -> CompileResult<()> {
        let pc = self.instructions.len() as u16;
        if self.bound.insert(label, pc).is_some() {
            return Err(CompileError::DuplicateLabel {
                name: self.label_name(label),
            });
        }
        if let Some(expected) = self.pending_depth.remove(&label) {
            if self.reachable && self.depth != expected {
                self.poison("stack depth mismatch at branch join");
            }
            self.depth = expected;
        }
        self.max_depth = self.max_depth.max(self.depth);
        self.bound_depth.insert(label, self.depth);
        self.reachable = true;
        Ok(())
    }

    fn record_branch_depth(&mut self, label: Label) {
        match self.bound_depth.get(&label) {
            Some(&expected) => {
                if self.depth != expected {
                    self.poison("stack depth mismatch at backward branch");
                }
            }
            None => {
                if let Some(&expected) = self.pending_depth.get(&label) {
                    if expected != self.depth {
                        self.poison("stack depth mismatch between branches to one label");
                    }
                } else {
                    self.pending_depth.insert(label, self.depth);
                }
            }
        }
    }

    fn emit_branch(&mut self, op: Opcode, label: Label) {
        if !self.reachable || self.poisoned.is_some() {
            return;
        }
        let at = self.instructions.len();
        // Provisional operand; the resolver patches it at finish.
        self.emit(op, 0, u16::MAX);
        if self.instructions.len() > at {
            self.forward_refs.push(ForwardRef { at, label });
            self.record_branch_depth(label);
        }
    }

    /// Unconditional jump.
    pub fn emit_jump(&mut self, label: Label) {
        self.emit_branch(Opcode::Jump, label);
    }

    /// Pop a bool and jump when it is false.
    pub fn emit_jump_if_false(&mut self, label: Label) {
        self.emit_branch(Opcode::JumpIfFalse, label);
    }

    /// Pop a bool and jump when it is true.
    pub fn emit_jump_if_true(&mut self, label: Label) {
        self.emit_branch(Opcode::JumpIfTrue, label);
    }

    /// Emit a `Switch` instruction over a jump table; targets resolve at
    /// finish. Depths for the targets are recorded after the scrutinee
    /// pop, so case labels bind at the pre-scrutinee depth.
    pub fn emit_switch(&mut self, base: i64, targets: Vec<Label>, default: Label) {
        if !self.reachable || self.poisoned.is_some() {
            return;
        }
        let idx = self.switch_tables.len() as u16;
        self.emit(Opcode::Switch, 0, idx);
        for &t in targets.iter().chain(std::iter::once(&default)) {
            self.record_branch_depth(t);
        }
        self.switch_tables.push(PendingSwitch {
            base,
            targets,
            default,
        });
        // A switch transfers unconditionally through the table.
        self.reachable = false;
    }

    // =========================================================================
    // Depth bookkeeping
    // =========================================================================

    /// Current stack depth.
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Current instruction offset.
    pub fn current_pc(&self) -> u16 {
        self.instructions.len() as u16
    }

    /// Resume emission at a known depth. Used for exception-handler entry
    /// points, which are reached through the table rather than a branch.
    pub fn resume_at_depth(&mut self, depth: u16) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
        self.reachable = true;
    }

    /// Record a protected-region table entry.
    pub fn add_exception_entry(&mut self, entry: ExceptionEntry) {
        self.exception_entries.push(entry);
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Patch all forward references and produce the finished unit.
    pub fn finish(mut self) -> CompileResult<Arc<CodeUnit>> {
        if let Some(reason) = self.poisoned {
            return Err(CompileError::Internal(reason));
        }

        // Resolve the fixup table: every provisional branch operand is
        // rewritten with its label's final offset.
        for fwd in &self.forward_refs {
            let target = *self.bound.get(&fwd.label).ok_or_else(|| {
                CompileError::UnresolvedLabel {
                    name: self.label_name(fwd.label),
                }
            })?;
            self.instructions[fwd.at] = self.instructions[fwd.at].with_imm(target);
        }

        let mut switch_tables = Vec::with_capacity(self.switch_tables.len());
        for pending in &self.switch_tables {
            let mut targets = Vec::with_capacity(pending.targets.len());
            for &label in &pending.targets {
                targets.push(*self.bound.get(&label).ok_or_else(|| {
                    CompileError::UnresolvedLabel {
                        name: self.label_name(label),
                    }
                })?);
            }
            let default =
                *self
                    .bound
                    .get(&pending.default)
                    .ok_or_else(|| CompileError::UnresolvedLabel {
                        name: self.label_name(pending.default),
                    })?;
            switch_tables.push(SwitchTable {
                base: pending.base,
                targets: targets.into_boxed_slice(),
                default,
            });
        }

        let end = self.instructions.len() as u16;
        for entry in &self.exception_entries {
            if entry.handler > end || entry.end > end {
                return Err(CompileError::Internal(
                    "exception handler offset out of range",
                ));
            }
        }

        Ok(Arc::new(CodeUnit {
            name: self.name,
            arity: self.arity,
            param_byref: self.param_byref.into_boxed_slice(),
            ret_ty: self.ret_ty,
            instructions: self.instructions.into_boxed_slice(),
            constants: self.constants.into_boxed_slice(),
            types: self.types.into_boxed_slice(),
            natives: self.natives.into_boxed_slice(),
            nested: self.nested.into_boxed_slice(),
            local_count: self.local_count,
            cell_count: self.cell_count,
            captures: self.captures.into_boxed_slice(),
            cell_params: self.cell_params.into_boxed_slice(),
            switch_tables: switch_tables.into_boxed_slice(),
            exception_table: self.exception_entries.into_boxed_slice(),
            max_stack: self.max_depth,
        }))
    }
}
