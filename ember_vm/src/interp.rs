//! The stack-machine dispatch loop.
//!
//! One frame per invocation: argument slots, local slots, closure cells,
//! and an operand stack pre-sized to the unit's `max_stack`. Exception
//! handling is table-driven: normal control flow never consults the
//! table; a thrown value or runtime fault scans it from the faulting pc,
//! truncates the operand stack to the entry's recorded depth, and
//! transfers to the handler. A finally handler runs with the exception
//! suspended and `EndFinally` resumes the unwind where it left off.

use crate::artifact::CompiledFn;
use ember_compiler::bytecode::{HandlerKind, Instruction, Opcode};
use ember_compiler::CodeUnit;
use ember_core::{Addr, CellRef, RuntimeError, RuntimeResult, StructVal, Ty, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// What one executed instruction does to control flow.
enum Flow {
    Continue,
    Jump(u16),
    Return(Value),
    EndFinally,
}

struct Frame<'a> {
    unit: &'a CodeUnit,
    args: Vec<Value>,
    locals: Vec<Value>,
    cells: Vec<CellRef>,
    stack: Vec<Value>,
}

impl Frame<'_> {
    fn pop(&mut self) -> RuntimeResult<Value> {
        self.stack
            .pop()
            .ok_or(RuntimeError::Invariant("operand stack underflow"))
    }

    fn pop_int(&mut self) -> RuntimeResult<i64> {
        self.pop()?.expect_int()
    }

    fn pop_bool(&mut self) -> RuntimeResult<bool> {
        self.pop()?.expect_bool()
    }

    /// Pop `n` values, preserving their push order.
    fn pop_args(&mut self, n: usize) -> RuntimeResult<Vec<Value>> {
        let len = self.stack.len();
        if len < n {
            return Err(RuntimeError::Invariant("operand stack underflow"));
        }
        Ok(self.stack.split_off(len - n))
    }

    fn arg_slot(&mut self, slot: u16) -> RuntimeResult<&mut Value> {
        self.args
            .get_mut(slot as usize)
            .ok_or(RuntimeError::Invariant("argument slot out of range"))
    }

    fn local_slot(&mut self, slot: u16) -> RuntimeResult<&mut Value> {
        self.locals
            .get_mut(slot as usize)
            .ok_or(RuntimeError::Invariant("local slot out of range"))
    }

    fn cell(&self, slot: u16) -> RuntimeResult<&CellRef> {
        self.cells
            .get(slot as usize)
            .ok_or(RuntimeError::Invariant("cell slot out of range"))
    }

    /// Read through an address.
    fn addr_load(&self, addr: &Addr) -> RuntimeResult<Value> {
        match addr {
            Addr::Arg(slot) => self
                .args
                .get(*slot as usize)
                .cloned()
                .ok_or(RuntimeError::Invariant("argument slot out of range")),
            Addr::Local(slot) => self
                .locals
                .get(*slot as usize)
                .cloned()
                .ok_or(RuntimeError::Invariant("local slot out of range")),
            Addr::Cell(cell) => Ok(cell.lock().clone()),
            Addr::Obj(obj) => Ok(Value::Obj(obj.clone())),
            Addr::Elem(array, index) => array.get(*index),
            Addr::Field(base, field) => match self.addr_load(base)? {
                Value::Struct(s) => s
                    .fields
                    .get(*field as usize)
                    .cloned()
                    .ok_or(RuntimeError::Invariant("struct field index out of range")),
                Value::Obj(o) => o.get_field(*field),
                Value::Null => Err(RuntimeError::NullValue),
                other => Err(RuntimeError::TypeMismatch {
                    expected: "struct",
                    found: other.kind_name(),
                }),
            },
        }
    }

    /// Write through an address. Field writes into value-type structs
    /// read the enclosing storage, patch the field, and write the struct
    /// back, so mutation lands in place however deep the path roots.
    fn addr_store(&mut self, addr: &Addr, value: Value) -> RuntimeResult<()> {
        match addr {
            Addr::Arg(slot) => {
                *self.arg_slot(*slot)? = value;
                Ok(())
            }
            Addr::Local(slot) => {
                *self.local_slot(*slot)? = value;
                Ok(())
            }
            Addr::Cell(cell) => {
                *cell.lock() = value;
                Ok(())
            }
            Addr::Obj(_) => Err(RuntimeError::Invariant("store to an object root")),
            Addr::Elem(array, index) => array.set(*index, value),
            Addr::Field(base, field) => match self.addr_load(base)? {
                // Reference semantics: the write needs no write-back.
                Value::Obj(o) => o.set_field(*field, value),
                Value::Struct(mut s) => {
                    match s.fields.get_mut(*field as usize) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(RuntimeError::Invariant("struct field index out of range"))
                        }
                    }
                    self.addr_store(base, Value::Struct(s))
                }
                Value::Null => Err(RuntimeError::NullValue),
                other => Err(RuntimeError::TypeMismatch {
                    expected: "struct",
                    found: other.kind_name(),
                }),
            },
        }
    }
}

/// The default value of a type.
fn default_of(ty: &Ty) -> Value {
    match ty {
        Ty::Unit => Value::Unit,
        Ty::Bool => Value::Bool(false),
        Ty::Int => Value::Int(0),
        Ty::Float => Value::Float(0.0),
        Ty::Str => Value::str(""),
        Ty::Nullable(_) => Value::Null,
        Ty::Struct(s) if !s.reference => Value::Struct(StructVal {
            ty: s.clone(),
            fields: s.fields.iter().map(|f| default_of(&f.ty)).collect(),
        }),
        // Reference types default to the null reference.
        Ty::Struct(_) | Ty::Array(_) | Ty::Func => Value::Null,
    }
}

fn arith(op: Opcode, l: Value, r: Value) -> RuntimeResult<Value> {
    use Opcode::*;
    match (op, l, r) {
        (Add, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
        (Sub, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(b))),
        (Mul, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(b))),
        (Div, Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivideByZero),
        (Div, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(b))),
        (Rem, Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivideByZero),
        (Rem, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),

        (Add, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Sub, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Mul, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (Div, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Rem, Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),

        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{a}{b}"))),

        (BitAnd, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a & b)),
        (BitOr, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a | b)),
        (BitXor, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a ^ b)),
        (BitAnd, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a & b)),
        (BitOr, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a | b)),
        (BitXor, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a ^ b)),
        (Shl, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_shl(b as u32 & 63))),
        (Shr, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_shr(b as u32 & 63))),

        (_, l, r) => Err(RuntimeError::TypeMismatch {
            expected: "matching numeric operands",
            found: if matches!(l, Value::Int(_) | Value::Float(_)) {
                r.kind_name()
            } else {
                l.kind_name()
            },
        }),
    }
}

fn compare(op: Opcode, l: Value, r: Value) -> RuntimeResult<Value> {
    use Opcode::*;
    match op {
        Eq => return Ok(Value::Bool(l == r)),
        Ne => return Ok(Value::Bool(l != r)),
        _ => {}
    }
    let result = match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => match op {
            Lt => a < b,
            Le => a <= b,
            Gt => a > b,
            Ge => a >= b,
            _ => return Err(RuntimeError::Invariant("non-comparison opcode")),
        },
        (Value::Float(a), Value::Float(b)) => match op {
            Lt => a < b,
            Le => a <= b,
            Gt => a > b,
            Ge => a >= b,
            _ => return Err(RuntimeError::Invariant("non-comparison opcode")),
        },
        (Value::Str(a), Value::Str(b)) => match op {
            Lt => a < b,
            Le => a <= b,
            Gt => a > b,
            Ge => a >= b,
            _ => return Err(RuntimeError::Invariant("non-comparison opcode")),
        },
        _ => {
            return Err(RuntimeError::TypeMismatch {
                expected: "comparable operands",
                found: l.kind_name(),
            })
        }
    };
    Ok(Value::Bool(result))
}

fn step(frame: &mut Frame<'_>, op: Opcode, inst: Instruction) -> RuntimeResult<Flow> {
    let unit = frame.unit;
    match op {
        Opcode::Nop => {}

        // --- Constants ---
        Opcode::PushConst => {
            let value = unit
                .constants
                .get(inst.imm() as usize)
                .cloned()
                .ok_or(RuntimeError::Invariant("constant index out of range"))?;
            frame.stack.push(value);
        }
        Opcode::PushInt => frame.stack.push(Value::Int(inst.imm_i16() as i64)),
        Opcode::PushTrue => frame.stack.push(Value::Bool(true)),
        Opcode::PushFalse => frame.stack.push(Value::Bool(false)),
        Opcode::PushNull => frame.stack.push(Value::Null),
        Opcode::PushUnit => frame.stack.push(Value::Unit),
        Opcode::PushDefault => {
            let ty = unit
                .types
                .get(inst.imm() as usize)
                .ok_or(RuntimeError::Invariant("type index out of range"))?;
            frame.stack.push(default_of(ty));
        }

        // --- Stack shuffling ---
        Opcode::Dup => {
            let top = frame
                .stack
                .last()
                .cloned()
                .ok_or(RuntimeError::Invariant("operand stack underflow"))?;
            frame.stack.push(top);
        }
        Opcode::Pop => {
            frame.pop()?;
        }

        // --- Variables ---
        Opcode::LoadArg => {
            let value = frame.arg_slot(inst.imm())?.clone();
            frame.stack.push(value);
        }
        Opcode::StoreArg => {
            let value = frame.pop()?;
            *frame.arg_slot(inst.imm())? = value;
        }
        Opcode::LoadLocal => {
            let value = frame.local_slot(inst.imm())?.clone();
            frame.stack.push(value);
        }
        Opcode::StoreLocal => {
            let value = frame.pop()?;
            *frame.local_slot(inst.imm())? = value;
        }
        Opcode::LoadCell => {
            let value = frame.cell(inst.imm())?.lock().clone();
            frame.stack.push(value);
        }
        Opcode::StoreCell => {
            let value = frame.pop()?;
            *frame.cell(inst.imm())?.lock() = value;
        }

        // --- Addresses ---
        Opcode::ArgAddr => frame.stack.push(Value::Addr(Addr::Arg(inst.imm()))),
        Opcode::LocalAddr => frame.stack.push(Value::Addr(Addr::Local(inst.imm()))),
        Opcode::CellAddr => {
            let cell = frame.cell(inst.imm())?.clone();
            frame.stack.push(Value::Addr(Addr::Cell(cell)));
        }
        Opcode::FieldAddr => {
            let base = match frame.pop()? {
                Value::Addr(a) => a,
                Value::Cell(c) => Addr::Cell(c),
                Value::Obj(o) => Addr::Obj(o),
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "address",
                        found: other.kind_name(),
                    })
                }
            };
            frame
                .stack
                .push(Value::Addr(Addr::Field(Box::new(base), inst.imm())));
        }
        Opcode::ElemAddr => {
            let index = frame.pop_int()?;
            match frame.pop()? {
                Value::Array(a) => frame.stack.push(Value::Addr(Addr::Elem(a, index))),
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "array",
                        found: other.kind_name(),
                    })
                }
            }
        }
        Opcode::LoadInd => {
            let value = match frame.pop()? {
                Value::Addr(a) => frame.addr_load(&a)?,
                Value::Cell(c) => c.lock().clone(),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "address",
                        found: other.kind_name(),
                    })
                }
            };
            frame.stack.push(value);
        }
        Opcode::StoreInd => {
            let value = frame.pop()?;
            match frame.pop()? {
                Value::Addr(a) => frame.addr_store(&a, value)?,
                Value::Cell(c) => *c.lock() = value,
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "address",
                        found: other.kind_name(),
                    })
                }
            }
        }

        // --- Members ---
        Opcode::LoadField => {
            let value = match frame.pop()? {
                Value::Struct(s) => s
                    .fields
                    .get(inst.imm() as usize)
                    .cloned()
                    .ok_or(RuntimeError::Invariant("struct field index out of range"))?,
                Value::Obj(o) => o.get_field(inst.imm())?,
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "struct",
                        found: other.kind_name(),
                    })
                }
            };
            frame.stack.push(value);
        }
        Opcode::StoreField => {
            let value = frame.pop()?;
            match frame.pop()? {
                Value::Obj(o) => o.set_field(inst.imm(), value)?,
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "object",
                        found: other.kind_name(),
                    })
                }
            }
        }
        Opcode::LoadElem => {
            let index = frame.pop_int()?;
            match frame.pop()? {
                Value::Array(a) => frame.stack.push(a.get(index)?),
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "array",
                        found: other.kind_name(),
                    })
                }
            }
        }
        Opcode::StoreElem => {
            let value = frame.pop()?;
            let index = frame.pop_int()?;
            match frame.pop()? {
                Value::Array(a) => a.set(index, value)?,
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "array",
                        found: other.kind_name(),
                    })
                }
            }
        }

        // --- Construction ---
        Opcode::NewArray => {
            let elems = frame.pop_args(inst.imm() as usize)?;
            frame.stack.push(Value::array(elems));
        }
        Opcode::NewStruct | Opcode::NewObj => {
            let fields = frame.pop_args(inst.aux() as usize)?;
            let ty = unit
                .types
                .get(inst.imm() as usize)
                .ok_or(RuntimeError::Invariant("type index out of range"))?;
            let Ty::Struct(s) = ty else {
                return Err(RuntimeError::Invariant("construction of a non-struct type"));
            };
            let value = if op == Opcode::NewObj {
                Value::obj(s.clone(), fields)
            } else {
                Value::struct_val(s.clone(), fields)
            };
            frame.stack.push(value);
        }
        Opcode::MakeClosure => {
            let nested = unit
                .nested
                .get(inst.imm() as usize)
                .cloned()
                .ok_or(RuntimeError::Invariant("nested unit index out of range"))?;
            let mut captured = Vec::with_capacity(nested.captures.len());
            for &slot in nested.captures.iter() {
                captured.push(frame.cell(slot)?.clone());
            }
            frame.stack.push(Value::Closure(Arc::new(CompiledFn::with_cells(
                nested, captured,
            ))));
        }

        // --- Arithmetic / logic ---
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Rem
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Shl
        | Opcode::Shr => {
            let r = frame.pop()?;
            let l = frame.pop()?;
            frame.stack.push(arith(op, l, r)?);
        }
        Opcode::Neg => {
            let value = match frame.pop()? {
                Value::Int(n) => Value::Int(n.wrapping_neg()),
                Value::Float(f) => Value::Float(-f),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "numeric operand",
                        found: other.kind_name(),
                    })
                }
            };
            frame.stack.push(value);
        }
        Opcode::Not => {
            let b = frame.pop_bool()?;
            frame.stack.push(Value::Bool(!b));
        }
        Opcode::BitNot => {
            let n = frame.pop_int()?;
            frame.stack.push(Value::Int(!n));
        }

        // --- Comparison ---
        Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            let r = frame.pop()?;
            let l = frame.pop()?;
            frame.stack.push(compare(op, l, r)?);
        }

        // --- Nullable / conversion ---
        Opcode::IsNull => {
            let v = frame.pop()?;
            frame.stack.push(Value::Bool(v.is_null()));
        }
        Opcode::UnwrapNullable => {
            let v = frame.pop()?;
            if v.is_null() {
                return Err(RuntimeError::NullValue);
            }
            frame.stack.push(v);
        }
        Opcode::ConvIntToFloat => {
            let n = frame.pop_int()?;
            frame.stack.push(Value::Float(n as f64));
        }
        Opcode::ConvFloatToInt => {
            let f = frame.pop()?.expect_float()?;
            frame.stack.push(Value::Int(f as i64));
        }

        // --- Control flow ---
        Opcode::Jump => return Ok(Flow::Jump(inst.imm())),
        Opcode::JumpIfFalse => {
            if !frame.pop_bool()? {
                return Ok(Flow::Jump(inst.imm()));
            }
        }
        Opcode::JumpIfTrue => {
            if frame.pop_bool()? {
                return Ok(Flow::Jump(inst.imm()));
            }
        }
        Opcode::Switch => {
            let table = unit
                .switch_tables
                .get(inst.imm() as usize)
                .ok_or(RuntimeError::Invariant("switch table index out of range"))?;
            let n = frame.pop_int()?;
            let target = n
                .checked_sub(table.base)
                .and_then(|offset| usize::try_from(offset).ok())
                .and_then(|offset| table.targets.get(offset).copied())
                .unwrap_or(table.default);
            return Ok(Flow::Jump(target));
        }
        Opcode::Return => return Ok(Flow::Return(frame.pop()?)),

        // --- Calls ---
        Opcode::CallNative | Opcode::TailCallNative => {
            let mut argv = frame.pop_args(inst.aux() as usize)?;
            let native = unit
                .natives
                .get(inst.imm() as usize)
                .ok_or(RuntimeError::Invariant("native index out of range"))?;
            frame.stack.push(native.call(&mut argv)?);
        }
        Opcode::Invoke | Opcode::TailInvoke => {
            let argv = frame.pop_args(inst.aux() as usize)?;
            match frame.pop()? {
                Value::Closure(c) => frame.stack.push(c.invoke(argv)?),
                Value::Null => return Err(RuntimeError::NullValue),
                other => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "closure",
                        found: other.kind_name(),
                    })
                }
            }
        }

        // --- Exceptions ---
        Opcode::Throw => {
            let v = frame.pop()?;
            return Err(RuntimeError::Thrown(v));
        }
        Opcode::EndFinally => return Ok(Flow::EndFinally),
    }
    Ok(Flow::Continue)
}

fn entry_matches(kind: &HandlerKind, err: &RuntimeError, types: &[Ty]) -> bool {
    match kind {
        HandlerKind::Finally => true,
        HandlerKind::Catch { filter: None } => true,
        HandlerKind::Catch { filter: Some(idx) } => match err {
            RuntimeError::Thrown(v) => types
                .get(*idx as usize)
                .is_some_and(|ty| v.matches_ty(ty)),
            // Runtime faults carry no value; only a filterless catch
            // takes them.
            _ => false,
        },
    }
}

fn exception_value(err: &RuntimeError) -> Value {
    match err {
        RuntimeError::Thrown(v) => v.clone(),
        other => Value::str(other.to_string()),
    }
}

/// Find a handler for `err` raised at `throw_pc`, scanning the table
/// from `start_idx`, and transfer to it. Returns the handler pc, or the
/// error itself when the frame has no handler left.
fn transfer(
    frame: &mut Frame<'_>,
    unwinds: &mut Vec<(RuntimeError, usize, usize)>,
    err: RuntimeError,
    throw_pc: usize,
    start_idx: usize,
) -> RuntimeResult<usize> {
    let unit = frame.unit;
    for (idx, entry) in unit.exception_table.iter().enumerate().skip(start_idx) {
        let covers = (entry.start as usize) <= throw_pc && throw_pc < entry.end as usize;
        if !covers || !entry_matches(&entry.kind, &err, &unit.types) {
            continue;
        }
        frame.stack.truncate(entry.depth as usize);
        match entry.kind {
            HandlerKind::Catch { .. } => {
                frame.stack.push(exception_value(&err));
            }
            HandlerKind::Finally => {
                unwinds.push((err, throw_pc, idx + 1));
            }
        }
        return Ok(entry.handler as usize);
    }
    Err(err)
}

/// Execute a code unit with the given arguments and captured cells.
pub(crate) fn execute(
    unit: &CodeUnit,
    args: Vec<Value>,
    captured: &[CellRef],
) -> RuntimeResult<Value> {
    if args.len() != unit.arity as usize {
        return Err(RuntimeError::ArityMismatch {
            expected: unit.arity as usize,
            got: args.len(),
        });
    }
    for (i, byref) in unit.param_byref.iter().enumerate() {
        if *byref && !matches!(args[i], Value::Cell(_)) {
            return Err(RuntimeError::TypeMismatch {
                expected: "cell for a by-reference parameter",
                found: args[i].kind_name(),
            });
        }
    }
    if captured.len() != unit.captures.len() {
        return Err(RuntimeError::Invariant("capture count mismatch"));
    }

    let mut cells: Vec<CellRef> = Vec::with_capacity(unit.cell_count as usize + captured.len());
    for _ in 0..unit.cell_count {
        cells.push(Arc::new(Mutex::new(Value::Unit)));
    }
    cells.extend(captured.iter().cloned());

    let mut frame = Frame {
        unit,
        locals: vec![Value::Unit; unit.local_count as usize],
        cells,
        stack: Vec::with_capacity(unit.max_stack as usize),
        args,
    };

    // Captured parameters live in their cells from the first instruction.
    for &(arg_slot, cell_slot) in unit.cell_params.iter() {
        let value = frame.arg_slot(arg_slot)?.clone();
        *frame.cell(cell_slot)?.lock() = value;
    }

    let mut unwinds: Vec<(RuntimeError, usize, usize)> = Vec::new();
    let mut pc: usize = 0;
    loop {
        let inst = *frame
            .unit
            .instructions
            .get(pc)
            .ok_or(RuntimeError::Invariant("pc out of range"))?;
        let op = inst
            .opcode()
            .ok_or(RuntimeError::Invariant("invalid opcode"))?;
        let at = pc;
        pc += 1;
        match step(&mut frame, op, inst) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Jump(target)) => pc = target as usize,
            Ok(Flow::Return(value)) => return Ok(value),
            Ok(Flow::EndFinally) => {
                let (err, throw_pc, next_idx) = unwinds
                    .pop()
                    .ok_or(RuntimeError::Invariant("finally unwind state missing"))?;
                pc = transfer(&mut frame, &mut unwinds, err, throw_pc, next_idx)?;
            }
            Err(err) => {
                pc = transfer(&mut frame, &mut unwinds, err, at, 0)?;
            }
        }
    }
}
