//! The managed value universe.
//!
//! Every quantity a compiled artifact computes with is a [`Value`].
//! Scalars are inline; strings are shared immutable buffers; arrays and
//! objects have reference semantics behind `Arc`; structs are value types
//! copied on assignment. Two variants exist for the machinery of compiled
//! code rather than user data:
//!
//! - [`Value::Cell`] — a shared mutable slot. Cells back closure-captured
//!   variables and by-reference arguments; both the enclosing and nested
//!   artifact (or the caller and callee) hold the same `Arc`.
//! - [`Value::Addr`] — the address of an assignable place, formed on the
//!   operand stack so a compound assignment reads and writes its target
//!   without re-evaluating the receiver. Addresses never escape a frame.
//!
//! Locking uses `parking_lot`, which keeps compiled artifacts `Send +
//! Sync`; concurrent invocations mutating the same captured slot get
//! plain load/store atomicity and nothing more.

use crate::error::{RuntimeError, RuntimeResult};
use crate::ty::{StructTy, Ty};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// A shared mutable slot: one closure cell or one by-reference argument.
pub type CellRef = Arc<Mutex<Value>>;

/// An array with reference semantics.
#[derive(Clone)]
pub struct ArrayRef(Arc<RwLock<Vec<Value>>>);

impl ArrayRef {
    /// Create an array from its elements.
    pub fn new(elems: Vec<Value>) -> Self {
        ArrayRef(Arc::new(RwLock::new(elems)))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Read the element at `index`, bounds-checked.
    pub fn get(&self, index: i64) -> RuntimeResult<Value> {
        let guard = self.0.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| guard.get(i).cloned())
            .ok_or(RuntimeError::IndexOutOfRange {
                index,
                len: guard.len(),
            })
    }

    /// Write the element at `index`, bounds-checked.
    pub fn set(&self, index: i64, value: Value) -> RuntimeResult<()> {
        let mut guard = self.0.write();
        let len = guard.len();
        match usize::try_from(index).ok().and_then(|i| guard.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::IndexOutOfRange { index, len }),
        }
    }

    /// Whether two references alias the same array.
    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0.read())
    }
}

/// A reference-type object instance.
#[derive(Clone)]
pub struct ObjRef {
    ty: Arc<StructTy>,
    fields: Arc<RwLock<Box<[Value]>>>,
}

impl ObjRef {
    /// Allocate an object of `ty` with the given field values.
    pub fn new(ty: Arc<StructTy>, fields: Vec<Value>) -> Self {
        ObjRef {
            ty,
            fields: Arc::new(RwLock::new(fields.into_boxed_slice())),
        }
    }

    /// The object's type.
    pub fn ty(&self) -> &Arc<StructTy> {
        &self.ty
    }

    /// Read field `index`.
    pub fn get_field(&self, index: u16) -> RuntimeResult<Value> {
        self.fields
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(RuntimeError::Invariant("object field index out of range"))
    }

    /// Write field `index`.
    pub fn set_field(&self, index: u16, value: Value) -> RuntimeResult<()> {
        match self.fields.write().get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::Invariant("object field index out of range")),
        }
    }

    /// Whether two references alias the same object.
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.ty.name, &*self.fields.read())
    }
}

/// A value-type struct instance. `Clone` copies the fields.
#[derive(Debug, Clone)]
pub struct StructVal {
    /// The struct's type.
    pub ty: Arc<StructTy>,
    /// Field values in declaration order.
    pub fields: Box<[Value]>,
}

/// The address of an assignable place, resolved against the current frame.
#[derive(Debug, Clone)]
pub enum Addr {
    /// An argument slot of the current frame.
    Arg(u16),
    /// A local slot of the current frame.
    Local(u16),
    /// A closure cell or by-reference slot.
    Cell(CellRef),
    /// An object rooting a field path. Objects have reference semantics,
    /// so the object value is its own address and field writes through
    /// it need no write-back.
    Obj(ObjRef),
    /// An element of an array.
    Elem(ArrayRef, i64),
    /// A field reached through another address (in-place struct access).
    Field(Box<Addr>, u16),
}

/// Anything invocable with the VM calling convention: compiled artifacts
/// and runtime closures.
pub trait Callable: Send + Sync + fmt::Debug {
    /// Invoke with positional arguments. By-reference parameters receive
    /// a [`Value::Cell`] the callee writes through.
    fn invoke(&self, args: Vec<Value>) -> RuntimeResult<Value>;
}

/// Shared handle to a callable value.
pub type ClosureRef = Arc<dyn Callable>;

/// A host function callable from compiled code.
///
/// Natives are resolved at tree construction time and stored in the code
/// unit's native pool; the VM calls straight through the boxed closure.
pub struct NativeFn {
    name: Arc<str>,
    arity: usize,
    f: Box<dyn Fn(&mut [Value]) -> RuntimeResult<Value> + Send + Sync>,
}

impl NativeFn {
    /// Create a native function descriptor.
    pub fn new(
        name: impl Into<Arc<str>>,
        arity: usize,
        f: impl Fn(&mut [Value]) -> RuntimeResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(NativeFn {
            name: name.into(),
            arity,
            f: Box::new(f),
        })
    }

    /// The function's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter count.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Call the function with an argument slice.
    pub fn call(&self, args: &mut [Value]) -> RuntimeResult<Value> {
        if args.len() != self.arity {
            return Err(RuntimeError::ArityMismatch {
                expected: self.arity,
                got: args.len(),
            });
        }
        (self.f)(args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({}/{})", self.name, self.arity)
    }
}

/// A managed runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// No value.
    Unit,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Immutable string.
    Str(Arc<str>),
    /// The absent state of a nullable.
    Null,
    /// Array (reference semantics).
    Array(ArrayRef),
    /// Value-type struct (copied on assignment).
    Struct(StructVal),
    /// Reference-type object.
    Obj(ObjRef),
    /// Shared mutable slot (closure cell / by-reference argument).
    Cell(CellRef),
    /// A callable closure.
    Closure(ClosureRef),
    /// Address of an assignable place (VM-internal).
    Addr(Addr),
}

impl Value {
    /// Wrap a value in a fresh shared cell.
    pub fn cell(inner: Value) -> Value {
        Value::Cell(Arc::new(Mutex::new(inner)))
    }

    /// Build a string value.
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    /// Build an array value from elements.
    pub fn array(elems: Vec<Value>) -> Value {
        Value::Array(ArrayRef::new(elems))
    }

    /// Build a struct value.
    pub fn struct_val(ty: Arc<StructTy>, fields: Vec<Value>) -> Value {
        Value::Struct(StructVal {
            ty,
            fields: fields.into_boxed_slice(),
        })
    }

    /// Build an object value.
    pub fn obj(ty: Arc<StructTy>, fields: Vec<Value>) -> Value {
        Value::Obj(ObjRef::new(ty, fields))
    }

    /// A short name of the runtime shape, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Null => "null",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Obj(_) => "object",
            Value::Cell(_) => "cell",
            Value::Closure(_) => "closure",
            Value::Addr(_) => "addr",
        }
    }

    /// Whether this is the null nullable state.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extract an `i64` or fail with a type mismatch.
    pub fn expect_int(self) -> RuntimeResult<i64> {
        match self {
            Value::Int(n) => Ok(n),
            other => Err(RuntimeError::TypeMismatch {
                expected: "int",
                found: other.kind_name(),
            }),
        }
    }

    /// Extract an `f64` or fail with a type mismatch.
    pub fn expect_float(self) -> RuntimeResult<f64> {
        match self {
            Value::Float(n) => Ok(n),
            other => Err(RuntimeError::TypeMismatch {
                expected: "float",
                found: other.kind_name(),
            }),
        }
    }

    /// Extract a `bool` or fail with a type mismatch.
    pub fn expect_bool(self) -> RuntimeResult<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(RuntimeError::TypeMismatch {
                expected: "bool",
                found: other.kind_name(),
            }),
        }
    }

    /// Whether the value's runtime shape inhabits `ty`. Used for catch
    /// filters and conversion checks.
    pub fn matches_ty(&self, ty: &Ty) -> bool {
        match (self, ty) {
            (Value::Null, Ty::Nullable(_)) => true,
            (v, Ty::Nullable(inner)) => v.matches_ty(inner),
            (Value::Unit, Ty::Unit) => true,
            (Value::Bool(_), Ty::Bool) => true,
            (Value::Int(_), Ty::Int) => true,
            (Value::Float(_), Ty::Float) => true,
            (Value::Str(_), Ty::Str) => true,
            (Value::Array(_), Ty::Array(_)) => true,
            (Value::Struct(v), Ty::Struct(t)) => Arc::ptr_eq(&v.ty, t),
            (Value::Obj(v), Ty::Struct(t)) => Arc::ptr_eq(v.ty(), t),
            (Value::Closure(_), Ty::Func) => true,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // Reference types compare by identity, like the source
            // language's default reference equality.
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Obj(a), Value::Obj(b)) => a.ptr_eq(b),
            (Value::Struct(a), Value::Struct(b)) => {
                Arc::ptr_eq(&a.ty, &b.ty) && a.fields == b.fields
            }
            (Value::Cell(a), Value::Cell(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_bounds() {
        let a = ArrayRef::new(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(a.get(1).unwrap(), Value::Int(2));
        assert!(matches!(
            a.get(2),
            Err(RuntimeError::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert!(a.get(-1).is_err());
        a.set(0, Value::Int(9)).unwrap();
        assert_eq!(a.get(0).unwrap(), Value::Int(9));
    }

    #[test]
    fn struct_clone_is_a_copy() {
        let ty = StructTy::new("Pair", false, vec![("a".into(), Ty::Int)]);
        let original = Value::struct_val(ty, vec![Value::Int(1)]);
        let copy = original.clone();
        // Mutating the copy through a fresh StructVal leaves the original
        // untouched; value semantics are a deep field copy.
        if let (Value::Struct(mut c), Value::Struct(o)) = (copy, original) {
            c.fields[0] = Value::Int(2);
            assert_eq!(o.fields[0], Value::Int(1));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn cells_share_state() {
        let cell = Value::cell(Value::Int(1));
        let alias = cell.clone();
        if let Value::Cell(c) = &cell {
            *c.lock() = Value::Int(5);
        }
        if let Value::Cell(c) = &alias {
            assert_eq!(*c.lock(), Value::Int(5));
        }
    }

    #[test]
    fn nullable_type_matching() {
        let t = Ty::nullable(Ty::Int);
        assert!(Value::Null.matches_ty(&t));
        assert!(Value::Int(3).matches_ty(&t));
        assert!(!Value::Bool(true).matches_ty(&t));
    }
}
