//! Static type model for expression trees and compiled code.
//!
//! Types describe the declared result of every tree node and drive the
//! compiler's operator selection (lifted vs. unlifted arithmetic, value
//! vs. reference member access). The model is deliberately closed: the
//! compiler matches on it exhaustively, so adding a type is a
//! compile-time-visible change.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A field of a [`StructTy`].
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name, used for diagnostics and tree construction.
    pub name: Arc<str>,
    /// Declared field type.
    pub ty: Ty,
}

/// A named composite type.
///
/// `reference: false` models a value type: assignment copies the fields
/// and the storage is addressable in place. `reference: true` models a
/// class: values share one underlying object.
///
/// Struct types have identity semantics: two independently constructed
/// `StructTy` instances are distinct types even if their fields match.
#[derive(Debug)]
pub struct StructTy {
    /// Type name.
    pub name: Arc<str>,
    /// Reference (class) vs. value (struct) semantics.
    pub reference: bool,
    /// Ordered field definitions.
    pub fields: Box<[FieldDef]>,
}

impl StructTy {
    /// Create a new struct or class type.
    pub fn new(
        name: impl Into<Arc<str>>,
        reference: bool,
        fields: Vec<(Arc<str>, Ty)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            reference,
            fields: fields
                .into_iter()
                .map(|(name, ty)| FieldDef { name, ty })
                .collect(),
        })
    }

    /// Look up a field index by name.
    pub fn field_index(&self, name: &str) -> Option<u16> {
        self.fields
            .iter()
            .position(|f| f.name.as_ref() == name)
            .map(|i| i as u16)
    }
}

/// The static type of a value.
#[derive(Debug, Clone)]
pub enum Ty {
    /// No value (statement-typed constructs).
    Unit,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// Immutable string.
    Str,
    /// Nullable wrapper over a value type.
    Nullable(Arc<Ty>),
    /// Array with reference semantics.
    Array(Arc<Ty>),
    /// Named composite type (value or reference, see [`StructTy`]).
    Struct(Arc<StructTy>),
    /// A callable produced by a lambda.
    Func,
}

impl Ty {
    /// Wrap a type in `Nullable`.
    pub fn nullable(inner: Ty) -> Ty {
        Ty::Nullable(Arc::new(inner))
    }

    /// Array-of-`elem` type.
    pub fn array(elem: Ty) -> Ty {
        Ty::Array(Arc::new(elem))
    }

    /// Whether this is a `Nullable` wrapper.
    pub fn is_nullable(&self) -> bool {
        matches!(self, Ty::Nullable(_))
    }

    /// The type underneath a `Nullable` wrapper, or the type itself.
    pub fn strip_nullable(&self) -> &Ty {
        match self {
            Ty::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Whether this is `Int` or `Float`.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float)
    }

    /// Whether values of this type are copied on assignment.
    pub fn is_value_type(&self) -> bool {
        match self {
            Ty::Struct(s) => !s.reference,
            Ty::Array(_) | Ty::Func => false,
            _ => true,
        }
    }
}

impl PartialEq for Ty {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Ty::Unit, Ty::Unit)
            | (Ty::Bool, Ty::Bool)
            | (Ty::Int, Ty::Int)
            | (Ty::Float, Ty::Float)
            | (Ty::Str, Ty::Str)
            | (Ty::Func, Ty::Func) => true,
            (Ty::Nullable(a), Ty::Nullable(b)) | (Ty::Array(a), Ty::Array(b)) => a == b,
            // Struct types have identity, not structural, equality.
            (Ty::Struct(a), Ty::Struct(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Ty {}

impl Hash for Ty {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Ty::Nullable(inner) | Ty::Array(inner) => inner.hash(state),
            Ty::Struct(s) => (Arc::as_ptr(s) as usize).hash(state),
            _ => {}
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Unit => write!(f, "unit"),
            Ty::Bool => write!(f, "bool"),
            Ty::Int => write!(f, "int"),
            Ty::Float => write!(f, "float"),
            Ty::Str => write!(f, "str"),
            Ty::Nullable(inner) => write!(f, "{inner}?"),
            Ty::Array(elem) => write!(f, "{elem}[]"),
            Ty::Struct(s) => write!(f, "{}", s.name),
            Ty::Func => write!(f, "fn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_types_have_identity_equality() {
        let a = StructTy::new("Point", false, vec![("x".into(), Ty::Int)]);
        let b = StructTy::new("Point", false, vec![("x".into(), Ty::Int)]);
        assert_eq!(Ty::Struct(a.clone()), Ty::Struct(a.clone()));
        assert_ne!(Ty::Struct(a), Ty::Struct(b));
    }

    #[test]
    fn strip_nullable() {
        let t = Ty::nullable(Ty::Int);
        assert!(t.is_nullable());
        assert_eq!(t.strip_nullable(), &Ty::Int);
        assert_eq!(Ty::Bool.strip_nullable(), &Ty::Bool);
    }

    #[test]
    fn field_lookup() {
        let s = StructTy::new(
            "Box",
            false,
            vec![("value".into(), Ty::Int), ("tag".into(), Ty::Str)],
        );
        assert_eq!(s.field_index("tag"), Some(1));
        assert_eq!(s.field_index("missing"), None);
    }
}
