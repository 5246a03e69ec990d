//! Expression node definitions and factory constructors.
//!
//! Nodes are tagged variants with a static result type computed at
//! construction time. The factories mirror the source system's builder
//! surface: they resolve member names to indices, lift binary result
//! types to nullable when an operand is nullable, and panic on
//! construction-time contract violations (unknown field, arity mismatch)
//! the way the original factories throw.

use ember_core::{NativeFn, StructTy, Ty, Value};
use std::sync::Arc;

/// A variable identity: a parameter or a block-declared local.
///
/// Identity is the `Arc` allocation, not the name; two same-named
/// variables in different scopes are distinct entities.
#[derive(Debug)]
pub struct Var {
    /// Surface name, for diagnostics.
    pub name: Arc<str>,
    /// Declared type.
    pub ty: Ty,
    /// Whether this parameter is passed by reference.
    pub by_ref: bool,
}

/// Shared variable handle.
pub type VarRef = Arc<Var>;

impl Var {
    /// Create a by-value variable.
    pub fn new(name: impl Into<Arc<str>>, ty: Ty) -> VarRef {
        Arc::new(Var {
            name: name.into(),
            ty,
            by_ref: false,
        })
    }

    /// Create a by-reference parameter.
    pub fn by_ref(name: impl Into<Arc<str>>, ty: Ty) -> VarRef {
        Arc::new(Var {
            name: name.into(),
            ty,
            by_ref: true,
        })
    }

    /// Identity key for maps (the allocation address).
    pub fn id(this: &VarRef) -> usize {
        Arc::as_ptr(this) as usize
    }
}

/// A symbolic branch target declared by a [`ExprKind::Label`] node and
/// referenced by [`ExprKind::Goto`] nodes.
#[derive(Debug)]
pub struct LabelTarget {
    /// Surface name, for diagnostics.
    pub name: Arc<str>,
    /// The type of the value carried to this label (`Unit` for none).
    pub ty: Ty,
}

/// Shared label handle.
pub type LabelRef = Arc<LabelTarget>;

impl LabelTarget {
    /// Create a label target.
    pub fn new(name: impl Into<Arc<str>>, ty: Ty) -> LabelRef {
        Arc::new(LabelTarget {
            name: name.into(),
            ty,
        })
    }

    /// Identity key for maps (the allocation address).
    pub fn id(this: &LabelRef) -> usize {
        Arc::as_ptr(this) as usize
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Boolean not.
    Not,
    /// Bitwise complement.
    BitNot,
    /// Throw the operand as an exception.
    Throw,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// Bitwise and.
    BitAnd,
    /// Bitwise or.
    BitOr,
    /// Bitwise xor.
    BitXor,
    /// Left shift.
    Shl,
    /// Arithmetic right shift.
    Shr,
    /// Short-circuit and.
    AndAlso,
    /// Short-circuit or.
    OrElse,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl BinaryOp {
    /// Whether the operator yields `Bool` regardless of operand types.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    /// Whether the operator is an equality test (lifted differently from
    /// the ordering comparisons).
    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne)
    }
}

/// Assignment modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// Plain `target = value`.
    Set,
    /// `target op= value`.
    Compound(BinaryOp),
    /// `++target`.
    PreIncrement,
    /// `target++`.
    PostIncrement,
    /// `--target`.
    PreDecrement,
    /// `target--`.
    PostDecrement,
}

/// One `catch` clause of a try expression.
#[derive(Debug)]
pub struct CatchClause {
    /// Type filter; `None` catches everything.
    pub ty: Option<Ty>,
    /// Variable bound to the caught value inside `body`.
    pub var: Option<VarRef>,
    /// Handler body.
    pub body: ExprRef,
}

/// One case of a switch expression.
#[derive(Debug)]
pub struct SwitchCase {
    /// Constant test values selecting this case.
    pub values: Vec<Value>,
    /// Case body.
    pub body: ExprRef,
}

/// A lambda: parameter list plus body, the unit of compilation.
#[derive(Debug)]
pub struct LambdaExpr {
    /// Name, for diagnostics and disassembly.
    pub name: Arc<str>,
    /// Ordered parameters.
    pub params: Vec<VarRef>,
    /// Body expression.
    pub body: ExprRef,
    /// Declared return type.
    pub ret: Ty,
}

/// Shared expression handle.
pub type ExprRef = Arc<Expr>;

/// An expression node: a kind plus its static result type.
#[derive(Debug)]
pub struct Expr {
    /// Static result type.
    pub ty: Ty,
    /// The node variant.
    pub kind: ExprKind,
}

/// The closed set of node kinds.
#[derive(Debug)]
pub enum ExprKind {
    /// A literal value.
    Constant(Value),
    /// A reference to a parameter or declared variable.
    Parameter(VarRef),
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: ExprRef,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: ExprRef,
        /// Right operand.
        right: ExprRef,
    },
    /// Member access on a struct or object.
    Field {
        /// Receiver.
        object: ExprRef,
        /// Field index into the receiver's type.
        field: u16,
    },
    /// Array element access.
    Index {
        /// Array expression.
        array: ExprRef,
        /// Index expression.
        index: ExprRef,
    },
    /// Call of a host function.
    Call {
        /// Resolved target.
        target: Arc<NativeFn>,
        /// Arguments.
        args: Vec<ExprRef>,
        /// Whether the call is marked for tail emission.
        tail: bool,
    },
    /// Construction of a struct or object.
    New {
        /// The constructed type.
        ty: Arc<StructTy>,
        /// Field initializers in declaration order.
        args: Vec<ExprRef>,
    },
    /// Array construction from element initializers.
    NewArray {
        /// Element type.
        elem: Ty,
        /// Element initializers.
        items: Vec<ExprRef>,
    },
    /// `test ? then : other` (both arms typed alike), or an `if` statement
    /// when typed `Unit`.
    Conditional {
        /// Condition.
        test: ExprRef,
        /// Then branch.
        then: ExprRef,
        /// Else branch.
        other: ExprRef,
    },
    /// A sequence with its own declared variables; the value is the last
    /// expression's value.
    Block {
        /// Variables scoped to this block.
        vars: Vec<VarRef>,
        /// Body expressions.
        body: Vec<ExprRef>,
    },
    /// An infinite loop exited by `Goto` to its break label.
    Loop {
        /// Body.
        body: ExprRef,
        /// Break target (loop result value arrives here).
        brk: Option<LabelRef>,
        /// Continue target.
        cont: Option<LabelRef>,
    },
    /// Jump to a label, optionally carrying a value.
    Goto {
        /// Target label.
        target: LabelRef,
        /// Carried value, when the label is value-typed.
        value: Option<ExprRef>,
    },
    /// A label definition; evaluates to the goto-carried value or the
    /// default when reached by fall-through.
    Label {
        /// The declared target.
        target: LabelRef,
        /// Fall-through value for value-typed labels.
        default: Option<ExprRef>,
    },
    /// A nested lambda; evaluates to a closure value.
    Lambda(Arc<LambdaExpr>),
    /// Invocation of a closure value.
    Invoke {
        /// Expression producing the closure.
        target: ExprRef,
        /// Arguments.
        args: Vec<ExprRef>,
        /// Whether the invoke is marked for tail emission.
        tail: bool,
    },
    /// Assignment in any mode (see [`AssignOp`]).
    Assign {
        /// Assignable target: parameter, field, or index.
        target: ExprRef,
        /// Mode.
        op: AssignOp,
        /// Right-hand side; `None` for increment/decrement modes.
        value: Option<ExprRef>,
    },
    /// Protected region with catch clauses and/or a finally body.
    TryCatchFinally {
        /// Protected body.
        body: ExprRef,
        /// Catch clauses, tried in order.
        catches: Vec<CatchClause>,
        /// Finally body, run on every exit path.
        finally: Option<ExprRef>,
    },
    /// Multi-way branch over constant case values.
    Switch {
        /// Scrutinee.
        scrutinee: ExprRef,
        /// Cases.
        cases: Vec<SwitchCase>,
        /// Default body.
        default: Option<ExprRef>,
    },
    /// Type conversion; the node's `ty` is the conversion target.
    Convert {
        /// Operand.
        operand: ExprRef,
    },
    /// The default value of a type.
    Default(Ty),
    /// Quoted sub-tree. Not compilable; exists to exercise the refusal
    /// contract.
    Quote(ExprRef),
    /// Runtime variable bundle. Not compilable; exists to exercise the
    /// refusal contract.
    RuntimeVariables(Vec<VarRef>),
}

impl ExprKind {
    /// A short name of the node kind, used by refusal diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Constant(_) => "Constant",
            ExprKind::Parameter(_) => "Parameter",
            ExprKind::Unary { .. } => "Unary",
            ExprKind::Binary { .. } => "Binary",
            ExprKind::Field { .. } => "Field",
            ExprKind::Index { .. } => "Index",
            ExprKind::Call { .. } => "Call",
            ExprKind::New { .. } => "New",
            ExprKind::NewArray { .. } => "NewArray",
            ExprKind::Conditional { .. } => "Conditional",
            ExprKind::Block { .. } => "Block",
            ExprKind::Loop { .. } => "Loop",
            ExprKind::Goto { .. } => "Goto",
            ExprKind::Label { .. } => "Label",
            ExprKind::Lambda(_) => "Lambda",
            ExprKind::Invoke { .. } => "Invoke",
            ExprKind::Assign { .. } => "Assign",
            ExprKind::TryCatchFinally { .. } => "TryCatchFinally",
            ExprKind::Switch { .. } => "Switch",
            ExprKind::Convert { .. } => "Convert",
            ExprKind::Default(_) => "Default",
            ExprKind::Quote(_) => "Quote",
            ExprKind::RuntimeVariables(_) => "RuntimeVariables",
        }
    }
}

fn mk(ty: Ty, kind: ExprKind) -> ExprRef {
    Arc::new(Expr { ty, kind })
}

/// Compute the result type of a binary operation, lifting to nullable
/// when either operand is nullable.
fn binary_ty(op: BinaryOp, left: &Expr, right: &Expr) -> Ty {
    if op.is_comparison() || matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
        return Ty::Bool;
    }
    let lifted = left.ty.is_nullable() || right.ty.is_nullable();
    let underlying = left.ty.strip_nullable().clone();
    if lifted {
        Ty::nullable(underlying)
    } else {
        underlying
    }
}

impl Expr {
    /// A constant with its type inferred from the value.
    pub fn constant(value: Value) -> ExprRef {
        let ty = match &value {
            Value::Unit => Ty::Unit,
            Value::Bool(_) => Ty::Bool,
            Value::Int(_) => Ty::Int,
            Value::Float(_) => Ty::Float,
            Value::Str(_) => Ty::Str,
            Value::Struct(s) => Ty::Struct(s.ty.clone()),
            Value::Obj(o) => Ty::Struct(o.ty().clone()),
            other => panic!("constant type cannot be inferred for {}", other.kind_name()),
        };
        mk(ty, ExprKind::Constant(value))
    }

    /// A constant with an explicit type (nullable constants, typed null).
    pub fn constant_of(value: Value, ty: Ty) -> ExprRef {
        mk(ty, ExprKind::Constant(value))
    }

    /// The null constant of a nullable type (`ty` is the underlying type).
    pub fn null_of(underlying: Ty) -> ExprRef {
        mk(Ty::nullable(underlying), ExprKind::Constant(Value::Null))
    }

    /// A variable reference.
    pub fn param(var: &VarRef) -> ExprRef {
        mk(var.ty.clone(), ExprKind::Parameter(var.clone()))
    }

    /// Unary operation.
    pub fn unary(op: UnaryOp, operand: ExprRef) -> ExprRef {
        let ty = match op {
            UnaryOp::Neg | UnaryOp::BitNot => operand.ty.clone(),
            UnaryOp::Not => Ty::Bool,
            UnaryOp::Throw => Ty::Unit,
        };
        mk(ty, ExprKind::Unary { op, operand })
    }

    /// Throw the operand as an exception.
    pub fn throw(operand: ExprRef) -> ExprRef {
        Self::unary(UnaryOp::Throw, operand)
    }

    /// Binary operation; the result type lifts to nullable when an
    /// operand is nullable.
    pub fn binary(op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        let ty = binary_ty(op, &left, &right);
        mk(ty, ExprKind::Binary { op, left, right })
    }

    /// `left + right`.
    pub fn add(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Add, left, right)
    }

    /// `left - right`.
    pub fn sub(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Sub, left, right)
    }

    /// `left * right`.
    pub fn mul(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Mul, left, right)
    }

    /// `left < right`.
    pub fn lt(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Lt, left, right)
    }

    /// `left == right`.
    pub fn eq(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// Member access by field name; resolves the index against the
    /// receiver's struct type.
    pub fn field(object: ExprRef, name: &str) -> ExprRef {
        let struct_ty = match object.ty.strip_nullable() {
            Ty::Struct(s) => s.clone(),
            other => panic!("field access on non-struct type {other}"),
        };
        let index = struct_ty
            .field_index(name)
            .unwrap_or_else(|| panic!("type {} has no field '{name}'", struct_ty.name));
        let ty = struct_ty.fields[index as usize].ty.clone();
        mk(ty, ExprKind::Field { object, field: index })
    }

    /// Array element access.
    pub fn index(array: ExprRef, index: ExprRef) -> ExprRef {
        let ty = match &array.ty {
            Ty::Array(elem) => (**elem).clone(),
            other => panic!("index access on non-array type {other}"),
        };
        mk(ty, ExprKind::Index { array, index })
    }

    /// Call of a host function with the given result type.
    pub fn call(target: Arc<NativeFn>, args: Vec<ExprRef>, ret: Ty) -> ExprRef {
        assert_eq!(
            target.arity(),
            args.len(),
            "call to {} with wrong arity",
            target.name()
        );
        mk(ret, ExprKind::Call { target, args, tail: false })
    }

    /// A [`Expr::call`] marked for tail emission.
    pub fn tail_call(target: Arc<NativeFn>, args: Vec<ExprRef>, ret: Ty) -> ExprRef {
        mk(ret, ExprKind::Call { target, args, tail: true })
    }

    /// Construct a struct or object; one initializer per field.
    pub fn new_struct(ty: Arc<StructTy>, args: Vec<ExprRef>) -> ExprRef {
        assert_eq!(
            ty.fields.len(),
            args.len(),
            "new {} with wrong initializer count",
            ty.name
        );
        mk(Ty::Struct(ty.clone()), ExprKind::New { ty, args })
    }

    /// Construct an array from element initializers.
    pub fn new_array(elem: Ty, items: Vec<ExprRef>) -> ExprRef {
        mk(Ty::array(elem.clone()), ExprKind::NewArray { elem, items })
    }

    /// Conditional expression; both arms must agree in type.
    pub fn cond(test: ExprRef, then: ExprRef, other: ExprRef) -> ExprRef {
        let ty = then.ty.clone();
        mk(ty, ExprKind::Conditional { test, then, other })
    }

    /// An `if` statement (unit-typed conditional with an empty else).
    pub fn if_then(test: ExprRef, then: ExprRef) -> ExprRef {
        mk(
            Ty::Unit,
            ExprKind::Conditional {
                test,
                then,
                other: Self::empty(),
            },
        )
    }

    /// The empty (unit) expression.
    pub fn empty() -> ExprRef {
        mk(Ty::Unit, ExprKind::Constant(Value::Unit))
    }

    /// A block with declared variables; its value is the last
    /// expression's value.
    pub fn block(vars: Vec<VarRef>, body: Vec<ExprRef>) -> ExprRef {
        let ty = body.last().map(|e| e.ty.clone()).unwrap_or(Ty::Unit);
        mk(ty, ExprKind::Block { vars, body })
    }

    /// A block without declared variables.
    pub fn seq(body: Vec<ExprRef>) -> ExprRef {
        Self::block(Vec::new(), body)
    }

    /// An infinite loop with optional break/continue labels; the loop's
    /// value is whatever a goto carries to the break label.
    pub fn loop_(body: ExprRef, brk: Option<LabelRef>, cont: Option<LabelRef>) -> ExprRef {
        let ty = brk.as_ref().map(|l| l.ty.clone()).unwrap_or(Ty::Unit);
        mk(ty, ExprKind::Loop { body, brk, cont })
    }

    /// Jump to a label.
    pub fn goto(target: &LabelRef) -> ExprRef {
        mk(
            Ty::Unit,
            ExprKind::Goto {
                target: target.clone(),
                value: None,
            },
        )
    }

    /// Jump to a value-typed label, carrying a value.
    pub fn goto_val(target: &LabelRef, value: ExprRef) -> ExprRef {
        mk(
            Ty::Unit,
            ExprKind::Goto {
                target: target.clone(),
                value: Some(value),
            },
        )
    }

    /// Define a label at this point.
    pub fn label(target: &LabelRef) -> ExprRef {
        mk(
            target.ty.clone(),
            ExprKind::Label {
                target: target.clone(),
                default: None,
            },
        )
    }

    /// Define a value-typed label with a fall-through default.
    pub fn label_val(target: &LabelRef, default: ExprRef) -> ExprRef {
        mk(
            target.ty.clone(),
            ExprKind::Label {
                target: target.clone(),
                default: Some(default),
            },
        )
    }

    /// A nested lambda.
    pub fn lambda(name: impl Into<Arc<str>>, params: Vec<VarRef>, body: ExprRef) -> ExprRef {
        let ret = body.ty.clone();
        mk(
            Ty::Func,
            ExprKind::Lambda(Arc::new(LambdaExpr {
                name: name.into(),
                params,
                body,
                ret,
            })),
        )
    }

    /// Invoke a closure value with the given result type.
    pub fn invoke(target: ExprRef, args: Vec<ExprRef>, ret: Ty) -> ExprRef {
        mk(ret, ExprKind::Invoke { target, args, tail: false })
    }

    /// An [`Expr::invoke`] marked for tail emission.
    pub fn tail_invoke(target: ExprRef, args: Vec<ExprRef>, ret: Ty) -> ExprRef {
        mk(ret, ExprKind::Invoke { target, args, tail: true })
    }

    /// `target = value`.
    pub fn assign(target: ExprRef, value: ExprRef) -> ExprRef {
        let ty = target.ty.clone();
        mk(
            ty,
            ExprKind::Assign {
                target,
                op: AssignOp::Set,
                value: Some(value),
            },
        )
    }

    /// `target op= value`.
    pub fn compound_assign(op: BinaryOp, target: ExprRef, value: ExprRef) -> ExprRef {
        let ty = target.ty.clone();
        mk(
            ty,
            ExprKind::Assign {
                target,
                op: AssignOp::Compound(op),
                value: Some(value),
            },
        )
    }

    /// `target += value`.
    pub fn add_assign(target: ExprRef, value: ExprRef) -> ExprRef {
        Self::compound_assign(BinaryOp::Add, target, value)
    }

    /// Increment/decrement in any of the four forms.
    pub fn crement(op: AssignOp, target: ExprRef) -> ExprRef {
        assert!(
            matches!(
                op,
                AssignOp::PreIncrement
                    | AssignOp::PostIncrement
                    | AssignOp::PreDecrement
                    | AssignOp::PostDecrement
            ),
            "crement constructor requires an increment/decrement mode"
        );
        let ty = target.ty.clone();
        mk(ty, ExprKind::Assign { target, op, value: None })
    }

    /// `++target`.
    pub fn pre_increment(target: ExprRef) -> ExprRef {
        Self::crement(AssignOp::PreIncrement, target)
    }

    /// `target++`.
    pub fn post_increment(target: ExprRef) -> ExprRef {
        Self::crement(AssignOp::PostIncrement, target)
    }

    /// `--target`.
    pub fn pre_decrement(target: ExprRef) -> ExprRef {
        Self::crement(AssignOp::PreDecrement, target)
    }

    /// A try with catch clauses and an optional finally.
    pub fn try_catch_finally(
        body: ExprRef,
        catches: Vec<CatchClause>,
        finally: Option<ExprRef>,
    ) -> ExprRef {
        let ty = body.ty.clone();
        mk(ty, ExprKind::TryCatchFinally { body, catches, finally })
    }

    /// A try/finally with no catch clauses.
    pub fn try_finally(body: ExprRef, finally: ExprRef) -> ExprRef {
        Self::try_catch_finally(body, Vec::new(), Some(finally))
    }

    /// A switch over constant case values.
    pub fn switch(
        scrutinee: ExprRef,
        cases: Vec<SwitchCase>,
        default: Option<ExprRef>,
    ) -> ExprRef {
        let ty = cases
            .first()
            .map(|c| c.body.ty.clone())
            .or_else(|| default.as_ref().map(|d| d.ty.clone()))
            .unwrap_or(Ty::Unit);
        mk(ty, ExprKind::Switch { scrutinee, cases, default })
    }

    /// Type conversion.
    pub fn convert(operand: ExprRef, to: Ty) -> ExprRef {
        mk(to, ExprKind::Convert { operand })
    }

    /// The default value of a type.
    pub fn default_of(ty: Ty) -> ExprRef {
        mk(ty.clone(), ExprKind::Default(ty))
    }

    /// A quoted sub-tree (always refused by the compiler).
    pub fn quote(inner: ExprRef) -> ExprRef {
        mk(Ty::Func, ExprKind::Quote(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_result_types_lift() {
        let plain = Expr::add(
            Expr::constant(Value::Int(1)),
            Expr::constant(Value::Int(2)),
        );
        assert_eq!(plain.ty, Ty::Int);

        let lifted = Expr::add(
            Expr::null_of(Ty::Int),
            Expr::constant(Value::Int(2)),
        );
        assert_eq!(lifted.ty, Ty::nullable(Ty::Int));

        let cmp = Expr::lt(
            Expr::null_of(Ty::Int),
            Expr::constant(Value::Int(2)),
        );
        assert_eq!(cmp.ty, Ty::Bool);
    }

    #[test]
    fn field_resolves_index() {
        let point = StructTy::new(
            "Point",
            false,
            vec![("x".into(), Ty::Int), ("y".into(), Ty::Int)],
        );
        let v = Var::new("p", Ty::Struct(point));
        let access = Expr::field(Expr::param(&v), "y");
        assert_eq!(access.ty, Ty::Int);
        match &access.kind {
            ExprKind::Field { field, .. } => assert_eq!(*field, 1),
            _ => unreachable!(),
        }
    }

    #[test]
    #[should_panic(expected = "has no field")]
    fn unknown_field_panics() {
        let point = StructTy::new("Point", false, vec![("x".into(), Ty::Int)]);
        let v = Var::new("p", Ty::Struct(point));
        Expr::field(Expr::param(&v), "z");
    }

    #[test]
    fn var_identity_is_per_allocation() {
        let a = Var::new("x", Ty::Int);
        let b = Var::new("x", Ty::Int);
        assert_ne!(Var::id(&a), Var::id(&b));
        assert_eq!(Var::id(&a), Var::id(&a.clone()));
    }

    #[test]
    fn block_type_is_last_expression() {
        let b = Expr::seq(vec![
            Expr::constant(Value::Int(1)),
            Expr::constant(Value::Bool(true)),
        ]);
        assert_eq!(b.ty, Ty::Bool);
        assert_eq!(Expr::seq(vec![]).ty, Ty::Unit);
    }
}
