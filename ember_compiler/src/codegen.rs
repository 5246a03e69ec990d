//! The code generator: a single recursive walk from tree to bytecode.
//!
//! Every node is emitted in a context: expression context leaves exactly
//! one value on the operand stack, statement context leaves none, and
//! tail context is expression context in return position (the only place
//! a tail-call qualifier can be honored). The walk is a single forward
//! pass; forward branches get provisional operands the label resolver
//! patches at finish.
//!
//! Emission policies:
//!
//! - **Single evaluation of compound-assignment targets.** Field and
//!   element targets are lowered to an address formed once on the stack
//!   and duplicated for the read and the write; receiver and index
//!   sub-expressions never run twice.
//! - **Byref value-type mutation.** A by-reference parameter's slot
//!   holds a shared cell; addresses root at the cell, so in-place
//!   arithmetic writes the caller's storage.
//! - **Nullable lifting.** Lifted operators spill both operands to
//!   scratch locals, test their null flags, branch to the null result,
//!   and otherwise run the underlying operation. Ordering comparisons
//!   produce `false` when either side is null; equality follows the
//!   strict truth table unless the option turns it off.
//! - **Protected regions.** Finally bodies are emitted once per normal
//!   exit path (fall-through, catch exit, goto leaving the region) plus
//!   one unwind copy terminated by `EndFinally` and referenced from the
//!   exception table.
//!
//! Anything the generator does not implement raises a typed refusal and
//! aborts the compilation; no partially built unit is observable.

use crate::bytecode::{CodeBuilder, CodeUnit, ExceptionEntry, HandlerKind, Label, Opcode};
use crate::error::{CompileError, CompileResult, NotSupported};
use crate::scope::{Analysis, ScopeAnalyzer, ScopeInfo, Storage};
use ember_core::{Ty, Value};
use ember_tree::{
    AssignOp, BinaryOp, CatchClause, Expr, ExprKind, ExprRef, LabelRef, LabelTarget, LambdaExpr,
    SwitchCase, UnaryOp, VarRef,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, trace};

/// Optional compiler behaviors.
#[derive(Debug, Clone)]
pub struct Options {
    /// Emit tail-call qualifiers where legal; a qualified call in a
    /// context that cannot honor them is refused.
    pub enable_tail_calls: bool,
    /// Follow the reference truth table for lifted equality. Off, the
    /// historical divergence applies: equality degrades to the ordering
    /// rule and both-null compares false.
    pub strict_nullable_lifting: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_tail_calls: false,
            strict_nullable_lifting: true,
        }
    }
}

/// Emission context for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    /// Leave nothing on the stack.
    Effect,
    /// Leave exactly one value on the stack.
    Value,
    /// Expression context in return position.
    Tail,
}

impl Ctx {
    fn is_value(self) -> bool {
        !matches!(self, Ctx::Effect)
    }

    /// The context for a child that produces this node's value but is
    /// not itself in return position.
    fn value_child(self) -> Ctx {
        if self.is_value() { Ctx::Value } else { Ctx::Effect }
    }
}

/// One active protected region during emission.
struct TryFrame {
    finally: Option<ExprRef>,
    /// Set while this region's finally body is being emitted, so goto
    /// routing and nested emission do not re-enter it.
    in_finally: bool,
}

/// Typical nesting depths stay on the stack.
type TryStack = SmallVec<[TryFrame; 4]>;

struct LabelState {
    asm: Label,
    /// Scratch local carrying the value of a value-typed label.
    slot: Option<u16>,
    try_depth: u32,
}

/// Compile a lambda tree to a code unit.
///
/// This is the whole front door: scope analysis, then one emission pass.
/// Errors out with a refusal for unsupported constructs and with
/// definitional errors for malformed trees; on any error no unit exists.
pub fn compile_lambda(lambda: &Arc<LambdaExpr>, options: &Options) -> CompileResult<Arc<CodeUnit>> {
    debug!(name = %lambda.name, "compiling lambda tree");
    let analysis = ScopeAnalyzer::analyze(lambda)?;
    let unit = CodeGen::run(lambda, &analysis, options)?;
    debug!(
        name = %lambda.name,
        instructions = unit.instructions.len(),
        max_stack = unit.max_stack,
        "compilation finished"
    );
    Ok(unit)
}

struct CodeGen<'a> {
    analysis: &'a Analysis,
    scope: &'a ScopeInfo,
    options: &'a Options,
    b: CodeBuilder,
    try_stack: TryStack,
    labels: FxHashMap<usize, LabelState>,
}

impl<'a> CodeGen<'a> {
    fn run(
        lambda: &Arc<LambdaExpr>,
        analysis: &'a Analysis,
        options: &'a Options,
    ) -> CompileResult<Arc<CodeUnit>> {
        let scope = analysis.scope(lambda);
        let mut b = CodeBuilder::new(
            lambda.name.clone(),
            scope.param_byref.clone(),
            lambda.ret.clone(),
        );
        for _ in 0..scope.local_count {
            b.alloc_local();
        }
        b.set_cells(
            scope.cell_count,
            scope.captures.clone(),
            scope.cell_params.clone(),
        );

        let mut gen = CodeGen {
            analysis,
            scope,
            options,
            b,
            try_stack: TryStack::new(),
            labels: FxHashMap::default(),
        };

        if lambda.ret == Ty::Unit {
            gen.emit(&lambda.body, Ctx::Effect)?;
            gen.b.emit_op(Opcode::PushUnit);
        } else {
            gen.emit(&lambda.body, Ctx::Tail)?;
        }
        gen.b.emit_op(Opcode::Return);
        gen.b.finish()
    }

    // =========================================================================
    // Main dispatch
    // =========================================================================

    fn emit(&mut self, expr: &Expr, ctx: Ctx) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Constant(value) => {
                if ctx.is_value() {
                    self.b.push_value(value);
                }
                Ok(())
            }

            ExprKind::Default(ty) => {
                if ctx.is_value() {
                    self.emit_default(ty);
                }
                Ok(())
            }

            ExprKind::Parameter(var) => {
                if ctx.is_value() {
                    self.emit_load_var(var)?;
                }
                Ok(())
            }

            ExprKind::Unary { op, operand } => self.emit_unary(*op, operand, ctx),

            ExprKind::Binary { op, left, right } => self.emit_binary(*op, left, right, ctx),

            ExprKind::Field { object, field } => {
                self.emit(object, Ctx::Value)?;
                self.b.emit_i(Opcode::LoadField, *field);
                self.discard_if_effect(ctx);
                Ok(())
            }

            ExprKind::Index { array, index } => {
                self.emit(array, Ctx::Value)?;
                self.emit(index, Ctx::Value)?;
                self.b.emit_op(Opcode::LoadElem);
                self.discard_if_effect(ctx);
                Ok(())
            }

            ExprKind::Call { target, args, tail } => {
                let argc = self.check_argc(args.len())?;
                for arg in args {
                    self.emit(arg, Ctx::Value)?;
                }
                let idx = self.b.add_native(target);
                if *tail && self.options.enable_tail_calls {
                    self.check_tail(ctx)?;
                    self.b.emit(Opcode::TailCallNative, argc, idx);
                    self.b.emit_op(Opcode::Return);
                } else {
                    self.b.emit(Opcode::CallNative, argc, idx);
                    self.discard_if_effect(ctx);
                }
                Ok(())
            }

            ExprKind::New { ty, args } => {
                let argc = self.check_argc(args.len())?;
                for arg in args {
                    self.emit(arg, Ctx::Value)?;
                }
                let idx = self.b.add_type(Ty::Struct(ty.clone()));
                let op = if ty.reference { Opcode::NewObj } else { Opcode::NewStruct };
                self.b.emit(op, argc, idx);
                self.discard_if_effect(ctx);
                Ok(())
            }

            ExprKind::NewArray { items, .. } => {
                if items.len() > u16::MAX as usize {
                    return Err(NotSupported::Node("NewArray with more than 65535 items").into());
                }
                for item in items {
                    self.emit(item, Ctx::Value)?;
                }
                self.b.emit_i(Opcode::NewArray, items.len() as u16);
                self.discard_if_effect(ctx);
                Ok(())
            }

            ExprKind::Conditional { test, then, other } => {
                self.emit(test, Ctx::Value)?;
                let l_else = self.b.create_label();
                let l_end = self.b.create_label();
                self.b.emit_jump_if_false(l_else);
                self.emit(then, ctx)?;
                self.b.emit_jump(l_end);
                self.b.bind_label(l_else)?;
                self.emit(other, ctx)?;
                self.b.bind_label(l_end)?;
                Ok(())
            }

            ExprKind::Block { body, .. } => {
                match body.split_last() {
                    None => {
                        if ctx.is_value() {
                            self.b.emit_op(Opcode::PushUnit);
                        }
                    }
                    Some((last, init)) => {
                        for e in init {
                            self.emit(e, Ctx::Effect)?;
                        }
                        self.emit(last, ctx)?;
                    }
                }
                Ok(())
            }

            ExprKind::Loop { body, brk, cont } => self.emit_loop(body, brk, cont, &expr.ty, ctx),

            ExprKind::Goto { target, value } => self.emit_goto(target, value.as_deref(), ctx),

            ExprKind::Label { target, default } => {
                self.emit_label(target, default.as_deref(), ctx)
            }

            ExprKind::Lambda(inner) => {
                if ctx.is_value() {
                    if inner.params.iter().any(|p| p.by_ref) {
                        return Err(
                            NotSupported::Node("Lambda with a by-reference parameter").into()
                        );
                    }
                    trace!(name = %inner.name, "compiling nested lambda");
                    let unit = CodeGen::run(inner, self.analysis, self.options)?;
                    let idx = self.b.add_nested(unit);
                    self.b.emit_i(Opcode::MakeClosure, idx);
                }
                Ok(())
            }

            ExprKind::Invoke { target, args, tail } => {
                self.emit(target, Ctx::Value)?;
                let argc = self.check_argc(args.len())?;
                for arg in args {
                    self.emit(arg, Ctx::Value)?;
                }
                if *tail && self.options.enable_tail_calls {
                    self.check_tail(ctx)?;
                    self.b.emit(Opcode::TailInvoke, argc, 0);
                    self.b.emit_op(Opcode::Return);
                } else {
                    self.b.emit(Opcode::Invoke, argc, 0);
                    self.discard_if_effect(ctx);
                }
                Ok(())
            }

            ExprKind::Assign { target, op, value } => {
                self.emit_assign(target, *op, value.as_deref(), ctx)
            }

            ExprKind::TryCatchFinally {
                body,
                catches,
                finally,
            } => self.emit_try(body, catches, finally.as_ref(), &expr.ty, ctx),

            ExprKind::Switch {
                scrutinee,
                cases,
                default,
            } => self.emit_switch(scrutinee, cases, default.as_deref(), &expr.ty, ctx),

            ExprKind::Convert { operand } => {
                self.emit(operand, Ctx::Value)?;
                self.emit_convert(&operand.ty, &expr.ty)?;
                self.discard_if_effect(ctx);
                Ok(())
            }

            ExprKind::Quote(_) | ExprKind::RuntimeVariables(_) => {
                trace!(kind = expr.kind.name(), "refusing unsupported node");
                Err(NotSupported::Node(expr.kind.name()).into())
            }
        }
    }

    // =========================================================================
    // Small helpers
    // =========================================================================

    fn discard_if_effect(&mut self, ctx: Ctx) {
        if !ctx.is_value() {
            self.b.emit_op(Opcode::Pop);
        }
    }

    fn check_argc(&self, len: usize) -> CompileResult<u8> {
        u8::try_from(len)
            .map_err(|_| NotSupported::Node("call with more than 255 arguments").into())
    }

    fn check_tail(&self, ctx: Ctx) -> CompileResult<()> {
        if !self.try_stack.is_empty() {
            return Err(NotSupported::TailCallInProtectedRegion.into());
        }
        if ctx != Ctx::Tail {
            return Err(NotSupported::TailCallPosition.into());
        }
        Ok(())
    }

    fn emit_default(&mut self, ty: &Ty) {
        match ty {
            Ty::Unit => self.b.emit_op(Opcode::PushUnit),
            Ty::Bool => self.b.emit_op(Opcode::PushFalse),
            Ty::Int => self.b.emit_i(Opcode::PushInt, 0),
            Ty::Float => self.b.push_value(&Value::Float(0.0)),
            Ty::Str => self.b.push_value(&Value::str("")),
            Ty::Nullable(_) => self.b.emit_op(Opcode::PushNull),
            Ty::Struct(s) if !s.reference => {
                let idx = self.b.add_type(ty.clone());
                self.b.emit_i(Opcode::PushDefault, idx);
            }
            // Reference types default to the null reference.
            Ty::Struct(_) | Ty::Array(_) | Ty::Func => self.b.emit_op(Opcode::PushNull),
        }
    }

    fn storage_of(&self, var: &VarRef) -> CompileResult<Storage> {
        self.scope
            .storage_of(var)
            .ok_or(CompileError::Internal("variable missing from scope analysis"))
    }

    fn emit_load_var(&mut self, var: &VarRef) -> CompileResult<()> {
        match self.storage_of(var)? {
            Storage::Arg(slot) => {
                self.b.emit_i(Opcode::LoadArg, slot);
                if var.by_ref {
                    self.b.emit_op(Opcode::LoadInd);
                }
            }
            Storage::Local(slot) => self.b.emit_i(Opcode::LoadLocal, slot),
            Storage::Cell(slot) => self.b.emit_i(Opcode::LoadCell, slot),
        }
        Ok(())
    }

    /// Store the top of stack into a non-byref variable.
    fn emit_store_var(&mut self, var: &VarRef) -> CompileResult<()> {
        match self.storage_of(var)? {
            Storage::Arg(slot) => self.b.emit_i(Opcode::StoreArg, slot),
            Storage::Local(slot) => self.b.emit_i(Opcode::StoreLocal, slot),
            Storage::Cell(slot) => self.b.emit_i(Opcode::StoreCell, slot),
        }
        Ok(())
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn emit_unary(&mut self, op: UnaryOp, operand: &ExprRef, ctx: Ctx) -> CompileResult<()> {
        if op == UnaryOp::Throw {
            self.emit(operand, Ctx::Value)?;
            self.b.emit_op(Opcode::Throw);
            return Ok(());
        }

        let underlying = operand.ty.strip_nullable();
        let opcode = match (op, underlying) {
            (UnaryOp::Neg, Ty::Int | Ty::Float) => Opcode::Neg,
            (UnaryOp::Not, Ty::Bool) => Opcode::Not,
            (UnaryOp::BitNot, Ty::Int) => Opcode::BitNot,
            _ => {
                return Err(NotSupported::UnaryOperator {
                    op,
                    ty: operand.ty.clone(),
                }
                .into())
            }
        };

        self.emit(operand, Ctx::Value)?;
        if operand.ty.is_nullable() {
            // Lifted: null flows through unchanged.
            let l_end = self.b.create_label();
            self.b.emit_op(Opcode::Dup);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_end);
            self.b.emit_op(opcode);
            self.b.bind_label(l_end)?;
        } else {
            self.b.emit_op(opcode);
        }
        self.discard_if_effect(ctx);
        Ok(())
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        left: &ExprRef,
        right: &ExprRef,
        ctx: Ctx,
    ) -> CompileResult<()> {
        if matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
            if left.ty != Ty::Bool || right.ty != Ty::Bool {
                return Err(NotSupported::Operator {
                    op,
                    ty: left.ty.clone(),
                }
                .into());
            }
            // Short-circuit: the left value doubles as the result when it
            // decides the answer.
            let l_short = self.b.create_label();
            self.emit(left, Ctx::Value)?;
            self.b.emit_op(Opcode::Dup);
            match op {
                BinaryOp::AndAlso => self.b.emit_jump_if_false(l_short),
                _ => self.b.emit_jump_if_true(l_short),
            }
            self.b.emit_op(Opcode::Pop);
            self.emit(right, Ctx::Value)?;
            self.b.bind_label(l_short)?;
            self.discard_if_effect(ctx);
            return Ok(());
        }

        self.check_binary(op, &left.ty, &right.ty)?;
        self.emit(left, Ctx::Value)?;
        self.emit(right, Ctx::Value)?;
        self.emit_binary_values(op, &left.ty, &right.ty)?;
        self.discard_if_effect(ctx);
        Ok(())
    }

    fn check_binary(&self, op: BinaryOp, left: &Ty, right: &Ty) -> CompileResult<()> {
        use BinaryOp::*;
        let lt = left.strip_nullable();
        let rt = right.strip_nullable();
        let ok = match op {
            Add => matches!(
                (lt, rt),
                (Ty::Int, Ty::Int) | (Ty::Float, Ty::Float) | (Ty::Str, Ty::Str)
            ),
            Sub | Mul | Div | Rem => {
                matches!((lt, rt), (Ty::Int, Ty::Int) | (Ty::Float, Ty::Float))
            }
            BitAnd | BitOr | BitXor => {
                matches!((lt, rt), (Ty::Int, Ty::Int) | (Ty::Bool, Ty::Bool))
            }
            Shl | Shr => matches!((lt, rt), (Ty::Int, Ty::Int)),
            Lt | Le | Gt | Ge => matches!(
                (lt, rt),
                (Ty::Int, Ty::Int) | (Ty::Float, Ty::Float) | (Ty::Str, Ty::Str)
            ),
            Eq | Ne => match (lt, rt) {
                (Ty::Int, Ty::Int)
                | (Ty::Float, Ty::Float)
                | (Ty::Bool, Ty::Bool)
                | (Ty::Str, Ty::Str) => true,
                // Reference identity comparison.
                (Ty::Struct(a), Ty::Struct(b)) => {
                    a.reference && b.reference && Arc::ptr_eq(a, b)
                }
                (Ty::Array(a), Ty::Array(b)) => a == b,
                _ => false,
            },
            AndAlso | OrElse => unreachable!("short-circuit operators handled separately"),
        };
        if ok {
            Ok(())
        } else {
            Err(NotSupported::Operator {
                op,
                ty: left.clone(),
            }
            .into())
        }
    }

    fn plain_opcode(op: BinaryOp) -> Opcode {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::Div,
            BinaryOp::Rem => Opcode::Rem,
            BinaryOp::BitAnd => Opcode::BitAnd,
            BinaryOp::BitOr => Opcode::BitOr,
            BinaryOp::BitXor => Opcode::BitXor,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            BinaryOp::Eq => Opcode::Eq,
            BinaryOp::Ne => Opcode::Ne,
            BinaryOp::Lt => Opcode::Lt,
            BinaryOp::Le => Opcode::Le,
            BinaryOp::Gt => Opcode::Gt,
            BinaryOp::Ge => Opcode::Ge,
            BinaryOp::AndAlso | BinaryOp::OrElse => {
                unreachable!("short-circuit operators have no single opcode")
            }
        }
    }

    /// Apply a binary operator to the two values on top of the stack,
    /// lifting when either operand type is nullable.
    fn emit_binary_values(&mut self, op: BinaryOp, left: &Ty, right: &Ty) -> CompileResult<()> {
        let lifted = left.is_nullable() || right.is_nullable();
        if !lifted {
            self.b.emit_op(Self::plain_opcode(op));
            return Ok(());
        }
        if op.is_equality() {
            self.emit_lifted_equality(op, left, right)
        } else if op.is_comparison() {
            self.emit_lifted(op, left, right, NullResult::False)
        } else {
            self.emit_lifted(op, left, right, NullResult::Null)
        }
    }

    /// Lifted arithmetic and ordering: spill operands, test null flags,
    /// short-circuit to the per-operator null result, otherwise run the
    /// underlying operation on the extracted values.
    fn emit_lifted(
        &mut self,
        op: BinaryOp,
        left: &Ty,
        right: &Ty,
        on_null: NullResult,
    ) -> CompileResult<()> {
        let t_right = self.b.alloc_temp();
        let t_left = self.b.alloc_temp();
        self.b.emit_i(Opcode::StoreLocal, t_right);
        self.b.emit_i(Opcode::StoreLocal, t_left);

        let l_null = self.b.create_label();
        let l_end = self.b.create_label();

        if left.is_nullable() {
            self.b.emit_i(Opcode::LoadLocal, t_left);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_null);
        }
        if right.is_nullable() {
            self.b.emit_i(Opcode::LoadLocal, t_right);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_null);
        }

        self.b.emit_i(Opcode::LoadLocal, t_left);
        self.b.emit_i(Opcode::LoadLocal, t_right);
        self.b.emit_op(Self::plain_opcode(op));
        self.b.emit_jump(l_end);

        self.b.bind_label(l_null)?;
        match on_null {
            NullResult::Null => self.b.emit_op(Opcode::PushNull),
            NullResult::False => self.b.emit_op(Opcode::PushFalse),
        }
        self.b.bind_label(l_end)?;

        self.b.free_temp(t_left);
        self.b.free_temp(t_right);
        Ok(())
    }

    /// Lifted equality. Strict mode follows the reference table:
    /// `null == null` is true and `null == x` is false, with `!=` as the
    /// negation. Non-strict mode pins the historical divergence: any
    /// null operand compares false for both `==` and `!=`.
    fn emit_lifted_equality(&mut self, op: BinaryOp, left: &Ty, right: &Ty) -> CompileResult<()> {
        if !self.options.strict_nullable_lifting {
            return self.emit_lifted(op, left, right, NullResult::False);
        }

        let one_null = if op == BinaryOp::Eq { Opcode::PushFalse } else { Opcode::PushTrue };
        let both_null = if op == BinaryOp::Eq { Opcode::PushTrue } else { Opcode::PushFalse };

        let t_right = self.b.alloc_temp();
        let t_left = self.b.alloc_temp();
        self.b.emit_i(Opcode::StoreLocal, t_right);
        self.b.emit_i(Opcode::StoreLocal, t_left);

        let l_end = self.b.create_label();

        if left.is_nullable() && right.is_nullable() {
            let l_left_null = self.b.create_label();
            let l_one = self.b.create_label();
            let l_both = self.b.create_label();

            self.b.emit_i(Opcode::LoadLocal, t_left);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_left_null);
            self.b.emit_i(Opcode::LoadLocal, t_right);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_one);
            self.b.emit_i(Opcode::LoadLocal, t_left);
            self.b.emit_i(Opcode::LoadLocal, t_right);
            self.b.emit_op(Self::plain_opcode(op));
            self.b.emit_jump(l_end);

            self.b.bind_label(l_left_null)?;
            self.b.emit_i(Opcode::LoadLocal, t_right);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_both);
            self.b.bind_label(l_one)?;
            self.b.emit_op(one_null);
            self.b.emit_jump(l_end);
            self.b.bind_label(l_both)?;
            self.b.emit_op(both_null);
        } else {
            // Only one side can be null; both-null is unreachable.
            let l_one = self.b.create_label();
            let nullable_temp = if left.is_nullable() { t_left } else { t_right };
            self.b.emit_i(Opcode::LoadLocal, nullable_temp);
            self.b.emit_op(Opcode::IsNull);
            self.b.emit_jump_if_true(l_one);
            self.b.emit_i(Opcode::LoadLocal, t_left);
            self.b.emit_i(Opcode::LoadLocal, t_right);
            self.b.emit_op(Self::plain_opcode(op));
            self.b.emit_jump(l_end);
            self.b.bind_label(l_one)?;
            self.b.emit_op(one_null);
        }

        self.b.bind_label(l_end)?;
        self.b.free_temp(t_left);
        self.b.free_temp(t_right);
        Ok(())
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    fn emit_convert(&mut self, from: &Ty, to: &Ty) -> CompileResult<()> {
        if from == to {
            return Ok(());
        }
        let refuse = || -> CompileError {
            NotSupported::Conversion {
                from: from.clone(),
                to: to.clone(),
            }
            .into()
        };

        match (from, to) {
            (Ty::Int, Ty::Float) => self.b.emit_op(Opcode::ConvIntToFloat),
            (Ty::Float, Ty::Int) => self.b.emit_op(Opcode::ConvFloatToInt),
            (src, Ty::Nullable(inner)) if !src.is_nullable() => {
                // Wrap: the representation is shared, only a numeric
                // widening may be needed underneath.
                match (src, inner.as_ref()) {
                    (s, i) if s == i => {}
                    (Ty::Int, Ty::Float) => self.b.emit_op(Opcode::ConvIntToFloat),
                    (Ty::Float, Ty::Int) => self.b.emit_op(Opcode::ConvFloatToInt),
                    _ => return Err(refuse()),
                }
            }
            (Ty::Nullable(inner), dst) if !dst.is_nullable() => {
                // Unwrap faults on null, then converts if needed.
                self.b.emit_op(Opcode::UnwrapNullable);
                match (inner.as_ref(), dst) {
                    (i, d) if i == d => {}
                    (Ty::Int, Ty::Float) => self.b.emit_op(Opcode::ConvIntToFloat),
                    (Ty::Float, Ty::Int) => self.b.emit_op(Opcode::ConvFloatToInt),
                    _ => return Err(refuse()),
                }
            }
            (Ty::Nullable(src), Ty::Nullable(dst)) => {
                let opcode = match (src.as_ref(), dst.as_ref()) {
                    (Ty::Int, Ty::Float) => Opcode::ConvIntToFloat,
                    (Ty::Float, Ty::Int) => Opcode::ConvFloatToInt,
                    _ => return Err(refuse()),
                };
                // Lifted conversion: null flows through.
                let l_end = self.b.create_label();
                self.b.emit_op(Opcode::Dup);
                self.b.emit_op(Opcode::IsNull);
                self.b.emit_jump_if_true(l_end);
                self.b.emit_op(opcode);
                self.b.bind_label(l_end)?;
            }
            _ => return Err(refuse()),
        }
        Ok(())
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    fn emit_assign(
        &mut self,
        target: &ExprRef,
        op: AssignOp,
        value: Option<&Expr>,
        ctx: Ctx,
    ) -> CompileResult<()> {
        // Simple variables need no address; everything else (fields,
        // elements, byref parameters) goes through a once-formed address.
        if let ExprKind::Parameter(var) = &target.kind {
            if !var.by_ref {
                return self.emit_var_assign(var, &target.ty, op, value, ctx);
            }
        }
        self.emit_place_assign(target, op, value, ctx)
    }

    fn emit_var_assign(
        &mut self,
        var: &VarRef,
        target_ty: &Ty,
        op: AssignOp,
        value: Option<&Expr>,
        ctx: Ctx,
    ) -> CompileResult<()> {
        match op {
            AssignOp::Set => {
                let value = value.ok_or(CompileError::Internal("assignment without a value"))?;
                self.emit(value, Ctx::Value)?;
                if ctx.is_value() {
                    self.b.emit_op(Opcode::Dup);
                }
                self.emit_store_var(var)
            }
            AssignOp::Compound(binop) => {
                let value = value.ok_or(CompileError::Internal("assignment without a value"))?;
                self.check_binary(binop, target_ty, &value.ty)?;
                self.emit_load_var(var)?;
                self.emit(value, Ctx::Value)?;
                self.emit_binary_values(binop, target_ty, &value.ty)?;
                if ctx.is_value() {
                    self.b.emit_op(Opcode::Dup);
                }
                self.emit_store_var(var)
            }
            _ => {
                let (binop, post) = Self::crement_parts(op);
                let one_ty = self.check_crement(target_ty)?;
                self.emit_load_var(var)?;
                let old = if post && ctx.is_value() {
                    let t = self.b.alloc_temp();
                    self.b.emit_op(Opcode::Dup);
                    self.b.emit_i(Opcode::StoreLocal, t);
                    Some(t)
                } else {
                    None
                };
                self.emit_one(&one_ty);
                self.emit_binary_values(binop, target_ty, &one_ty)?;
                if !post && ctx.is_value() {
                    self.b.emit_op(Opcode::Dup);
                }
                self.emit_store_var(var)?;
                if let Some(t) = old {
                    self.b.emit_i(Opcode::LoadLocal, t);
                    self.b.free_temp(t);
                }
                Ok(())
            }
        }
    }

    /// Assignment through an address: the receiver (and index) of the
    /// target is evaluated exactly once, and the formed address is
    /// duplicated for the read and the write.
    fn emit_place_assign(
        &mut self,
        target: &ExprRef,
        op: AssignOp,
        value: Option<&Expr>,
        ctx: Ctx,
    ) -> CompileResult<()> {
        self.emit_address(target)?;
        match op {
            AssignOp::Set => {
                let value = value.ok_or(CompileError::Internal("assignment without a value"))?;
                self.emit(value, Ctx::Value)?;
                let result = self.stash_for_result(ctx);
                self.b.emit_op(Opcode::StoreInd);
                self.unstash_result(result);
                Ok(())
            }
            AssignOp::Compound(binop) => {
                let value = value.ok_or(CompileError::Internal("assignment without a value"))?;
                self.check_binary(binop, &target.ty, &value.ty)?;
                self.b.emit_op(Opcode::Dup);
                self.b.emit_op(Opcode::LoadInd);
                self.emit(value, Ctx::Value)?;
                self.emit_binary_values(binop, &target.ty, &value.ty)?;
                let result = self.stash_for_result(ctx);
                self.b.emit_op(Opcode::StoreInd);
                self.unstash_result(result);
                Ok(())
            }
            _ => {
                let (binop, post) = Self::crement_parts(op);
                let one_ty = self.check_crement(&target.ty)?;
                self.b.emit_op(Opcode::Dup);
                self.b.emit_op(Opcode::LoadInd);
                let old = if post && ctx.is_value() {
                    let t = self.b.alloc_temp();
                    self.b.emit_op(Opcode::Dup);
                    self.b.emit_i(Opcode::StoreLocal, t);
                    Some(t)
                } else {
                    None
                };
                self.emit_one(&one_ty);
                self.emit_binary_values(binop, &target.ty, &one_ty)?;
                let result = if !post { self.stash_for_result(ctx) } else { None };
                self.b.emit_op(Opcode::StoreInd);
                self.unstash_result(result);
                if let Some(t) = old {
                    self.b.emit_i(Opcode::LoadLocal, t);
                    self.b.free_temp(t);
                }
                Ok(())
            }
        }
    }

    fn crement_parts(op: AssignOp) -> (BinaryOp, bool) {
        match op {
            AssignOp::PreIncrement => (BinaryOp::Add, false),
            AssignOp::PostIncrement => (BinaryOp::Add, true),
            AssignOp::PreDecrement => (BinaryOp::Sub, false),
            AssignOp::PostDecrement => (BinaryOp::Sub, true),
            AssignOp::Set | AssignOp::Compound(_) => unreachable!("not an increment mode"),
        }
    }

    fn check_crement(&self, target_ty: &Ty) -> CompileResult<Ty> {
        match target_ty.strip_nullable() {
            Ty::Int => Ok(Ty::Int),
            Ty::Float => Ok(Ty::Float),
            _ => Err(NotSupported::AssignTarget("increment of a non-numeric target").into()),
        }
    }

    fn emit_one(&mut self, ty: &Ty) {
        match ty {
            Ty::Float => self.b.push_value(&Value::Float(1.0)),
            _ => self.b.emit_i(Opcode::PushInt, 1),
        }
    }

    /// In expression context, spill the value below the pending
    /// `StoreInd` so it can be re-pushed as the assignment's result.
    fn stash_for_result(&mut self, ctx: Ctx) -> Option<u16> {
        if ctx.is_value() {
            let t = self.b.alloc_temp();
            self.b.emit_op(Opcode::Dup);
            self.b.emit_i(Opcode::StoreLocal, t);
            Some(t)
        } else {
            None
        }
    }

    fn unstash_result(&mut self, slot: Option<u16>) {
        if let Some(t) = slot {
            self.b.emit_i(Opcode::LoadLocal, t);
            self.b.free_temp(t);
        }
    }

    /// Push the address of an assignable place. Receivers and indexes
    /// are evaluated exactly once here; re-reads and writes go through
    /// the resulting address.
    fn emit_address(&mut self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Parameter(var) => match self.storage_of(var)? {
                // The cell a byref argument slot holds is itself the
                // address of the caller's storage.
                Storage::Arg(slot) if var.by_ref => {
                    self.b.emit_i(Opcode::LoadArg, slot);
                }
                Storage::Arg(slot) => self.b.emit_i(Opcode::ArgAddr, slot),
                Storage::Local(slot) => self.b.emit_i(Opcode::LocalAddr, slot),
                Storage::Cell(slot) => self.b.emit_i(Opcode::CellAddr, slot),
            },
            ExprKind::Field { object, field } => {
                self.emit_receiver_address(object)?;
                self.b.emit_i(Opcode::FieldAddr, *field);
            }
            ExprKind::Index { array, index } => {
                self.emit(array, Ctx::Value)?;
                self.emit(index, Ctx::Value)?;
                self.b.emit_op(Opcode::ElemAddr);
            }
            other => return Err(NotSupported::AssignTarget(other.name()).into()),
        }
        Ok(())
    }

    /// Push something `FieldAddr` can root at: an address for value-type
    /// receivers (so writes land in place), the object itself for
    /// reference-type receivers.
    fn emit_receiver_address(&mut self, object: &ExprRef) -> CompileResult<()> {
        if object.ty.is_nullable() {
            return Err(NotSupported::AssignTarget("field of a nullable receiver").into());
        }
        let is_reference = match &object.ty {
            Ty::Struct(s) => s.reference,
            _ => return Err(NotSupported::AssignTarget("field of a non-struct receiver").into()),
        };
        if is_reference {
            return self.emit(object, Ctx::Value);
        }
        match &object.kind {
            ExprKind::Parameter(_) | ExprKind::Field { .. } | ExprKind::Index { .. } => {
                self.emit_address(object)
            }
            // A value-type rvalue has no home; give it one so the write
            // has somewhere to land, matching the source semantics of
            // mutating a temporary copy.
            _ => {
                self.emit(object, Ctx::Value)?;
                let t = self.b.alloc_temp();
                self.b.emit_i(Opcode::StoreLocal, t);
                self.b.emit_i(Opcode::LocalAddr, t);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn label_state(&mut self, target: &LabelRef) -> CompileResult<(Label, Option<u16>, u32)> {
        let id = LabelTarget::id(target);
        if !self.labels.contains_key(&id) {
            let def = self
                .scope
                .label_def(target)
                .ok_or(CompileError::UnresolvedLabel {
                    name: target.name.clone(),
                })?;
            let asm = self.b.create_named_label(target.name.clone());
            let slot = if target.ty != Ty::Unit {
                Some(self.b.alloc_temp())
            } else {
                None
            };
            self.labels.insert(
                id,
                LabelState {
                    asm,
                    slot,
                    try_depth: def.try_depth,
                },
            );
        }
        let state = &self.labels[&id];
        Ok((state.asm, state.slot, state.try_depth))
    }

    fn emit_loop(
        &mut self,
        body: &ExprRef,
        brk: &Option<LabelRef>,
        cont: &Option<LabelRef>,
        loop_ty: &Ty,
        ctx: Ctx,
    ) -> CompileResult<()> {
        let top = match cont {
            Some(label) => self.label_state(label)?.0,
            None => self.b.create_label(),
        };
        self.b.bind_label(top)?;
        self.emit(body, Ctx::Effect)?;
        self.b.emit_jump(top);

        if let Some(label) = brk {
            let (asm, slot, _) = self.label_state(label)?;
            self.b.bind_label(asm)?;
            if ctx.is_value() {
                match slot {
                    Some(slot) if *loop_ty != Ty::Unit => self.b.emit_i(Opcode::LoadLocal, slot),
                    _ => self.b.emit_op(Opcode::PushUnit),
                }
            }
        } else if ctx.is_value() {
            // No break label: the loop never produces a value. Dead, but
            // keeps the context contract; the builder drops it as
            // unreachable.
            self.b.emit_op(Opcode::PushUnit);
        }
        Ok(())
    }

    fn emit_goto(&mut self, target: &LabelRef, value: Option<&Expr>, ctx: Ctx) -> CompileResult<()> {
        let (asm, slot, target_depth) = self.label_state(target)?;

        if let Some(v) = value {
            self.emit(v, Ctx::Value)?;
            match slot {
                Some(slot) => self.b.emit_i(Opcode::StoreLocal, slot),
                None => self.b.emit_op(Opcode::Pop),
            }
        }

        // Route the exit through every finally between here and the
        // target's protected depth, innermost first.
        let active: Vec<usize> = self
            .try_stack
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.in_finally)
            .map(|(i, _)| i)
            .collect();
        if (target_depth as usize) > active.len() {
            return Err(NotSupported::JumpIntoProtectedRegion.into());
        }
        let crossing = active[(target_depth as usize)..].to_vec();
        for &idx in crossing.iter().rev() {
            let finally = self.try_stack[idx].finally.clone();
            if let Some(f) = finally {
                self.try_stack[idx].in_finally = true;
                let result = self.emit(&f, Ctx::Effect);
                self.try_stack[idx].in_finally = false;
                result?;
            }
        }

        self.b.emit_jump(asm);
        // Goto is unit-typed; nothing flows out of it, but honor the
        // context contract for the unreachable fall-through.
        if ctx.is_value() {
            self.b.emit_op(Opcode::PushUnit);
        }
        Ok(())
    }

    fn emit_label(
        &mut self,
        target: &LabelRef,
        default: Option<&Expr>,
        ctx: Ctx,
    ) -> CompileResult<()> {
        let (asm, slot, _) = self.label_state(target)?;
        match slot {
            Some(slot) => {
                match default {
                    Some(d) => self.emit(d, Ctx::Value)?,
                    None => self.emit_default(&target.ty),
                }
                self.b.emit_i(Opcode::StoreLocal, slot);
                self.b.bind_label(asm)?;
                if ctx.is_value() {
                    self.b.emit_i(Opcode::LoadLocal, slot);
                }
            }
            None => {
                if let Some(d) = default {
                    self.emit(d, Ctx::Effect)?;
                }
                self.b.bind_label(asm)?;
                if ctx.is_value() {
                    self.b.emit_op(Opcode::PushUnit);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Protected regions
    // =========================================================================

    fn emit_try(
        &mut self,
        body: &ExprRef,
        catches: &[CatchClause],
        finally: Option<&ExprRef>,
        try_ty: &Ty,
        ctx: Ctx,
    ) -> CompileResult<()> {
        let result_slot = if ctx.is_value() && *try_ty != Ty::Unit {
            Some(self.b.alloc_temp())
        } else {
            None
        };
        let body_ctx = if result_slot.is_some() { Ctx::Value } else { Ctx::Effect };
        let depth0 = self.b.depth();

        self.try_stack.push(TryFrame {
            finally: finally.cloned(),
            in_finally: false,
        });

        let l_end = self.b.create_label();
        let l_fin = finally.map(|_| self.b.create_label());
        let exit = l_fin.unwrap_or(l_end);

        let try_start = self.b.current_pc();
        let body_result = self.emit(body, body_ctx);
        if body_result.is_ok() {
            if let Some(slot) = result_slot {
                self.b.emit_i(Opcode::StoreLocal, slot);
            }
        }
        let try_end = self.b.current_pc();
        self.b.emit_jump(exit);

        // Catch handlers. Each is entered through the table with the
        // exception value pushed at the region's entry depth.
        let mut pending = body_result;
        for clause in catches {
            if pending.is_err() {
                break;
            }
            let handler = self.b.current_pc();
            self.b.resume_at_depth(depth0 + 1);
            pending = (|| -> CompileResult<()> {
                match &clause.var {
                    Some(var) => self.emit_store_var(var)?,
                    None => self.b.emit_op(Opcode::Pop),
                }
                self.emit(&clause.body, body_ctx)?;
                if let Some(slot) = result_slot {
                    self.b.emit_i(Opcode::StoreLocal, slot);
                }
                self.b.emit_jump(exit);
                let filter = clause.ty.as_ref().map(|t| self.b.add_type(t.clone()));
                self.b.add_exception_entry(ExceptionEntry {
                    start: try_start,
                    end: try_end,
                    handler,
                    depth: depth0,
                    kind: HandlerKind::Catch { filter },
                });
                Ok(())
            })();
        }

        // Finally: one inline copy on the shared normal exit path (it
        // sits outside the protected range), one unwind copy terminated
        // by EndFinally and referenced from the table. The table range
        // covers the try body and the catch handlers, so a throw inside
        // a handler still runs the finally.
        if let Some(f) = finally {
            if pending.is_ok() {
                let protected_end = self.b.current_pc();
                pending = (|| -> CompileResult<()> {
                    let l_fin = l_fin.expect("finally label exists");
                    self.b.bind_label(l_fin)?;
                    self.with_finally_marked(|gen| gen.emit(f, Ctx::Effect))?;
                    self.b.emit_jump(l_end);

                    let unwind = self.b.current_pc();
                    self.b.resume_at_depth(depth0);
                    self.with_finally_marked(|gen| gen.emit(f, Ctx::Effect))?;
                    self.b.emit_op(Opcode::EndFinally);
                    self.b.add_exception_entry(ExceptionEntry {
                        start: try_start,
                        end: protected_end,
                        handler: unwind,
                        depth: depth0,
                        kind: HandlerKind::Finally,
                    });
                    Ok(())
                })();
            }
        }

        self.try_stack.pop();
        pending?;

        self.b.bind_label(l_end)?;
        if let Some(slot) = result_slot {
            self.b.emit_i(Opcode::LoadLocal, slot);
            self.b.free_temp(slot);
        }
        Ok(())
    }

    fn with_finally_marked<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CompileResult<R>,
    ) -> CompileResult<R> {
        let idx = self.try_stack.len() - 1;
        self.try_stack[idx].in_finally = true;
        let result = f(self);
        self.try_stack[idx].in_finally = false;
        result
    }

    // =========================================================================
    // Switch
    // =========================================================================

    /// Jump table iff every case value is an integer constant, there are
    /// at least three of them, and the value span is at most three times
    /// the count; everything else lowers to an equality chain.
    fn switch_table_plan(scrutinee_ty: &Ty, cases: &[SwitchCase]) -> Option<(i64, i64)> {
        if *scrutinee_ty != Ty::Int {
            return None;
        }
        let mut values = Vec::new();
        for case in cases {
            for v in &case.values {
                match v {
                    Value::Int(n) => values.push(*n),
                    _ => return None,
                }
            }
        }
        if values.len() < 3 {
            return None;
        }
        let min = *values.iter().min().expect("nonempty");
        let max = *values.iter().max().expect("nonempty");
        let span = max.checked_sub(min)?;
        if span > (values.len() as i64).saturating_mul(3) || span >= u16::MAX as i64 {
            return None;
        }
        Some((min, max))
    }

    fn emit_switch(
        &mut self,
        scrutinee: &ExprRef,
        cases: &[SwitchCase],
        default: Option<&Expr>,
        switch_ty: &Ty,
        ctx: Ctx,
    ) -> CompileResult<()> {
        if !matches!(scrutinee.ty, Ty::Int | Ty::Bool | Ty::Str) {
            return Err(NotSupported::SwitchScrutinee(scrutinee.ty.clone()).into());
        }
        let body_ctx = ctx.value_child();
        let l_end = self.b.create_label();
        let l_default = self.b.create_label();
        let case_labels: Vec<Label> = cases.iter().map(|_| self.b.create_label()).collect();

        if let Some((min, max)) = Self::switch_table_plan(&scrutinee.ty, cases) {
            // Dense integral cases: one table dispatch.
            let span = (max - min) as usize + 1;
            let mut targets = vec![l_default; span];
            for (case, &label) in cases.iter().zip(&case_labels) {
                for v in &case.values {
                    if let Value::Int(n) = v {
                        targets[(n - min) as usize] = label;
                    }
                }
            }
            self.emit(scrutinee, Ctx::Value)?;
            self.b.emit_switch(min, targets, l_default);
        } else {
            // Sparse or non-integral: an equality chain over a spilled
            // scrutinee.
            self.emit(scrutinee, Ctx::Value)?;
            let t = self.b.alloc_temp();
            self.b.emit_i(Opcode::StoreLocal, t);
            for (case, &label) in cases.iter().zip(&case_labels) {
                for v in &case.values {
                    self.b.emit_i(Opcode::LoadLocal, t);
                    self.b.push_value(v);
                    self.b.emit_op(Opcode::Eq);
                    self.b.emit_jump_if_true(label);
                }
            }
            self.b.emit_jump(l_default);
            self.b.free_temp(t);
        }

        for (case, &label) in cases.iter().zip(&case_labels) {
            self.b.bind_label(label)?;
            self.emit(&case.body, body_ctx)?;
            self.b.emit_jump(l_end);
        }

        self.b.bind_label(l_default)?;
        match default {
            Some(d) => self.emit(d, body_ctx)?,
            None => {
                if body_ctx.is_value() {
                    self.emit_default(switch_ty);
                }
            }
        }
        self.b.bind_label(l_end)?;
        Ok(())
    }
}

/// What a lifted operator produces when an operand is null.
#[derive(Debug, Clone, Copy)]
enum NullResult {
    Null,
    False,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_tree::Var;

    fn lambda_of(params: Vec<VarRef>, body: ExprRef) -> Arc<LambdaExpr> {
        match &Expr::lambda("test", params, body).kind {
            ExprKind::Lambda(l) => l.clone(),
            _ => unreachable!(),
        }
    }

    fn compile(lambda: &Arc<LambdaExpr>) -> Arc<CodeUnit> {
        compile_lambda(lambda, &Options::default()).expect("compile error")
    }

    fn count_opcode(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions
            .iter()
            .filter(|i| i.opcode() == Some(op))
            .count()
    }

    #[test]
    fn add_compiles_to_three_instructions() {
        let lambda = lambda_of(
            vec![],
            Expr::add(Expr::constant(Value::Int(1)), Expr::constant(Value::Int(2))),
        );
        let unit = compile(&lambda);
        let ops: Vec<Opcode> = unit
            .instructions
            .iter()
            .map(|i| i.opcode().unwrap())
            .collect();
        assert_eq!(
            ops,
            vec![Opcode::PushInt, Opcode::PushInt, Opcode::Add, Opcode::Return]
        );
    }

    #[test]
    fn lifted_add_emits_null_tests() {
        let lambda = lambda_of(
            vec![],
            Expr::add(Expr::null_of(Ty::Int), Expr::constant(Value::Int(2))),
        );
        let unit = compile(&lambda);
        assert!(count_opcode(&unit, Opcode::IsNull) >= 1);
        assert!(count_opcode(&unit, Opcode::PushNull) >= 1);
    }

    #[test]
    fn compound_array_assign_evaluates_receiver_once() {
        // a[i] += 1 must form the element address once: one ElemAddr and
        // no LoadElem/StoreElem pair that would re-run the index.
        let a = Var::new("a", Ty::array(Ty::Int));
        let body = Expr::add_assign(
            Expr::index(Expr::param(&a), Expr::constant(Value::Int(0))),
            Expr::constant(Value::Int(1)),
        );
        let lambda = lambda_of(vec![a], Expr::seq(vec![body]));
        let unit = compile(&lambda);
        assert_eq!(count_opcode(&unit, Opcode::ElemAddr), 1);
        assert_eq!(count_opcode(&unit, Opcode::LoadElem), 0);
        assert_eq!(count_opcode(&unit, Opcode::LoadInd), 1);
        assert_eq!(count_opcode(&unit, Opcode::StoreInd), 1);
    }

    #[test]
    fn quote_is_refused_not_crashed() {
        let lambda = lambda_of(vec![], Expr::quote(Expr::constant(Value::Int(1))));
        let err = compile_lambda(&lambda, &Options::default()).unwrap_err();
        assert!(err.is_refusal());
        assert!(err.to_string().contains("Quote"));
    }

    #[test]
    fn mismatched_operand_types_are_refused() {
        let lambda = lambda_of(
            vec![],
            Expr::binary(
                BinaryOp::Add,
                Expr::constant(Value::Int(1)),
                Expr::constant(Value::Float(1.0)),
            ),
        );
        let err = compile_lambda(&lambda, &Options::default()).unwrap_err();
        assert!(err.is_refusal());
    }

    #[test]
    fn tail_call_inside_try_is_refused() {
        let f = ember_core::NativeFn::new("id", 1, |args| Ok(args[0].clone()));
        let body = Expr::try_finally(
            Expr::tail_call(f, vec![Expr::constant(Value::Int(1))], Ty::Int),
            Expr::empty(),
        );
        let lambda = lambda_of(vec![], body);
        let options = Options {
            enable_tail_calls: true,
            ..Options::default()
        };
        let err = compile_lambda(&lambda, &options).unwrap_err();
        assert!(matches!(
            err,
            CompileError::NotSupported(NotSupported::TailCallInProtectedRegion)
        ));
    }

    #[test]
    fn tail_call_in_return_position_emits_the_qualifier() {
        let f = ember_core::NativeFn::new("id", 1, |args| Ok(args[0].clone()));
        let lambda = lambda_of(
            vec![],
            Expr::tail_call(f, vec![Expr::constant(Value::Int(1))], Ty::Int),
        );
        let options = Options {
            enable_tail_calls: true,
            ..Options::default()
        };
        let unit = compile_lambda(&lambda, &options).unwrap();
        assert_eq!(count_opcode(&unit, Opcode::TailCallNative), 1);
        // Qualifier is followed immediately by a return.
        let pos = unit
            .instructions
            .iter()
            .position(|i| i.opcode() == Some(Opcode::TailCallNative))
            .unwrap();
        assert_eq!(unit.instructions[pos + 1].opcode(), Some(Opcode::Return));
    }

    #[test]
    fn dense_switch_uses_a_jump_table() {
        let s = Var::new("s", Ty::Int);
        let cases = vec![
            SwitchCase { values: vec![Value::Int(1)], body: Expr::constant(Value::Int(10)) },
            SwitchCase { values: vec![Value::Int(2)], body: Expr::constant(Value::Int(20)) },
            SwitchCase { values: vec![Value::Int(3)], body: Expr::constant(Value::Int(30)) },
        ];
        let body = Expr::switch(
            Expr::param(&s),
            cases,
            Some(Expr::constant(Value::Int(0))),
        );
        let lambda = lambda_of(vec![s], body);
        let unit = compile(&lambda);
        assert_eq!(count_opcode(&unit, Opcode::Switch), 1);
        assert_eq!(unit.switch_tables.len(), 1);
        assert_eq!(unit.switch_tables[0].base, 1);
        assert_eq!(unit.switch_tables[0].targets.len(), 3);
    }

    #[test]
    fn sparse_switch_uses_an_equality_chain() {
        let s = Var::new("s", Ty::Int);
        let cases = vec![
            SwitchCase { values: vec![Value::Int(1)], body: Expr::constant(Value::Int(10)) },
            SwitchCase { values: vec![Value::Int(1000)], body: Expr::constant(Value::Int(20)) },
            SwitchCase { values: vec![Value::Int(-1000)], body: Expr::constant(Value::Int(30)) },
        ];
        let body = Expr::switch(
            Expr::param(&s),
            cases,
            Some(Expr::constant(Value::Int(0))),
        );
        let lambda = lambda_of(vec![s], body);
        let unit = compile(&lambda);
        assert_eq!(count_opcode(&unit, Opcode::Switch), 0);
        assert!(count_opcode(&unit, Opcode::Eq) >= 3);
    }

    #[test]
    fn goto_out_of_try_inlines_the_finally() {
        let exit = LabelTarget::new("exit", Ty::Unit);
        let f = ember_core::NativeFn::new("noop", 0, |_| Ok(Value::Unit));
        let finally_body = Expr::call(f, vec![], Ty::Unit);
        let body = Expr::seq(vec![
            Expr::try_finally(Expr::goto(&exit), finally_body),
            Expr::label(&exit),
        ]);
        let lambda = lambda_of(vec![], body);
        let unit = compile(&lambda);
        // Goto copy + normal-path copy + unwind copy.
        assert_eq!(count_opcode(&unit, Opcode::CallNative), 3);
        assert_eq!(count_opcode(&unit, Opcode::EndFinally), 1);
        assert_eq!(unit.exception_table.len(), 1);
        assert_eq!(unit.exception_table[0].kind, HandlerKind::Finally);
    }

    #[test]
    fn nested_lambda_compiles_to_a_nested_unit() {
        let x = Var::new("x", Ty::Int);
        let inner = Expr::lambda("inner", vec![], Expr::param(&x));
        let body = Expr::block(
            vec![x.clone()],
            vec![
                Expr::assign(Expr::param(&x), Expr::constant(Value::Int(1))),
                inner,
            ],
        );
        let lambda = lambda_of(vec![], body);
        let unit = compile(&lambda);
        assert_eq!(unit.nested.len(), 1);
        assert_eq!(unit.cell_count, 1);
        assert_eq!(unit.nested[0].captures.as_ref(), &[0]);
        assert_eq!(count_opcode(&unit, Opcode::MakeClosure), 1);
    }
}
