//! Scope and closure analysis.
//!
//! A single pre-codegen pass over a lambda tree that:
//!
//! 1. discovers parameters and block-declared variables per lambda
//!    boundary and assigns each a storage class: argument slot, local
//!    slot, or closure-cell slot;
//! 2. detects captures: a variable referenced inside a nested lambda but
//!    declared in an enclosing one is promoted to a cell in its defining
//!    scope and relayed as a captured cell through every intermediate
//!    scope down to the use site, so doubly-nested closures can reach it;
//! 3. collects label definitions per lambda together with the
//!    protected-region depth at the definition site;
//! 4. reports definitional errors before any instruction is emitted:
//!    references to undeclared variables and doubly-defined labels.
//!
//! Cell slot layout per scope is own cells (cellvars) first, then
//! captured cells (freevars), matching the frame layout the VM builds.
//! Variable identity is the `Arc` allocation, so same-named variables in
//! different scopes are distinct and shadowing needs no special casing.

use crate::error::{CompileError, CompileResult};
use ember_tree::{
    Expr, ExprKind, LabelTarget, LambdaExpr, Var, VarRef,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Where a variable lives, relative to the scope using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Argument slot of the frame.
    Arg(u16),
    /// Local slot of the frame.
    Local(u16),
    /// Closure cell slot of the frame.
    Cell(u16),
}

/// A label definition discovered by analysis.
#[derive(Debug, Clone)]
pub struct LabelDef {
    /// Surface name, for diagnostics.
    pub name: Arc<str>,
    /// Number of protected regions enclosing the definition site. Goto
    /// emission uses this to count the finally bodies an exit crosses.
    pub try_depth: u32,
}

/// Analysis output for one lambda boundary.
#[derive(Debug)]
pub struct ScopeInfo {
    /// Lambda name.
    pub name: Arc<str>,
    /// Ordered parameters.
    pub params: Vec<VarRef>,
    /// Per-parameter by-reference flags.
    pub param_byref: Vec<bool>,
    /// Local slots used by declared variables.
    pub local_count: u16,
    /// Cells this scope materializes (cellvars).
    pub cell_count: u16,
    /// For each captured variable, the enclosing scope's cell slot.
    /// Captured cells occupy slots `cell_count..cell_count + captures.len()`.
    pub captures: Vec<u16>,
    /// `(arg_slot, cell_slot)`: captured parameters copied into their
    /// cells at frame entry.
    pub cell_params: Vec<(u16, u16)>,
    storage: FxHashMap<usize, Storage>,
    labels: FxHashMap<usize, LabelDef>,
}

impl ScopeInfo {
    /// Storage class of a variable referenced in this scope.
    pub fn storage_of(&self, var: &VarRef) -> Option<Storage> {
        self.storage.get(&Var::id(var)).copied()
    }

    /// The definition of a label declared in this scope.
    pub fn label_def(&self, target: &Arc<LabelTarget>) -> Option<&LabelDef> {
        self.labels.get(&LabelTarget::id(target))
    }
}

/// Complete analysis of a lambda tree: one [`ScopeInfo`] per lambda
/// boundary, keyed by lambda identity.
#[derive(Debug)]
pub struct Analysis {
    scopes: FxHashMap<usize, ScopeInfo>,
}

impl Analysis {
    /// The scope of a lambda, which must belong to the analyzed tree.
    pub fn scope(&self, lambda: &Arc<LambdaExpr>) -> &ScopeInfo {
        &self.scopes[&(Arc::as_ptr(lambda) as usize)]
    }
}

/// In-flight state for one lambda boundary during the walk.
struct LambdaScope {
    id: usize,
    name: Arc<str>,
    parent: Option<usize>,
    params: Vec<VarRef>,
    /// Everything ever declared in this lambda (params and block
    /// locals); guards against double slot assignment.
    declared: FxHashSet<usize>,
    /// Declared variables currently in scope (block visibility).
    active: FxHashSet<usize>,
    /// All block-declared variables, in declaration order.
    local_order: Vec<VarRef>,
    /// Variables of this scope captured by nested lambdas.
    captured: FxHashSet<usize>,
    /// Variables captured from enclosing scopes (direct uses and
    /// relays), in discovery order.
    freevars: Vec<VarRef>,
    free_set: FxHashSet<usize>,
    labels: FxHashMap<usize, LabelDef>,
    try_depth: u32,
}

impl LambdaScope {
    fn add_free(&mut self, var: &VarRef) {
        let id = Var::id(var);
        if self.free_set.insert(id) {
            self.freevars.push(var.clone());
        }
    }
}

/// Intermediate result held until capture maps can be resolved against
/// parent slot assignments.
struct FinishedScope {
    info: ScopeInfo,
    parent: Option<usize>,
    freevars: Vec<VarRef>,
}

/// The analyzer. One instance per compilation; see [`ScopeAnalyzer::analyze`].
pub struct ScopeAnalyzer {
    stack: Vec<LambdaScope>,
    finished: FxHashMap<usize, FinishedScope>,
}

impl ScopeAnalyzer {
    /// Analyze a tree rooted at `lambda`.
    pub fn analyze(lambda: &Arc<LambdaExpr>) -> CompileResult<Analysis> {
        let mut analyzer = ScopeAnalyzer {
            stack: Vec::new(),
            finished: FxHashMap::default(),
        };
        analyzer.enter_lambda(lambda);
        analyzer.walk(&lambda.body)?;
        analyzer.leave_lambda();
        analyzer.resolve_captures()
    }

    fn enter_lambda(&mut self, lambda: &Arc<LambdaExpr>) {
        let parent = self.stack.last().map(|s| s.id);
        let mut scope = LambdaScope {
            id: Arc::as_ptr(lambda) as usize,
            name: lambda.name.clone(),
            parent,
            params: lambda.params.clone(),
            declared: FxHashSet::default(),
            active: FxHashSet::default(),
            local_order: Vec::new(),
            captured: FxHashSet::default(),
            freevars: Vec::new(),
            free_set: FxHashSet::default(),
            labels: FxHashMap::default(),
            try_depth: 0,
        };
        for param in &lambda.params {
            let id = Var::id(param);
            scope.declared.insert(id);
            scope.active.insert(id);
        }
        self.stack.push(scope);
    }

    fn leave_lambda(&mut self) {
        let scope = self.stack.pop().expect("lambda scope stack underflow");

        // Slot assignment. Cells first: captured params and captured
        // locals in declaration order, then captured cells from
        // enclosing scopes after them.
        let mut storage = FxHashMap::default();
        let mut cell_slot: u16 = 0;
        let mut cell_params = Vec::new();

        for (arg_slot, param) in scope.params.iter().enumerate() {
            let id = Var::id(param);
            if scope.captured.contains(&id) {
                storage.insert(id, Storage::Cell(cell_slot));
                cell_params.push((arg_slot as u16, cell_slot));
                cell_slot += 1;
            } else {
                storage.insert(id, Storage::Arg(arg_slot as u16));
            }
        }

        let mut local_slot: u16 = 0;
        for var in &scope.local_order {
            let id = Var::id(var);
            if scope.captured.contains(&id) {
                storage.insert(id, Storage::Cell(cell_slot));
                cell_slot += 1;
            } else {
                storage.insert(id, Storage::Local(local_slot));
                local_slot += 1;
            }
        }

        let cell_count = cell_slot;
        for (i, var) in scope.freevars.iter().enumerate() {
            storage.insert(Var::id(var), Storage::Cell(cell_count + i as u16));
        }

        let info = ScopeInfo {
            name: scope.name,
            param_byref: scope.params.iter().map(|p| p.by_ref).collect(),
            params: scope.params,
            local_count: local_slot,
            cell_count,
            captures: Vec::new(),
            cell_params,
            storage,
            labels: scope.labels,
        };
        self.finished.insert(
            scope.id,
            FinishedScope {
                info,
                parent: scope.parent,
                freevars: scope.freevars,
            },
        );
    }

    /// Fill in the capture maps once every scope's slot assignment is
    /// known: each captured variable pulls the defining-or-relaying
    /// parent's cell slot.
    fn resolve_captures(mut self) -> CompileResult<Analysis> {
        let ids: Vec<usize> = self.finished.keys().copied().collect();
        for id in ids {
            let (parent, freevars) = {
                let s = &self.finished[&id];
                (s.parent, s.freevars.clone())
            };
            let mut captures = Vec::with_capacity(freevars.len());
            for var in &freevars {
                let parent_id =
                    parent.ok_or(CompileError::Internal("captured variable with no parent scope"))?;
                let parent_scope = &self.finished[&parent_id];
                match parent_scope.info.storage.get(&Var::id(var)) {
                    Some(Storage::Cell(slot)) => captures.push(*slot),
                    _ => {
                        return Err(CompileError::Internal(
                            "captured variable not a cell in the enclosing scope",
                        ))
                    }
                }
            }
            self.finished.get_mut(&id).expect("scope exists").info.captures = captures;
        }
        Ok(Analysis {
            scopes: self
                .finished
                .into_iter()
                .map(|(id, s)| (id, s.info))
                .collect(),
        })
    }

    /// Resolve a variable use in the innermost scope that actively
    /// declares it, promoting to cells and relaying through intermediate
    /// scopes on capture.
    fn resolve(&mut self, var: &VarRef) -> CompileResult<()> {
        let id = Var::id(var);
        let top = self.stack.len() - 1;
        let defining = (0..=top)
            .rev()
            .find(|&i| self.stack[i].active.contains(&id));
        match defining {
            Some(i) if i == top => Ok(()),
            Some(i) => {
                self.stack[i].captured.insert(id);
                for j in i + 1..=top {
                    self.stack[j].add_free(var);
                }
                Ok(())
            }
            None => Err(CompileError::UndefinedVariable {
                name: var.name.clone(),
            }),
        }
    }

    fn declare(&mut self, var: &VarRef) {
        let scope = self.stack.last_mut().expect("no active lambda scope");
        let id = Var::id(var);
        if scope.declared.insert(id) {
            scope.local_order.push(var.clone());
        }
        scope.active.insert(id);
    }

    fn undeclare(&mut self, var: &VarRef) {
        let scope = self.stack.last_mut().expect("no active lambda scope");
        scope.active.remove(&Var::id(var));
    }

    fn define_label(&mut self, target: &Arc<LabelTarget>) -> CompileResult<()> {
        let scope = self.stack.last_mut().expect("no active lambda scope");
        let def = LabelDef {
            name: target.name.clone(),
            try_depth: scope.try_depth,
        };
        if scope.labels.insert(LabelTarget::id(target), def).is_some() {
            return Err(CompileError::DuplicateLabel {
                name: target.name.clone(),
            });
        }
        Ok(())
    }

    fn walk(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Constant(_) | ExprKind::Default(_) => Ok(()),

            ExprKind::Parameter(var) => self.resolve(var),

            ExprKind::Unary { operand, .. } | ExprKind::Convert { operand } => self.walk(operand),

            ExprKind::Binary { left, right, .. } => {
                self.walk(left)?;
                self.walk(right)
            }

            ExprKind::Field { object, .. } => self.walk(object),

            ExprKind::Index { array, index } => {
                self.walk(array)?;
                self.walk(index)
            }

            ExprKind::Call { args, .. } | ExprKind::New { args, .. } => {
                for arg in args {
                    self.walk(arg)?;
                }
                Ok(())
            }

            ExprKind::NewArray { items, .. } => {
                for item in items {
                    self.walk(item)?;
                }
                Ok(())
            }

            ExprKind::Conditional { test, then, other } => {
                self.walk(test)?;
                self.walk(then)?;
                self.walk(other)
            }

            ExprKind::Block { vars, body } => {
                for var in vars {
                    self.declare(var);
                }
                for e in body {
                    self.walk(e)?;
                }
                for var in vars {
                    self.undeclare(var);
                }
                Ok(())
            }

            ExprKind::Loop { body, brk, cont } => {
                if let Some(label) = brk {
                    self.define_label(label)?;
                }
                if let Some(label) = cont {
                    self.define_label(label)?;
                }
                self.walk(body)
            }

            ExprKind::Goto { value, .. } => {
                if let Some(v) = value {
                    self.walk(v)?;
                }
                Ok(())
            }

            ExprKind::Label { target, default } => {
                self.define_label(target)?;
                if let Some(d) = default {
                    self.walk(d)?;
                }
                Ok(())
            }

            ExprKind::Lambda(inner) => {
                self.enter_lambda(inner);
                self.walk(&inner.body)?;
                self.leave_lambda();
                Ok(())
            }

            ExprKind::Invoke { target, args, .. } => {
                self.walk(target)?;
                for arg in args {
                    self.walk(arg)?;
                }
                Ok(())
            }

            ExprKind::Assign { target, value, .. } => {
                self.walk(target)?;
                if let Some(v) = value {
                    self.walk(v)?;
                }
                Ok(())
            }

            ExprKind::TryCatchFinally {
                body,
                catches,
                finally,
            } => {
                {
                    let scope = self.stack.last_mut().expect("no active lambda scope");
                    scope.try_depth += 1;
                }
                self.walk(body)?;
                for clause in catches {
                    if let Some(var) = &clause.var {
                        self.declare(var);
                    }
                    self.walk(&clause.body)?;
                    if let Some(var) = &clause.var {
                        self.undeclare(var);
                    }
                }
                {
                    let scope = self.stack.last_mut().expect("no active lambda scope");
                    scope.try_depth -= 1;
                }
                if let Some(f) = finally {
                    self.walk(f)?;
                }
                Ok(())
            }

            ExprKind::Switch {
                scrutinee,
                cases,
                default,
            } => {
                self.walk(scrutinee)?;
                for case in cases {
                    self.walk(&case.body)?;
                }
                if let Some(d) = default {
                    self.walk(d)?;
                }
                Ok(())
            }

            // Refused by the code generator; their interior is not part
            // of the compiled program.
            ExprKind::Quote(_) | ExprKind::RuntimeVariables(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Ty, Value};
    use ember_tree::Expr;

    fn lambda_of(params: Vec<VarRef>, body: ember_tree::ExprRef) -> Arc<LambdaExpr> {
        match &Expr::lambda("test", params, body).kind {
            ExprKind::Lambda(l) => l.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn params_and_locals_get_slots() {
        let p = Var::new("p", Ty::Int);
        let q = Var::new("q", Ty::Int);
        let x = Var::new("x", Ty::Int);
        let body = Expr::block(
            vec![x.clone()],
            vec![Expr::assign(Expr::param(&x), Expr::param(&q))],
        );
        let lambda = lambda_of(vec![p.clone(), q.clone()], body);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();
        let scope = analysis.scope(&lambda);

        assert_eq!(scope.storage_of(&p), Some(Storage::Arg(0)));
        assert_eq!(scope.storage_of(&q), Some(Storage::Arg(1)));
        assert_eq!(scope.storage_of(&x), Some(Storage::Local(0)));
        assert_eq!(scope.local_count, 1);
        assert_eq!(scope.cell_count, 0);
    }

    #[test]
    fn captured_local_becomes_a_cell() {
        let x = Var::new("x", Ty::Int);
        let inner = Expr::lambda("inner", vec![], Expr::param(&x));
        let inner_lambda = match &inner.kind {
            ExprKind::Lambda(l) => l.clone(),
            _ => unreachable!(),
        };
        let body = Expr::block(
            vec![x.clone()],
            vec![
                Expr::assign(Expr::param(&x), Expr::constant(Value::Int(1))),
                inner,
            ],
        );
        let lambda = lambda_of(vec![], body);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();

        let outer = analysis.scope(&lambda);
        assert_eq!(outer.storage_of(&x), Some(Storage::Cell(0)));
        assert_eq!(outer.cell_count, 1);
        assert_eq!(outer.local_count, 0);

        let inner_scope = analysis.scope(&inner_lambda);
        assert_eq!(inner_scope.storage_of(&x), Some(Storage::Cell(0)));
        assert_eq!(inner_scope.cell_count, 0);
        assert_eq!(inner_scope.captures, vec![0]);
    }

    #[test]
    fn capture_relays_through_an_intermediate_lambda() {
        // outer declares x; innermost uses it; the middle lambda never
        // mentions x but must still relay the cell.
        let x = Var::new("x", Ty::Int);
        let innermost = Expr::lambda("innermost", vec![], Expr::param(&x));
        let middle = Expr::lambda("middle", vec![], innermost.clone());
        let middle_lambda = match &middle.kind {
            ExprKind::Lambda(l) => l.clone(),
            _ => unreachable!(),
        };
        let body = Expr::block(vec![x.clone()], vec![middle]);
        let lambda = lambda_of(vec![], body);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();

        let outer = analysis.scope(&lambda);
        assert_eq!(outer.storage_of(&x), Some(Storage::Cell(0)));

        let middle_scope = analysis.scope(&middle_lambda);
        // Relay: x is a captured cell in the middle scope even though the
        // middle body never references it.
        assert_eq!(middle_scope.storage_of(&x), Some(Storage::Cell(0)));
        assert_eq!(middle_scope.captures, vec![0]);
    }

    #[test]
    fn captured_parameter_gets_a_cell_copy() {
        let p = Var::new("p", Ty::Int);
        let inner = Expr::lambda("inner", vec![], Expr::param(&p));
        let lambda = lambda_of(vec![p.clone()], inner);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();
        let scope = analysis.scope(&lambda);

        assert_eq!(scope.storage_of(&p), Some(Storage::Cell(0)));
        assert_eq!(scope.cell_params, vec![(0, 0)]);
    }

    #[test]
    fn undefined_variable_is_reported_before_codegen() {
        let stray = Var::new("stray", Ty::Int);
        let lambda = lambda_of(vec![], Expr::param(&stray));
        match ScopeAnalyzer::analyze(&lambda) {
            Err(CompileError::UndefinedVariable { name }) => assert_eq!(name.as_ref(), "stray"),
            other => panic!("expected UndefinedVariable, got {other:?}"),
        }
    }

    #[test]
    fn variable_is_not_visible_outside_its_block() {
        let x = Var::new("x", Ty::Int);
        let body = Expr::seq(vec![
            Expr::block(vec![x.clone()], vec![Expr::param(&x)]),
            // Out of scope here.
            Expr::param(&x),
        ]);
        let lambda = lambda_of(vec![], body);
        assert!(matches!(
            ScopeAnalyzer::analyze(&lambda),
            Err(CompileError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn shadowing_by_name_is_legal() {
        let outer_x = Var::new("x", Ty::Int);
        let inner_x = Var::new("x", Ty::Int);
        let inner = Expr::lambda(
            "inner",
            vec![],
            Expr::block(vec![inner_x.clone()], vec![Expr::param(&inner_x)]),
        );
        let body = Expr::block(vec![outer_x.clone()], vec![inner]);
        let lambda = lambda_of(vec![], body);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();
        let outer = analysis.scope(&lambda);
        // The inner x is a distinct entity; outer x is not captured.
        assert_eq!(outer.storage_of(&outer_x), Some(Storage::Local(0)));
        assert_eq!(outer.cell_count, 0);
    }

    #[test]
    fn duplicate_label_is_reported() {
        let l = LabelTarget::new("dup", Ty::Unit);
        let body = Expr::seq(vec![Expr::label(&l), Expr::label(&l)]);
        let lambda = lambda_of(vec![], body);
        match ScopeAnalyzer::analyze(&lambda) {
            Err(CompileError::DuplicateLabel { name }) => assert_eq!(name.as_ref(), "dup"),
            other => panic!("expected DuplicateLabel, got {other:?}"),
        }
    }

    #[test]
    fn label_records_protected_depth() {
        let inside = LabelTarget::new("inside", Ty::Unit);
        let outside = LabelTarget::new("outside", Ty::Unit);
        let body = Expr::seq(vec![
            Expr::try_finally(Expr::label(&inside), Expr::empty()),
            Expr::label(&outside),
        ]);
        let lambda = lambda_of(vec![], body);
        let analysis = ScopeAnalyzer::analyze(&lambda).unwrap();
        let scope = analysis.scope(&lambda);
        assert_eq!(scope.label_def(&inside).unwrap().try_depth, 1);
        assert_eq!(scope.label_def(&outside).unwrap().try_depth, 0);
    }
}
