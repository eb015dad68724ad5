//! Semantic analyzer: scope discovery and binding
//! disambiguation, producing the annotated tree in [`crate::hir`].
//!
//! Two passes:
//!
//! - **Pass 1 — discovery.** A top-down traversal that attaches a
//!   [`ScopeNode`] to every scope-forming node (function body, block,
//!   catch clause, program root) and hoists `var`/function declarations
//!   to the nearest enclosing function-or-program scope. Scope nodes are
//!   appended to a flat arena in the exact pre-order the traversal visits
//!   them — an arena of scopes keyed by index, avoiding back-pointers.
//! - **Pass 2 — disambiguation.** A second traversal over the *same* tree,
//!   in the *same* pre-order, consuming scope nodes from the arena by a
//!   monotonic cursor (no node-identity bookkeeping needed, since both
//!   passes visit scope-forming nodes in an identical sequence) and
//!   producing the [`crate::hir::Module`].
//!
//! The analyzer is a pure function of its input (`analyze` never reads or
//! retains process-wide state), so running it twice on the same tree is
//! idempotent — the second run just recomputes the same result.

use std::rc::Rc;
use rustc_hash::FxHashMap;

use crate::ast::{self, Expr, ForInit, Stmt, VarKind};
use crate::config::CompilerOptions;
use crate::errors::{CompileError, CompileResult, SourceSpan};
use crate::hir::{DeclKind, HExpr, HFunction, HStmt, MemberKey, Module, ResolvedIdent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Program,
    Function,
    Block,
    Catch,
}

struct ScopeNode {
    #[allow(dead_code)]
    kind: ScopeKind,
    bindings: FxHashMap<String, DeclKind>,
}

/// Pass 1: builds the flat, pre-order scope arena.
struct Discovery {
    scopes: Vec<ScopeNode>,
}

impl Discovery {
    fn new() -> Self {
        Discovery { scopes: Vec::new() }
    }

    fn push_scope(&mut self, kind: ScopeKind) -> usize {
        self.scopes.push(ScopeNode {
            kind,
            bindings: FxHashMap::default(),
        });
        self.scopes.len() - 1
    }

    fn declare(&mut self, idx: usize, name: &str, kind: DeclKind) -> CompileResult<()> {
        let is_block_scoped = matches!(kind, DeclKind::Let | DeclKind::Const);
        let node = &mut self.scopes[idx];
        if let Some(existing) = node.bindings.get(name) {
            let existing_block_scoped = matches!(existing, DeclKind::Let | DeclKind::Const);
            if is_block_scoped || existing_block_scoped {
                return Err(CompileError::Redeclaration {
                    name: name.to_string(),
                    span: SourceSpan::unknown(),
                });
            }
            return Ok(());
        }
        node.bindings.insert(name.to_string(), kind);
        Ok(())
    }

    fn run(&mut self, program: &ast::Program) -> CompileResult<()> {
        let root = self.push_scope(ScopeKind::Program);
        self.block_body(&program.body, root, root)
    }

    fn block_body(&mut self, body: &[Stmt], hoist: usize, current: usize) -> CompileResult<()> {
        for stmt in body {
            self.stmt(stmt, hoist, current)?;
        }
        Ok(())
    }

    fn function(&mut self, f: &ast::FunctionNode) -> CompileResult<()> {
        let fn_scope = self.push_scope(ScopeKind::Function);
        for p in &f.params {
            self.declare(fn_scope, &p.name, DeclKind::Param)?;
        }
        self.block_body(&f.body, fn_scope, fn_scope)
    }

    fn stmt(&mut self, stmt: &Stmt, hoist: usize, current: usize) -> CompileResult<()> {
        match stmt {
            Stmt::VariableDeclaration { kind, declarations } => {
                let (target, decl_kind) = match kind {
                    VarKind::Var => (hoist, DeclKind::Var),
                    VarKind::Let => (current, DeclKind::Let),
                    VarKind::Const => (current, DeclKind::Const),
                };
                for d in declarations {
                    self.declare(target, &d.id.name, decl_kind)?;
                    if let Some(init) = &d.init {
                        self.expr(init, hoist, current)?;
                    }
                }
                Ok(())
            }
            Stmt::FunctionDeclaration(f) => {
                if let Some(id) = &f.id {
                    self.declare(hoist, &id.name, DeclKind::Function)?;
                }
                self.function(f)
            }
            Stmt::Block { body } => {
                let block_scope = self.push_scope(ScopeKind::Block);
                self.block_body(body, hoist, block_scope)
            }
            Stmt::Expression { expression } => self.expr(expression, hoist, current),
            Stmt::If { test, consequent, alternate } => {
                self.expr(test, hoist, current)?;
                self.stmt(consequent, hoist, current)?;
                if let Some(alt) = alternate {
                    self.stmt(alt, hoist, current)?;
                }
                Ok(())
            }
            Stmt::While { test, body } => {
                self.expr(test, hoist, current)?;
                self.stmt(body, hoist, current)
            }
            Stmt::For { init, test, update, body } => {
                let loop_scope = self.push_scope(ScopeKind::Block);
                if let Some(init) = init {
                    match init.as_ref() {
                        ForInit::Decl { kind, declarations } => {
                            let (target, decl_kind) = match kind {
                                VarKind::Var => (hoist, DeclKind::Var),
                                VarKind::Let => (loop_scope, DeclKind::Let),
                                VarKind::Const => (loop_scope, DeclKind::Const),
                            };
                            for d in declarations {
                                self.declare(target, &d.id.name, decl_kind)?;
                                if let Some(init) = &d.init {
                                    self.expr(init, hoist, loop_scope)?;
                                }
                            }
                        }
                        ForInit::Expr(e) => self.expr(e, hoist, loop_scope)?,
                    }
                }
                if let Some(test) = test {
                    self.expr(test, hoist, loop_scope)?;
                }
                if let Some(update) = update {
                    self.expr(update, hoist, loop_scope)?;
                }
                self.stmt(body, hoist, loop_scope)
            }
            Stmt::Return { argument } => {
                if let Some(a) = argument {
                    self.expr(a, hoist, current)?;
                }
                Ok(())
            }
            Stmt::Throw { argument } => self.expr(argument, hoist, current),
            Stmt::Try { block, handler, finalizer } => {
                let try_scope = self.push_scope(ScopeKind::Block);
                self.block_body(block, hoist, try_scope)?;
                if let Some(h) = handler {
                    let catch_scope = self.push_scope(ScopeKind::Catch);
                    if let Some(p) = &h.param {
                        self.declare(catch_scope, &p.name, DeclKind::Catch)?;
                    }
                    self.block_body(&h.body, hoist, catch_scope)?;
                }
                if let Some(fin) = finalizer {
                    let fin_scope = self.push_scope(ScopeKind::Block);
                    self.block_body(fin, hoist, fin_scope)?;
                }
                Ok(())
            }
            Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Empty {} => Ok(()),
            Stmt::Labeled { body, .. } => self.stmt(body, hoist, current),
        }
    }

    fn expr(&mut self, expr: &Expr, hoist: usize, current: usize) -> CompileResult<()> {
        match expr {
            Expr::NumericLiteral { .. }
            | Expr::StringLiteral { .. }
            | Expr::BooleanLiteral { .. }
            | Expr::NullLiteral {}
            | Expr::UndefinedLiteral {}
            | Expr::Identifier { .. } => Ok(()),
            Expr::ArrayExpression { elements } => {
                for e in elements {
                    self.expr(e, hoist, current)?;
                }
                Ok(())
            }
            Expr::ObjectExpression { properties } => {
                for p in properties {
                    self.expr(&p.value, hoist, current)?;
                }
                Ok(())
            }
            Expr::FunctionExpression(f) => self.function(f),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.expr(left, hoist, current)?;
                self.expr(right, hoist, current)
            }
            Expr::Unary { argument, .. } | Expr::Update { argument, .. } => {
                self.expr(argument, hoist, current)
            }
            Expr::Assignment { left, right, .. } => {
                self.expr(left, hoist, current)?;
                self.expr(right, hoist, current)
            }
            Expr::Call { callee, arguments } => {
                self.expr(callee, hoist, current)?;
                for a in arguments {
                    self.expr(a, hoist, current)?;
                }
                Ok(())
            }
            Expr::Member { object, property, computed } => {
                self.expr(object, hoist, current)?;
                if *computed {
                    self.expr(property, hoist, current)?;
                }
                Ok(())
            }
            Expr::Conditional { test, consequent, alternate } => {
                self.expr(test, hoist, current)?;
                self.expr(consequent, hoist, current)?;
                self.expr(alternate, hoist, current)
            }
            Expr::Sequence { expressions } => {
                for e in expressions {
                    self.expr(e, hoist, current)?;
                }
                Ok(())
            }
            Expr::EvalLike { arguments, .. } => {
                for a in arguments {
                    self.expr(a, hoist, current)?;
                }
                Ok(())
            }
        }
    }
}

/// Maps a source-level `var`/`let`/`const` marker to the scope record's
/// declaration kind. `var` is hoisted by the discovery pass but still
/// carries its own kind through to the annotated tree, same as `let`/`const`.
fn var_decl_kind(kind: VarKind) -> DeclKind {
    match kind {
        VarKind::Var => DeclKind::Var,
        VarKind::Let => DeclKind::Let,
        VarKind::Const => DeclKind::Const,
    }
}

/// Pass 2: consumes the scope arena in the same pre-order and lowers the
/// tree into [`crate::hir`], renaming shadowed bindings to `base#N`.
struct Resolver<'a> {
    scopes: &'a [ScopeNode],
    cursor: usize,
    /// Lexical chain of (declared name -> unique name) maps, outermost first.
    frames: Vec<FxHashMap<String, String>>,
    /// Open function frames: (scope-stack depth at which the function's
    /// own parameter frame begins, accumulated captures).
    function_frames: Vec<(usize, Vec<String>)>,
    next_unique: u32,
    closures_enabled: bool,
}

impl<'a> Resolver<'a> {
    fn new(scopes: &'a [ScopeNode], closures_enabled: bool) -> Self {
        Resolver {
            scopes,
            cursor: 0,
            frames: Vec::new(),
            function_frames: Vec::new(),
            next_unique: 0,
            closures_enabled,
        }
    }

    fn enter_scope(&mut self) -> &'a ScopeNode {
        let node = &self.scopes[self.cursor];
        self.cursor += 1;
        self.frames.push(FxHashMap::default());
        node
    }

    fn exit_scope(&mut self) {
        self.frames.pop();
    }

    /// Assigns (and records) the unique name for a binding declared in the
    /// current (innermost) frame.
    fn bind_current(&mut self, original: &str) -> String {
        let shadowed = self
            .frames
            .iter()
            .take(self.frames.len() - 1)
            .any(|f| f.contains_key(original));
        let unique = if shadowed {
            let n = self.next_unique;
            self.next_unique += 1;
            format!("{original}#{n}")
        } else {
            original.to_string()
        };
        self.frames
            .last_mut()
            .expect("a frame is always open while binding")
            .insert(original.to_string(), unique.clone());
        unique
    }

    fn resolve_ident(&mut self, name: &str) -> ResolvedIdent {
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            if let Some(unique) = frame.get(name) {
                for (fn_depth, captures) in self.function_frames.iter_mut() {
                    if *fn_depth > depth && !captures.contains(unique) {
                        captures.push(unique.clone());
                    }
                }
                return ResolvedIdent {
                    original: name.to_string(),
                    resolved: Some(unique.clone()),
                };
            }
        }
        ResolvedIdent {
            original: name.to_string(),
            resolved: None,
        }
    }

    fn function(&mut self, f: &ast::FunctionNode, declared_name: Option<String>) -> Rc<HFunction> {
        self.enter_scope();
        let depth_of_params = self.frames.len() - 1;
        let params = f
            .params
            .iter()
            .map(|p| self.bind_current(&p.name))
            .collect();
        self.function_frames.push((depth_of_params, Vec::new()));
        let body = self.block_body(&f.body);
        let (_, captures) = self.function_frames.pop().expect("pushed above");
        self.exit_scope();
        let debug_name = f
            .id
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        Rc::new(HFunction {
            declared_name,
            debug_name,
            params,
            body,
            captures: if self.closures_enabled { captures } else { Vec::new() },
            span: SourceSpan::unknown(),
        })
    }

    fn block_body(&mut self, body: &[Stmt]) -> Vec<HStmt> {
        body.iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&mut self, stmt: &Stmt) -> HStmt {
        match stmt {
            Stmt::VariableDeclaration { kind, declarations } => {
                // A single source statement may declare several bindings;
                // HStmt::Let is one binding, so multi-declarator
                // statements lower to a sequence via Block. Single
                // declarators (the overwhelmingly common case) lower
                // directly to avoid an unnecessary wrapper.
                let kind = var_decl_kind(*kind);
                let mut lets = Vec::new();
                for d in declarations {
                    let init = d.init.as_ref().map(|e| self.expr(e));
                    let unique = self.bind_current(&d.id.name);
                    lets.push(HStmt::Let {
                        name: unique,
                        kind,
                        init,
                    });
                }
                if lets.len() == 1 {
                    lets.into_iter().next().unwrap()
                } else {
                    HStmt::Block(lets)
                }
            }
            Stmt::FunctionDeclaration(f) => {
                let unique = f.id.as_ref().map(|id| self.bind_current(&id.name));
                HStmt::FunctionDecl(self.function(f, unique))
            }
            Stmt::Block { body } => {
                self.enter_scope();
                let lowered = self.block_body(body);
                self.exit_scope();
                HStmt::Block(lowered)
            }
            Stmt::Expression { expression } => HStmt::Expr(self.expr(expression)),
            Stmt::If { test, consequent, alternate } => HStmt::If {
                test: self.expr(test),
                consequent: Box::new(self.stmt(consequent)),
                alternate: alternate.as_ref().map(|a| Box::new(self.stmt(a))),
            },
            Stmt::While { test, body } => HStmt::While {
                test: self.expr(test),
                body: Box::new(self.stmt(body)),
                label: None,
            },
            Stmt::For { init, test, update, body } => {
                self.enter_scope();
                let init = init.as_ref().map(|i| {
                    Box::new(match i.as_ref() {
                        ForInit::Decl { kind, declarations } => {
                            let kind = var_decl_kind(*kind);
                            let mut lets = Vec::new();
                            for d in declarations {
                                let init = d.init.as_ref().map(|e| self.expr(e));
                                let unique = self.bind_current(&d.id.name);
                                lets.push(HStmt::Let {
                                    name: unique,
                                    kind,
                                    init,
                                });
                            }
                            if lets.len() == 1 {
                                lets.into_iter().next().unwrap()
                            } else {
                                HStmt::Block(lets)
                            }
                        }
                        ForInit::Expr(e) => HStmt::Expr(self.expr(e)),
                    })
                });
                let test = test.as_ref().map(|t| self.expr(t));
                let update = update.as_ref().map(|u| self.expr(u));
                let body = Box::new(self.stmt(body));
                self.exit_scope();
                HStmt::For { init, test, update, body, label: None }
            }
            Stmt::Return { argument } => HStmt::Return(argument.as_ref().map(|a| self.expr(a))),
            Stmt::Throw { argument } => HStmt::Throw(self.expr(argument)),
            Stmt::Try { block, handler, finalizer } => {
                self.enter_scope();
                let lowered_block = self.block_body(block);
                self.exit_scope();
                let (catch_param, catch_body) = if let Some(h) = handler {
                    self.enter_scope();
                    let param = h.param.as_ref().map(|p| self.bind_current(&p.name));
                    let body = self.block_body(&h.body);
                    self.exit_scope();
                    (param, Some(body))
                } else {
                    (None, None)
                };
                let finally = finalizer.as_ref().map(|fin| {
                    self.enter_scope();
                    let lowered = self.block_body(fin);
                    self.exit_scope();
                    lowered
                });
                HStmt::Try {
                    block: lowered_block,
                    catch_param,
                    catch_body,
                    finally,
                }
            }
            Stmt::Break { label } => HStmt::Break(label.clone()),
            Stmt::Continue { label } => HStmt::Continue(label.clone()),
            Stmt::Labeled { label, body } => HStmt::Labeled {
                label: label.clone(),
                body: Box::new(self.stmt(body)),
            },
            Stmt::Empty {} => HStmt::Empty,
        }
    }

    fn expr(&mut self, expr: &Expr) -> HExpr {
        match expr {
            Expr::NumericLiteral { value } => HExpr::Number(*value),
            Expr::StringLiteral { value } => HExpr::Str(value.clone()),
            Expr::BooleanLiteral { value } => HExpr::Bool(*value),
            Expr::NullLiteral {} => HExpr::Null,
            Expr::UndefinedLiteral {} => HExpr::Undefined,
            Expr::Identifier { name, .. } => HExpr::Ident(self.resolve_ident(name)),
            Expr::ArrayExpression { elements } => {
                HExpr::Array(elements.iter().map(|e| self.expr(e)).collect())
            }
            Expr::ObjectExpression { properties } => HExpr::Object(
                properties
                    .iter()
                    .map(|p| (p.key.clone(), self.expr(&p.value)))
                    .collect(),
            ),
            Expr::FunctionExpression(f) => HExpr::Function(self.function(f, None)),
            Expr::Binary { operator, left, right } => {
                HExpr::Binary(*operator, Box::new(self.expr(left)), Box::new(self.expr(right)))
            }
            Expr::Logical { operator, left, right } => {
                HExpr::Logical(*operator, Box::new(self.expr(left)), Box::new(self.expr(right)))
            }
            Expr::Unary { operator, argument } => {
                HExpr::Unary(*operator, Box::new(self.expr(argument)))
            }
            Expr::Update { operator, argument, prefix } => HExpr::Update {
                op: *operator,
                target: Box::new(self.expr(argument)),
                prefix: *prefix,
            },
            Expr::Assignment { operator, left, right } => HExpr::Assign {
                op: *operator,
                target: Box::new(self.expr(left)),
                value: Box::new(self.expr(right)),
            },
            Expr::Call { callee, arguments } => HExpr::Call {
                callee: Box::new(self.expr(callee)),
                args: arguments.iter().map(|a| self.expr(a)).collect(),
            },
            Expr::Member { object, property, computed } => HExpr::Member {
                object: Box::new(self.expr(object)),
                property: if *computed {
                    MemberKey::Computed(Box::new(self.expr(property)))
                } else {
                    match property.as_ref() {
                        Expr::Identifier { name, .. } => MemberKey::Name(name.clone()),
                        _ => MemberKey::Computed(Box::new(self.expr(property))),
                    }
                },
                computed: *computed,
            },
            Expr::Conditional { test, consequent, alternate } => HExpr::Conditional {
                test: Box::new(self.expr(test)),
                consequent: Box::new(self.expr(consequent)),
                alternate: Box::new(self.expr(alternate)),
            },
            Expr::Sequence { expressions } => {
                HExpr::Sequence(expressions.iter().map(|e| self.expr(e)).collect())
            }
            Expr::EvalLike { .. } => HExpr::EvalLike,
        }
    }
}

/// Run the semantic analyzer over a parsed program, producing the
/// annotated tree. See module docs for the two-pass algorithm.
pub fn analyze(program: &ast::Program, options: &CompilerOptions) -> CompileResult<Module> {
    let mut discovery = Discovery::new();
    discovery.run(program)?;

    let mut resolver = Resolver::new(&discovery.scopes, options.closures_enabled);
    resolver.enter_scope();
    let body = resolver.block_body(&program.body);
    resolver.exit_scope();

    Ok(Module { body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;

    fn num(v: f64) -> Expr {
        Expr::NumericLiteral { value: v }
    }

    fn ident(name: &str) -> Expr {
        Expr::Identifier { name: name.to_string(), span: Span::unknown() }
    }

    fn let_decl(name: &str, init: Expr) -> Stmt {
        Stmt::VariableDeclaration {
            kind: VarKind::Let,
            declarations: vec![VariableDeclarator { id: Identifier::new(name), init: Some(init) }],
        }
    }

    #[test]
    fn resolves_simple_reference() {
        let program = Program {
            body: vec![
                let_decl("x", num(1.0)),
                Stmt::Expression { expression: ident("x") },
            ],
        };
        let module = analyze(&program, &CompilerOptions::default()).unwrap();
        match &module.body[1] {
            HStmt::Expr(HExpr::Ident(r)) => assert_eq!(r.resolved.as_deref(), Some("x")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn shadowing_renames_inner_binding() {
        let program = Program {
            body: vec![
                let_decl("x", num(1.0)),
                Stmt::Block {
                    body: vec![
                        let_decl("x", num(2.0)),
                        Stmt::Expression { expression: ident("x") },
                    ],
                },
            ],
        };
        let module = analyze(&program, &CompilerOptions::default()).unwrap();
        let HStmt::Block(inner) = &module.body[1] else { panic!() };
        let HStmt::Let { name, .. } = &inner[0] else { panic!() };
        assert_eq!(name, "x#0");
        match &inner[1] {
            HStmt::Expr(HExpr::Ident(r)) => assert_eq!(r.resolved.as_deref(), Some("x#0")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unresolved_reference_left_as_global() {
        let program = Program {
            body: vec![Stmt::Expression { expression: ident("undeclared") }],
        };
        let module = analyze(&program, &CompilerOptions::default()).unwrap();
        match &module.body[0] {
            HStmt::Expr(HExpr::Ident(r)) => assert_eq!(r.resolved, None),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn let_let_redeclaration_in_same_scope_errors() {
        let program = Program {
            body: vec![let_decl("x", num(1.0)), let_decl("x", num(2.0))],
        };
        let err = analyze(&program, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Redeclaration { .. }));
    }

    #[test]
    fn var_var_redeclaration_is_allowed() {
        let var_decl = |name: &str| Stmt::VariableDeclaration {
            kind: VarKind::Var,
            declarations: vec![VariableDeclarator { id: Identifier::new(name), init: None }],
        };
        let program = Program { body: vec![var_decl("x"), var_decl("x")] };
        assert!(analyze(&program, &CompilerOptions::default()).is_ok());
    }

    #[test]
    fn analysis_is_idempotent() {
        let program = Program {
            body: vec![
                let_decl("x", num(1.0)),
                Stmt::Block { body: vec![let_decl("x", num(2.0))] },
            ],
        };
        let first = analyze(&program, &CompilerOptions::default()).unwrap();
        let second = analyze(&program, &CompilerOptions::default()).unwrap();
        // Pure function of the input: identical (deterministic) output.
        assert_eq!(format!("{first:?}"), format!("{second:?}"));
    }

    #[test]
    fn closure_capture_is_flagged() {
        // (function() { let n = 0; return function() { n += 1; return n; }; })
        let outer = FunctionNode {
            id: None,
            params: vec![],
            body: vec![
                let_decl("n", num(0.0)),
                Stmt::Return {
                    argument: Some(Expr::FunctionExpression(FunctionNode {
                        id: None,
                        params: vec![],
                        body: vec![
                            Stmt::Expression {
                                expression: Expr::Assignment {
                                    operator: AssignOp::AddAssign,
                                    left: Box::new(ident("n")),
                                    right: Box::new(num(1.0)),
                                },
                            },
                            Stmt::Return { argument: Some(ident("n")) },
                        ],
                    })),
                },
            ],
        };
        let program = Program {
            body: vec![Stmt::Expression {
                expression: Expr::FunctionExpression(outer),
            }],
        };
        let module = analyze(&program, &CompilerOptions::default()).unwrap();
        let HStmt::Expr(HExpr::Function(outer_fn)) = &module.body[0] else { panic!() };
        let HStmt::Return(Some(HExpr::Function(inner_fn))) = outer_fn.body.last().unwrap() else {
            panic!()
        };
        assert_eq!(inner_fn.captures, vec!["n".to_string()]);
    }
}
