//! The annotated tree produced by the semantic analyzer.
//!
//! This mirrors the shape of [`crate::ast`] but every binding and every
//! resolved reference carries its globally unique name, and every function carries the set
//! of outer-scope bindings it closes over.

use std::rc::Rc;

use crate::ast::{AssignOp, BinaryOp, LogicalOp, UnaryOp, UpdateOp};
use crate::errors::SourceSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
    Param,
    Function,
    Catch,
}

/// A function definition after analysis: resolved parameter names, a
/// resolved body, and the list of outer-scope unique names it captures.
#[derive(Debug, Clone)]
pub struct HFunction {
    /// Unique name assigned to this function's own binding, if it has one
    /// (function declarations and named function expressions do; IIFEs
    /// and most function expressions don't).
    pub declared_name: Option<String>,
    /// A name used purely for diagnostics/debugging (Wasm name section).
    pub debug_name: String,
    pub params: Vec<String>,
    pub body: Vec<HStmt>,
    /// Unique names of bindings declared in an enclosing scope that this
    /// function's body reads or writes. Populated only when
    /// `closures_enabled`; empty otherwise, in which case the
    /// generator lowers captured reads/writes as ordinary (miscompiled if
    /// actually mutated concurrently, which is why the option exists at
    /// all — see DESIGN.md for the resolved Open Question).
    pub captures: Vec<String>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum HStmt {
    Let {
        name: String,
        kind: DeclKind,
        init: Option<HExpr>,
    },
    FunctionDecl(Rc<HFunction>),
    Block(Vec<HStmt>),
    Expr(HExpr),
    If {
        test: HExpr,
        consequent: Box<HStmt>,
        alternate: Option<Box<HStmt>>,
    },
    While {
        test: HExpr,
        body: Box<HStmt>,
        label: Option<String>,
    },
    For {
        init: Option<Box<HStmt>>,
        test: Option<HExpr>,
        update: Option<HExpr>,
        body: Box<HStmt>,
        label: Option<String>,
    },
    Return(Option<HExpr>),
    Throw(HExpr),
    Try {
        block: Vec<HStmt>,
        catch_param: Option<String>,
        catch_body: Option<Vec<HStmt>>,
        finally: Option<Vec<HStmt>>,
    },
    Break(Option<String>),
    Continue(Option<String>),
    Labeled {
        label: String,
        body: Box<HStmt>,
    },
    Empty,
}

#[derive(Debug, Clone)]
pub enum MemberKey {
    Name(String),
    Computed(Box<HExpr>),
}

/// A resolved identifier reference: `Some(local)` when bound within the
/// compiled module (possibly renamed to `base#N`), `None` when the
/// analyzer could not resolve it to any declaration in scope — the
/// generator treats these as accesses to host/global bindings (spec
/// §4.1 — "Unresolved references are left as-is").
#[derive(Debug, Clone)]
pub struct ResolvedIdent {
    pub original: String,
    pub resolved: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HExpr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident(ResolvedIdent),
    Array(Vec<HExpr>),
    Object(Vec<(String, HExpr)>),
    Function(Rc<HFunction>),
    Binary(BinaryOp, Box<HExpr>, Box<HExpr>),
    Logical(LogicalOp, Box<HExpr>, Box<HExpr>),
    Unary(UnaryOp, Box<HExpr>),
    Update {
        op: UpdateOp,
        target: Box<HExpr>,
        prefix: bool,
    },
    Assign {
        op: AssignOp,
        target: Box<HExpr>,
        value: Box<HExpr>,
    },
    Call {
        callee: Box<HExpr>,
        args: Vec<HExpr>,
    },
    Member {
        object: Box<HExpr>,
        property: MemberKey,
        computed: bool,
    },
    Conditional {
        test: Box<HExpr>,
        consequent: Box<HExpr>,
        alternate: Box<HExpr>,
    },
    Sequence(Vec<HExpr>),
    /// Always rejected by the generator with `UnsupportedError`.
    EvalLike,
}

/// The whole-program output of the semantic analyzer.
#[derive(Debug, Clone)]
pub struct Module {
    pub body: Vec<HStmt>,
}
