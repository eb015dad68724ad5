//! Integration coverage for the semantic analyzer, driven
//! through the crate's public `ast::Program` -> `analyzer::analyze` API
//! rather than the unit tests colocated in `analyzer.rs`, which exercise
//! the `Discovery`/`Resolver` internals directly.

use scriptwasm::analyzer::analyze;
use scriptwasm::ast::*;
use scriptwasm::config::CompilerOptions;
use scriptwasm::errors::CompileError;
use scriptwasm::hir::{DeclKind, HExpr, HStmt};

fn num(value: f64) -> Expr {
    Expr::NumericLiteral { value }
}

fn ident(name: &str) -> Expr {
    Expr::Identifier { name: name.to_string(), span: Span::unknown() }
}

fn let_stmt(name: &str, init: Expr) -> Stmt {
    Stmt::VariableDeclaration {
        kind: VarKind::Let,
        declarations: vec![VariableDeclarator { id: Identifier::new(name), init: Some(init) }],
    }
}

#[test]
fn hoists_var_declarations_above_their_first_use() {
    // `print(x); var x = 1;` - `var` is function-scoped and hoisted, so
    // the reference resolves even though it lexically precedes the decl.
    let program = Program {
        body: vec![
            Stmt::Expression { expression: ident("x") },
            Stmt::VariableDeclaration {
                kind: VarKind::Var,
                declarations: vec![VariableDeclarator { id: Identifier::new("x"), init: Some(num(1.0)) }],
            },
        ],
    };
    let module = analyze(&program, &CompilerOptions::default()).expect("hoisted var resolves");
    match &module.body[0] {
        HStmt::Expr(HExpr::Ident(r)) => assert_eq!(r.resolved.as_deref(), Some("x")),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn function_declarations_are_hoisted_for_mutual_recursion() {
    // `function even(n) { ... odd(n-1) ... }  function odd(n) { ... even(n-1) ... }`
    // Each function body references the other before its own declaration
    // is reached lexically; both must still resolve.
    let even = FunctionNode {
        id: Some(Identifier::new("even")),
        params: vec![Identifier::new("n")],
        body: vec![Stmt::Return {
            argument: Some(Expr::Call {
                callee: Box::new(ident("odd")),
                arguments: vec![ident("n")],
            }),
        }],
    };
    let odd = FunctionNode {
        id: Some(Identifier::new("odd")),
        params: vec![Identifier::new("n")],
        body: vec![Stmt::Return {
            argument: Some(Expr::Call {
                callee: Box::new(ident("even")),
                arguments: vec![ident("n")],
            }),
        }],
    };
    let program = Program {
        body: vec![Stmt::FunctionDeclaration(even), Stmt::FunctionDeclaration(odd)],
    };
    let module = analyze(&program, &CompilerOptions::default()).expect("mutual recursion resolves");
    assert_eq!(module.body.len(), 2);
}

#[test]
fn block_scoped_let_shadowing_is_renamed_not_rejected() {
    let program = Program {
        body: vec![
            let_stmt("x", num(1.0)),
            Stmt::Block {
                body: vec![let_stmt("x", num(2.0)), Stmt::Expression { expression: ident("x") }],
            },
            Stmt::Expression { expression: ident("x") },
        ],
    };
    let module = analyze(&program, &CompilerOptions::default()).expect("shadowing is legal");
    let HStmt::Block(inner) = &module.body[1] else { panic!("expected block") };
    let HStmt::Let { name: inner_name, .. } = &inner[0] else { panic!("expected let") };
    assert_ne!(inner_name, "x", "the shadowing binding must be renamed, not left colliding");
    match &module.body[2] {
        HStmt::Expr(HExpr::Ident(r)) => assert_eq!(r.resolved.as_deref(), Some("x")),
        other => panic!("outer x must still resolve to the outer binding: {other:?}"),
    }
}

#[test]
fn resolved_bindings_keep_their_source_declaration_kind() {
    let program = Program {
        body: vec![
            let_stmt("a", num(1.0)),
            Stmt::VariableDeclaration {
                kind: VarKind::Var,
                declarations: vec![VariableDeclarator { id: Identifier::new("b"), init: Some(num(2.0)) }],
            },
            Stmt::VariableDeclaration {
                kind: VarKind::Const,
                declarations: vec![VariableDeclarator { id: Identifier::new("c"), init: Some(num(3.0)) }],
            },
        ],
    };
    let module = analyze(&program, &CompilerOptions::default()).expect("resolves");
    let kinds: Vec<DeclKind> = module
        .body
        .iter()
        .map(|s| match s {
            HStmt::Let { kind, .. } => *kind,
            other => panic!("expected a let binding: {other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec![DeclKind::Let, DeclKind::Var, DeclKind::Const]);
}

#[test]
fn let_redeclaration_in_the_same_block_is_a_redeclaration_error() {
    let program = Program { body: vec![let_stmt("x", num(1.0)), let_stmt("x", num(2.0))] };
    let err = analyze(&program, &CompilerOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::Redeclaration { .. }));
}

#[test]
fn closures_disabled_skips_capture_flagging() {
    let outer = FunctionNode {
        id: None,
        params: vec![],
        body: vec![
            let_stmt("n", num(0.0)),
            Stmt::Return {
                argument: Some(Expr::FunctionExpression(FunctionNode {
                    id: None,
                    params: vec![],
                    body: vec![Stmt::Return { argument: Some(ident("n")) }],
                })),
            },
        ],
    };
    let program = Program { body: vec![Stmt::Expression { expression: Expr::FunctionExpression(outer) }] };
    let options = CompilerOptions { closures_enabled: false, ..CompilerOptions::default() };
    let module = analyze(&program, &options).expect("analysis still succeeds with closures disabled");
    let HStmt::Expr(HExpr::Function(outer_fn)) = &module.body[0] else { panic!() };
    let HStmt::Return(Some(HExpr::Function(inner_fn))) = outer_fn.body.last().unwrap() else { panic!() };
    assert!(inner_fn.captures.is_empty(), "capture analysis must be skipped when disabled");
}

#[test]
fn eval_like_call_is_flagged_but_not_rejected_by_the_analyzer() {
    // The analyzer flags `eval`/`new Function`; only the
    // generator is required to reject it.
    let program = Program {
        body: vec![Stmt::Expression {
            expression: Expr::EvalLike { callee_name: "eval".to_string(), arguments: vec![] },
        }],
    };
    let module = analyze(&program, &CompilerOptions::default()).expect("analyzer does not reject eval");
    assert!(matches!(module.body[0], HStmt::Expr(HExpr::EvalLike)));
}
