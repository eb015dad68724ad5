//! Two correctness properties checked across randomized inputs.
//!
//! (a) for any scope tree, after analysis every reference resolves to
//!     exactly one binding;
//! (b) for any numeric literal, const -> assemble -> execute recovers the
//!     literal to bit-exact IEEE-754.

use proptest::prelude::*;
use scriptwasm::analyzer::analyze;
use scriptwasm::ast::*;
use scriptwasm::compiler::compile;
use scriptwasm::config::CompilerOptions;
use scriptwasm::hir::{HExpr, HStmt};
use wasmi::{Engine, Linker, Module as WasmiModule, Store};

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

/// Builds `depth` nested blocks, each shadowing the same name `x` and
/// referencing it once right after its own declaration - a scope tree
/// where every reference must resolve to its own immediately-enclosing
/// binding, never an outer or inner one.
fn nested_shadowing_blocks(depth: u32) -> Stmt {
    fn build(remaining: u32) -> Vec<Stmt> {
        if remaining == 0 {
            return vec![];
        }
        let mut body = vec![let_stmt("x", num(remaining as f64)), Stmt::Expression { expression: ident("x") }];
        body.push(Stmt::Block { body: build(remaining - 1) });
        body
    }
    Stmt::Block { body: build(depth) }
}

/// Counts every resolved-identifier reference reachable from a statement
/// list, and separately every reference left unresolved. A well-formed
/// scope tree must produce zero unresolved references and exactly the
/// expected count of resolved ones.
fn count_references(stmts: &[HStmt]) -> (usize, usize) {
    fn expr(e: &HExpr, resolved: &mut usize, unresolved: &mut usize) {
        match e {
            HExpr::Ident(r) => {
                if r.resolved.is_some() {
                    *resolved += 1;
                } else {
                    *unresolved += 1;
                }
            }
            HExpr::Binary(_, a, b) | HExpr::Logical(_, a, b) => {
                expr(a, resolved, unresolved);
                expr(b, resolved, unresolved);
            }
            HExpr::Unary(_, a) => expr(a, resolved, unresolved),
            HExpr::Sequence(items) | HExpr::Array(items) => {
                for item in items {
                    expr(item, resolved, unresolved);
                }
            }
            _ => {}
        }
    }
    fn stmt(s: &HStmt, resolved: &mut usize, unresolved: &mut usize) {
        match s {
            HStmt::Let { init: Some(e), .. } => expr(e, resolved, unresolved),
            HStmt::Expr(e) => expr(e, resolved, unresolved),
            HStmt::Block(body) => {
                for s in body {
                    stmt(s, resolved, unresolved);
                }
            }
            _ => {}
        }
    }
    let mut resolved = 0;
    let mut unresolved = 0;
    for s in stmts {
        stmt(s, &mut resolved, &mut unresolved);
    }
    (resolved, unresolved)
}

proptest! {
    #[test]
    fn every_reference_in_a_nested_shadowing_scope_resolves_uniquely(depth in 1u32..12) {
        let program = Program { body: vec![nested_shadowing_blocks(depth)] };
        let module = analyze(&program, &CompilerOptions::default()).expect("well-formed shadowing always analyzes");
        let (resolved, unresolved) = count_references(&module.body);
        prop_assert_eq!(unresolved, 0, "no reference may survive analysis unresolved");
        prop_assert_eq!(resolved, depth as usize);
    }

    #[test]
    fn numeric_literal_round_trips_through_assembly_bit_exact(value in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        let program = Program { body: vec![Stmt::Expression { expression: num(value) }] };
        let out = compile(&program, &CompilerOptions::default()).expect("a bare numeric literal always compiles");

        let engine = Engine::default();
        let module = WasmiModule::new(&engine, &out.wasm[..]).expect("valid wasm");
        let mut store = Store::new(&engine, ());
        let linker = Linker::new(&engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("instantiate")
            .start(&mut store)
            .expect("run start section");
        let entry = instance.get_typed_func::<(), (f64, i32)>(&store, "m").expect("exports nullary m");
        let (returned, _type_id) = entry.call(&mut store, ()).expect("runs without trapping");
        prop_assert_eq!(returned.to_bits(), value.to_bits());
    }
}
