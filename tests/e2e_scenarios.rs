//! End-to-end scenarios, each compiled through the full pipeline and
//! then actually *executed* with `wasmi` against the host-import
//! surface, so "outputs X" means genuine execution semantics rather
//! than IR inspection.

use scriptwasm::ast::*;
use scriptwasm::compiler::compile;
use scriptwasm::config::CompilerOptions;
use wasmi::{Caller, Engine, Linker, Module as WasmiModule, Store};

#[derive(Default)]
struct Host {
    printed: Vec<f64>,
}

fn num(value: f64) -> Expr {
    Expr::NumericLiteral { value }
}

fn ident(name: &str) -> Expr {
    Expr::Identifier { name: name.to_string(), span: Span::unknown() }
}

fn print_call(arg: Expr) -> Expr {
    Expr::Call { callee: Box::new(ident("print")), arguments: vec![arg] }
}

/// Compiles `program` and runs its `m` entry point under `wasmi`,
/// returning every value the host `print` import observed, in call order.
fn run(program: &Program, options: &CompilerOptions) -> Vec<f64> {
    let out = compile(program, options).expect("program compiles");
    let engine = Engine::default();
    let module = WasmiModule::new(&engine, &out.wasm[..]).expect("assembled module is valid wasm");
    let mut store = Store::new(&engine, Host::default());
    let mut linker = Linker::new(&engine);
    linker
        .func_wrap("env", "print", |mut caller: Caller<'_, Host>, value: f64| {
            caller.data_mut().printed.push(value);
        })
        .expect("define env.print");
    linker
        .func_wrap("env", "printChar", |_caller: Caller<'_, Host>, _code_point: i32| {})
        .expect("define env.printChar");
    linker.func_wrap("env", "time", |_caller: Caller<'_, Host>| 0.0f64).expect("define env.time");
    linker.func_wrap("env", "timeOrigin", |_caller: Caller<'_, Host>| 0.0f64).expect("define env.timeOrigin");

    let instance = linker
        .instantiate(&mut store, &module)
        .expect("instantiate")
        .start(&mut store)
        .expect("run start section");
    let entry = instance
        .get_typed_func::<(), (f64, i32)>(&store, "m")
        .expect("module exports a nullary 'm'");
    entry.call(&mut store, ()).expect("entry point runs without trapping");
    store.data().printed.clone()
}

#[test]
fn scenario_1_print_of_an_arithmetic_expression() {
    let program = Program {
        body: vec![Stmt::Expression {
            expression: print_call(Expr::Binary {
                operator: BinaryOp::Add,
                left: Box::new(num(1.0)),
                right: Box::new(num(2.0)),
            }),
        }],
    };
    assert_eq!(run(&program, &CompilerOptions::default()), vec![3.0]);
}

#[test]
fn scenario_2_for_loop_accumulation() {
    // let x = 10; for (let i = 0; i < 3; i++) x += i; print(x);  -> 13
    let program = Program {
        body: vec![
            Stmt::VariableDeclaration {
                kind: VarKind::Let,
                declarations: vec![VariableDeclarator { id: Identifier::new("x"), init: Some(num(10.0)) }],
            },
            Stmt::For {
                init: Some(Box::new(ForInit::Decl {
                    kind: VarKind::Let,
                    declarations: vec![VariableDeclarator { id: Identifier::new("i"), init: Some(num(0.0)) }],
                })),
                test: Some(Expr::Binary {
                    operator: BinaryOp::Lt,
                    left: Box::new(ident("i")),
                    right: Box::new(num(3.0)),
                }),
                update: Some(Expr::Update { operator: UpdateOp::Inc, argument: Box::new(ident("i")), prefix: false }),
                body: Box::new(Stmt::Expression {
                    expression: Expr::Assignment {
                        operator: AssignOp::AddAssign,
                        left: Box::new(ident("x")),
                        right: Box::new(ident("i")),
                    },
                }),
            },
            Stmt::Expression { expression: print_call(ident("x")) },
        ],
    };
    assert_eq!(run(&program, &CompilerOptions::default()), vec![13.0]);
}

#[test]
fn scenario_3_recursive_fibonacci() {
    // function f(n) { if (n < 2) return n; return f(n-1) + f(n-2); }
    // print(f(10));  -> 55
    let f = FunctionNode {
        id: Some(Identifier::new("f")),
        params: vec![Identifier::new("n")],
        body: vec![
            Stmt::If {
                test: Expr::Binary { operator: BinaryOp::Lt, left: Box::new(ident("n")), right: Box::new(num(2.0)) },
                consequent: Box::new(Stmt::Return { argument: Some(ident("n")) }),
                alternate: None,
            },
            Stmt::Return {
                argument: Some(Expr::Binary {
                    operator: BinaryOp::Add,
                    left: Box::new(Expr::Call {
                        callee: Box::new(ident("f")),
                        arguments: vec![Expr::Binary {
                            operator: BinaryOp::Sub,
                            left: Box::new(ident("n")),
                            right: Box::new(num(1.0)),
                        }],
                    }),
                    right: Box::new(Expr::Call {
                        callee: Box::new(ident("f")),
                        arguments: vec![Expr::Binary {
                            operator: BinaryOp::Sub,
                            left: Box::new(ident("n")),
                            right: Box::new(num(2.0)),
                        }],
                    }),
                }),
            },
        ],
    };
    let program = Program {
        body: vec![
            Stmt::FunctionDeclaration(f),
            Stmt::Expression {
                expression: print_call(Expr::Call { callee: Box::new(ident("f")), arguments: vec![num(10.0)] }),
            },
        ],
    };
    assert_eq!(run(&program, &CompilerOptions::default()), vec![55.0]);
}

#[test]
fn scenario_4_closure_counter_allocates_a_fresh_cell_per_call() {
    // let c = (function(){ let n = 0; return function(){ n += 1; return n; }; })();
    // print(c()); print(c()); print(c());  -> 1, 2, 3
    let inner = FunctionNode {
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
    };
    let outer = FunctionNode {
        id: None,
        params: vec![],
        body: vec![
            Stmt::VariableDeclaration {
                kind: VarKind::Let,
                declarations: vec![VariableDeclarator { id: Identifier::new("n"), init: Some(num(0.0)) }],
            },
            Stmt::Return { argument: Some(Expr::FunctionExpression(inner)) },
        ],
    };
    let program = Program {
        body: vec![
            Stmt::VariableDeclaration {
                kind: VarKind::Let,
                declarations: vec![VariableDeclarator {
                    id: Identifier::new("c"),
                    init: Some(Expr::Call {
                        callee: Box::new(Expr::FunctionExpression(outer)),
                        arguments: vec![],
                    }),
                }],
            },
            Stmt::Expression { expression: print_call(Expr::Call { callee: Box::new(ident("c")), arguments: vec![] }) },
            Stmt::Expression { expression: print_call(Expr::Call { callee: Box::new(ident("c")), arguments: vec![] }) },
            Stmt::Expression { expression: print_call(Expr::Call { callee: Box::new(ident("c")), arguments: vec![] }) },
        ],
    };
    assert_eq!(run(&program, &CompilerOptions::default()), vec![1.0, 2.0, 3.0]);
}

#[test]
fn scenario_5_throw_and_catch_plumbs_the_exception_tag() {
    // try { throw 42; } catch (e) { print(e); }  -> 42
    let program = Program {
        body: vec![Stmt::Try {
            block: vec![Stmt::Throw { argument: num(42.0) }],
            handler: Some(CatchClause {
                param: Some(Identifier::new("e")),
                body: vec![Stmt::Expression { expression: print_call(ident("e")) }],
            }),
            finalizer: None,
        }],
    };
    assert_eq!(run(&program, &CompilerOptions::default()), vec![42.0]);
}

#[test]
fn scenario_6_optimizer_shrinks_the_binary_without_changing_behavior() {
    let program = Program {
        body: vec![Stmt::Expression {
            expression: print_call(Expr::Binary {
                operator: BinaryOp::Add,
                left: Box::new(num(1.0)),
                right: Box::new(num(2.0)),
            }),
        }],
    };
    let unopt = compile(&program, &CompilerOptions { opt_passes: 0, ..CompilerOptions::default() }).unwrap();
    let opt = compile(&program, &CompilerOptions { opt_passes: 2, ..CompilerOptions::default() }).unwrap();
    assert!(opt.wasm.len() < unopt.wasm.len(), "two peephole passes must shrink this constant-foldable program");

    let unopt_options = CompilerOptions { opt_passes: 0, ..CompilerOptions::default() };
    let opt_options = CompilerOptions { opt_passes: 2, ..CompilerOptions::default() };
    assert_eq!(run(&program, &unopt_options), vec![3.0]);
    assert_eq!(run(&program, &opt_options), vec![3.0]);
}
