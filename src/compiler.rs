//! The pipeline entry point: wires the four core stages
//! together — semantic analyzer, code generator, peephole optimizer,
//! assembler — and returns the assembled binary alongside a
//! [`StageTimings`] report.
//!
//! The library itself never prints anything: library stages return
//! `Result`, and all user-facing reporting happens in the CLI layer
//! (`src/main.rs`) via `colour`.

use std::time::{Duration, Instant};

use crate::ast::Program;
use crate::config::CompilerOptions;
use crate::errors::CompileResult;
use crate::{analyzer, assemble, codegen, optimize};

/// Per-stage timing, returned on every successful compile.
/// Tokenization/parsing are the upstream parser's concern and are not
/// measured here.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub analyze: Duration,
    pub generate: Duration,
    pub optimize: Duration,
    pub assemble: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.analyze + self.generate + self.optimize + self.assemble
    }
}

/// Output of a successful compile: the assembled binary plus the timing
/// report and the optimizer's rewrite counters (useful for the CLI's
/// `--detailed-timers` flag and for scenario 6's opt-passes comparison).
pub struct CompileOutput {
    pub wasm: Vec<u8>,
    pub timings: StageTimings,
    pub optimizer_stats: optimize::OptimizationStats,
}

/// Runs the whole pipeline over an already-parsed ESTree [`Program`]
///. Errors at any stage abort immediately and no
/// partial artifact is returned.
pub fn compile(program: &Program, options: &CompilerOptions) -> CompileResult<CompileOutput> {
    let t0 = Instant::now();
    let annotated = analyzer::analyze(program, options)?;
    let analyze_time = t0.elapsed();

    let t1 = Instant::now();
    let mut module = codegen::generate(&annotated, options)?;
    let generate_time = t1.elapsed();

    let t2 = Instant::now();
    // This generator never maintains a `#last_type` tracking global
    //, so there is no index to pass.
    let optimizer_stats = optimize::optimize_module(&mut module, options, None);
    let optimize_time = t2.elapsed();

    let t3 = Instant::now();
    let wasm = assemble::assemble(&module)?;
    let assemble_time = t3.elapsed();

    Ok(CompileOutput {
        wasm,
        timings: StageTimings {
            analyze: analyze_time,
            generate: generate_time,
            optimize: optimize_time,
            assemble: assemble_time,
        },
        optimizer_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Program, Stmt};

    fn print_call(value: f64) -> Stmt {
        Stmt::Expression {
            expression: Expr::Call {
                callee: Box::new(Expr::Identifier { name: "print".into(), span: Default::default() }),
                arguments: vec![Expr::NumericLiteral { value }],
            },
        }
    }

    #[test]
    fn compiles_a_trivial_program_to_a_valid_module() {
        let program = Program { body: vec![print_call(3.0)] };
        let out = compile(&program, &CompilerOptions::default()).expect("compiles");
        assert_eq!(&out.wasm[0..4], b"\0asm");
        wasmparser::Validator::new().validate_all(&out.wasm).expect("valid wasm");
    }

    #[test]
    fn opt_passes_zero_produces_a_larger_or_equal_binary_than_two_passes() {
        let program = Program {
            body: vec![Stmt::Expression {
                expression: Expr::Call {
                    callee: Box::new(Expr::Identifier { name: "print".into(), span: Default::default() }),
                    arguments: vec![Expr::Binary {
                        operator: crate::ast::BinaryOp::Add,
                        left: Box::new(Expr::NumericLiteral { value: 1.0 }),
                        right: Box::new(Expr::NumericLiteral { value: 2.0 }),
                    }],
                },
            }],
        };
        let unopt = compile(&program, &CompilerOptions { opt_passes: 0, ..Default::default() }).unwrap();
        let opt = compile(&program, &CompilerOptions { opt_passes: 2, ..Default::default() }).unwrap();
        assert!(opt.wasm.len() <= unopt.wasm.len());
    }
}
