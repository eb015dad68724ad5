//! The peephole optimizer: local, adjacent-instruction
//! rewrites applied to every function's flat instruction stream after
//! code generation and before assembly.
//!
//! A stateful pass object accumulates stats and runs once per function
//! body, applying a windowed rewrite table over its instruction stream.
//! The rewrite table is applied to a fixed point *within* each configured
//! pass, since a single non-iterated scan can miss cascades (eliminating
//! a dead load can expose a new adjacent `set`/`get` pair, etc).

use crate::config::CompilerOptions;
use crate::ir::{FuncRef, FunctionRecord, Instr, Module};

#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizationStats {
    pub instructions_before: u32,
    pub instructions_after: u32,
    pub rewrites_applied: u32,
}

impl OptimizationStats {
    pub fn reduction_percentage(&self) -> f64 {
        if self.instructions_before == 0 {
            return 0.0;
        }
        let reduced = self.instructions_before.saturating_sub(self.instructions_after);
        (reduced as f64 / self.instructions_before as f64) * 100.0
    }
}

/// Runs the configured number of optimization passes over every function
/// in `module`, in place. `last_type_global`, when set, names the global
/// index the generator uses to track the most recently computed
/// expression's type tag; writes to it that are immediately overwritten
/// before being read are eliminated.
pub fn optimize_module(
    module: &mut Module,
    options: &CompilerOptions,
    last_type_global: Option<u32>,
) -> OptimizationStats {
    let mut stats = OptimizationStats::default();
    for function in &mut module.functions {
        optimize_function(function, options, last_type_global, &mut stats);
    }
    stats
}

fn optimize_function(
    function: &mut FunctionRecord,
    options: &CompilerOptions,
    last_type_global: Option<u32>,
    stats: &mut OptimizationStats,
) {
    stats.instructions_before += function.body.len() as u32;
    for _ in 0..options.opt_passes {
        let mut changed = true;
        while changed {
            changed = false;
            changed |= constant_fold_pass(&mut function.body, stats);
            changed |= constant_trunc_pass(&mut function.body, stats);
            changed |= local_access_pass(&mut function.body, stats);
            changed |= dead_code_pass(&mut function.body, stats);
            changed |= eqz_canonicalize_pass(&mut function.body, stats);
            changed |= identity_conversion_pass(&mut function.body, stats);
            changed |= empty_block_pass(&mut function.body, stats);
            if let Some(g) = last_type_global {
                changed |= dead_global_write_pass(&mut function.body, g, stats);
            }
            if options.tail_call {
                changed |= tail_call_pass(&mut function.body, stats);
            }
        }
    }
    stats.instructions_after += function.body.len() as u32;
}

/// `local.set k; local.get k` -> `local.tee k`.
/// `local.tee k; drop` -> `local.set k`.
fn local_access_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        match (&body[i], &body[i + 1]) {
            (Instr::LocalSet(a), Instr::LocalGet(b)) if a == b => {
                body[i] = Instr::LocalTee(*a);
                body.remove(i + 1);
                changed = true;
                stats.rewrites_applied += 1;
            }
            (Instr::LocalTee(a), Instr::Drop) => {
                body[i] = Instr::LocalSet(*a);
                body.remove(i + 1);
                changed = true;
                stats.rewrites_applied += 1;
            }
            _ => i += 1,
        }
    }
    changed
}

/// Any side-effect-free value-producing instruction immediately followed
/// by `drop` is dead: remove both.
fn dead_code_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        let dead = matches!(
            (&body[i], &body[i + 1]),
            (
                Instr::LocalGet(_) | Instr::GlobalGet(_) | Instr::F64Const(_) | Instr::I32Const(_),
                Instr::Drop
            )
        );
        if dead {
            body.remove(i + 1);
            body.remove(i);
            changed = true;
            stats.rewrites_applied += 1;
        } else {
            i += 1;
        }
    }
    changed
}

fn constant_fold_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 2 < body.len() {
        let folded = match (&body[i], &body[i + 1], &body[i + 2]) {
            (Instr::I32Const(a), Instr::I32Const(b), op) => fold_i32(*a, *b, op),
            (Instr::F64Const(a), Instr::F64Const(b), op) => fold_f64(*a, *b, op),
            _ => None,
        };
        if let Some(result) = folded {
            body.splice(i..i + 3, [result]);
            changed = true;
            stats.rewrites_applied += 1;
        } else {
            i += 1;
        }
    }
    changed
}

fn fold_i32(a: i32, b: i32, op: &Instr) -> Option<Instr> {
    Some(Instr::I32Const(match op {
        Instr::I32Add => a.wrapping_add(b),
        Instr::I32Sub => a.wrapping_sub(b),
        Instr::I32Mul => a.wrapping_mul(b),
        Instr::I32And => a & b,
        Instr::I32Or => a | b,
        Instr::I32Xor => a ^ b,
        Instr::I32DivS if b != 0 => a.wrapping_div(b),
        _ => return None,
    }))
}

fn fold_f64(a: f64, b: f64, op: &Instr) -> Option<Instr> {
    Some(Instr::F64Const(match op {
        Instr::F64Add => a + b,
        Instr::F64Sub => a - b,
        Instr::F64Mul => a * b,
        Instr::F64Div => a / b,
        _ => return None,
    }))
}

/// Constant-folds a literal immediately truncated to `i32`: `f64.const c;
/// i32.trunc_f64_s` becomes `i32.const c` truncated toward zero, matching
/// the instruction's own runtime semantics (traps are not reachable here
/// since the operand is a known-in-range literal).
fn constant_trunc_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        if let (Instr::F64Const(c), Instr::I32TruncF64S) = (&body[i], &body[i + 1]) {
            body.splice(i..i + 2, [Instr::I32Const(*c as i32)]);
            changed = true;
            stats.rewrites_applied += 1;
        } else {
            i += 1;
        }
    }
    changed
}

/// Collapses `i32.eqz; i32.eqz; i32.eqz` to a single `i32.eqz` — triple
/// boolean negation equals single negation. Two in a row are left alone:
/// `eqz(eqz(x))` is the canonical truthiness coercion and is already
/// minimal. Also canonicalizes `i32.const 0; i32.eq` to `i32.eqz`, the
/// idiomatic zero-comparison.
fn eqz_canonicalize_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        if i + 2 < body.len()
            && matches!(
                (&body[i], &body[i + 1], &body[i + 2]),
                (Instr::I32Eqz, Instr::I32Eqz, Instr::I32Eqz)
            )
        {
            body.remove(i + 2);
            body.remove(i + 1);
            changed = true;
            stats.rewrites_applied += 1;
            continue;
        }
        if matches!((&body[i], &body[i + 1]), (Instr::I32Const(0), Instr::I32Eq)) {
            body[i] = Instr::I32Eqz;
            body.remove(i + 1);
            changed = true;
            stats.rewrites_applied += 1;
            continue;
        }
        i += 1;
    }
    changed
}

/// A conversion immediately undone by its own inverse is a no-op. Codegen
/// only ever emits such adjacent pairs as adapters at a typed/untyped
/// boundary, never as a deliberate round-trip, so collapsing them is safe.
fn identity_conversion_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        let cancels = matches!(
            (&body[i], &body[i + 1]),
            (Instr::F64ConvertI32S, Instr::I32TruncF64S) | (Instr::I32TruncF64S, Instr::F64ConvertI32S)
        );
        if cancels {
            body.remove(i + 1);
            body.remove(i);
            changed = true;
            stats.rewrites_applied += 1;
        } else {
            i += 1;
        }
    }
    changed
}

/// `block ... end` with nothing between the two is a no-op.
fn empty_block_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        let empty = matches!(
            (&body[i], &body[i + 1]),
            (Instr::Block(_), Instr::End) | (Instr::Loop(_), Instr::End)
        );
        if empty {
            body.remove(i + 1);
            body.remove(i);
            changed = true;
            stats.rewrites_applied += 1;
        } else {
            i += 1;
        }
    }
    changed
}

/// `global.set L; ...; global.set L` with no `global.get L` between the
/// two writes: the first write is dead.
fn dead_global_write_pass(body: &mut Vec<Instr>, global: u32, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut last_write: Option<usize> = None;
    let mut i = 0;
    while i < body.len() {
        match &body[i] {
            Instr::GlobalSet(g) if *g == global => {
                if let Some(prev) = last_write {
                    body.remove(prev);
                    i -= 1;
                    changed = true;
                    stats.rewrites_applied += 1;
                }
                last_write = Some(i);
            }
            Instr::GlobalGet(g) if *g == global => {
                last_write = None;
            }
            // Control-flow joins invalidate the "no read between" proof;
            // conservatively forget the pending write across them.
            Instr::Block(_) | Instr::Loop(_) | Instr::If(_) | Instr::Else | Instr::End
            | Instr::Br(_) | Instr::BrIf(_) | Instr::Call(_) => {
                last_write = None;
            }
            _ => {}
        }
        i += 1;
    }
    changed
}

/// `call f; return` -> `return_call f`, only when `tail_call` is enabled
/// and only when the callee is already
/// resolved (never rewrites a deferred reference; the assembler's
/// deferred-resolution pass runs after optimization).
fn tail_call_pass(body: &mut Vec<Instr>, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < body.len() {
        if let (Instr::Call(target), Instr::Return) = (&body[i], &body[i + 1]) {
            if matches!(target, FuncRef::Resolved(_)) {
                let target = target.clone();
                body[i] = Instr::ReturnCall(target);
                body.remove(i + 1);
                changed = true;
                stats.rewrites_applied += 1;
                continue;
            }
        }
        i += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncRef, FunctionRecord, LoweringState};

    fn function_with(body: Vec<Instr>) -> FunctionRecord {
        FunctionRecord {
            debug_name: "f".to_string(),
            params: vec![],
            locals: vec![],
            body,
            exported_name: None,
            state: LoweringState::Lowered,
            index: Some(0),
        }
    }

    fn run(body: Vec<Instr>, opts: &CompilerOptions) -> Vec<Instr> {
        let mut f = function_with(body);
        let mut stats = OptimizationStats::default();
        optimize_function(&mut f, opts, None, &mut stats);
        f.body
    }

    #[test]
    fn folds_constant_arithmetic() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::I32Const(2), Instr::I32Const(3), Instr::I32Add], &opts);
        assert_eq!(out, vec![Instr::I32Const(5)]);
    }

    #[test]
    fn set_get_becomes_tee() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::LocalSet(0), Instr::LocalGet(0)], &opts);
        assert_eq!(out, vec![Instr::LocalTee(0)]);
    }

    #[test]
    fn dead_load_before_drop_is_removed() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::LocalGet(1), Instr::Drop], &opts);
        assert_eq!(out, Vec::<Instr>::new());
    }

    #[test]
    fn triple_eqz_collapses_to_one() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::I32Eqz, Instr::I32Eqz, Instr::I32Eqz], &opts);
        assert_eq!(out, vec![Instr::I32Eqz]);
    }

    #[test]
    fn const_zero_eq_becomes_eqz() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::I32Const(0), Instr::I32Eq], &opts);
        assert_eq!(out, vec![Instr::I32Eqz]);
    }

    #[test]
    fn const_trunc_folds_to_i32_const() {
        let opts = CompilerOptions::default();
        let out = run(vec![Instr::F64Const(3.7), Instr::I32TruncF64S], &opts);
        assert_eq!(out, vec![Instr::I32Const(3)]);
    }

    #[test]
    fn zero_passes_leaves_body_untouched() {
        let mut opts = CompilerOptions::default();
        opts.opt_passes = 0;
        let out = run(vec![Instr::I32Const(2), Instr::I32Const(3), Instr::I32Add], &opts);
        assert_eq!(out, vec![Instr::I32Const(2), Instr::I32Const(3), Instr::I32Add]);
    }

    #[test]
    fn is_idempotent_beyond_first_pass() {
        let opts = CompilerOptions::default();
        let body = vec![
            Instr::LocalGet(0),
            Instr::Drop,
            Instr::I32Const(1),
            Instr::I32Const(1),
            Instr::I32Add,
        ];
        let once = run(body.clone(), &opts);
        let twice = run(once.clone(), &opts);
        assert_eq!(once, twice);
    }

    #[test]
    fn tail_call_rewrite_requires_config_flag() {
        let mut opts = CompilerOptions::default();
        opts.tail_call = false;
        let body = vec![Instr::Call(FuncRef::Resolved(2)), Instr::Return];
        let out = run(body.clone(), &opts);
        assert_eq!(out, body);

        opts.tail_call = true;
        let out = run(body, &opts);
        assert_eq!(out, vec![Instr::ReturnCall(FuncRef::Resolved(2))]);
    }
}
