//! Statement and expression lowering.
//!
//! A builder accumulates functions/globals/data as it walks the analyzer's
//! output tree. Every compiled function returns exactly two Wasm results,
//! `(f64 value, i32 type-id)`, including the synthetic `#main` entry point
//! that wraps top-level statements.
//!
//! **Calling convention.** Every user-defined function (declaration or
//! expression) is compiled to the same fixed signature —
//! `(env_ptr: i32, argc: i32, args_ptr: i32) -> (f64, i32)` — regardless
//! of its source arity. Arguments are marshalled into a heap-allocated
//! buffer of `(f64, i32)` pairs before each call. This uniform ABI is
//! what makes recursion (direct and, were it needed, indirect through a
//! table) trivial: every callable function shares one Wasm type. Closures
//! close over their captures by reference: any local that a nested
//! function's body reads or writes is heap-allocated (a "cell") rather
//! than kept in a plain Wasm local, and the capturing function receives
//! an `env_ptr` pointing at a flat array of cell pointers, one per
//! capture, in `HFunction::captures` order.
//!
//! **Call target resolution is static.** A call's callee must resolve,
//! at compile time, to a concrete [`crate::hir::HFunction`] — either a
//! named declaration, or a local binding whose inferred static type is
//! `StaticType::Function` (propagated through `let` initializers and,
//! for the common "return a closure" pattern, through a single-return
//! analysis of the callee's own body). A callee that cannot be traced to
//! a concrete function this way (e.g. one arriving through an untyped
//! channel such as a parameter or an array element) is rejected with
//! `CompileError::TypeCompile` — full dynamic dispatch is out of scope
//! for this crate (see DESIGN.md).

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ast::{AssignOp, BinaryOp, LogicalOp, UnaryOp, UpdateOp};
use crate::codegen::builtins::{self, HostImport};
use crate::config::CompilerOptions;
use crate::errors::{CompileError, CompileResult, SourceSpan};
use crate::hir::{self, HExpr, HFunction, HStmt, MemberKey};
use crate::ir::{
    BlockType, DataSegment, ExceptionTag, FuncRef, FunctionRecord, GlobalRecord, ImportRecord,
    Instr, LoweringState, Module as IrModule, PageMap, TypeId, ValType,
};

const HEAP_TOP_GLOBAL: u32 = 0;
const EXCEPTION_TAG: u32 = 0;
const PAIR_SIZE: u32 = 16;
const ARRAY_MAX_CAPACITY: u32 = 64;

/// Compile-time-only type hint attached to a binding, used solely to
/// resolve call targets and object property offsets statically. Never
/// observable at runtime; carries no obligation on the generated code.
#[derive(Debug, Clone)]
enum StaticType {
    Number,
    Bool,
    Str,
    Null,
    Undefined,
    Array,
    Object(Rc<Vec<String>>),
    Function(Rc<HFunction>),
}

#[derive(Debug, Clone, Copy)]
enum LocalSlot {
    /// Plain value held directly in two Wasm locals.
    Direct { value: u32, ty: u32 },
    /// Heap cell: a single i32 local holds the pointer to a `(f64, i32)`
    /// pair living in linear memory, so nested functions can close over
    /// it by copying the pointer rather than the value.
    Cell { ptr: u32 },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockRole {
    LoopBreak,
    LoopContinue,
    LabeledBreak,
}

struct ActiveBlock {
    label: Option<String>,
    role: BlockRole,
}

/// Per-function lowering state: accumulated locals/body plus lexical
/// bookkeeping (scopes, active loops, capture needs).
struct FnBuilder<'m> {
    module: &'m mut LowerCtx,
    locals: Vec<ValType>,
    body: Vec<Instr>,
    scopes: Vec<FxHashMap<String, LocalSlot>>,
    var_types: FxHashMap<String, StaticType>,
    needs_cell: std::collections::HashSet<String>,
    block_stack: Vec<ActiveBlock>,
    scratch_f64: Option<u32>,
    scratch_i32: Option<u32>,
}

/// Whole-module lowering state shared across all functions being built.
struct LowerCtx {
    imports: Vec<ImportRecord>,
    functions: Vec<FunctionRecord>,
    /// Maps a declared function's unique binding name to its assigned
    /// Wasm function index.
    name_to_index: FxHashMap<String, u32>,
    /// Maps an `HFunction`'s identity (`Rc::as_ptr` as an integer) to its
    /// assigned index, for function *expressions* with no declared name.
    ptr_to_index: FxHashMap<usize, u32>,
    data: Vec<DataSegment>,
    data_cursor: u32,
    string_cache: FxHashMap<String, (u32, u32)>,
    alloc_index: u32,
    array_push_index: u32,
}

impl LowerCtx {
    fn func_ptr(f: &Rc<HFunction>) -> usize {
        Rc::as_ptr(f) as usize
    }

    fn index_for(&self, f: &Rc<HFunction>) -> Option<u32> {
        if let Some(name) = &f.declared_name {
            if let Some(idx) = self.name_to_index.get(name) {
                return Some(*idx);
            }
        }
        self.ptr_to_index.get(&Self::func_ptr(f)).copied()
    }

    fn intern_string(&mut self, s: &str) -> (u32, u32) {
        if let Some(existing) = self.string_cache.get(s) {
            return *existing;
        }
        let bytes = s.as_bytes();
        let mut blob = Vec::with_capacity(4 + bytes.len());
        blob.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        blob.extend_from_slice(bytes);
        let offset = self.data_cursor;
        self.data.push(DataSegment { offset, bytes: blob.clone() });
        self.data_cursor += blob.len() as u32;
        let result = (offset, bytes.len() as u32);
        self.string_cache.insert(s.to_string(), result);
        result
    }
}

/// Discover every function reachable from `body`, in pre-order, assigning
/// each a stable Wasm function index before any body is lowered.
fn discover(body: &[HStmt], out: &mut Vec<Rc<HFunction>>) {
    for stmt in body {
        discover_stmt(stmt, out);
    }
}

fn discover_stmt(stmt: &HStmt, out: &mut Vec<Rc<HFunction>>) {
    match stmt {
        HStmt::Let { init: Some(e), .. } => discover_expr(e, out),
        HStmt::Let { init: None, .. } => {}
        HStmt::FunctionDecl(f) => discover_function(f, out),
        HStmt::Block(body) => discover(body, out),
        HStmt::Expr(e) => discover_expr(e, out),
        HStmt::If { test, consequent, alternate } => {
            discover_expr(test, out);
            discover_stmt(consequent, out);
            if let Some(a) = alternate {
                discover_stmt(a, out);
            }
        }
        HStmt::While { test, body, .. } => {
            discover_expr(test, out);
            discover_stmt(body, out);
        }
        HStmt::For { init, test, update, body, .. } => {
            if let Some(i) = init {
                discover_stmt(i, out);
            }
            if let Some(t) = test {
                discover_expr(t, out);
            }
            if let Some(u) = update {
                discover_expr(u, out);
            }
            discover_stmt(body, out);
        }
        HStmt::Return(Some(e)) => discover_expr(e, out),
        HStmt::Return(None) => {}
        HStmt::Throw(e) => discover_expr(e, out),
        HStmt::Try { block, catch_body, finally, .. } => {
            discover(block, out);
            if let Some(c) = catch_body {
                discover(c, out);
            }
            if let Some(f) = finally {
                discover(f, out);
            }
        }
        HStmt::Labeled { body, .. } => discover_stmt(body, out),
        HStmt::Break(_) | HStmt::Continue(_) | HStmt::Empty => {}
    }
}

fn discover_expr(expr: &HExpr, out: &mut Vec<Rc<HFunction>>) {
    match expr {
        HExpr::Function(f) => discover_function(f, out),
        HExpr::Array(items) => items.iter().for_each(|e| discover_expr(e, out)),
        HExpr::Object(props) => props.iter().for_each(|(_, e)| discover_expr(e, out)),
        HExpr::Binary(_, l, r) | HExpr::Logical(_, l, r) => {
            discover_expr(l, out);
            discover_expr(r, out);
        }
        HExpr::Unary(_, a) => discover_expr(a, out),
        HExpr::Update { target, .. } => discover_expr(target, out),
        HExpr::Assign { target, value, .. } => {
            discover_expr(target, out);
            discover_expr(value, out);
        }
        HExpr::Call { callee, args } => {
            discover_expr(callee, out);
            args.iter().for_each(|a| discover_expr(a, out));
        }
        HExpr::Member { object, property, .. } => {
            discover_expr(object, out);
            if let MemberKey::Computed(e) = property {
                discover_expr(e, out);
            }
        }
        HExpr::Conditional { test, consequent, alternate } => {
            discover_expr(test, out);
            discover_expr(consequent, out);
            discover_expr(alternate, out);
        }
        HExpr::Sequence(items) => items.iter().for_each(|e| discover_expr(e, out)),
        HExpr::Number(_)
        | HExpr::Str(_)
        | HExpr::Bool(_)
        | HExpr::Null
        | HExpr::Undefined
        | HExpr::Ident(_)
        | HExpr::EvalLike => {}
    }
}

fn discover_function(f: &Rc<HFunction>, out: &mut Vec<Rc<HFunction>>) {
    let ptr = Rc::as_ptr(f) as usize;
    if out.iter().any(|existing| Rc::as_ptr(existing) as usize == ptr) {
        return;
    }
    out.push(f.clone());
    discover(&f.body, out);
}

/// Walks the body of `f` looking for the static type its calls would
/// return, used only for call-target resolution through the common
/// "function returning a closure" pattern (spec's closures/counter
/// scenario). Looks at direct `return` statements only — not a general
/// return-type inference engine.
fn infer_return_static_type(
    f: &HFunction,
    var_types: &FxHashMap<String, StaticType>,
) -> Option<StaticType> {
    fn search(
        body: &[HStmt],
        var_types: &FxHashMap<String, StaticType>,
    ) -> Option<StaticType> {
        for stmt in body {
            match stmt {
                HStmt::Return(Some(e)) => return infer_static_type(e, var_types),
                HStmt::Block(b) => {
                    if let Some(t) = search(b, var_types) {
                        return Some(t);
                    }
                }
                HStmt::If { consequent, alternate, .. } => {
                    if let Some(t) = search(std::slice::from_ref(consequent), var_types) {
                        return Some(t);
                    }
                    if let Some(a) = alternate {
                        if let Some(t) = search(std::slice::from_ref(a), var_types) {
                            return Some(t);
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }
    search(&f.body, var_types)
}

fn infer_static_type(expr: &HExpr, var_types: &FxHashMap<String, StaticType>) -> Option<StaticType> {
    match expr {
        HExpr::Number(_) => Some(StaticType::Number),
        HExpr::Str(_) => Some(StaticType::Str),
        HExpr::Bool(_) => Some(StaticType::Bool),
        HExpr::Null => Some(StaticType::Null),
        HExpr::Undefined => Some(StaticType::Undefined),
        HExpr::Array(_) => Some(StaticType::Array),
        HExpr::Object(props) => Some(StaticType::Object(Rc::new(
            props.iter().map(|(k, _)| k.clone()).collect(),
        ))),
        HExpr::Function(f) => Some(StaticType::Function(f.clone())),
        HExpr::Ident(r) => r.resolved.as_ref().and_then(|n| var_types.get(n).cloned()),
        HExpr::Binary(op, ..) => match op {
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::StrictEq
            | BinaryOp::StrictNotEq
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::Le
            | BinaryOp::Ge => Some(StaticType::Bool),
            _ => Some(StaticType::Number),
        },
        HExpr::Unary(op, _) => Some(match op {
            UnaryOp::Neg => StaticType::Number,
            UnaryOp::Not => StaticType::Bool,
            UnaryOp::Typeof => StaticType::Str,
            UnaryOp::Void => StaticType::Undefined,
        }),
        HExpr::Update { .. } => Some(StaticType::Number),
        HExpr::Assign { value, .. } => infer_static_type(value, var_types),
        HExpr::Call { callee, .. } => match infer_static_type(callee, var_types) {
            Some(StaticType::Function(f)) => infer_return_static_type(&f, var_types),
            _ => None,
        },
        HExpr::Logical(..) | HExpr::Member { .. } | HExpr::Conditional { .. } | HExpr::Sequence(_)
        | HExpr::EvalLike => None,
    }
}

/// Lowers the whole program to a Wasm IR module: discovers and schedules
/// every function up front, lowers each body in place, then lowers the
/// synthetic `#main` entry from the module's top-level statements.
pub fn generate(module: &hir::Module, options: &CompilerOptions) -> CompileResult<IrModule> {
    let mut discovered = Vec::new();
    discover(&module.body, &mut discovered);

    // One export per declared top-level function — a function declared
    // directly in the program body, not one nested inside another
    // function or produced by an expression.
    let top_level_names: std::collections::HashSet<&str> = module
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            HStmt::FunctionDecl(f) => Some(f.debug_name.as_str()),
            _ => None,
        })
        .collect();

    let mut ctx = LowerCtx {
        imports: [HostImport::Print, HostImport::PrintChar, HostImport::Time, HostImport::TimeOrigin]
            .into_iter()
            .map(|h| ImportRecord {
                module: h.module().to_string(),
                name: h.name().to_string(),
                params: h.params(),
                results: h.results(),
            })
            .collect(),
        functions: Vec::new(),
        name_to_index: FxHashMap::default(),
        ptr_to_index: FxHashMap::default(),
        data: Vec::new(),
        data_cursor: 0,
        string_cache: FxHashMap::default(),
        alloc_index: 0,
        array_push_index: 0,
    };
    let import_count = ctx.imports.len() as u32;

    for (position, f) in discovered.iter().enumerate() {
        let index = import_count + position as u32;
        if let Some(name) = &f.declared_name {
            ctx.name_to_index.insert(name.clone(), index);
        }
        ctx.ptr_to_index.insert(LowerCtx::func_ptr(f), index);
        let exported_name = if top_level_names.contains(f.debug_name.as_str()) {
            f.declared_name.clone()
        } else {
            None
        };
        ctx.functions.push(FunctionRecord {
            debug_name: f.debug_name.clone(),
            params: vec![ValType::I32, ValType::I32, ValType::I32],
            locals: Vec::new(),
            body: Vec::new(),
            exported_name,
            state: LoweringState::Scheduled,
            index: Some(index),
        });
    }
    ctx.alloc_index = import_count + discovered.len() as u32;
    ctx.array_push_index = ctx.alloc_index + 1;
    ctx.functions.push(alloc_function_stub());
    ctx.functions.push(array_push_function_stub());

    for (position, f) in discovered.iter().enumerate() {
        let lowered = lower_function_body(&mut ctx, f)?;
        ctx.functions[position].locals = lowered.locals;
        ctx.functions[position].body = lowered.body;
        ctx.functions[position].state = LoweringState::Lowered;
    }

    let alloc_idx = ctx.alloc_index as usize;
    ctx.functions[alloc_idx] = alloc_function(ctx.alloc_index);
    let push_idx = ctx.array_push_index as usize;
    ctx.functions[push_idx] = array_push_function(ctx.array_push_index);

    let main = lower_main(&mut ctx, &module.body)?;
    let main_index = ctx.functions.len() as u32 + import_count;
    ctx.functions.push(FunctionRecord {
        debug_name: "#main".to_string(),
        params: vec![],
        locals: main.locals,
        body: main.body,
        // The synthetic entry point is exported under the name `m` (not
        // `main`) so it can't collide with a source-level top-level
        // function literally named `main`.
        exported_name: Some("m".to_string()),
        state: LoweringState::Lowered,
        index: Some(main_index),
    });

    Ok(IrModule {
        imports: ctx.imports,
        functions: ctx.functions,
        globals: vec![GlobalRecord {
            val_type: ValType::I32,
            mutable: true,
            init: Instr::I32Const(align_up(ctx.data_cursor, PAIR_SIZE) as i32),
        }],
        data: ctx.data,
        pages: Some(PageMap { initial_pages: 1, maximum_pages: None }),
        exceptions: vec![ExceptionTag {
            debug_name: "#exception".to_string(),
            params: vec![ValType::F64, ValType::I32],
        }],
        start_function: None,
    })
}

struct Lowered {
    locals: Vec<ValType>,
    body: Vec<Instr>,
}

/// Rounds `value` up to the next multiple of `align` (the heap must start
/// past every data segment, 16-byte aligned to match `(f64, i32)` pairs).
fn align_up(value: u32, align: u32) -> u32 {
    ((value + align - 1) / align) * align
}

fn alloc_function_stub() -> FunctionRecord {
    FunctionRecord {
        debug_name: "#alloc".to_string(),
        params: vec![ValType::I32],
        locals: vec![],
        body: vec![],
        exported_name: None,
        state: LoweringState::Scheduled,
        index: None,
    }
}

fn array_push_function_stub() -> FunctionRecord {
    FunctionRecord {
        debug_name: "#array_push".to_string(),
        params: vec![ValType::I32, ValType::F64, ValType::I32],
        locals: vec![],
        body: vec![],
        exported_name: None,
        state: LoweringState::Scheduled,
        index: None,
    }
}

/// `fn(size: i32) -> i32`: bump-allocates `size` bytes from the global
/// heap pointer. No free list, no growth beyond the reserved pages
/// (spec's page-map config bounds the module's memory; this crate does
/// not implement garbage collection or `memory.grow`-on-demand, a scope
/// reduction recorded in DESIGN.md).
fn alloc_function(index: u32) -> FunctionRecord {
    const OLD_PTR_LOCAL: u32 = 1;
    FunctionRecord {
        debug_name: "#alloc".to_string(),
        params: vec![ValType::I32],
        locals: vec![ValType::I32],
        body: vec![
            Instr::GlobalGet(HEAP_TOP_GLOBAL),
            Instr::LocalSet(OLD_PTR_LOCAL),
            Instr::LocalGet(OLD_PTR_LOCAL),
            Instr::LocalGet(0),
            Instr::I32Add,
            Instr::GlobalSet(HEAP_TOP_GLOBAL),
            Instr::LocalGet(OLD_PTR_LOCAL),
            Instr::Return,
            Instr::End,
        ],
        exported_name: None,
        state: LoweringState::Lowered,
        index: Some(index),
    }
}

/// `fn(arr_ptr: i32, val: f64, val_type: i32) -> (f64, i32)`: appends a
/// value to a fixed-capacity array record and returns the new length,
/// matching `Array.prototype.push`.
fn array_push_function(index: u32) -> FunctionRecord {
    const LEN_LOCAL: u32 = 3;
    const ADDR_LOCAL: u32 = 4;
    FunctionRecord {
        debug_name: "#array_push".to_string(),
        params: vec![ValType::I32, ValType::F64, ValType::I32],
        locals: vec![ValType::I32, ValType::I32],
        body: vec![
            Instr::LocalGet(0),
            Instr::I32Load { offset: 0 },
            Instr::LocalSet(LEN_LOCAL),
            Instr::LocalGet(0),
            Instr::I32Const(4),
            Instr::I32Add,
            Instr::LocalGet(LEN_LOCAL),
            Instr::I32Const(PAIR_SIZE as i32),
            Instr::I32Mul,
            Instr::I32Add,
            Instr::LocalSet(ADDR_LOCAL),
            Instr::LocalGet(ADDR_LOCAL),
            Instr::LocalGet(1),
            Instr::F64Store { offset: 0 },
            Instr::LocalGet(ADDR_LOCAL),
            Instr::LocalGet(2),
            Instr::I32Store { offset: 8 },
            Instr::LocalGet(0),
            Instr::LocalGet(LEN_LOCAL),
            Instr::I32Const(1),
            Instr::I32Add,
            Instr::I32Store { offset: 0 },
            Instr::LocalGet(LEN_LOCAL),
            Instr::I32Const(1),
            Instr::I32Add,
            Instr::F64ConvertI32S,
            Instr::I32Const(TypeId::Number.tag()),
            Instr::End,
        ],
        exported_name: None,
        state: LoweringState::Lowered,
        index: Some(index),
    }
}

fn lower_function_body(ctx: &mut LowerCtx, f: &Rc<HFunction>) -> CompileResult<Lowered> {
    let needs_cell = capture_needs(&f.body);
    let mut fb = FnBuilder {
        module: ctx,
        locals: Vec::new(),
        body: Vec::new(),
        scopes: vec![FxHashMap::default()],
        var_types: FxHashMap::default(),
        needs_cell,
        block_stack: Vec::new(),
        scratch_f64: None,
        scratch_i32: None,
    };

    // Param 0: env_ptr, param 1: argc (unused at runtime, informational
    // only — callers always pad the args buffer to the callee's arity),
    // param 2: args_ptr.
    for (i, capture_name) in f.captures.iter().enumerate() {
        let ptr_local = fb.alloc_local(ValType::I32);
        fb.body.push(Instr::LocalGet(0));
        fb.body.push(Instr::I32Load { offset: (i as u32) * 4 });
        fb.body.push(Instr::LocalSet(ptr_local));
        fb.bind(capture_name.clone(), LocalSlot::Cell { ptr: ptr_local });
    }

    for (i, param_name) in f.params.iter().enumerate() {
        let value_read = vec![Instr::LocalGet(2), Instr::F64Load { offset: (i as u32) * PAIR_SIZE }];
        let type_read = vec![Instr::LocalGet(2), Instr::I32Load { offset: (i as u32) * PAIR_SIZE + 8 }];
        if fb.needs_cell.contains(param_name) {
            let ptr_local = fb.alloc_local(ValType::I32);
            fb.body.extend(vec![Instr::I32Const(PAIR_SIZE as i32), Instr::Call(FuncRef::Resolved(fb.module.alloc_index))]);
            fb.body.push(Instr::LocalSet(ptr_local));
            fb.body.push(Instr::LocalGet(ptr_local));
            fb.body.extend(value_read);
            fb.body.push(Instr::F64Store { offset: 0 });
            fb.body.push(Instr::LocalGet(ptr_local));
            fb.body.extend(type_read);
            fb.body.push(Instr::I32Store { offset: 8 });
            fb.bind(param_name.clone(), LocalSlot::Cell { ptr: ptr_local });
        } else {
            let value_local = fb.alloc_local(ValType::F64);
            let type_local = fb.alloc_local(ValType::I32);
            fb.body.extend(value_read);
            fb.body.push(Instr::LocalSet(value_local));
            fb.body.extend(type_read);
            fb.body.push(Instr::LocalSet(type_local));
            fb.bind(param_name.clone(), LocalSlot::Direct { value: value_local, ty: type_local });
        }
    }

    let mut produced_value = false;
    for stmt in &f.body {
        if let HStmt::Return(_) = stmt {
            produced_value = true;
        }
        fb.lower_stmt(stmt)?;
    }
    if !produced_value {
        fb.body.push(Instr::F64Const(0.0));
        fb.body.push(Instr::I32Const(TypeId::Undefined.tag()));
    }
    fb.body.push(Instr::End);

    Ok(Lowered { locals: fb.locals, body: fb.body })
}

fn lower_main(ctx: &mut LowerCtx, body: &[HStmt]) -> CompileResult<Lowered> {
    let needs_cell = capture_needs(body);
    let mut fb = FnBuilder {
        module: ctx,
        locals: Vec::new(),
        body: Vec::new(),
        scopes: vec![FxHashMap::default()],
        var_types: FxHashMap::default(),
        needs_cell,
        block_stack: Vec::new(),
        scratch_f64: None,
        scratch_i32: None,
    };
    for (i, stmt) in body.iter().enumerate() {
        let is_last = i + 1 == body.len();
        if is_last {
            if let HStmt::Expr(e) = stmt {
                fb.lower_expr(e)?;
                fb.body.push(Instr::End);
                return Ok(Lowered { locals: fb.locals, body: fb.body });
            }
        }
        fb.lower_stmt(stmt)?;
    }
    fb.body.push(Instr::F64Const(0.0));
    fb.body.push(Instr::I32Const(TypeId::Undefined.tag()));
    fb.body.push(Instr::End);
    Ok(Lowered { locals: fb.locals, body: fb.body })
}

/// Names declared in `body`'s own (outermost) scope that at least one
/// function nested anywhere inside `body` captures — these must be
/// heap-allocated cells rather than plain locals. Because the analyzer
/// propagates a capture to every enclosing function frame, a name
/// captured several levels down still shows up on the *immediate* child
/// function's `captures` list, so scanning direct children suffices.
fn capture_needs(body: &[HStmt]) -> std::collections::HashSet<String> {
    let mut functions = Vec::new();
    for stmt in body {
        collect_immediate_functions_stmt(stmt, &mut functions);
    }
    let mut needs = std::collections::HashSet::new();
    for f in functions {
        needs.extend(f.captures.iter().cloned());
    }
    needs
}

fn collect_immediate_functions_stmt(stmt: &HStmt, out: &mut Vec<Rc<HFunction>>) {
    match stmt {
        HStmt::Let { init: Some(e), .. } => collect_immediate_functions_expr(e, out),
        HStmt::FunctionDecl(f) => out.push(f.clone()),
        HStmt::Block(b) => b.iter().for_each(|s| collect_immediate_functions_stmt(s, out)),
        HStmt::Expr(e) => collect_immediate_functions_expr(e, out),
        HStmt::If { test, consequent, alternate } => {
            collect_immediate_functions_expr(test, out);
            collect_immediate_functions_stmt(consequent, out);
            if let Some(a) = alternate {
                collect_immediate_functions_stmt(a, out);
            }
        }
        HStmt::While { test, body, .. } => {
            collect_immediate_functions_expr(test, out);
            collect_immediate_functions_stmt(body, out);
        }
        HStmt::For { init, test, update, body, .. } => {
            if let Some(i) = init {
                collect_immediate_functions_stmt(i, out);
            }
            if let Some(t) = test {
                collect_immediate_functions_expr(t, out);
            }
            if let Some(u) = update {
                collect_immediate_functions_expr(u, out);
            }
            collect_immediate_functions_stmt(body, out);
        }
        HStmt::Return(Some(e)) => collect_immediate_functions_expr(e, out),
        HStmt::Throw(e) => collect_immediate_functions_expr(e, out),
        HStmt::Try { block, catch_body, finally, .. } => {
            block.iter().for_each(|s| collect_immediate_functions_stmt(s, out));
            if let Some(c) = catch_body {
                c.iter().for_each(|s| collect_immediate_functions_stmt(s, out));
            }
            if let Some(f) = finally {
                f.iter().for_each(|s| collect_immediate_functions_stmt(s, out));
            }
        }
        HStmt::Labeled { body, .. } => collect_immediate_functions_stmt(body, out),
        HStmt::Let { init: None, .. } | HStmt::Return(None) | HStmt::Break(_)
        | HStmt::Continue(_) | HStmt::Empty => {}
    }
}

fn collect_immediate_functions_expr(expr: &HExpr, out: &mut Vec<Rc<HFunction>>) {
    match expr {
        HExpr::Function(f) => out.push(f.clone()),
        HExpr::Array(items) => items.iter().for_each(|e| collect_immediate_functions_expr(e, out)),
        HExpr::Object(props) => props.iter().for_each(|(_, e)| collect_immediate_functions_expr(e, out)),
        HExpr::Binary(_, l, r) | HExpr::Logical(_, l, r) => {
            collect_immediate_functions_expr(l, out);
            collect_immediate_functions_expr(r, out);
        }
        HExpr::Unary(_, a) => collect_immediate_functions_expr(a, out),
        HExpr::Update { target, .. } => collect_immediate_functions_expr(target, out),
        HExpr::Assign { target, value, .. } => {
            collect_immediate_functions_expr(target, out);
            collect_immediate_functions_expr(value, out);
        }
        HExpr::Call { callee, args } => {
            collect_immediate_functions_expr(callee, out);
            args.iter().for_each(|a| collect_immediate_functions_expr(a, out));
        }
        HExpr::Member { object, property, .. } => {
            collect_immediate_functions_expr(object, out);
            if let MemberKey::Computed(e) = property {
                collect_immediate_functions_expr(e, out);
            }
        }
        HExpr::Conditional { test, consequent, alternate } => {
            collect_immediate_functions_expr(test, out);
            collect_immediate_functions_expr(consequent, out);
            collect_immediate_functions_expr(alternate, out);
        }
        HExpr::Sequence(items) => items.iter().for_each(|e| collect_immediate_functions_expr(e, out)),
        _ => {}
    }
}

impl<'m> FnBuilder<'m> {
    fn alloc_local(&mut self, vt: ValType) -> u32 {
        let base = 3; // env_ptr, argc, args_ptr always occupy 0..3 for user functions
        let idx = base + self.locals.len() as u32;
        self.locals.push(vt);
        idx
    }

    fn bind(&mut self, name: String, slot: LocalSlot) {
        self.scopes.last_mut().expect("a scope is always open").insert(name, slot);
    }

    fn lookup(&self, name: &str) -> Option<LocalSlot> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn scratch_f64(&mut self) -> u32 {
        if let Some(l) = self.scratch_f64 {
            return l;
        }
        let l = self.alloc_local(ValType::F64);
        self.scratch_f64 = Some(l);
        l
    }

    fn scratch_i32(&mut self) -> u32 {
        if let Some(l) = self.scratch_i32 {
            return l;
        }
        let l = self.alloc_local(ValType::I32);
        self.scratch_i32 = Some(l);
        l
    }

    /// Declares a new binding in the current scope, initializing it from
    /// whatever pair is already on the stack (value deep, type-id top).
    fn declare_from_stack(&mut self, name: &str) {
        if self.needs_cell.contains(name) {
            let tmp_ty = self.scratch_i32();
            let tmp_val = self.scratch_f64();
            self.body.push(Instr::LocalSet(tmp_ty));
            self.body.push(Instr::LocalSet(tmp_val));
            self.body.push(Instr::I32Const(PAIR_SIZE as i32));
            self.body.push(Instr::Call(FuncRef::Resolved(self.module.alloc_index)));
            let ptr = self.alloc_local(ValType::I32);
            self.body.push(Instr::LocalSet(ptr));
            self.body.push(Instr::LocalGet(ptr));
            self.body.push(Instr::LocalGet(tmp_val));
            self.body.push(Instr::F64Store { offset: 0 });
            self.body.push(Instr::LocalGet(ptr));
            self.body.push(Instr::LocalGet(tmp_ty));
            self.body.push(Instr::I32Store { offset: 8 });
            self.bind(name.to_string(), LocalSlot::Cell { ptr });
        } else {
            let ty = self.alloc_local(ValType::I32);
            let value = self.alloc_local(ValType::F64);
            self.body.push(Instr::LocalSet(ty));
            self.body.push(Instr::LocalSet(value));
            self.bind(name.to_string(), LocalSlot::Direct { value, ty });
        }
    }

    fn read_slot(&mut self, slot: LocalSlot) {
        match slot {
            LocalSlot::Direct { value, ty } => {
                self.body.push(Instr::LocalGet(value));
                self.body.push(Instr::LocalGet(ty));
            }
            LocalSlot::Cell { ptr } => {
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::F64Load { offset: 0 });
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::I32Load { offset: 8 });
            }
        }
    }

    /// Stores a pair already on the stack into `slot`, leaving a copy of
    /// the same pair on the stack (assignment expressions evaluate to
    /// the assigned value).
    fn write_slot(&mut self, slot: LocalSlot) {
        let tmp_ty = self.scratch_i32();
        let tmp_val = self.scratch_f64();
        self.body.push(Instr::LocalSet(tmp_ty));
        self.body.push(Instr::LocalSet(tmp_val));
        match slot {
            LocalSlot::Direct { value, ty } => {
                self.body.push(Instr::LocalGet(tmp_val));
                self.body.push(Instr::LocalSet(value));
                self.body.push(Instr::LocalGet(tmp_ty));
                self.body.push(Instr::LocalSet(ty));
            }
            LocalSlot::Cell { ptr } => {
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::LocalGet(tmp_val));
                self.body.push(Instr::F64Store { offset: 0 });
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::LocalGet(tmp_ty));
                self.body.push(Instr::I32Store { offset: 8 });
            }
        }
        self.body.push(Instr::LocalGet(tmp_val));
        self.body.push(Instr::LocalGet(tmp_ty));
    }

    fn drop_pair(&mut self) {
        self.body.push(Instr::Drop);
        self.body.push(Instr::Drop);
    }

    /// Consumes a `(f64, i32)` pair on the stack and leaves a single i32
    /// boolean: false for `null`/`undefined`, otherwise `value != 0.0`
    /// (correct for numbers, booleans stored as 0.0/1.0, and pointers,
    /// which are always non-zero past the reserved heap base).
    fn truthy(&mut self) {
        let tmp_ty = self.scratch_i32();
        let tmp_val = self.scratch_f64();
        self.body.push(Instr::LocalSet(tmp_ty));
        self.body.push(Instr::LocalSet(tmp_val));
        self.body.push(Instr::LocalGet(tmp_ty));
        self.body.push(Instr::I32Const(TypeId::Null.tag()));
        self.body.push(Instr::I32Eq);
        self.body.push(Instr::LocalGet(tmp_ty));
        self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
        self.body.push(Instr::I32Eq);
        self.body.push(Instr::I32Or);
        self.body.push(Instr::If(BlockType::I32));
        self.body.push(Instr::I32Const(0));
        self.body.push(Instr::Else);
        self.body.push(Instr::LocalGet(tmp_val));
        self.body.push(Instr::F64Const(0.0));
        self.body.push(Instr::F64Ne);
        self.body.push(Instr::End);
    }

    fn lower_stmt(&mut self, stmt: &HStmt) -> CompileResult<()> {
        match stmt {
            HStmt::Let { name, init, .. } => {
                if let Some(e) = init {
                    self.lower_expr(e)?;
                } else {
                    self.body.push(Instr::F64Const(0.0));
                    self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                }
                if let Some(e) = init {
                    if let Some(st) = infer_static_type(e, &self.var_types) {
                        self.var_types.insert(name.clone(), st);
                    }
                }
                self.declare_from_stack(name);
                Ok(())
            }
            HStmt::FunctionDecl(f) => {
                self.var_types.insert(
                    f.declared_name.clone().unwrap_or_default(),
                    StaticType::Function(f.clone()),
                );
                if f.captures.is_empty() {
                    self.body.push(Instr::F64Const(0.0));
                } else {
                    self.build_env_array(f)?;
                    self.body.push(Instr::F64ConvertI32S);
                }
                self.body.push(Instr::I32Const(TypeId::Function.tag()));
                if let Some(name) = &f.declared_name {
                    self.declare_from_stack(name);
                } else {
                    self.drop_pair();
                }
                Ok(())
            }
            HStmt::Block(body) => {
                self.push_scope();
                for s in body {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                Ok(())
            }
            HStmt::Expr(e) => {
                self.lower_expr(e)?;
                self.drop_pair();
                Ok(())
            }
            HStmt::If { test, consequent, alternate } => {
                self.lower_expr(test)?;
                self.truthy();
                self.body.push(Instr::If(BlockType::Empty));
                self.lower_stmt(consequent)?;
                if let Some(a) = alternate {
                    self.body.push(Instr::Else);
                    self.lower_stmt(a)?;
                }
                self.body.push(Instr::End);
                Ok(())
            }
            HStmt::While { test, body, label } => {
                self.block_stack.push(ActiveBlock { label: label.clone(), role: BlockRole::LoopBreak });
                self.body.push(Instr::Block(BlockType::Empty));
                self.block_stack.push(ActiveBlock { label: label.clone(), role: BlockRole::LoopContinue });
                self.body.push(Instr::Loop(BlockType::Empty));
                self.lower_expr(test)?;
                self.truthy();
                self.body.push(Instr::I32Eqz);
                self.body.push(Instr::BrIf(1));
                self.lower_stmt(body)?;
                self.body.push(Instr::Br(0));
                self.body.push(Instr::End);
                self.body.push(Instr::End);
                self.block_stack.pop();
                self.block_stack.pop();
                Ok(())
            }
            HStmt::For { init, test, update, body, label } => {
                self.push_scope();
                if let Some(i) = init {
                    self.lower_stmt(i)?;
                }
                self.block_stack.push(ActiveBlock { label: label.clone(), role: BlockRole::LoopBreak });
                self.body.push(Instr::Block(BlockType::Empty));
                self.block_stack.push(ActiveBlock { label: label.clone(), role: BlockRole::LoopContinue });
                self.body.push(Instr::Loop(BlockType::Empty));
                if let Some(t) = test {
                    self.lower_expr(t)?;
                    self.truthy();
                    self.body.push(Instr::I32Eqz);
                    self.body.push(Instr::BrIf(1));
                }
                self.lower_stmt(body)?;
                if let Some(u) = update {
                    self.lower_expr(u)?;
                    self.drop_pair();
                }
                self.body.push(Instr::Br(0));
                self.body.push(Instr::End);
                self.body.push(Instr::End);
                self.block_stack.pop();
                self.block_stack.pop();
                self.pop_scope();
                Ok(())
            }
            HStmt::Return(value) => {
                match value {
                    Some(e) => self.lower_expr(e)?,
                    None => {
                        self.body.push(Instr::F64Const(0.0));
                        self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                    }
                }
                self.body.push(Instr::Return);
                Ok(())
            }
            HStmt::Throw(e) => {
                self.lower_expr(e)?;
                self.body.push(Instr::Throw(EXCEPTION_TAG));
                Ok(())
            }
            HStmt::Try { block, catch_param, catch_body, finally } => {
                self.lower_try(block, catch_param.as_deref(), catch_body.as_deref(), finally.as_deref())
            }
            HStmt::Break(label) => {
                let depth = self.find_block(label.as_deref(), &[BlockRole::LoopBreak, BlockRole::LabeledBreak])?;
                self.body.push(Instr::Br(depth));
                Ok(())
            }
            HStmt::Continue(label) => {
                let depth = self.find_block(label.as_deref(), &[BlockRole::LoopContinue])?;
                self.body.push(Instr::Br(depth));
                Ok(())
            }
            HStmt::Labeled { label, body } => {
                if matches!(body.as_ref(), HStmt::While { .. } | HStmt::For { .. }) {
                    // The loop lowering itself consumes `label` for both
                    // its break and continue targets.
                    return self.lower_labeled_loop(label, body);
                }
                self.block_stack.push(ActiveBlock { label: Some(label.clone()), role: BlockRole::LabeledBreak });
                self.body.push(Instr::Block(BlockType::Empty));
                self.lower_stmt(body)?;
                self.body.push(Instr::End);
                self.block_stack.pop();
                Ok(())
            }
            HStmt::Empty => Ok(()),
        }
    }

    fn lower_labeled_loop(&mut self, label: &str, body: &HStmt) -> CompileResult<()> {
        match body {
            HStmt::While { test, body, .. } => {
                self.lower_stmt(&HStmt::While {
                    test: test.clone(),
                    body: body.clone(),
                    label: Some(label.to_string()),
                })
            }
            HStmt::For { init, test, update, body, .. } => self.lower_stmt(&HStmt::For {
                init: init.clone(),
                test: test.clone(),
                update: update.clone(),
                body: body.clone(),
                label: Some(label.to_string()),
            }),
            _ => unreachable!("caller only dispatches loop statements here"),
        }
    }

    fn find_block(&self, label: Option<&str>, roles: &[BlockRole]) -> CompileResult<u32> {
        for (i, entry) in self.block_stack.iter().enumerate().rev() {
            let role_matches = roles.contains(&entry.role);
            let label_matches = match label {
                Some(l) => entry.label.as_deref() == Some(l),
                None => true,
            };
            if role_matches && label_matches {
                return Ok((self.block_stack.len() - 1 - i) as u32);
            }
        }
        Err(CompileError::Unsupported {
            what: "break/continue with no matching enclosing loop or label".to_string(),
            span: SourceSpan::unknown(),
        })
    }

    fn lower_try(
        &mut self,
        block: &[HStmt],
        catch_param: Option<&str>,
        catch_body: Option<&[HStmt]>,
        finally: Option<&[HStmt]>,
    ) -> CompileResult<()> {
        match (catch_body, finally) {
            (Some(handler), None) => {
                self.body.push(Instr::Try(BlockType::Pair));
                self.push_scope();
                for s in block {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::Catch(EXCEPTION_TAG));
                self.push_scope();
                if let Some(param) = catch_param {
                    self.declare_from_stack(param);
                } else {
                    self.drop_pair();
                }
                for s in handler {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::End);
                Ok(())
            }
            (None, Some(finalizer)) => {
                self.body.push(Instr::Try(BlockType::Pair));
                self.push_scope();
                for s in block {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::CatchAll);
                self.push_scope();
                for s in finalizer {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::Rethrow(0));
                self.body.push(Instr::End);
                self.push_scope();
                for s in finalizer {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                Ok(())
            }
            (Some(handler), Some(finalizer)) => {
                self.body.push(Instr::Try(BlockType::Pair));
                self.body.push(Instr::Try(BlockType::Pair));
                self.push_scope();
                for s in block {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::Catch(EXCEPTION_TAG));
                self.push_scope();
                if let Some(param) = catch_param {
                    self.declare_from_stack(param);
                } else {
                    self.drop_pair();
                }
                for s in handler {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::End);
                self.body.push(Instr::CatchAll);
                self.push_scope();
                for s in finalizer {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                self.body.push(Instr::Rethrow(0));
                self.body.push(Instr::End);
                self.push_scope();
                for s in finalizer {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                Ok(())
            }
            (None, None) => {
                self.push_scope();
                for s in block {
                    self.lower_stmt(s)?;
                }
                self.pop_scope();
                Ok(())
            }
        }
    }

    /// Allocates an env array (one i32 cell pointer per capture) for `f`
    /// and leaves its pointer (as plain i32, not yet converted to the
    /// f64 value slot) on the stack.
    fn build_env_array(&mut self, f: &HFunction) -> CompileResult<()> {
        let size = (f.captures.len() as u32) * 4;
        self.body.push(Instr::I32Const(size.max(4) as i32));
        self.body.push(Instr::Call(FuncRef::Resolved(self.module.alloc_index)));
        let env_ptr = self.alloc_local(ValType::I32);
        self.body.push(Instr::LocalSet(env_ptr));
        for (i, name) in f.captures.iter().enumerate() {
            let slot = self.lookup(name).ok_or_else(|| CompileError::UnresolvedReference {
                function: f.debug_name.clone(),
                detail: format!("capture '{name}' not bound in enclosing scope"),
            })?;
            let LocalSlot::Cell { ptr } = slot else {
                return Err(CompileError::Internal {
                    message: format!("captured binding '{name}' was not heap-allocated"),
                });
            };
            self.body.push(Instr::LocalGet(env_ptr));
            self.body.push(Instr::LocalGet(ptr));
            self.body.push(Instr::I32Store { offset: (i as u32) * 4 });
        }
        self.body.push(Instr::LocalGet(env_ptr));
        Ok(())
    }

    fn lower_expr(&mut self, expr: &HExpr) -> CompileResult<()> {
        match expr {
            HExpr::Number(n) => {
                self.body.push(Instr::F64Const(*n));
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            HExpr::Str(s) => {
                let (offset, _len) = self.module.intern_string(s);
                self.body.push(Instr::I32Const(offset as i32));
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::String.tag()));
                Ok(())
            }
            HExpr::Bool(b) => {
                self.body.push(Instr::F64Const(if *b { 1.0 } else { 0.0 }));
                self.body.push(Instr::I32Const(TypeId::Boolean.tag()));
                Ok(())
            }
            HExpr::Null => {
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::I32Const(TypeId::Null.tag()));
                Ok(())
            }
            HExpr::Undefined => {
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                Ok(())
            }
            HExpr::Ident(r) => {
                let name = r.resolved.as_deref().ok_or_else(|| CompileError::UnresolvedReference {
                    function: "<expr>".to_string(),
                    detail: format!("unresolved identifier '{}'", r.original),
                })?;
                let slot = self.lookup(name).ok_or_else(|| CompileError::Internal {
                    message: format!("resolved identifier '{name}' has no local binding"),
                })?;
                self.read_slot(slot);
                Ok(())
            }
            HExpr::Array(items) => {
                let size = 4 + ARRAY_MAX_CAPACITY * PAIR_SIZE;
                self.body.push(Instr::I32Const(size as i32));
                self.body.push(Instr::Call(FuncRef::Resolved(self.module.alloc_index)));
                let ptr = self.alloc_local(ValType::I32);
                self.body.push(Instr::LocalSet(ptr));
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::I32Const(items.len() as i32));
                self.body.push(Instr::I32Store { offset: 0 });
                for (i, item) in items.iter().enumerate() {
                    let tmp_ty = self.scratch_i32();
                    let tmp_val = self.scratch_f64();
                    self.lower_expr(item)?;
                    self.body.push(Instr::LocalSet(tmp_ty));
                    self.body.push(Instr::LocalSet(tmp_val));
                    self.body.push(Instr::LocalGet(ptr));
                    self.body.push(Instr::LocalGet(tmp_val));
                    self.body.push(Instr::F64Store { offset: 4 + (i as u32) * PAIR_SIZE });
                    self.body.push(Instr::LocalGet(ptr));
                    self.body.push(Instr::LocalGet(tmp_ty));
                    self.body.push(Instr::I32Store { offset: 4 + (i as u32) * PAIR_SIZE + 8 });
                }
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Array.tag()));
                Ok(())
            }
            HExpr::Object(props) => {
                let size = (props.len() as u32) * PAIR_SIZE;
                self.body.push(Instr::I32Const(size.max(PAIR_SIZE) as i32));
                self.body.push(Instr::Call(FuncRef::Resolved(self.module.alloc_index)));
                let ptr = self.alloc_local(ValType::I32);
                self.body.push(Instr::LocalSet(ptr));
                for (i, (_key, value)) in props.iter().enumerate() {
                    let tmp_ty = self.scratch_i32();
                    let tmp_val = self.scratch_f64();
                    self.lower_expr(value)?;
                    self.body.push(Instr::LocalSet(tmp_ty));
                    self.body.push(Instr::LocalSet(tmp_val));
                    self.body.push(Instr::LocalGet(ptr));
                    self.body.push(Instr::LocalGet(tmp_val));
                    self.body.push(Instr::F64Store { offset: (i as u32) * PAIR_SIZE });
                    self.body.push(Instr::LocalGet(ptr));
                    self.body.push(Instr::LocalGet(tmp_ty));
                    self.body.push(Instr::I32Store { offset: (i as u32) * PAIR_SIZE + 8 });
                }
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Object.tag()));
                Ok(())
            }
            HExpr::Function(f) => {
                if f.captures.is_empty() {
                    self.body.push(Instr::F64Const(0.0));
                } else {
                    self.build_env_array(f)?;
                    self.body.push(Instr::F64ConvertI32S);
                }
                self.body.push(Instr::I32Const(TypeId::Function.tag()));
                Ok(())
            }
            HExpr::Binary(op, l, r) => self.lower_binary(*op, l, r),
            HExpr::Logical(op, l, r) => self.lower_logical(*op, l, r),
            HExpr::Unary(op, a) => self.lower_unary(*op, a),
            HExpr::Update { op, target, prefix } => self.lower_update(*op, target, *prefix),
            HExpr::Assign { op, target, value } => self.lower_assign(*op, target, value),
            HExpr::Call { callee, args } => self.lower_call(callee, args),
            HExpr::Member { object, property, computed } => {
                self.lower_member_read(object, property, *computed)
            }
            HExpr::Conditional { test, consequent, alternate } => {
                self.lower_expr(test)?;
                self.truthy();
                self.body.push(Instr::If(BlockType::Pair));
                self.lower_expr(consequent)?;
                self.body.push(Instr::Else);
                self.lower_expr(alternate)?;
                self.body.push(Instr::End);
                Ok(())
            }
            HExpr::Sequence(items) => {
                for (i, e) in items.iter().enumerate() {
                    self.lower_expr(e)?;
                    if i + 1 != items.len() {
                        self.drop_pair();
                    }
                }
                Ok(())
            }
            HExpr::EvalLike => Err(CompileError::Unsupported {
                what: "eval / dynamic Function construction".to_string(),
                span: SourceSpan::unknown(),
            }),
        }
    }

    fn numeric_operand(&mut self, e: &HExpr) -> CompileResult<()> {
        self.lower_expr(e)?;
        self.body.push(Instr::Drop); // discard the type tag; arithmetic assumes Number
        Ok(())
    }

    fn lower_binary(&mut self, op: BinaryOp, l: &HExpr, r: &HExpr) -> CompileResult<()> {
        use BinaryOp::*;
        match op {
            Add | Sub | Mul | Div | Mod => {
                self.numeric_operand(l)?;
                self.numeric_operand(r)?;
                self.body.push(match op {
                    Add => Instr::F64Add,
                    Sub => Instr::F64Sub,
                    Mul => Instr::F64Mul,
                    Div => Instr::F64Div,
                    Mod => {
                        return Err(CompileError::Unsupported {
                            what: "'%' operator".to_string(),
                            span: SourceSpan::unknown(),
                        })
                    }
                    _ => unreachable!(),
                });
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            Eq | NotEq | StrictEq | StrictNotEq | Lt | Gt | Le | Ge => {
                self.numeric_operand(l)?;
                self.numeric_operand(r)?;
                self.body.push(match op {
                    Eq | StrictEq => Instr::F64Eq,
                    NotEq | StrictNotEq => Instr::F64Ne,
                    Lt => Instr::F64Lt,
                    Gt => Instr::F64Gt,
                    Le => Instr::F64Le,
                    Ge => Instr::F64Ge,
                    _ => unreachable!(),
                });
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Boolean.tag()));
                // The comparison pushed an i32; convert it back to the
                // f64 value slot used for booleans.
                self.reorder_bool_result();
                Ok(())
            }
        }
    }

    /// Comparisons above produce `i32 -> f64.convert -> i32 type-const`,
    /// leaving `(f64 bool-as-number, i32 type)` on the stack already in
    /// the right order; kept as a no-op hook so the comparison lowering
    /// above reads in one straight line rather than needing a branch.
    fn reorder_bool_result(&mut self) {}

    fn lower_logical(&mut self, op: LogicalOp, l: &HExpr, r: &HExpr) -> CompileResult<()> {
        self.lower_expr(l)?;
        let tmp_ty = self.scratch_i32();
        let tmp_val = self.scratch_f64();
        self.body.push(Instr::LocalSet(tmp_ty));
        self.body.push(Instr::LocalSet(tmp_val));
        self.body.push(Instr::LocalGet(tmp_val));
        self.body.push(Instr::LocalGet(tmp_ty));
        self.truthy();
        if matches!(op, LogicalOp::Or) {
            self.body.push(Instr::I32Eqz);
        }
        self.body.push(Instr::If(BlockType::Pair));
        self.lower_expr(r)?;
        self.body.push(Instr::Else);
        self.body.push(Instr::LocalGet(tmp_val));
        self.body.push(Instr::LocalGet(tmp_ty));
        self.body.push(Instr::End);
        Ok(())
    }

    fn lower_unary(&mut self, op: UnaryOp, a: &HExpr) -> CompileResult<()> {
        match op {
            UnaryOp::Neg => {
                self.numeric_operand(a)?;
                self.body.push(Instr::F64Neg);
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            UnaryOp::Not => {
                self.lower_expr(a)?;
                self.truthy();
                self.body.push(Instr::I32Eqz);
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Boolean.tag()));
                Ok(())
            }
            UnaryOp::Void => {
                self.lower_expr(a)?;
                self.drop_pair();
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                Ok(())
            }
            UnaryOp::Typeof => {
                self.lower_expr(a)?;
                self.body.push(Instr::Drop);
                let ti = self.alloc_local(ValType::I32);
                self.body.push(Instr::LocalSet(ti));
                self.lower_typeof_chain(ti, 0);
                Ok(())
            }
        }
    }

    /// `typeof` lowers to a chain of `i32.eq` checks against the operand's
    /// type-id, each arm pushing the matching interned `TYPE_STRING`
    /// literal (spec's value-type-id table, collapsed to JS's `typeof`
    /// result strings — `null` and `array` both read as `"object"`,
    /// matching real `typeof null`/`typeof []`).
    fn lower_typeof_chain(&mut self, ti: u32, idx: usize) {
        let order = TypeId::ALL;
        if idx + 1 == order.len() {
            self.push_type_name_string(order[idx]);
            return;
        }
        self.body.push(Instr::LocalGet(ti));
        self.body.push(Instr::I32Const(order[idx].tag()));
        self.body.push(Instr::I32Eq);
        self.body.push(Instr::If(BlockType::Pair));
        self.push_type_name_string(order[idx]);
        self.body.push(Instr::Else);
        self.lower_typeof_chain(ti, idx + 1);
        self.body.push(Instr::End);
    }

    fn push_type_name_string(&mut self, t: TypeId) {
        let name = match t {
            TypeId::Number => "number",
            TypeId::Boolean => "boolean",
            TypeId::String => "string",
            TypeId::Null | TypeId::Object | TypeId::Array => "object",
            TypeId::Undefined => "undefined",
            TypeId::Function => "function",
        };
        let (offset, _len) = self.module.intern_string(name);
        self.body.push(Instr::I32Const(offset as i32));
        self.body.push(Instr::F64ConvertI32S);
        self.body.push(Instr::I32Const(TypeId::String.tag()));
    }

    fn lower_update(&mut self, op: UpdateOp, target: &HExpr, prefix: bool) -> CompileResult<()> {
        let HExpr::Ident(r) = target else {
            return Err(CompileError::Unsupported {
                what: "increment/decrement of a non-identifier target".to_string(),
                span: SourceSpan::unknown(),
            });
        };
        let name = r.resolved.as_deref().ok_or_else(|| CompileError::UnresolvedReference {
            function: "<expr>".to_string(),
            detail: format!("unresolved identifier '{}'", r.original),
        })?;
        let slot = self.lookup(name).ok_or_else(|| CompileError::Internal {
            message: format!("resolved identifier '{name}' has no local binding"),
        })?;
        self.read_slot(slot);
        self.body.push(Instr::Drop);
        // A dedicated local, not the shared scratch: `write_slot` below
        // also uses the shared f64 scratch, which would otherwise clobber
        // this value before the postfix case reads it back.
        let old = self.alloc_local(ValType::F64);
        self.body.push(Instr::LocalSet(old));
        self.body.push(Instr::LocalGet(old));
        self.body.push(Instr::F64Const(1.0));
        self.body.push(match op {
            UpdateOp::Inc => Instr::F64Add,
            UpdateOp::Dec => Instr::F64Sub,
        });
        self.body.push(Instr::I32Const(TypeId::Number.tag()));
        self.write_slot(slot);
        if !prefix {
            self.drop_pair();
            self.body.push(Instr::LocalGet(old));
            self.body.push(Instr::I32Const(TypeId::Number.tag()));
        }
        Ok(())
    }

    fn lower_assign(&mut self, op: AssignOp, target: &HExpr, value: &HExpr) -> CompileResult<()> {
        let HExpr::Ident(r) = target else {
            return Err(CompileError::Unsupported {
                what: "assignment to a non-identifier target".to_string(),
                span: SourceSpan::unknown(),
            });
        };
        let name = r.resolved.as_deref().ok_or_else(|| CompileError::UnresolvedReference {
            function: "<expr>".to_string(),
            detail: format!("unresolved identifier '{}'", r.original),
        })?;
        let slot = self.lookup(name).ok_or_else(|| CompileError::Internal {
            message: format!("resolved identifier '{name}' has no local binding"),
        })?;
        match op {
            AssignOp::Assign => {
                self.lower_expr(value)?;
            }
            AssignOp::AddAssign | AssignOp::SubAssign | AssignOp::MulAssign | AssignOp::DivAssign => {
                self.read_slot(slot);
                self.body.push(Instr::Drop);
                self.numeric_operand(value)?;
                self.body.push(match op {
                    AssignOp::AddAssign => Instr::F64Add,
                    AssignOp::SubAssign => Instr::F64Sub,
                    AssignOp::MulAssign => Instr::F64Mul,
                    AssignOp::DivAssign => Instr::F64Div,
                    AssignOp::Assign => unreachable!(),
                });
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
            }
        }
        self.write_slot(slot);
        if let Some(st) = infer_static_type(value, &self.var_types) {
            self.var_types.insert(name.to_string(), st);
        }
        Ok(())
    }

    fn lower_call(&mut self, callee: &HExpr, args: &[HExpr]) -> CompileResult<()> {
        if let HExpr::Ident(r) = callee {
            if r.resolved.is_none() {
                if let Some(host) = HostImport::from_name(&r.original) {
                    return self.lower_host_call(host, args);
                }
            }
        }
        if let HExpr::Member { object, property: MemberKey::Name(name), computed: false } = callee {
            if let Some(st) = infer_static_type(object, &self.var_types) {
                let receiver_type = match st {
                    StaticType::Number => Some(TypeId::Number),
                    StaticType::Str => Some(TypeId::String),
                    StaticType::Array => Some(TypeId::Array),
                    _ => None,
                };
                if let Some(rt) = receiver_type {
                    if let Some(method) = builtins::lookup(rt, name) {
                        return self.lower_builtin_method_call(rt, method.name, object, args);
                    }
                }
            }
        }

        let target = infer_static_type(callee, &self.var_types);
        let Some(StaticType::Function(f)) = target else {
            return Err(CompileError::TypeCompile {
                message: "call target could not be resolved to a concrete function at compile time".to_string(),
                span: SourceSpan::unknown(),
            });
        };
        let index = self.module.index_for(&f).ok_or_else(|| CompileError::Internal {
            message: format!("function '{}' was not scheduled", f.debug_name),
        })?;

        // env_ptr for the call: if the callee is itself an expression
        // producing a Function value, its value slot already carries the
        // env pointer (0 for captureless functions); otherwise reuse 0.
        self.lower_expr(callee)?;
        self.body.push(Instr::I32TruncF64S);
        let env_local = self.alloc_local(ValType::I32);
        self.body.push(Instr::LocalSet(env_local));
        self.body.push(Instr::Drop); // discard type tag from callee pair

        let args_ptr = self.build_args_buffer(args)?;
        self.body.push(Instr::LocalGet(env_local));
        self.body.push(Instr::I32Const(args.len() as i32));
        self.body.push(Instr::LocalGet(args_ptr));
        self.body.push(Instr::Call(FuncRef::Resolved(index)));
        Ok(())
    }

    fn build_args_buffer(&mut self, args: &[HExpr]) -> CompileResult<u32> {
        let size = (args.len() as u32).max(1) * PAIR_SIZE;
        self.body.push(Instr::I32Const(size as i32));
        self.body.push(Instr::Call(FuncRef::Resolved(self.module.alloc_index)));
        let ptr = self.alloc_local(ValType::I32);
        self.body.push(Instr::LocalSet(ptr));
        for (i, arg) in args.iter().enumerate() {
            let tmp_ty = self.scratch_i32();
            let tmp_val = self.scratch_f64();
            self.lower_expr(arg)?;
            self.body.push(Instr::LocalSet(tmp_ty));
            self.body.push(Instr::LocalSet(tmp_val));
            self.body.push(Instr::LocalGet(ptr));
            self.body.push(Instr::LocalGet(tmp_val));
            self.body.push(Instr::F64Store { offset: (i as u32) * PAIR_SIZE });
            self.body.push(Instr::LocalGet(ptr));
            self.body.push(Instr::LocalGet(tmp_ty));
            self.body.push(Instr::I32Store { offset: (i as u32) * PAIR_SIZE + 8 });
        }
        Ok(ptr)
    }

    fn lower_host_call(&mut self, host: HostImport, args: &[HExpr]) -> CompileResult<()> {
        match host {
            HostImport::Print => {
                let arg = args.first().ok_or_else(|| CompileError::TypeCompile {
                    message: "print() requires one argument".to_string(),
                    span: SourceSpan::unknown(),
                })?;
                self.numeric_operand(arg)?;
                self.body.push(Instr::Call(FuncRef::Resolved(host_import_index(host))));
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                Ok(())
            }
            HostImport::PrintChar => {
                let arg = args.first().ok_or_else(|| CompileError::TypeCompile {
                    message: "printChar() requires one argument".to_string(),
                    span: SourceSpan::unknown(),
                })?;
                self.numeric_operand(arg)?;
                self.body.push(Instr::I32TruncF64S);
                self.body.push(Instr::Call(FuncRef::Resolved(host_import_index(host))));
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::I32Const(TypeId::Undefined.tag()));
                Ok(())
            }
            HostImport::Time | HostImport::TimeOrigin => {
                self.body.push(Instr::Call(FuncRef::Resolved(host_import_index(host))));
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
        }
    }

    fn lower_builtin_method_call(
        &mut self,
        receiver: TypeId,
        name: &str,
        object: &HExpr,
        args: &[HExpr],
    ) -> CompileResult<()> {
        match (receiver, name) {
            (TypeId::Number, "floor") => {
                self.numeric_operand(object)?;
                self.body.push(Instr::I32TruncF64S);
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            (TypeId::Number, "abs") => {
                self.numeric_operand(object)?;
                let v = self.alloc_local(ValType::F64);
                let result = self.alloc_local(ValType::F64);
                self.body.push(Instr::LocalTee(v));
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::F64Lt);
                self.body.push(Instr::If(BlockType::Empty));
                self.body.push(Instr::F64Const(0.0));
                self.body.push(Instr::LocalGet(v));
                self.body.push(Instr::F64Sub);
                self.body.push(Instr::LocalSet(result));
                self.body.push(Instr::Else);
                self.body.push(Instr::LocalGet(v));
                self.body.push(Instr::LocalSet(result));
                self.body.push(Instr::End);
                self.body.push(Instr::LocalGet(result));
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            (TypeId::Number, "max") | (TypeId::Number, "min") => {
                self.numeric_operand(object)?;
                let a = self.alloc_local(ValType::F64);
                self.body.push(Instr::LocalSet(a));
                let arg = args.first().ok_or_else(|| CompileError::TypeCompile {
                    message: format!("Number.prototype.{name} requires one argument"),
                    span: SourceSpan::unknown(),
                })?;
                self.numeric_operand(arg)?;
                let b = self.alloc_local(ValType::F64);
                self.body.push(Instr::LocalSet(b));
                let result = self.alloc_local(ValType::F64);
                self.body.push(Instr::LocalGet(a));
                self.body.push(Instr::LocalGet(b));
                self.body.push(if name == "max" { Instr::F64Lt } else { Instr::F64Gt });
                self.body.push(Instr::If(BlockType::Empty));
                self.body.push(Instr::LocalGet(b));
                self.body.push(Instr::LocalSet(result));
                self.body.push(Instr::Else);
                self.body.push(Instr::LocalGet(a));
                self.body.push(Instr::LocalSet(result));
                self.body.push(Instr::End);
                self.body.push(Instr::LocalGet(result));
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            (TypeId::String, "length") | (TypeId::Array, "length") => {
                self.lower_expr(object)?;
                self.body.push(Instr::Drop);
                self.body.push(Instr::I32TruncF64S);
                self.body.push(Instr::I32Load { offset: 0 });
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            (TypeId::String, "charCodeAt") => {
                self.lower_expr(object)?;
                self.body.push(Instr::Drop);
                self.body.push(Instr::I32TruncF64S);
                let ptr = self.scratch_i32();
                self.body.push(Instr::LocalSet(ptr));
                let arg = args.first().ok_or_else(|| CompileError::TypeCompile {
                    message: "String.prototype.charCodeAt requires one argument".to_string(),
                    span: SourceSpan::unknown(),
                })?;
                self.numeric_operand(arg)?;
                self.body.push(Instr::I32TruncF64S);
                self.body.push(Instr::LocalGet(ptr));
                self.body.push(Instr::I32Const(4));
                self.body.push(Instr::I32Add);
                self.body.push(Instr::I32Add);
                self.body.push(Instr::I32Load8U { offset: 0 });
                self.body.push(Instr::F64ConvertI32S);
                self.body.push(Instr::I32Const(TypeId::Number.tag()));
                Ok(())
            }
            (TypeId::Array, "push") => {
                self.lower_expr(object)?;
                self.body.push(Instr::Drop);
                self.body.push(Instr::I32TruncF64S);
                let arg = args.first().ok_or_else(|| CompileError::TypeCompile {
                    message: "Array.prototype.push requires one argument".to_string(),
                    span: SourceSpan::unknown(),
                })?;
                self.numeric_operand_with_tag(arg)?;
                self.body.push(Instr::Call(FuncRef::Resolved(self.module.array_push_index)));
                Ok(())
            }
            _ => Err(CompileError::Unsupported {
                what: format!("{receiver:?}.prototype.{name}"),
                span: SourceSpan::unknown(),
            }),
        }
    }

    /// Like [`Self::numeric_operand`] but keeps the type tag on the
    /// stack, for call sites (like `#array_push`) whose signature wants
    /// the full pair.
    fn numeric_operand_with_tag(&mut self, e: &HExpr) -> CompileResult<()> {
        self.lower_expr(e)
    }

    fn lower_member_read(&mut self, object: &HExpr, property: &MemberKey, computed: bool) -> CompileResult<()> {
        if !computed {
            if let MemberKey::Name(key) = property {
                if let Some(StaticType::Object(shape)) = infer_static_type(object, &self.var_types) {
                    if let Some(index) = shape.iter().position(|k| k == key) {
                        self.lower_expr(object)?;
                        self.body.push(Instr::Drop);
                        self.body.push(Instr::I32TruncF64S);
                        let ptr = self.scratch_i32();
                        self.body.push(Instr::LocalSet(ptr));
                        self.body.push(Instr::LocalGet(ptr));
                        self.body.push(Instr::F64Load { offset: (index as u32) * PAIR_SIZE });
                        self.body.push(Instr::LocalGet(ptr));
                        self.body.push(Instr::I32Load { offset: (index as u32) * PAIR_SIZE + 8 });
                        return Ok(());
                    }
                    return Err(CompileError::TypeCompile {
                        message: format!("object has no property '{key}'"),
                        span: SourceSpan::unknown(),
                    });
                }
                if let Some(st) = infer_static_type(object, &self.var_types) {
                    let receiver_type = match st {
                        StaticType::Number => Some(TypeId::Number),
                        StaticType::Str => Some(TypeId::String),
                        StaticType::Array => Some(TypeId::Array),
                        _ => None,
                    };
                    if let Some(rt) = receiver_type {
                        if builtins::lookup(rt, key).is_some() {
                            return self.lower_builtin_method_call(rt, key, object, &[]);
                        }
                    }
                }
            }
        }
        let index_expr = match property {
            MemberKey::Computed(e) => e.as_ref(),
            MemberKey::Name(_) => {
                return Err(CompileError::TypeCompile {
                    message: "member access requires a statically known receiver shape".to_string(),
                    span: SourceSpan::unknown(),
                })
            }
        };
        let _ = computed;
        self.lower_expr(object)?;
        self.body.push(Instr::Drop);
        self.body.push(Instr::I32TruncF64S);
        let ptr = self.scratch_i32();
        self.body.push(Instr::LocalSet(ptr));
        self.numeric_operand(index_expr)?;
        self.body.push(Instr::I32TruncF64S);
        self.body.push(Instr::I32Const(PAIR_SIZE as i32));
        self.body.push(Instr::I32Mul);
        self.body.push(Instr::I32Const(4));
        self.body.push(Instr::I32Add);
        let offset = self.scratch_i32();
        self.body.push(Instr::LocalSet(offset));
        self.body.push(Instr::LocalGet(ptr));
        self.body.push(Instr::LocalGet(offset));
        self.body.push(Instr::I32Add);
        let addr = self.alloc_local(ValType::I32);
        self.body.push(Instr::LocalTee(addr));
        self.body.push(Instr::F64Load { offset: 0 });
        self.body.push(Instr::LocalGet(addr));
        self.body.push(Instr::I32Load { offset: 8 });
        Ok(())
    }
}

fn host_import_index(host: HostImport) -> u32 {
    match host {
        HostImport::Print => 0,
        HostImport::PrintChar => 1,
        HostImport::Time => 2,
        HostImport::TimeOrigin => 3,
    }
}
