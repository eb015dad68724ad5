//! The typed Wasm IR the code generator produces and the optimizer and
//! assembler consume.
//!
//! The instruction stream is a **flat** `Vec<Instr>` rather than a nested
//! tree: `Block`/`Loop`/`If`/`Else`/`End` are ordinary entries in the
//! vector, exactly mirroring the flat structure of the Wasm binary format
//! itself (and of `wasm_encoder::Function::instruction`, which this
//! crate's assembler calls directly — see `src/assemble/encode.rs`). A
//! flat stream is what makes the peephole optimizer's adjacent-pair
//! rewrites
//! a simple windowed scan rather than a tree rewrite.
//!
//! Forward references (direct and mutual recursion) are represented by
//! [`FuncRef::Deferred`], which the
//! generator emits when a callee's index is not yet known, and which the
//! assembler's deferred-resolution pass patches to
//! `FuncRef::Resolved` once every function has been assigned its final
//! index. Any `FuncRef::Deferred` surviving to encoding is a generator bug
//! and becomes `CompileError::UnresolvedReference`.

use rustc_hash::FxHashMap;

/// A possibly-unresolved function reference, keyed by the function's
/// `debug_name` until the assembler assigns real indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuncRef {
    Resolved(u32),
    Deferred(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    /// Result arity is always the 2-result `(value, type-id)` pair, or
    /// empty; no other block signatures are generated, save
    /// for the single-`i32` shape a truthiness check's `if`/`else`
    /// produces internally (never a source-visible value).
    Pair,
    I32,
}

/// One entry in a function's flat instruction stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    F64Const(f64),
    I32Const(i32),

    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Neg,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,

    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32RemS,
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I32LeS,
    I32GeS,
    I32And,
    I32Or,
    I32Xor,

    F64ConvertI32S,
    I32TruncF64S,

    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    Return,
    Unreachable,
    Drop,
    Select,

    Call(FuncRef),
    CallIndirect { type_index: u32, table_index: u32 },
    ReturnCall(FuncRef),

    I32Load { offset: u32 },
    I32Store { offset: u32 },
    I32Load8U { offset: u32 },
    I32Store8 { offset: u32 },
    F64Load { offset: u32 },
    F64Store { offset: u32 },
    MemorySize,
    MemoryGrow,

    Throw(u32),
    Rethrow(u32),
    /// Marks the start of a `try` region; `catches` names the tag indices
    /// handled before falling through to an unconditional `catch_all`,
    /// mirroring the legacy Wasm exception-handling proposal's `try`/
    /// `catch`/`catch_all`/`end` encoding that `wasm-encoder` exposes.
    Try(BlockType),
    Catch(u32),
    CatchAll,

    /// A bookkeeping no-op the optimizer is free to delete; used by the
    /// generator to keep source-level statement boundaries visible to
    /// debugging passes without affecting stack shape.
    Nop,
}

impl Instr {
    /// Net effect on the value-stack depth (push count − pop count),
    /// used by stack-effect-preservation tests.
    /// `None` for instructions whose effect depends on surrounding block
    /// structure (block/loop/if headers and their `end`/`else`), which
    /// the optimizer and verifier reason about structurally instead.
    pub fn stack_delta(&self) -> Option<i32> {
        use Instr::*;
        Some(match self {
            F64Const(_) | I32Const(_) | LocalGet(_) | GlobalGet(_) => 1,
            LocalSet(_) | GlobalSet(_) | Drop => -1,
            LocalTee(_) => 0,
            F64Add | F64Sub | F64Mul | F64Div | F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => -1,
            F64Neg => 0,
            I32Add | I32Sub | I32Mul | I32DivS | I32RemS | I32Eq | I32Ne | I32LtS | I32GtS
            | I32LeS | I32GeS | I32And | I32Or | I32Xor => -1,
            I32Eqz => 0,
            F64ConvertI32S | I32TruncF64S => 0,
            Select => -2,
            I32Load { .. } | F64Load { .. } | I32Load8U { .. } => 0,
            I32Store { .. } | F64Store { .. } | I32Store8 { .. } => -2,
            MemorySize => 1,
            MemoryGrow => 0,
            Nop => 0,
            Br(_) | BrIf(_) | Return | Unreachable | Call(_) | CallIndirect { .. }
            | ReturnCall(_) | Throw(_) | Rethrow(_) => return None,
            Block(_) | Loop(_) | If(_) | Else | End | Try(_) | Catch(_) | CatchAll => return None,
        })
    }
}

/// Progress of one function through lowering:
/// `Unseen -> Scheduled -> Lowering -> DeferredPatched -> Lowered`.
/// A function enters `DeferredPatched` only if its own body
/// contained at least one forward reference that had to be resolved after
/// the rest of its body was already lowered; otherwise it goes straight
/// from `Lowering` to `Lowered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweringState {
    Unseen,
    Scheduled,
    Lowering,
    DeferredPatched,
    Lowered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    F64,
    I32,
}

impl From<ValType> for wasm_encoder::ValType {
    fn from(v: ValType) -> Self {
        match v {
            ValType::F64 => wasm_encoder::ValType::F64,
            ValType::I32 => wasm_encoder::ValType::I32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub debug_name: String,
    /// Param count always matches the source function's arity; every
    /// param is a value/type-id pair, so the real Wasm param count is
    /// `2 * params.len()` plus one extra pair per capture cell pointer
    /// when closures are enabled (see `src/codegen/lower.rs`).
    pub params: Vec<ValType>,
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
    pub exported_name: Option<String>,
    pub state: LoweringState,
    /// Assigned once the generator finishes scheduling every function
    /// reachable from the module's entry points; `None` until then.
    pub index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GlobalRecord {
    pub val_type: ValType,
    pub mutable: bool,
    pub init: Instr,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Linear memory sizing, in 64KiB Wasm pages.
#[derive(Debug, Clone, Copy)]
pub struct PageMap {
    pub initial_pages: u32,
    pub maximum_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ExceptionTag {
    pub debug_name: String,
    /// Parameter types carried by an exception of this tag; this crate
    /// only ever generates one tag (for `throw`/`catch` of a boxed
    /// value/type-id pair), but the type models arbitrarily many so the
    /// assembler's tag-section logic isn't special-cased to exactly one.
    pub params: Vec<ValType>,
}

/// A host import the generator may reference.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub module: String,
    pub name: String,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

/// The complete, un-optimized-or-optimized Wasm module produced by the
/// generator and consumed by the optimizer and assembler. Functions are
/// keyed by `debug_name` for deferred-reference resolution and by a
/// parallel index vector once indices are assigned — an arena read by
/// index, avoiding back-pointers from call sites into function bodies.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub imports: Vec<ImportRecord>,
    pub functions: Vec<FunctionRecord>,
    pub globals: Vec<GlobalRecord>,
    pub data: Vec<DataSegment>,
    pub pages: Option<PageMap>,
    pub exceptions: Vec<ExceptionTag>,
    pub start_function: Option<u32>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    /// True Wasm function index for a function known only by name, once
    /// import tree-shaking and renumbering have run. Returns
    /// `None` if no such function exists or it has not been assigned an
    /// index yet.
    pub fn index_of(&self, debug_name: &str) -> Option<u32> {
        self.functions
            .iter()
            .find(|f| f.debug_name == debug_name)
            .and_then(|f| f.index)
    }

    pub fn index_map(&self) -> FxHashMap<String, u32> {
        self.functions
            .iter()
            .filter_map(|f| f.index.map(|i| (f.debug_name.clone(), i)))
            .collect()
    }
}
