//! Binary serialization of [`crate::ir::Module`].
//!
//! Three passes over the module precede section emission, in this order:
//!
//! 1. **Deferred resolution** — every [`FuncRef::Deferred`] is replaced by
//!    the [`FunctionRecord::index`] of the function it names. Nothing in
//!    `src/codegen/lower.rs` currently emits a `Deferred` reference
//!    (function indices are reserved for every discovered function before
//!    any body is lowered, so recursive calls are already `Resolved` by
//!    construction — see DESIGN.md), but the pass runs unconditionally
//!    because the IR type still models forward references and a future
//!    lazy-lowering generator could produce them.
//! 2. **Import tree-shaking** — scan every surviving function body for
//!    `Call`/`ReturnCall` targets below the import count; imports never
//!    referenced are dropped.
//! 3. **Renumbering** — imports and functions share one Wasm index space,
//!    so dropping an import shifts every later index down. A single
//!    `old -> new` map is built once and applied to every call site,
//!    export, and the start section.
//!
//! Section order follows the Wasm binary format exactly: magic+version,
//! type, import, function, table, memory, tag, global, export, start, element,
//! data-count, code, data, name. This crate never needs a table (no
//! function value ever crosses an indirect call — `ReturnCall`/`Call`
//! targets are always direct) or passive data segments (every segment is
//! placed at a fixed, codegen-computed offset), so the table, element,
//! and data-count sections are always empty and omitted entirely; a
//! conformant decoder treats a missing section the same as an empty one.

use std::collections::HashMap;

use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, ExportKind, ExportSection, Function, FunctionSection,
    GlobalSection, GlobalType, ImportSection, Instruction as W, MemArg, MemorySection, MemoryType,
    Module as WasmModule, NameMap, NameSection, TagKind, TagSection, TagType, TypeSection, ValType,
};

use crate::errors::{CompileError, CompileResult};
use crate::ir::{BlockType, FuncRef, Instr, Module};

type Sig = (Vec<ValType>, Vec<ValType>);

/// Assembles an optimized [`Module`] into a binary Wasm module.
pub fn assemble(module: &Module) -> CompileResult<Vec<u8>> {
    let mut module = module.clone();
    resolve_deferred(&mut module)?;
    let old_to_new = tree_shake_and_renumber(&mut module);
    remap_calls(&mut module, &old_to_new);

    let mut types = TypeRegistry::new();

    // Import signatures first so import-section type indices are stable
    // regardless of how many module-defined functions reference them.
    let import_types: Vec<u32> = module
        .imports
        .iter()
        .map(|imp| {
            types.intern((
                imp.params.iter().map(|t| (*t).into()).collect(),
                imp.results.iter().map(|t| (*t).into()).collect(),
            ))
        })
        .collect();

    let function_types: Vec<u32> = module
        .functions
        .iter()
        .map(|f| {
            types.intern((
                f.params.iter().map(|t| (*t).into()).collect(),
                // Every compiled function returns the (value, type-id)
                // pair — except the
                // allocator/array-push internal helpers, which return a
                // single i32 pointer; their actual result list is baked
                // into `FunctionRecord::params`/body at generation time,
                // so we derive results from whether the body's final
                // `end` leaves one or two values. Both shapes are fixed
                // per function at generation time; recover it here from
                // the function's own declared arity class.
                result_shape(f),
            ))
        })
        .collect();

    // A reusable 0-param, (f64, i32)-result signature for every block/
    // loop/if that needs to carry the value+type-id pair across its
    // `end`.
    let pair_type = types.intern((vec![], vec![ValType::F64, ValType::I32]));

    let tag_types: Vec<u32> = module
        .exceptions
        .iter()
        .map(|tag| types.intern((tag.params.iter().map(|t| (*t).into()).collect(), vec![])))
        .collect();

    let mut type_section = TypeSection::new();
    for (params, results) in types.ordered() {
        type_section.function(params.iter().copied(), results.iter().copied());
    }

    let mut import_section = ImportSection::new();
    for (imp, ty) in module.imports.iter().zip(&import_types) {
        import_section.import(&imp.module, &imp.name, wasm_encoder::EntityType::Function(*ty));
    }

    let mut function_section = FunctionSection::new();
    for ty in &function_types {
        function_section.function(*ty);
    }

    let mut memory_section = MemorySection::new();
    let pages = module.pages.unwrap_or(crate::ir::PageMap {
        initial_pages: 1,
        maximum_pages: None,
    });
    memory_section.memory(MemoryType {
        minimum: pages.initial_pages as u64,
        maximum: pages.maximum_pages.map(|p| p as u64),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });

    let mut tag_section = TagSection::new();
    for ty in &tag_types {
        tag_section.tag(TagType {
            kind: TagKind::Exception,
            func_type_idx: *ty,
        });
    }

    let mut global_section = GlobalSection::new();
    for g in &module.globals {
        let init = const_expr(&g.init)?;
        global_section.global(
            GlobalType {
                val_type: g.val_type.into(),
                mutable: g.mutable,
                shared: false,
            },
            &init,
        );
    }

    let mut export_section = ExportSection::new();
    let import_count = module.imports.len() as u32;
    for (i, f) in module.functions.iter().enumerate() {
        if let Some(name) = &f.exported_name {
            export_section.export(name, ExportKind::Func, import_count + i as u32);
        }
    }
    // Linear memory is always exported under the conventional name `$`.
    export_section.export("$", ExportKind::Memory, 0);

    let start_section = module
        .start_function
        .map(|function_index| wasm_encoder::StartSection { function_index });

    let mut code_section = CodeSection::new();
    let mut name_map = NameMap::new();
    for (i, f) in module.functions.iter().enumerate() {
        name_map.append(import_count + i as u32, &f.debug_name);
        code_section.function(&build_function(f, pair_type)?);
    }

    let mut data_section = DataSection::new();
    let mem_capacity = pages.initial_pages as u64 * crate::config::WASM_PAGE_SIZE as u64;
    for seg in &module.data {
        let end = seg.offset as u64 + seg.bytes.len() as u64;
        if end > mem_capacity {
            return Err(CompileError::Encoding {
                message: format!(
                    "data segment at offset {} (len {}) exceeds the module's {} configured pages",
                    seg.offset,
                    seg.bytes.len(),
                    pages.initial_pages
                ),
            });
        }
        data_section.active(0, &ConstExpr::i32_const(seg.offset as i32), seg.bytes.iter().copied());
    }

    let mut names = NameSection::new();
    names.module("scriptwasm");
    names.functions(&name_map);

    let mut out = WasmModule::new();
    out.section(&type_section);
    out.section(&import_section);
    out.section(&function_section);
    out.section(&memory_section);
    if !module.exceptions.is_empty() {
        out.section(&tag_section);
    }
    out.section(&global_section);
    out.section(&export_section);
    if let Some(start) = start_section {
        out.section(&start);
    }
    out.section(&code_section);
    out.section(&data_section);
    out.section(&names);

    Ok(out.finish())
}

/// `params`, `results` for a module-defined function's Wasm signature.
/// Every user-callable function (uniform `(i32,i32,i32) -> (f64,i32)`
/// calling convention) and the synthetic `#main` entry
/// (`() -> (f64,i32)`) return the value/type-id pair; the two small
/// internal allocator helpers return a single `i32` pointer and are
/// recognized by name, since they are the only functions this generator
/// ever produces with a different result shape.
fn result_shape(f: &crate::ir::FunctionRecord) -> Vec<ValType> {
    if f.debug_name == "#alloc" || f.debug_name == "#array_push" {
        vec![ValType::I32]
    } else {
        vec![ValType::F64, ValType::I32]
    }
}

struct TypeRegistry {
    order: Vec<Sig>,
    index: HashMap<Sig, u32>,
}

impl TypeRegistry {
    fn new() -> Self {
        TypeRegistry {
            order: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, sig: Sig) -> u32 {
        if let Some(i) = self.index.get(&sig) {
            return *i;
        }
        let i = self.order.len() as u32;
        self.index.insert(sig.clone(), i);
        self.order.push(sig);
        i
    }

    fn ordered(&self) -> impl Iterator<Item = &Sig> {
        self.order.iter()
    }
}

/// Pass 1: replace every [`FuncRef::Deferred`] with the index of the
/// function it names. Fails with [`CompileError::UnresolvedReference`]
/// if a name does not resolve to any declared
/// function.
fn resolve_deferred(module: &mut Module) -> CompileResult<()> {
    let by_name: HashMap<&str, u32> = module
        .functions
        .iter()
        .filter_map(|f| f.index.map(|i| (f.debug_name.as_str(), i)))
        .collect();

    for f in &mut module.functions {
        for instr in &mut f.body {
            let target = match instr {
                Instr::Call(r) | Instr::ReturnCall(r) => Some(r),
                _ => None,
            };
            if let Some(FuncRef::Deferred(name)) = target {
                match by_name.get(name.as_str()) {
                    Some(idx) => *target.unwrap() = FuncRef::Resolved(*idx),
                    None => {
                        return Err(CompileError::UnresolvedReference {
                            function: f.debug_name.clone(),
                            detail: name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Pass 2+3: drop unreferenced imports and return the `old index -> new
/// index` map every remaining reference (calls, exports, start) must be
/// rewritten through.
fn tree_shake_and_renumber(module: &mut Module) -> HashMap<u32, u32> {
    let import_count = module.imports.len() as u32;
    let mut reachable = vec![false; import_count as usize];
    for f in &module.functions {
        for instr in &f.body {
            if let Instr::Call(FuncRef::Resolved(idx)) | Instr::ReturnCall(FuncRef::Resolved(idx)) = instr {
                if *idx < import_count {
                    reachable[*idx as usize] = true;
                }
            }
        }
    }

    let mut old_to_new = HashMap::new();
    let mut kept_imports = Vec::new();
    for (old_idx, keep) in reachable.iter().enumerate() {
        if *keep {
            old_to_new.insert(old_idx as u32, kept_imports.len() as u32);
            kept_imports.push(module.imports[old_idx].clone());
        }
    }
    let new_import_count = kept_imports.len() as u32;
    module.imports = kept_imports;

    for (pos, f) in module.functions.iter_mut().enumerate() {
        let old_idx = import_count + pos as u32;
        old_to_new.insert(old_idx, new_import_count + pos as u32);
        f.index = Some(new_import_count + pos as u32);
    }

    old_to_new
}

fn remap_calls(module: &mut Module, old_to_new: &HashMap<u32, u32>) {
    for f in &mut module.functions {
        for instr in &mut f.body {
            match instr {
                Instr::Call(FuncRef::Resolved(idx)) | Instr::ReturnCall(FuncRef::Resolved(idx)) => {
                    if let Some(new) = old_to_new.get(idx) {
                        *idx = *new;
                    }
                }
                _ => {}
            }
        }
    }
    if let Some(start) = &mut module.start_function {
        if let Some(new) = old_to_new.get(start) {
            *start = *new;
        }
    }
}

fn const_expr(instr: &Instr) -> CompileResult<ConstExpr> {
    match instr {
        Instr::I32Const(v) => Ok(ConstExpr::i32_const(*v)),
        Instr::F64Const(v) => Ok(ConstExpr::f64_const(*v)),
        other => Err(CompileError::Encoding {
            message: format!("unsupported global initializer instruction: {other:?}"),
        }),
    }
}

/// Run-length encodes `locals` by value type and lowers every instruction in `f.body` into a
/// `wasm_encoder::Function`. `pair_type` is the interned `() -> (f64,i32)`
/// type index, needed whenever a `Block`/`If`/`Try` carries the full
/// value/type-id pair across its `end`.
fn build_function(f: &crate::ir::FunctionRecord, pair_type: u32) -> CompileResult<Function> {
    let mut groups: Vec<(u32, ValType)> = Vec::new();
    for local in &f.locals {
        let vt: ValType = (*local).into();
        match groups.last_mut() {
            Some((count, ty)) if *ty == vt => *count += 1,
            _ => groups.push((1, vt)),
        }
    }

    let mut func = Function::new(groups);
    for instr in &f.body {
        func.instruction(&lower_instr(instr, pair_type)?);
    }
    Ok(func)
}

fn block_type(bt: BlockType, pair_type: u32) -> wasm_encoder::BlockType {
    match bt {
        BlockType::Empty => wasm_encoder::BlockType::Empty,
        BlockType::I32 => wasm_encoder::BlockType::Result(ValType::I32),
        BlockType::Pair => wasm_encoder::BlockType::FunctionType(pair_type),
    }
}

fn resolved_index(r: &FuncRef, caller: &str) -> CompileResult<u32> {
    match r {
        FuncRef::Resolved(idx) => Ok(*idx),
        FuncRef::Deferred(name) => Err(CompileError::UnresolvedReference {
            function: caller.to_string(),
            detail: name.clone(),
        }),
    }
}

fn lower_instr(instr: &Instr, pair_type: u32) -> CompileResult<W<'static>> {
    Ok(match instr {
        Instr::F64Const(v) => W::F64Const((*v).into()),
        Instr::I32Const(v) => W::I32Const(*v),
        Instr::LocalGet(i) => W::LocalGet(*i),
        Instr::LocalSet(i) => W::LocalSet(*i),
        Instr::LocalTee(i) => W::LocalTee(*i),
        Instr::GlobalGet(i) => W::GlobalGet(*i),
        Instr::GlobalSet(i) => W::GlobalSet(*i),

        Instr::F64Add => W::F64Add,
        Instr::F64Sub => W::F64Sub,
        Instr::F64Mul => W::F64Mul,
        Instr::F64Div => W::F64Div,
        Instr::F64Neg => W::F64Neg,
        Instr::F64Eq => W::F64Eq,
        Instr::F64Ne => W::F64Ne,
        Instr::F64Lt => W::F64Lt,
        Instr::F64Gt => W::F64Gt,
        Instr::F64Le => W::F64Le,
        Instr::F64Ge => W::F64Ge,

        Instr::I32Add => W::I32Add,
        Instr::I32Sub => W::I32Sub,
        Instr::I32Mul => W::I32Mul,
        Instr::I32DivS => W::I32DivS,
        Instr::I32RemS => W::I32RemS,
        Instr::I32Eqz => W::I32Eqz,
        Instr::I32Eq => W::I32Eq,
        Instr::I32Ne => W::I32Ne,
        Instr::I32LtS => W::I32LtS,
        Instr::I32GtS => W::I32GtS,
        Instr::I32LeS => W::I32LeS,
        Instr::I32GeS => W::I32GeS,
        Instr::I32And => W::I32And,
        Instr::I32Or => W::I32Or,
        Instr::I32Xor => W::I32Xor,

        Instr::F64ConvertI32S => W::F64ConvertI32S,
        Instr::I32TruncF64S => W::I32TruncF64S,

        Instr::Block(bt) => W::Block(block_type(*bt, pair_type)),
        Instr::Loop(bt) => W::Loop(block_type(*bt, pair_type)),
        Instr::If(bt) => W::If(block_type(*bt, pair_type)),
        Instr::Else => W::Else,
        Instr::End => W::End,
        Instr::Br(l) => W::Br(*l),
        Instr::BrIf(l) => W::BrIf(*l),
        Instr::Return => W::Return,
        Instr::Unreachable => W::Unreachable,
        Instr::Drop => W::Drop,
        Instr::Select => W::Select,

        Instr::Call(r) => W::Call(resolved_index(r, "<call>")?),
        Instr::CallIndirect { type_index, table_index } => W::CallIndirect {
            ty: *type_index,
            table: *table_index,
        },
        Instr::ReturnCall(r) => W::ReturnCall(resolved_index(r, "<return_call>")?),

        Instr::I32Load { offset } => W::I32Load(mem_arg(*offset, 2)),
        Instr::I32Store { offset } => W::I32Store(mem_arg(*offset, 2)),
        Instr::I32Load8U { offset } => W::I32Load8U(mem_arg(*offset, 0)),
        Instr::I32Store8 { offset } => W::I32Store8(mem_arg(*offset, 0)),
        Instr::F64Load { offset } => W::F64Load(mem_arg(*offset, 3)),
        Instr::F64Store { offset } => W::F64Store(mem_arg(*offset, 3)),
        Instr::MemorySize => W::MemorySize(0),
        Instr::MemoryGrow => W::MemoryGrow(0),

        Instr::Throw(tag) => W::Throw(*tag),
        Instr::Rethrow(depth) => W::Rethrow(*depth),
        Instr::Try(bt) => W::Try(block_type(*bt, pair_type)),
        Instr::Catch(tag) => W::Catch(*tag),
        Instr::CatchAll => W::CatchAll,

        Instr::Nop => W::Nop,
    })
}

fn mem_arg(offset: u32, align: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align,
        memory_index: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BlockType as IrBlockType, DataSegment, ExceptionTag, FunctionRecord, GlobalRecord,
        ImportRecord, LoweringState, PageMap, ValType as IrValType,
    };

    fn simple_module() -> Module {
        let mut m = Module::new();
        m.imports.push(ImportRecord {
            module: "env".into(),
            name: "print".into(),
            params: vec![IrValType::F64, IrValType::I32],
            results: vec![],
        });
        m.imports.push(ImportRecord {
            module: "env".into(),
            name: "time".into(),
            params: vec![],
            results: vec![IrValType::F64],
        });
        m.functions.push(FunctionRecord {
            debug_name: "#main".into(),
            params: vec![],
            locals: vec![],
            body: vec![
                Instr::F64Const(3.0),
                Instr::I32Const(0),
                Instr::Call(FuncRef::Resolved(0)),
                Instr::F64Const(3.0),
                Instr::I32Const(0),
                Instr::Return,
                Instr::End,
            ],
            exported_name: Some("m".into()),
            state: LoweringState::Lowered,
            index: Some(2),
        });
        m.globals.push(GlobalRecord {
            val_type: IrValType::I32,
            mutable: true,
            init: Instr::I32Const(0),
        });
        m.pages = Some(PageMap { initial_pages: 1, maximum_pages: None });
        m
    }

    #[test]
    fn drops_unreferenced_import_and_renumbers() {
        let wasm = assemble(&simple_module()).expect("assembles");
        assert_eq!(&wasm[0..4], b"\0asm");
        let mut validator = wasmparser::Validator::new();
        validator.validate_all(&wasm).expect("valid wasm module");
    }

    #[test]
    fn resolves_deferred_call_to_declared_function() {
        let mut m = Module::new();
        m.functions.push(FunctionRecord {
            debug_name: "helper".into(),
            params: vec![IrValType::I32, IrValType::I32, IrValType::I32],
            locals: vec![],
            body: vec![Instr::F64Const(1.0), Instr::I32Const(0), Instr::Return, Instr::End],
            exported_name: None,
            state: LoweringState::Lowered,
            index: Some(0),
        });
        m.functions.push(FunctionRecord {
            debug_name: "#main".into(),
            params: vec![],
            locals: vec![],
            body: vec![
                Instr::I32Const(0),
                Instr::I32Const(0),
                Instr::I32Const(0),
                Instr::Call(FuncRef::Deferred("helper".into())),
                Instr::Return,
                Instr::End,
            ],
            exported_name: Some("m".into()),
            state: LoweringState::Lowered,
            index: Some(1),
        });
        m.pages = Some(PageMap { initial_pages: 1, maximum_pages: None });
        let wasm = assemble(&m).expect("assembles");
        wasmparser::Validator::new().validate_all(&wasm).expect("valid");
    }

    #[test]
    fn unresolved_deferred_reference_is_an_error() {
        let mut m = Module::new();
        m.functions.push(FunctionRecord {
            debug_name: "#main".into(),
            params: vec![],
            locals: vec![],
            body: vec![Instr::Call(FuncRef::Deferred("missing".into())), Instr::End],
            exported_name: None,
            state: LoweringState::Lowered,
            index: Some(0),
        });
        let err = assemble(&m).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedReference { .. }));
    }

    #[test]
    fn exception_tag_round_trips() {
        let mut m = simple_module();
        m.exceptions.push(ExceptionTag {
            debug_name: "#exception".into(),
            params: vec![IrValType::F64, IrValType::I32],
        });
        m.functions[0].body = vec![
            Instr::Try(IrBlockType::Empty),
            Instr::F64Const(1.0),
            Instr::I32Const(0),
            Instr::Throw(0),
            Instr::Catch(0),
            Instr::Drop,
            Instr::Drop,
            Instr::End,
            Instr::F64Const(0.0),
            Instr::I32Const(4),
            Instr::Return,
            Instr::End,
        ];
        let wasm = assemble(&m).expect("assembles");
        wasmparser::Validator::new().validate_all(&wasm).expect("valid");
    }

    #[test]
    fn oversized_data_segment_is_an_encoding_error() {
        let mut m = simple_module();
        m.data.push(DataSegment { offset: 70_000, bytes: vec![1, 2, 3] });
        let err = assemble(&m).unwrap_err();
        assert!(matches!(err, CompileError::Encoding { .. }));
    }
}
