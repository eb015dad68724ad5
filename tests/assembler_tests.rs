//! Integration coverage for the assembler, driven through
//! hand-built [`scriptwasm::ir::Module`] values so tree-shaking, export
//! naming, and section ordering can be asserted on the decoded binary
//! independent of the code generator.

use scriptwasm::assemble::assemble;
use scriptwasm::errors::CompileError;
use scriptwasm::ir::{
    BlockType, DataSegment, ExceptionTag, FuncRef, FunctionRecord, GlobalRecord, ImportRecord,
    Instr, LoweringState, Module, PageMap, ValType,
};

fn main_only(body: Vec<Instr>) -> Module {
    let mut m = Module::new();
    m.functions.push(FunctionRecord {
        debug_name: "#main".into(),
        params: vec![],
        locals: vec![],
        body,
        exported_name: Some("m".into()),
        state: LoweringState::Lowered,
        index: Some(0),
    });
    m.pages = Some(PageMap { initial_pages: 1, maximum_pages: None });
    m
}

fn section_names(wasm: &[u8]) -> Vec<&'static str> {
    use wasmparser::Payload::*;
    wasmparser::Parser::new(0)
        .parse_all(wasm)
        .filter_map(|p| p.ok())
        .filter_map(|p| {
            Some(match p {
                TypeSection(_) => "type",
                ImportSection(_) => "import",
                FunctionSection(_) => "function",
                TableSection(_) => "table",
                MemorySection(_) => "memory",
                TagSection(_) => "tag",
                GlobalSection(_) => "global",
                ExportSection(_) => "export",
                StartSection { .. } => "start",
                ElementSection(_) => "element",
                DataCountSection { .. } => "data-count",
                CodeSectionStart { .. } => "code",
                DataSection(_) => "data",
                CustomSection(_) => "custom",
                _ => return None,
            })
        })
        .collect()
}

#[test]
fn sections_appear_in_the_order_spec_md_mandates() {
    let mut module = main_only(vec![
        Instr::F64Const(1.0),
        Instr::I32Const(0),
        Instr::Return,
    ]);
    module.globals.push(GlobalRecord { val_type: ValType::I32, mutable: true, init: Instr::I32Const(0) });
    module.data.push(DataSegment { offset: 0, bytes: vec![1, 2, 3] });
    let wasm = assemble(&module).expect("assembles");
    let names = section_names(&wasm);
    // table/element/data-count are never emitted (no indirect calls, no
    // passive segments) - everything else must appear in spec order.
    let expected_order = ["type", "function", "memory", "global", "export", "code", "data", "custom"];
    let mut cursor = 0;
    for expected in expected_order {
        let found = names[cursor..].iter().position(|n| *n == expected);
        assert!(found.is_some(), "missing section '{expected}' in {names:?}");
        cursor += found.unwrap();
    }
    assert!(!names.contains(&"table"));
    assert!(!names.contains(&"element"));
    assert!(!names.contains(&"data-count"));
}

#[test]
fn unreferenced_host_import_is_tree_shaken() {
    let mut module = main_only(vec![Instr::F64Const(1.0), Instr::I32Const(0), Instr::Return]);
    module.imports.insert(
        0,
        ImportRecord { module: "env".into(), name: "time".into(), params: vec![], results: vec![ValType::F64] },
    );
    // main's only function index shifts from 0 to 1 once the import is
    // inserted ahead of it; nothing in main's body calls the import.
    module.functions[0].index = Some(1);
    let wasm = assemble(&module).expect("assembles");
    assert!(!section_names(&wasm).contains(&"import"), "an unreferenced import must be dropped entirely");
}

#[test]
fn referenced_host_import_survives_tree_shaking() {
    let mut module = Module::new();
    module.imports.push(ImportRecord {
        module: "env".into(),
        name: "print".into(),
        params: vec![ValType::F64, ValType::I32],
        results: vec![],
    });
    module.functions.push(FunctionRecord {
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
        ],
        exported_name: Some("m".into()),
        state: LoweringState::Lowered,
        index: Some(1),
    });
    module.pages = Some(PageMap { initial_pages: 1, maximum_pages: None });
    let wasm = assemble(&module).expect("assembles");
    assert!(section_names(&wasm).contains(&"import"));
    wasmparser::Validator::new().validate_all(&wasm).expect("valid wasm module");
}

#[test]
fn exports_m_and_the_linear_memory_dollar() {
    let module = main_only(vec![Instr::F64Const(1.0), Instr::I32Const(0), Instr::Return]);
    let wasm = assemble(&module).expect("assembles");
    let mut names = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(&wasm) {
        if let wasmparser::Payload::ExportSection(reader) = payload.expect("valid payload") {
            for export in reader {
                names.push(export.expect("valid export").name.to_string());
            }
        }
    }
    assert!(names.contains(&"m".to_string()));
    assert!(names.contains(&"$".to_string()));
}

#[test]
fn top_level_function_export_survives_alongside_the_entry_point() {
    let mut module = Module::new();
    module.functions.push(FunctionRecord {
        debug_name: "square".into(),
        params: vec![ValType::I32, ValType::I32, ValType::I32],
        locals: vec![],
        body: vec![Instr::F64Const(0.0), Instr::I32Const(0), Instr::Return],
        exported_name: Some("square".into()),
        state: LoweringState::Lowered,
        index: Some(0),
    });
    module.functions.push(FunctionRecord {
        debug_name: "#main".into(),
        params: vec![],
        locals: vec![],
        body: vec![Instr::F64Const(0.0), Instr::I32Const(0), Instr::Return],
        exported_name: Some("m".into()),
        state: LoweringState::Lowered,
        index: Some(1),
    });
    module.pages = Some(PageMap { initial_pages: 1, maximum_pages: None });
    let wasm = assemble(&module).expect("assembles");
    let mut names = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(&wasm) {
        if let wasmparser::Payload::ExportSection(reader) = payload.expect("valid payload") {
            for export in reader {
                names.push(export.expect("valid export").name.to_string());
            }
        }
    }
    assert!(names.contains(&"square".to_string()));
    assert!(names.contains(&"m".to_string()));
}

#[test]
fn a_deferred_reference_with_no_matching_function_is_an_unresolved_reference_error() {
    let module = main_only(vec![
        Instr::I32Const(0),
        Instr::I32Const(0),
        Instr::I32Const(0),
        Instr::Call(FuncRef::Deferred("nonexistent".into())),
        Instr::Return,
    ]);
    let err = assemble(&module).unwrap_err();
    assert!(matches!(err, CompileError::UnresolvedReference { .. }));
}

#[test]
fn try_catch_with_pair_block_type_round_trips_through_validation() {
    let mut module = main_only(vec![
        Instr::Try(BlockType::Pair),
        Instr::F64Const(1.0),
        Instr::I32Const(0),
        Instr::Throw(0),
        Instr::Catch(0),
        Instr::End,
        Instr::Return,
    ]);
    module.exceptions.push(ExceptionTag { debug_name: "#exception".into(), params: vec![ValType::F64, ValType::I32] });
    let wasm = assemble(&module).expect("assembles");
    wasmparser::Validator::new().validate_all(&wasm).expect("valid wasm module");
}
