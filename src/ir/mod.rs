//! The Wasm intermediate representation shared by the generator,
//! optimizer, and assembler.

pub mod module;
pub mod types;

pub use module::{
    BlockType, DataSegment, ExceptionTag, FuncRef, FunctionRecord, GlobalRecord, ImportRecord,
    Instr, LoweringState, Module, PageMap, ValType,
};
pub use types::TypeId;
