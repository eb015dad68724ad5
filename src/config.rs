//! Compiler configuration.
//!
//! A plain struct built once before compilation begins and treated as
//! read-only for the duration of a compile. Held as an explicit,
//! passed-in value rather than an ambient global, so a caller compiling
//! several programs with different options never has to worry about
//! stale state leaking between them.

use serde::Deserialize;

use crate::errors::{CompileError, CompileResult};

/// The primary scalar ("value type") of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    F64,
    I32,
}

impl ValueType {
    pub fn to_val_type(self) -> wasm_encoder::ValType {
        match self {
            ValueType::F64 => wasm_encoder::ValType::F64,
            ValueType::I32 => wasm_encoder::ValType::I32,
        }
    }
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::F64
    }
}

/// One Wasm page, spec GLOSSARY.
pub const WASM_PAGE_SIZE: u32 = 65536;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    pub value_type: ValueType,
    pub page_size_bytes: u32,
    pub closures_enabled: bool,
    pub opt_passes: u32,
    pub tail_call: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            value_type: ValueType::F64,
            page_size_bytes: WASM_PAGE_SIZE,
            closures_enabled: true,
            opt_passes: 2,
            tail_call: false,
        }
    }
}

impl CompilerOptions {
    /// Load options from a TOML configuration file's contents, falling
    /// back to [`CompilerOptions::default`] for any field left unset.
    pub fn from_toml_str(contents: &str) -> CompileResult<Self> {
        toml::from_str(contents).map_err(|e| CompileError::Internal {
            message: format!("invalid configuration: {e}"),
        })
    }
}
