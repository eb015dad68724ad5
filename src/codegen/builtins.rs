//! The built-in registry: host imports and the
//! small stdlib method surface this crate implements.
//!
//! Method dispatch is keyed by `(TypeId, method name)`; registration order
//! of built-ins within one compile is implementation-defined, fixed here to
//! declaration order in [`ALL_METHODS`]. This registry only records *which*
//! methods exist and their arity/result type for validation; the
//! instruction sequence for each is generated in `src/codegen/lower.rs`,
//! which has the call-site context (receiver and argument locals) the
//! registry alone does not.

use crate::ir::TypeId;

/// The four host imports this compiler's runtime surface names explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostImport {
    Print,
    PrintChar,
    Time,
    TimeOrigin,
}

impl HostImport {
    pub fn from_name(name: &str) -> Option<HostImport> {
        Some(match name {
            "print" => HostImport::Print,
            "printChar" => HostImport::PrintChar,
            "time" => HostImport::Time,
            "timeOrigin" => HostImport::TimeOrigin,
            _ => return None,
        })
    }

    pub fn module(self) -> &'static str {
        "env"
    }

    pub fn name(self) -> &'static str {
        match self {
            HostImport::Print => "print",
            HostImport::PrintChar => "printChar",
            HostImport::Time => "time",
            HostImport::TimeOrigin => "timeOrigin",
        }
    }

    pub fn params(self) -> Vec<crate::ir::ValType> {
        use crate::ir::ValType;
        match self {
            HostImport::Print => vec![ValType::F64],
            HostImport::PrintChar => vec![ValType::I32],
            HostImport::Time | HostImport::TimeOrigin => vec![],
        }
    }

    pub fn results(self) -> Vec<crate::ir::ValType> {
        use crate::ir::ValType;
        match self {
            HostImport::Print | HostImport::PrintChar => vec![],
            HostImport::Time | HostImport::TimeOrigin => vec![ValType::F64],
        }
    }
}

/// One supported prototype method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinMethod {
    pub receiver: TypeId,
    pub name: &'static str,
    pub arity: usize,
    pub result_type: TypeId,
}

pub const ALL_METHODS: &[BuiltinMethod] = &[
    BuiltinMethod { receiver: TypeId::Number, name: "floor", arity: 0, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::Number, name: "abs", arity: 0, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::Number, name: "max", arity: 1, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::Number, name: "min", arity: 1, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::String, name: "length", arity: 0, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::String, name: "charCodeAt", arity: 1, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::Array, name: "push", arity: 1, result_type: TypeId::Number },
    BuiltinMethod { receiver: TypeId::Array, name: "length", arity: 0, result_type: TypeId::Number },
];

pub fn lookup(receiver: TypeId, name: &str) -> Option<&'static BuiltinMethod> {
    ALL_METHODS.iter().find(|m| m.receiver == receiver && m.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_registered_on_number() {
        assert!(lookup(TypeId::Number, "floor").is_some());
        assert!(lookup(TypeId::Number, "charCodeAt").is_none());
    }

    #[test]
    fn host_imports_resolve_by_name() {
        assert_eq!(HostImport::from_name("print"), Some(HostImport::Print));
        assert_eq!(HostImport::from_name("nope"), None);
    }
}
