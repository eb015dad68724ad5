//! Unified error taxonomy for the compiler pipeline.
//!
//! Hand-rolled rather than built on `thiserror`/`anyhow`: every stage
//! returns a [`CompileResult`] and the pipeline aborts on the first error.

use std::fmt;

/// Source position attached to a diagnostic, when derivable from the AST
/// node that produced it. The parser is an external collaborator; this
/// crate only carries whatever position information arrives on
/// [`crate::ast::Identifier`] nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSpan {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

impl SourceSpan {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn at(line: u32, column: u32) -> Self {
        SourceSpan {
            file: None,
            line,
            column,
        }
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}:{}", self.line, self.column),
            None => write!(f, "<input>:{}:{}", self.line, self.column),
        }
    }
}

/// The error taxonomy. Every stage produces one of these;
/// none of them are caught and converted upstream into another kind.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// Surfaced by the upstream parser. Not produced by this crate itself
    /// (the parser is out of scope) but kept as a variant so a caller that
    /// owns both the parser and this pipeline can report both uniformly.
    Parse { message: String },

    /// Semantic analyzer: a `let`/`const` binding conflicts with a prior
    /// binding in the same scope.
    Redeclaration { name: String, span: SourceSpan },

    /// Code generator: syntax or semantic feature not implemented.
    Unsupported { what: String, span: SourceSpan },

    /// Code generator: a static type hint contradicts a required operand
    /// type and no runtime fallback exists.
    TypeCompile { message: String, span: SourceSpan },

    /// Assembler: a deferred instruction survived to assembly — a
    /// generator bug, not a user-facing error in the ordinary sense, but
    /// kept in the public taxonomy so callers can match on it uniformly.
    UnresolvedReference { function: String, detail: String },

    /// Assembler: an operand was out of its encodable range.
    Encoding { message: String },

    /// Internal invariant violation. Distinct from user-facing errors —
    /// never constructed from user input, only from `debug_assert`-style
    /// internal checks that should be unreachable by construction.
    Internal { message: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Parse { message } => write!(f, "parse error: {message}"),
            CompileError::Redeclaration { name, span } => {
                write!(f, "{span}: cannot redeclare '{name}' in this scope")
            }
            CompileError::Unsupported { what, span } => {
                write!(f, "{span}: unsupported construct: {what}")
            }
            CompileError::TypeCompile { message, span } => {
                write!(f, "{span}: type error: {message}")
            }
            CompileError::UnresolvedReference { function, detail } => {
                write!(
                    f,
                    "internal error: unresolved deferred reference in function '{function}': {detail}"
                )
            }
            CompileError::Encoding { message } => write!(f, "encoding error: {message}"),
            CompileError::Internal { message } => write!(f, "internal compiler error: {message}"),
        }
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

/// Construct an [`CompileError::Internal`]. Kept as a helper so invariant
/// checks read the same way throughout the crate.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {
        return Err($crate::errors::CompileError::Internal { message: format!($($arg)*) })
    };
}
