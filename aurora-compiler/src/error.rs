//! Frontend error types.

use thiserror::Error;

/// Any error raised between source text and manifest.
///
/// Every variant is fatal; passes unwind immediately and the driver
/// reports the message with its source position to stderr.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The scanner hit an unterminated string, an unknown character, or
    /// an unparseable numeric literal.
    #[error("lexical error at {line}:{column}: {message}")]
    Lexical {
        /// Description of the problem.
        message: String,
        /// 1-based source line.
        line: usize,
        /// 1-based source column.
        column: usize,
    },
    /// The parser met an unexpected token.
    #[error("parse error at {line}:{column}: expected {expected}, got {got}")]
    Parse {
        /// What the grammar allowed here.
        expected: String,
        /// The offending token's lexeme.
        got: String,
        /// 1-based source line.
        line: usize,
        /// 1-based source column.
        column: usize,
    },
    /// A scope or type rule is violated.
    #[error("type error at {line}:{column}: {message}")]
    Type {
        /// Description of the problem.
        message: String,
        /// 1-based source line.
        line: usize,
        /// 1-based source column.
        column: usize,
    },
    /// The IR cannot be lowered to MISA.
    #[error("codegen error: {0}")]
    Codegen(String),
    /// The register allocator ran out of evictable registers.
    #[error("register allocation error: {0}")]
    Allocation(String),
}

impl CompileError {
    pub(crate) fn type_at(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self::Type {
            message: message.into(),
            line,
            column,
        }
    }
}

impl From<aurora_asm::ManifestError> for CompileError {
    fn from(err: aurora_asm::ManifestError) -> Self {
        Self::Codegen(err.to_string())
    }
}
