//! Aurora frontend.
//!
//! Translates Aurora source text into a MISA [`Manifest`]: lexing,
//! recursive-descent parsing into a typed IR, a validation/type-check
//! pass, and code generation over an LRU-spilling virtual register
//! allocator.

#![allow(clippy::wrong_self_convention)]

pub mod codegen;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod regalloc;
pub mod token;
pub mod validate;

use aurora_asm::Manifest;

pub use error::CompileError;

/// Compiles a source file into its manifest.
pub fn compile(source: &str) -> Result<Manifest, CompileError> {
    let program = parser::parse(source)?;
    validate::check(&program)?;
    codegen::generate(&program)
}

/// Commonly used frontend types.
pub mod prelude {
    pub use crate::codegen::generate;
    pub use crate::error::CompileError;
    pub use crate::ir::{BinOp, Block, Expr, ExprKind, Program, Stmt, StmtKind, Type, UnOp};
    pub use crate::lexer::Lexer;
    pub use crate::parser::parse;
    pub use crate::regalloc::{FrameSlots, RegisterFile};
    pub use crate::validate::check;
    pub use crate::compile;
}
