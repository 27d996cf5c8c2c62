//! Aurora native backend.
//!
//! Re-parses the textual manifest, lowers MISA slots to x86-64 machine
//! code with the service runtime expanded inline, resolves labels and
//! relocations, and wraps the result in a PE64 or ELF64 image.

#![allow(clippy::wrong_self_convention)]

pub mod driver;
pub mod error;
pub mod image;
pub mod layout;
pub mod lower;
pub mod runtime;
pub mod x86;

pub use driver::{NativeCompiler, Target};
pub use error::BuildError;
