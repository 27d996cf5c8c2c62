//! Atomic types of the Aurora MISA.
//!
//! MISA (minimal instruction-set architecture) is the 16-byte-per-slot
//! intermediate format produced by the Aurora code generator and consumed
//! by the native backend. This crate defines the opcode catalog, the slot
//! encoding, the virtual register file, service codes, and the textual
//! manifest that serializes a compiled module.

#![warn(missing_docs)]

mod cond;
mod instruction;
mod manifest;
mod opcode;
mod service;
mod types;

#[cfg(test)]
mod encoding_tests;

pub use cond::Cond;
pub use opcode::consts;
pub use instruction::{op, Instruction};
pub use manifest::{Directive, Manifest, ManifestError, SharedType};
pub use opcode::{InvalidOpcode, Opcode};
pub use service::ServiceCode;
pub use types::{
    Immediate32, LabelId, RegisterId, Word, GP_REGISTER_COUNT, REG_RET, REG_TMP0, REG_TMP1,
    REG_VAR_FIRST, REG_VAR_LAST, XMM_REGISTER_COUNT, XMM_TMP0, XMM_TMP1, XMM_VAR_FIRST,
    XMM_VAR_LAST,
};
