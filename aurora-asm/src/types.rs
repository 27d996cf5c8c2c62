//! Register file constants and primitive aliases.

/// Native machine word.
pub type Word = u64;

/// Virtual register identifier, `r0..r7` or `xmm0..xmm7` depending on the
/// bank implied by the opcode.
pub type RegisterId = u8;

/// 32-bit immediate operand of an instruction slot.
pub type Immediate32 = u32;

/// Index into a manifest's flat label table.
pub type LabelId = u32;

/// Number of virtual general-purpose registers.
pub const GP_REGISTER_COUNT: usize = 8;

/// Number of virtual float registers.
pub const XMM_REGISTER_COUNT: usize = 8;

/// Reserved for return values and service arguments; never allocated to a
/// variable.
pub const REG_RET: RegisterId = 0;

/// First general-purpose register available to variables and call
/// arguments.
pub const REG_VAR_FIRST: RegisterId = 1;

/// Last general-purpose register available to variables and call
/// arguments.
pub const REG_VAR_LAST: RegisterId = 5;

/// First general-purpose expression temporary.
pub const REG_TMP0: RegisterId = 6;

/// Second general-purpose expression temporary.
pub const REG_TMP1: RegisterId = 7;

/// First float register available to variables and call arguments.
pub const XMM_VAR_FIRST: RegisterId = 0;

/// Last float register available to variables and call arguments.
pub const XMM_VAR_LAST: RegisterId = 5;

/// First float expression temporary.
pub const XMM_TMP0: RegisterId = 6;

/// Second float expression temporary.
pub const XMM_TMP1: RegisterId = 7;
