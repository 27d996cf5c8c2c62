use core::fmt;

use consts::*;

pub mod consts;

/// Raised when a byte can't be mapped to any known [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid opcode byte 0x{0:02x}")]
pub struct InvalidOpcode(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[allow(non_camel_case_types)]
/// Opcode catalog of the Aurora MISA.
///
/// The set is closed: every slot produced by the code generator carries one
/// of these bytes, and the native backend dispatches on them by match.
/// Integer opcodes operate on the general-purpose bank `r0..r7`; opcodes in
/// the `0x20` block operate on the float bank `xmm0..xmm7`.
pub enum Opcode {
    /// Does nothing; consumes a slot.
    NOP = OP_NOP,
    /// Copies a register or loads an immediate (`b = 0xFF`).
    MOV = OP_MOV,
    /// Loads the 8-byte value at a data label into a register.
    LD = OP_LD,
    /// Stores a register into the 8-byte cell at a data label.
    ST = OP_ST,
    /// Integer addition.
    ADD = OP_ADD,
    /// Integer subtraction.
    SUB = OP_SUB,
    /// Integer compare; the following `CJMP` consumes the result.
    CMP = OP_CMP,
    /// Unconditional jump to a label.
    JMP = OP_JMP,
    /// Conditional jump; `a` holds a [`crate::Cond`] code.
    CJMP = OP_CJMP,
    /// Calls the function at a label; result arrives in `r0`.
    CALL = OP_CALL,
    /// Returns from the current function.
    RET = OP_RET,
    /// Invokes a runtime service; `imm` holds a [`crate::ServiceCode`].
    SVC = OP_SVC,
    /// Terminates the program with the exit code in `r0`.
    HALT = OP_HALT,
    /// Integer multiplication.
    MUL = OP_MUL,
    /// Integer division (quotient).
    DIV = OP_DIV,
    /// Integer division (remainder).
    REM = OP_REM,
    /// Bitwise and.
    AND = OP_AND,
    /// Bitwise or.
    OR = OP_OR,
    /// Bitwise xor.
    XOR = OP_XOR,
    /// Bitwise complement of `a` in place.
    NOT = OP_NOT,
    /// Shift left.
    SHL = OP_SHL,
    /// Arithmetic shift right.
    SHR = OP_SHR,
    /// Spills register `a` to stack slot `imm`; `c = 1` selects the float
    /// bank.
    STORE_STACK = OP_STORE_STACK,
    /// Reloads register `a` from stack slot `imm`; `c = 1` selects the
    /// float bank.
    LOAD_STACK = OP_LOAD_STACK,
    /// Reserves `a | b << 8` contiguous stack slots starting at slot `imm`.
    ARRAY_ALLOC = OP_ARRAY_ALLOC,
    /// Stores register `b` at index register `a` off base slot `imm`.
    ARRAY_STORE = OP_ARRAY_STORE,
    /// Loads into register `a` from index register `b` off base slot `imm`.
    ARRAY_LOAD = OP_ARRAY_LOAD,
    /// Copies a float register or loads a payload immediate (`b = 0xFF`).
    FMOV = OP_FMOV,
    /// Float addition.
    FADD = OP_FADD,
    /// Float subtraction.
    FSUB = OP_FSUB,
    /// Float multiplication.
    FMUL = OP_FMUL,
    /// Float division.
    FDIV = OP_FDIV,
    /// Float compare; the following `CJMP` selects unsigned-style jumps.
    FCMP = OP_FCMP,
    /// Converts integer register `b` into float register `a`.
    CVTSI2SD = OP_CVTSI2SD,
    /// Converts float register `b` into integer register `a`, truncating.
    CVTSD2SI = OP_CVTSD2SI,
    /// Starts a thread at a function label; the handle arrives in `a`.
    SPAWN = OP_SPAWN,
    /// Blocks until the thread whose handle is in `a` terminates.
    JOIN = OP_JOIN,
    /// Atomically loads the shared cell at a data label into `a`.
    ATOMIC_LOAD = OP_ATOMIC_LOAD,
    /// Atomically stores `a` into the shared cell at a data label.
    ATOMIC_STORE = OP_ATOMIC_STORE,
    /// Atomically adds `a` into the shared cell at a data label.
    ATOMIC_ADD = OP_ATOMIC_ADD,
    /// Atomically adds float `a` into the shared cell via a CAS loop.
    ATOMIC_FADD = OP_ATOMIC_FADD,
}

impl Opcode {
    /// Whether the opcode's register operands name the float bank.
    pub const fn is_float(&self) -> bool {
        matches!(
            self,
            Self::FMOV
                | Self::FADD
                | Self::FSUB
                | Self::FMUL
                | Self::FDIV
                | Self::FCMP
                | Self::ATOMIC_FADD
        )
    }

    /// Whether the opcode references a label through the `0xFE` sentinel.
    pub const fn may_reference_label(&self) -> bool {
        matches!(
            self,
            Self::JMP
                | Self::CJMP
                | Self::CALL
                | Self::SPAWN
                | Self::LD
                | Self::ST
                | Self::MOV
                | Self::ATOMIC_LOAD
                | Self::ATOMIC_STORE
                | Self::ATOMIC_ADD
                | Self::ATOMIC_FADD
        )
    }

    /// Lower-case mnemonic, as printed in manifest comments.
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Self::NOP => "nop",
            Self::MOV => "mov",
            Self::LD => "ld",
            Self::ST => "st",
            Self::ADD => "add",
            Self::SUB => "sub",
            Self::CMP => "cmp",
            Self::JMP => "jmp",
            Self::CJMP => "cjmp",
            Self::CALL => "call",
            Self::RET => "ret",
            Self::SVC => "svc",
            Self::HALT => "halt",
            Self::MUL => "mul",
            Self::DIV => "div",
            Self::REM => "rem",
            Self::AND => "and",
            Self::OR => "or",
            Self::XOR => "xor",
            Self::NOT => "not",
            Self::SHL => "shl",
            Self::SHR => "shr",
            Self::STORE_STACK => "store_stack",
            Self::LOAD_STACK => "load_stack",
            Self::ARRAY_ALLOC => "array_alloc",
            Self::ARRAY_STORE => "array_store",
            Self::ARRAY_LOAD => "array_load",
            Self::FMOV => "fmov",
            Self::FADD => "fadd",
            Self::FSUB => "fsub",
            Self::FMUL => "fmul",
            Self::FDIV => "fdiv",
            Self::FCMP => "fcmp",
            Self::CVTSI2SD => "cvtsi2sd",
            Self::CVTSD2SI => "cvtsd2si",
            Self::SPAWN => "spawn",
            Self::JOIN => "join",
            Self::ATOMIC_LOAD => "atomic_load",
            Self::ATOMIC_STORE => "atomic_store",
            Self::ATOMIC_ADD => "atomic_add",
            Self::ATOMIC_FADD => "atomic_fadd",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            OP_NOP => Ok(Self::NOP),
            OP_MOV => Ok(Self::MOV),
            OP_LD => Ok(Self::LD),
            OP_ST => Ok(Self::ST),
            OP_ADD => Ok(Self::ADD),
            OP_SUB => Ok(Self::SUB),
            OP_CMP => Ok(Self::CMP),
            OP_JMP => Ok(Self::JMP),
            OP_CJMP => Ok(Self::CJMP),
            OP_CALL => Ok(Self::CALL),
            OP_RET => Ok(Self::RET),
            OP_SVC => Ok(Self::SVC),
            OP_HALT => Ok(Self::HALT),
            OP_MUL => Ok(Self::MUL),
            OP_DIV => Ok(Self::DIV),
            OP_REM => Ok(Self::REM),
            OP_AND => Ok(Self::AND),
            OP_OR => Ok(Self::OR),
            OP_XOR => Ok(Self::XOR),
            OP_NOT => Ok(Self::NOT),
            OP_SHL => Ok(Self::SHL),
            OP_SHR => Ok(Self::SHR),
            OP_STORE_STACK => Ok(Self::STORE_STACK),
            OP_LOAD_STACK => Ok(Self::LOAD_STACK),
            OP_ARRAY_ALLOC => Ok(Self::ARRAY_ALLOC),
            OP_ARRAY_STORE => Ok(Self::ARRAY_STORE),
            OP_ARRAY_LOAD => Ok(Self::ARRAY_LOAD),
            OP_FMOV => Ok(Self::FMOV),
            OP_FADD => Ok(Self::FADD),
            OP_FSUB => Ok(Self::FSUB),
            OP_FMUL => Ok(Self::FMUL),
            OP_FDIV => Ok(Self::FDIV),
            OP_FCMP => Ok(Self::FCMP),
            OP_CVTSI2SD => Ok(Self::CVTSI2SD),
            OP_CVTSD2SI => Ok(Self::CVTSD2SI),
            OP_SPAWN => Ok(Self::SPAWN),
            OP_JOIN => Ok(Self::JOIN),
            OP_ATOMIC_LOAD => Ok(Self::ATOMIC_LOAD),
            OP_ATOMIC_STORE => Ok(Self::ATOMIC_STORE),
            OP_ATOMIC_ADD => Ok(Self::ATOMIC_ADD),
            OP_ATOMIC_FADD => Ok(Self::ATOMIC_FADD),
            _ => Err(InvalidOpcode(byte)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
