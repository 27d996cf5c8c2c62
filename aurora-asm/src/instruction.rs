use core::fmt;

use crate::opcode::consts::*;
use crate::{Cond, Immediate32, InvalidOpcode, LabelId, Opcode, RegisterId, ServiceCode, Word};

/// A single 16-byte MISA slot.
///
/// The low eight bytes hold `[opcode][a][b][c][imm32]`; the high eight
/// bytes are padding, except for the wide-immediate forms of `MOV` and
/// `FMOV` where they carry a 64-bit payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    op: u8,
    a: u8,
    b: u8,
    c: u8,
    imm: Immediate32,
    payload: Word,
}

impl Instruction {
    /// Size of a slot in bytes.
    pub const LEN: usize = 16;

    /// Builds a slot from raw fields.
    pub const fn new(op: Opcode, a: u8, b: u8, c: u8, imm: Immediate32) -> Self {
        Self {
            op: op as u8,
            a,
            b,
            c,
            imm,
            payload: 0,
        }
    }

    const fn with_payload(mut self, payload: Word) -> Self {
        self.payload = payload;
        self
    }

    /// The slot's opcode.
    pub fn opcode(&self) -> Opcode {
        // `op` is only ever written from an `Opcode`.
        Opcode::try_from(self.op).expect("constructed from a valid opcode")
    }

    /// Raw opcode byte.
    pub const fn op(&self) -> u8 {
        self.op
    }

    /// First operand byte.
    pub const fn a(&self) -> u8 {
        self.a
    }

    /// Second operand byte.
    pub const fn b(&self) -> u8 {
        self.b
    }

    /// Third operand byte.
    pub const fn c(&self) -> u8 {
        self.c
    }

    /// 32-bit immediate field.
    pub const fn imm(&self) -> Immediate32 {
        self.imm
    }

    /// 64-bit payload half of the slot.
    pub const fn payload(&self) -> Word {
        self.payload
    }

    /// Whether the high slot half carries a payload rather than padding.
    pub const fn has_payload(&self) -> bool {
        (self.op == OP_FMOV && self.b == SENTINEL_IMM)
            || (self.op == OP_MOV && self.b == SENTINEL_IMM && self.c == WIDE_IMM)
    }

    /// Whether the `b` operand is the immediate sentinel.
    pub const fn is_immediate(&self) -> bool {
        self.b == SENTINEL_IMM
    }

    /// The referenced label, when the `b` operand is the label sentinel.
    pub fn label(&self) -> Option<LabelId> {
        if self.opcode().may_reference_label() && self.b == SENTINEL_LABEL {
            Some(self.imm)
        } else {
            None
        }
    }

    /// Rewrites the referenced label id. No-op for slots without one.
    pub fn set_label(&mut self, label: LabelId) {
        if self.label().is_some() {
            self.imm = label;
        }
    }

    /// The signed immediate, widened from `imm32` or read from the
    /// payload for wide `MOV`.
    pub const fn imm_i64(&self) -> i64 {
        if self.op == OP_MOV && self.b == SENTINEL_IMM && self.c == WIDE_IMM {
            self.payload as i64
        } else {
            self.imm as i32 as i64
        }
    }

    /// The float immediate of a `FMOV` payload slot.
    pub const fn imm_f64(&self) -> f64 {
        f64::from_bits(self.payload)
    }

    /// The low eight bytes as a little-endian word.
    pub fn low_word(&self) -> Word {
        let mut lo = [0u8; 8];
        lo[0] = self.op;
        lo[1] = self.a;
        lo[2] = self.b;
        lo[3] = self.c;
        lo[4..8].copy_from_slice(&self.imm.to_le_bytes());
        Word::from_le_bytes(lo)
    }

    /// Rebuilds a slot from its low word and payload half.
    pub fn from_words(lo: Word, payload: Word) -> Result<Self, InvalidOpcode> {
        let bytes = lo.to_le_bytes();
        Opcode::try_from(bytes[0])?;
        Ok(Self {
            op: bytes[0],
            a: bytes[1],
            b: bytes[2],
            c: bytes[3],
            imm: Immediate32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            payload,
        })
    }

    /// Serializes the full 16-byte slot.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..8].copy_from_slice(&self.low_word().to_le_bytes());
        buf[8..].copy_from_slice(&self.payload.to_le_bytes());
        buf
    }

    /// Deserializes a 16-byte slot.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Result<Self, InvalidOpcode> {
        let lo = Word::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        let hi = Word::from_le_bytes(bytes[8..].try_into().expect("8 bytes"));
        Self::from_words(lo, hi)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Opcode::*;

        let op = self.opcode();
        let m = op.mnemonic();
        match op {
            NOP | RET | HALT => f.write_str(m),
            MOV => {
                if self.b == SENTINEL_LABEL {
                    write!(f, "{m} r{}, @{}", self.a, self.imm)
                } else if self.b == SENTINEL_IMM {
                    write!(f, "{m} r{}, {}", self.a, self.imm_i64())
                } else {
                    write!(f, "{m} r{}, r{}", self.a, self.b)
                }
            }
            FMOV => {
                if self.b == SENTINEL_IMM {
                    write!(f, "{m} xmm{}, {}", self.a, self.imm_f64())
                } else {
                    write!(f, "{m} xmm{}, xmm{}", self.a, self.b)
                }
            }
            ADD | SUB | MUL | DIV | REM | AND | OR | XOR | SHL | SHR | CMP => {
                if self.b == SENTINEL_IMM {
                    write!(f, "{m} r{}, {}", self.a, self.imm as i32)
                } else {
                    write!(f, "{m} r{}, r{}", self.a, self.b)
                }
            }
            FADD | FSUB | FMUL | FDIV | FCMP => {
                write!(f, "{m} xmm{}, xmm{}", self.a, self.b)
            }
            NOT => write!(f, "{m} r{}", self.a),
            JMP | CALL => write!(f, "{m} @{}", self.imm),
            CJMP => {
                let cond = Cond::try_from(self.a)
                    .map(|c| c.mnemonic())
                    .unwrap_or("??");
                write!(f, "{m} {cond}, @{}", self.imm)
            }
            SVC => match ServiceCode::try_from(self.imm as u8) {
                Ok(code) => write!(f, "{m} {code}"),
                Err(_) => write!(f, "{m} 0x{:02x}", self.imm),
            },
            LD | ATOMIC_LOAD => write!(f, "{m} r{}, @{}", self.a, self.imm),
            ST | ATOMIC_STORE | ATOMIC_ADD => write!(f, "{m} @{}, r{}", self.imm, self.a),
            ATOMIC_FADD => write!(f, "{m} @{}, xmm{}", self.imm, self.a),
            CVTSI2SD => write!(f, "{m} xmm{}, r{}", self.a, self.b),
            CVTSD2SI => write!(f, "{m} r{}, xmm{}", self.a, self.b),
            SPAWN => write!(f, "{m} r{}, @{}", self.a, self.imm),
            JOIN => write!(f, "{m} r{}", self.a),
            STORE_STACK => {
                let bank = if self.c == FLOAT_BANK { "xmm" } else { "r" };
                write!(f, "{m} {}, {bank}{}", self.imm, self.a)
            }
            LOAD_STACK => {
                let bank = if self.c == FLOAT_BANK { "xmm" } else { "r" };
                write!(f, "{m} {bank}{}, {}", self.a, self.imm)
            }
            ARRAY_ALLOC => {
                let count = self.a as u16 | (self.b as u16) << 8;
                write!(f, "{m} {}, {count}", self.imm)
            }
            ARRAY_STORE => write!(f, "{m} {}, r{}, r{}", self.imm, self.a, self.b),
            ARRAY_LOAD => write!(f, "{m} r{}, {}, r{}", self.a, self.imm, self.b),
        }
    }
}

/// Slot constructors, one per instruction form.
#[allow(missing_docs)]
pub mod op {
    use super::*;

    pub fn nop() -> Instruction {
        Instruction::new(Opcode::NOP, 0, 0, 0, 0)
    }

    pub fn mov(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::MOV, dst, src, 0, 0)
    }

    /// `MOV` of a 32-bit signed immediate.
    pub fn movi(dst: RegisterId, value: i32) -> Instruction {
        Instruction::new(Opcode::MOV, dst, SENTINEL_IMM, 0, value as u32)
    }

    /// `MOV` of a full 64-bit immediate carried in the payload half.
    pub fn movi64(dst: RegisterId, value: i64) -> Instruction {
        Instruction::new(Opcode::MOV, dst, SENTINEL_IMM, WIDE_IMM, 0)
            .with_payload(value as Word)
    }

    /// `MOV` of a data label's address.
    pub fn mov_label(dst: RegisterId, label: LabelId) -> Instruction {
        Instruction::new(Opcode::MOV, dst, SENTINEL_LABEL, 0, label)
    }

    pub fn ld(dst: RegisterId, label: LabelId) -> Instruction {
        Instruction::new(Opcode::LD, dst, SENTINEL_LABEL, 0, label)
    }

    pub fn st(label: LabelId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::ST, src, SENTINEL_LABEL, 0, label)
    }

    macro_rules! alu {
        ($($name:ident, $imm_name:ident, $opcode:ident;)*) => {
            $(
                pub fn $name(dst: RegisterId, src: RegisterId) -> Instruction {
                    Instruction::new(Opcode::$opcode, dst, src, 0, 0)
                }

                pub fn $imm_name(dst: RegisterId, value: i32) -> Instruction {
                    Instruction::new(Opcode::$opcode, dst, SENTINEL_IMM, 0, value as u32)
                }
            )*
        };
    }

    alu! {
        add, addi, ADD;
        sub, subi, SUB;
        mul, muli, MUL;
        div, divi, DIV;
        rem, remi, REM;
        and, andi, AND;
        or, ori, OR;
        xor, xori, XOR;
        shl, shli, SHL;
        shr, shri, SHR;
        cmp, cmpi, CMP;
    }

    pub fn not(dst: RegisterId) -> Instruction {
        Instruction::new(Opcode::NOT, dst, 0, 0, 0)
    }

    pub fn jmp(label: LabelId) -> Instruction {
        Instruction::new(Opcode::JMP, 0, SENTINEL_LABEL, 0, label)
    }

    pub fn cjmp(cond: Cond, label: LabelId) -> Instruction {
        Instruction::new(Opcode::CJMP, cond as u8, SENTINEL_LABEL, 0, label)
    }

    pub fn call(label: LabelId) -> Instruction {
        Instruction::new(Opcode::CALL, 0, SENTINEL_LABEL, 0, label)
    }

    pub fn ret() -> Instruction {
        Instruction::new(Opcode::RET, 0, 0, 0, 0)
    }

    pub fn svc(code: ServiceCode) -> Instruction {
        Instruction::new(Opcode::SVC, 0, 0, 0, code as u32)
    }

    pub fn halt() -> Instruction {
        Instruction::new(Opcode::HALT, 0, 0, 0, 0)
    }

    pub fn fmov(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::FMOV, dst, src, 0, 0)
    }

    /// `FMOV` of a float immediate carried in the payload half.
    pub fn fmovi(dst: RegisterId, value: f64) -> Instruction {
        Instruction::new(Opcode::FMOV, dst, SENTINEL_IMM, 0, 0).with_payload(value.to_bits())
    }

    pub fn fadd(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::FADD, dst, src, 0, 0)
    }

    pub fn fsub(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::FSUB, dst, src, 0, 0)
    }

    pub fn fmul(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::FMUL, dst, src, 0, 0)
    }

    pub fn fdiv(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::FDIV, dst, src, 0, 0)
    }

    pub fn fcmp(lhs: RegisterId, rhs: RegisterId) -> Instruction {
        Instruction::new(Opcode::FCMP, lhs, rhs, 0, 0)
    }

    pub fn cvtsi2sd(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::CVTSI2SD, dst, src, 0, 0)
    }

    pub fn cvtsd2si(dst: RegisterId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::CVTSD2SI, dst, src, 0, 0)
    }

    pub fn spawn(dst: RegisterId, func: LabelId) -> Instruction {
        Instruction::new(Opcode::SPAWN, dst, SENTINEL_LABEL, 0, func)
    }

    pub fn join(handle: RegisterId) -> Instruction {
        Instruction::new(Opcode::JOIN, handle, 0, 0, 0)
    }

    pub fn atomic_load(dst: RegisterId, cell: LabelId) -> Instruction {
        Instruction::new(Opcode::ATOMIC_LOAD, dst, SENTINEL_LABEL, 0, cell)
    }

    pub fn atomic_store(cell: LabelId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::ATOMIC_STORE, src, SENTINEL_LABEL, 0, cell)
    }

    pub fn atomic_add(cell: LabelId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::ATOMIC_ADD, src, SENTINEL_LABEL, 0, cell)
    }

    pub fn atomic_fadd(cell: LabelId, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::ATOMIC_FADD, src, SENTINEL_LABEL, 0, cell)
    }

    pub fn store_stack(slot: u32, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::STORE_STACK, src, 0, 0, slot)
    }

    pub fn load_stack(dst: RegisterId, slot: u32) -> Instruction {
        Instruction::new(Opcode::LOAD_STACK, dst, 0, 0, slot)
    }

    pub fn store_stack_f(slot: u32, src: RegisterId) -> Instruction {
        Instruction::new(Opcode::STORE_STACK, src, 0, FLOAT_BANK, slot)
    }

    pub fn load_stack_f(dst: RegisterId, slot: u32) -> Instruction {
        Instruction::new(Opcode::LOAD_STACK, dst, 0, FLOAT_BANK, slot)
    }

    pub fn array_alloc(base_slot: u32, count: u16) -> Instruction {
        Instruction::new(
            Opcode::ARRAY_ALLOC,
            (count & 0xff) as u8,
            (count >> 8) as u8,
            0,
            base_slot,
        )
    }

    pub fn array_store(base_slot: u32, idx: RegisterId, val: RegisterId) -> Instruction {
        Instruction::new(Opcode::ARRAY_STORE, idx, val, 0, base_slot)
    }

    pub fn array_load(dst: RegisterId, base_slot: u32, idx: RegisterId) -> Instruction {
        Instruction::new(Opcode::ARRAY_LOAD, dst, idx, 0, base_slot)
    }
}
