//! MISA to x86-64 instruction selection.
//!
//! The [`Emitter`] walks the decoded instruction stream, mapping
//! virtual registers onto the per-target physical file and expanding
//! division/shift shuffles, atomics, and service stubs. It tracks the
//! kind of the most recent compare so conditional jumps pick signed
//! (integer) or unsigned (float) forms.

use std::collections::HashSet;

use aurora_asm::{consts, Cond, Instruction, LabelId, Opcode, ServiceCode};

use crate::driver::Target;
use crate::error::BuildError;
use crate::layout::{LabelTable, Reloc, RelocKind, SectionId};
use crate::x86::{cc, Asm, Reg, Xmm};

/// Offset of spill slot zero inside a frame (above the shadow space,
/// API scratch, and callee register save area).
pub const SLOT_BASE: i32 = 0x50;

const WIN_GP_MAP: [Reg; 8] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Rbx,
];

const SYSV_GP_MAP: [Reg; 8] = [
    Reg::Rax,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
];

/// Code emission context for one image.
pub struct Emitter {
    /// Compilation target.
    pub target: Target,
    /// Output code buffer.
    pub asm: Asm,
    /// Deferred patches into the code buffer.
    pub relocs: Vec<Reloc>,
    /// Flat label table (manifest labels plus backend internals).
    pub labels: LabelTable,
    /// Labels of `shared` cells declared `float`.
    pub shared_float: HashSet<LabelId>,
    /// Whether the most recent compare was an `FCMP`.
    pub last_compare_float: bool,
    /// Frame size of the function being lowered (zero for `main`).
    pub frame: i64,
    /// Cached `GetStdHandle` cells (Windows only).
    pub stdout_cell: Option<LabelId>,
    /// Cached stdin handle cell (Windows only).
    pub stdin_cell: Option<LabelId>,
    /// Backend-internal read-only data, appended to `.rdata`.
    pub aux_rdata: Vec<(LabelId, Vec<u8>)>,
    pause_msgs: Option<(LabelId, u32, LabelId, u32)>,
}

impl Emitter {
    /// A fresh emitter over the given label table.
    pub fn new(target: Target, labels: LabelTable) -> Self {
        Self {
            target,
            asm: Asm::new(),
            relocs: Vec::new(),
            labels,
            shared_float: HashSet::new(),
            last_compare_float: false,
            frame: 0,
            stdout_cell: None,
            stdin_cell: None,
            aux_rdata: Vec::new(),
            pause_msgs: None,
        }
    }

    /// Maps a virtual general-purpose register to its physical home.
    pub fn map(&self, r: u8) -> Result<Reg, BuildError> {
        let table = match self.target {
            Target::Windows => &WIN_GP_MAP,
            Target::Linux => &SYSV_GP_MAP,
        };
        table
            .get(r as usize)
            .copied()
            .ok_or_else(|| BuildError::encoding(format!("virtual register r{r} out of range")))
    }

    fn xmm(r: u8) -> Result<Xmm, BuildError> {
        if r < 8 {
            Ok(Xmm(r))
        } else {
            Err(BuildError::encoding(format!(
                "virtual register xmm{r} out of range"
            )))
        }
    }

    /// Per-target scratch pair, never overlapping the virtual file.
    pub fn scratch(&self) -> (Reg, Reg) {
        match self.target {
            Target::Windows => (Reg::Rsi, Reg::Rdi),
            Target::Linux => (Reg::Rbx, Reg::R11),
        }
    }

    /// Scratch SSE registers outside the virtual file.
    pub const XMM_SCRATCH: (Xmm, Xmm) = (Xmm(8), Xmm(9));

    fn slot_disp(slot: u32) -> i32 {
        SLOT_BASE + 8 * slot as i32
    }

    /// Records a rel32 patch at `at` against a label.
    pub fn rel32(&mut self, at: usize, label: LabelId) {
        self.relocs.push(Reloc {
            at: at as u64,
            kind: RelocKind::Rel32(label),
        });
    }

    /// Records a rel32 patch at `at` against a data label.
    pub fn rel32_data(&mut self, at: usize, label: LabelId) {
        self.relocs.push(Reloc {
            at: at as u64,
            kind: RelocKind::Rel32Data(label),
        });
    }

    /// Records an IAT-relative patch at `at`.
    pub fn rel32_iat(&mut self, at: usize, symbol: crate::layout::ImportSymbol) {
        self.relocs.push(Reloc {
            at: at as u64,
            kind: RelocKind::Rel32Iat(symbol),
        });
    }

    /// `call [rip + IAT slot]`.
    pub fn call_import(&mut self, symbol: crate::layout::ImportSymbol) {
        let at = self.asm.call_rip();
        self.rel32_iat(at, symbol);
    }

    /// Loads the address of a data label into a register.
    pub fn data_addr(&mut self, dst: Reg, label: LabelId) {
        match self.target {
            Target::Windows => {
                let at = self.asm.lea_rip(dst);
                self.rel32_data(at, label);
            }
            Target::Linux => {
                let at = self.asm.mov_ri64(dst, 0);
                self.relocs.push(Reloc {
                    at: at as u64,
                    kind: RelocKind::Abs64Data(label),
                });
            }
        }
    }

    /// Interned read-only messages for the pause service.
    pub fn pause_messages(&mut self) -> (LabelId, u32, LabelId, u32) {
        if let Some(msgs) = self.pause_msgs {
            return msgs;
        }
        let head: &[u8] = b"Exit code: ";
        let tail: &[u8] = b"Press Enter to continue...";
        let head_label = self.labels.add("__pause_head");
        let tail_label = self.labels.add("__pause_tail");
        self.aux_rdata.push((head_label, head.to_vec()));
        self.aux_rdata.push((tail_label, tail.to_vec()));
        let msgs = (head_label, head.len() as u32, tail_label, tail.len() as u32);
        self.pause_msgs = Some(msgs);
        msgs
    }

    fn label_of(&self, instr: &Instruction) -> Result<LabelId, BuildError> {
        instr
            .label()
            .ok_or_else(|| BuildError::encoding(format!("`{instr}` without a label operand")))
    }

    /// Lowers one MISA slot.
    pub fn lower(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        use Opcode::*;

        match instr.opcode() {
            NOP => {}
            MOV => self.lower_mov(instr)?,
            LD => self.lower_ld(instr)?,
            ST => self.lower_st(instr)?,
            ADD | SUB | AND | OR | XOR | CMP => self.lower_alu(instr)?,
            MUL => self.lower_mul(instr)?,
            DIV | REM => self.lower_div(instr)?,
            NOT => {
                let dst = self.map(instr.a())?;
                self.asm.not_r(dst);
            }
            SHL | SHR => self.lower_shift(instr)?,
            JMP => {
                let label = self.label_of(instr)?;
                let at = self.asm.jmp();
                self.rel32(at, label);
            }
            CJMP => self.lower_cjmp(instr)?,
            CALL => {
                let label = self.label_of(instr)?;
                let at = self.asm.call();
                self.rel32(at, label);
            }
            RET => self.emit_epilogue(),
            SVC => self.lower_svc(instr)?,
            HALT => self.emit_exit(),
            STORE_STACK | LOAD_STACK => self.lower_stack(instr)?,
            ARRAY_ALLOC => {}
            ARRAY_STORE => {
                let idx = self.map(instr.a())?;
                let val = self.map(instr.b())?;
                let disp = Self::slot_disp(instr.imm());
                self.asm.mov_mr_idx8(Reg::Rsp, idx, disp, val);
            }
            ARRAY_LOAD => {
                let dst = self.map(instr.a())?;
                let idx = self.map(instr.b())?;
                let disp = Self::slot_disp(instr.imm());
                self.asm.mov_rm_idx8(dst, Reg::Rsp, idx, disp);
            }
            FMOV => self.lower_fmov(instr)?,
            FADD | FSUB | FMUL | FDIV => {
                let dst = Self::xmm(instr.a())?;
                let src = Self::xmm(instr.b())?;
                match instr.opcode() {
                    FADD => self.asm.addsd(dst, src),
                    FSUB => self.asm.subsd(dst, src),
                    FMUL => self.asm.mulsd(dst, src),
                    _ => self.asm.divsd(dst, src),
                }
            }
            FCMP => {
                let lhs = Self::xmm(instr.a())?;
                let rhs = Self::xmm(instr.b())?;
                self.asm.ucomisd(lhs, rhs);
                self.last_compare_float = true;
            }
            CVTSI2SD => {
                let dst = Self::xmm(instr.a())?;
                let src = self.map(instr.b())?;
                self.asm.cvtsi2sd(dst, src);
            }
            CVTSD2SI => {
                let dst = self.map(instr.a())?;
                let src = Self::xmm(instr.b())?;
                self.asm.cvttsd2si(dst, src);
            }
            SPAWN => {
                let dst = self.map(instr.a())?;
                let func = self.label_of(instr)?;
                self.emit_spawn(dst, func);
            }
            JOIN => {
                let handle = self.map(instr.a())?;
                self.emit_join(handle);
            }
            ATOMIC_LOAD => self.lower_atomic_load(instr)?,
            ATOMIC_STORE => self.lower_atomic_store(instr)?,
            ATOMIC_ADD => {
                let src = self.map(instr.a())?;
                let cell = self.label_of(instr)?;
                let (s1, s2) = self.scratch();
                let at = self.asm.lea_rip(s1);
                self.rel32_data(at, cell);
                self.asm.mov_rr(s2, src);
                self.asm.lock_xadd_m(s1, s2);
            }
            ATOMIC_FADD => self.lower_atomic_fadd(instr)?,
        }
        Ok(())
    }

    fn lower_mov(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = self.map(instr.a())?;
        if let Some(label) = instr.label() {
            self.data_addr(dst, label);
        } else if instr.is_immediate() {
            let value = instr.imm_i64();
            match i32::try_from(value) {
                Ok(v) => self.asm.mov_ri32(dst, v),
                Err(_) => {
                    self.asm.mov_ri64(dst, value);
                }
            }
        } else {
            let src = self.map(instr.b())?;
            self.asm.mov_rr(dst, src);
        }
        Ok(())
    }

    fn lower_ld(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let cell = self.label_of(instr)?;
        if self.shared_float.contains(&cell) {
            let dst = Self::xmm(instr.a())?;
            let at = self.asm.movsd_x_rip(dst);
            self.rel32_data(at, cell);
        } else {
            let dst = self.map(instr.a())?;
            let at = self.asm.mov_rm_rip(dst);
            self.rel32_data(at, cell);
        }
        Ok(())
    }

    fn lower_st(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let cell = self.label_of(instr)?;
        if self.shared_float.contains(&cell) {
            let src = Self::xmm(instr.a())?;
            let at = self.asm.movsd_rip_x(src);
            self.rel32_data(at, cell);
        } else {
            let src = self.map(instr.a())?;
            let at = self.asm.mov_mr_rip(src);
            self.rel32_data(at, cell);
        }
        Ok(())
    }

    fn lower_alu(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = self.map(instr.a())?;
        let op = instr.opcode();
        if instr.is_immediate() {
            let v = i32::try_from(instr.imm_i64())
                .map_err(|_| BuildError::encoding(format!("immediate too wide in `{instr}`")))?;
            match op {
                Opcode::ADD => self.asm.add_ri(dst, v),
                Opcode::SUB => self.asm.sub_ri(dst, v),
                Opcode::AND => self.asm.and_ri(dst, v),
                Opcode::OR => self.asm.or_ri(dst, v),
                Opcode::XOR => self.asm.xor_ri(dst, v),
                _ => {
                    self.asm.cmp_ri(dst, v);
                    self.last_compare_float = false;
                }
            }
        } else {
            let src = self.map(instr.b())?;
            match op {
                Opcode::ADD => self.asm.add_rr(dst, src),
                Opcode::SUB => self.asm.sub_rr(dst, src),
                Opcode::AND => self.asm.and_rr(dst, src),
                Opcode::OR => self.asm.or_rr(dst, src),
                Opcode::XOR => self.asm.xor_rr(dst, src),
                _ => {
                    self.asm.cmp_rr(dst, src);
                    self.last_compare_float = false;
                }
            }
        }
        Ok(())
    }

    fn lower_mul(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = self.map(instr.a())?;
        if instr.is_immediate() {
            let v = i32::try_from(instr.imm_i64())
                .map_err(|_| BuildError::encoding(format!("immediate too wide in `{instr}`")))?;
            self.asm.imul_rri(dst, dst, v);
        } else {
            let src = self.map(instr.b())?;
            self.asm.imul_rr(dst, src);
        }
        Ok(())
    }

    /// `IDIV` needs RDX:RAX; the divisor moves to scratch and RDX is
    /// preserved around the operation.
    fn lower_div(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = self.map(instr.a())?;
        let (s1, s2) = self.scratch();

        if instr.is_immediate() {
            let v = i32::try_from(instr.imm_i64())
                .map_err(|_| BuildError::encoding(format!("immediate too wide in `{instr}`")))?;
            self.asm.mov_ri32(s1, v);
        } else {
            let src = self.map(instr.b())?;
            self.asm.mov_rr(s1, src);
        }

        self.asm.mov_rr(s2, Reg::Rdx);
        self.asm.mov_rr(Reg::Rax, dst);
        self.asm.cqo();
        self.asm.idiv(s1);
        let result = if instr.opcode() == Opcode::REM {
            Reg::Rdx
        } else {
            Reg::Rax
        };
        self.asm.mov_rr(dst, result);
        if dst != Reg::Rdx {
            self.asm.mov_rr(Reg::Rdx, s2);
        }
        Ok(())
    }

    /// Variable shifts go through CL with RCX preserved.
    fn lower_shift(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = self.map(instr.a())?;
        let arithmetic = instr.opcode() == Opcode::SHR;

        if instr.is_immediate() {
            let v = (instr.imm_i64() & 63) as u8;
            if arithmetic {
                self.asm.sar_ri(dst, v);
            } else {
                self.asm.shl_ri(dst, v);
            }
            return Ok(());
        }

        let src = self.map(instr.b())?;
        let (s1, s2) = self.scratch();
        self.asm.mov_rr(s1, src); // amount, before rcx is disturbed
        self.asm.mov_rr(s2, Reg::Rcx); // old rcx (the dst value when dst == rcx)
        self.asm.mov_rr(Reg::Rcx, s1);
        if dst == Reg::Rcx {
            if arithmetic {
                self.asm.sar_cl(s2);
            } else {
                self.asm.shl_cl(s2);
            }
            self.asm.mov_rr(Reg::Rcx, s2);
        } else {
            if arithmetic {
                self.asm.sar_cl(dst);
            } else {
                self.asm.shl_cl(dst);
            }
            self.asm.mov_rr(Reg::Rcx, s2);
        }
        Ok(())
    }

    fn lower_cjmp(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let cond = Cond::try_from(instr.a())
            .map_err(|b| BuildError::encoding(format!("bad condition code 0x{b:02x}")))?;
        let label = self.label_of(instr)?;
        let cc = condition_cc(cond, self.last_compare_float);
        let at = self.asm.jcc(cc);
        self.rel32(at, label);
        Ok(())
    }

    fn lower_stack(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let disp = Self::slot_disp(instr.imm());
        let float = instr.c() == consts::FLOAT_BANK;
        let store = instr.opcode() == Opcode::STORE_STACK;
        match (store, float) {
            (true, false) => {
                let src = self.map(instr.a())?;
                self.asm.mov_mr(Reg::Rsp, disp, src);
            }
            (false, false) => {
                let dst = self.map(instr.a())?;
                self.asm.mov_rm(dst, Reg::Rsp, disp);
            }
            (true, true) => {
                let src = Self::xmm(instr.a())?;
                self.asm.movsd_mx(Reg::Rsp, disp, src);
            }
            (false, true) => {
                let dst = Self::xmm(instr.a())?;
                self.asm.movsd_xm(dst, Reg::Rsp, disp);
            }
        }
        Ok(())
    }

    fn lower_fmov(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let dst = Self::xmm(instr.a())?;
        if instr.is_immediate() {
            let (s1, _) = self.scratch();
            self.asm.mov_ri64(s1, instr.payload() as i64);
            self.asm.movq_xr(dst, s1);
        } else {
            let src = Self::xmm(instr.b())?;
            self.asm.movsd_xx(dst, src);
        }
        Ok(())
    }

    fn lower_atomic_load(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let cell = self.label_of(instr)?;
        let (s1, _) = self.scratch();
        let at = self.asm.lea_rip(s1);
        self.rel32_data(at, cell);
        if self.shared_float.contains(&cell) {
            let dst = Self::xmm(instr.a())?;
            self.asm.movsd_xm(dst, s1, 0);
        } else {
            let dst = self.map(instr.a())?;
            self.asm.mov_rm(dst, s1, 0);
        }
        Ok(())
    }

    fn lower_atomic_store(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let cell = self.label_of(instr)?;
        let (s1, s2) = self.scratch();
        let at = self.asm.lea_rip(s1);
        self.rel32_data(at, cell);
        if self.shared_float.contains(&cell) {
            let src = Self::xmm(instr.a())?;
            self.asm.movq_rx(s2, src);
        } else {
            let src = self.map(instr.a())?;
            self.asm.mov_rr(s2, src);
        }
        self.asm.lock_xchg_m(s1, s2);
        Ok(())
    }

    /// Lock-free CAS loop: reload, add, `lock cmpxchg`, retry on
    /// contention.
    fn lower_atomic_fadd(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let src = Self::xmm(instr.a())?;
        let cell = self.label_of(instr)?;
        let (s1, s2) = self.scratch();
        let (xs, _) = Self::XMM_SCRATCH;

        let at = self.asm.lea_rip(s1);
        self.rel32_data(at, cell);
        let head = self.asm.len();
        self.asm.mov_rm(Reg::Rax, s1, 0);
        self.asm.movq_xr(xs, Reg::Rax);
        self.asm.addsd(xs, src);
        self.asm.movq_rx(s2, xs);
        self.asm.lock_cmpxchg_m(s1, s2);
        let retry = self.asm.jcc(cc::NE);
        let disp = head as i64 - (retry as i64 + 4);
        self.asm.patch32(retry, disp as i32);
        Ok(())
    }

    fn lower_svc(&mut self, instr: &Instruction) -> Result<(), BuildError> {
        let code = ServiceCode::try_from(instr.imm() as u8)
            .map_err(|b| BuildError::encoding(format!("unknown service code 0x{b:02x}")))?;
        match code {
            ServiceCode::Exit => self.emit_exit(),
            ServiceCode::PrintInt => self.emit_print_int(),
            ServiceCode::PrintString => self.emit_print_string(),
            ServiceCode::PrintFloat => self.emit_print_float(),
            ServiceCode::InputInt => self.emit_input_int(),
            ServiceCode::Pause => self.emit_pause(false),
            ServiceCode::PauseSilent => self.emit_pause(true),
        }
        Ok(())
    }

    /// Places a label at the current text offset.
    pub fn bind_here(&mut self, label: LabelId) -> Result<(), BuildError> {
        let offset = self.asm.len() as u64;
        self.labels.place(label, SectionId::Text, offset)
    }
}

/// Second opcode byte of the conditional jump for a MISA condition.
///
/// `UCOMISD` sets CF/ZF, so float compares take the unsigned-style
/// jumps; integer compares take the signed ones.
pub fn condition_cc(cond: Cond, float: bool) -> u8 {
    match (cond, float) {
        (Cond::Eq, _) => cc::E,
        (Cond::Ne, _) => cc::NE,
        (Cond::Lt, false) => cc::L,
        (Cond::Le, false) => cc::LE,
        (Cond::Gt, false) => cc::G,
        (Cond::Ge, false) => cc::GE,
        (Cond::Lt, true) => cc::B,
        (Cond::Le, true) => cc::BE,
        (Cond::Gt, true) => cc::A,
        (Cond::Ge, true) => cc::AE,
    }
}
