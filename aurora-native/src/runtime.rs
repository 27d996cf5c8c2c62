//! Inlined service runtime.
//!
//! Every `SVC`, `SPAWN`, `JOIN`, and `HALT` expands at its call site.
//! Stubs that call the OS preserve every virtual register they touch:
//! on Windows that is the volatile half of the mapped file
//! (RCX/RDX/R8..R11) plus XMM0..XMM5, on Linux the seven mapped
//! argument registers. Win64 stubs reserve shadow space and keep RSP
//! 16-byte aligned at every external call; function bodies run at
//! `rsp ≡ 8 (mod 16)`, so every stub frame is `≡ 8 (mod 16)` as well.

use aurora_asm::LabelId;

use crate::driver::Target;
use crate::layout::ImportSymbol;
use crate::lower::Emitter;
use crate::x86::{cc, Reg, Xmm};

const WIN_GP_SAVES: [Reg; 6] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9, Reg::R10, Reg::R11];
const LINUX_GP_SAVES: [Reg; 7] = [
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
];

/// `clone` flags for a same-VM thread with a clear-on-exit tid cell.
const CLONE_THREAD_FLAGS: i32 = 0x0025_0f00;

const SYS_READ: i32 = 0;
const SYS_WRITE: i32 = 1;
const SYS_MMAP: i32 = 9;
const SYS_CLONE: i32 = 56;
const SYS_EXIT: i32 = 60;
const SYS_FUTEX: i32 = 202;
const SYS_EXIT_GROUP: i32 = 231;

impl Emitter {
    // ---- function scaffolding ----

    /// Function prologue: frame reservation plus the callee register
    /// save area on Windows. `main` has no frame.
    pub fn emit_prologue(&mut self, frame: i64) {
        self.frame = frame;
        if frame == 0 {
            return;
        }
        self.asm.sub_ri(Reg::Rsp, frame as i32);
        if self.target == Target::Windows {
            self.asm.mov_mr(Reg::Rsp, 0x30, Reg::Rbx);
            self.asm.mov_mr(Reg::Rsp, 0x38, Reg::Rsi);
            self.asm.mov_mr(Reg::Rsp, 0x40, Reg::Rdi);
        }
    }

    /// Function epilogue at `RET`.
    pub fn emit_epilogue(&mut self) {
        if self.frame > 0 {
            if self.target == Target::Windows {
                self.asm.mov_rm(Reg::Rbx, Reg::Rsp, 0x30);
                self.asm.mov_rm(Reg::Rsi, Reg::Rsp, 0x38);
                self.asm.mov_rm(Reg::Rdi, Reg::Rsp, 0x40);
            }
            self.asm.add_ri(Reg::Rsp, self.frame as i32);
        }
        self.asm.ret();
    }

    /// Image entry point: caches the std handles (Windows), fixes the
    /// entry stack parity (Linux), and jumps to `main`.
    pub fn emit_entry(&mut self, main: LabelId) {
        match self.target {
            Target::Windows => {
                let stdout = self.stdout_cell.expect("std handle cells exist");
                let stdin = self.stdin_cell.expect("std handle cells exist");
                self.asm.sub_ri(Reg::Rsp, 0x28);
                self.asm.mov_r32i(Reg::Rcx, -11i32 as u32); // STD_OUTPUT_HANDLE
                self.call_import(ImportSymbol::GetStdHandle);
                let at = self.asm.mov_mr_rip(Reg::Rax);
                self.rel32_data(at, stdout);
                self.asm.mov_r32i(Reg::Rcx, -10i32 as u32); // STD_INPUT_HANDLE
                self.call_import(ImportSymbol::GetStdHandle);
                let at = self.asm.mov_mr_rip(Reg::Rax);
                self.rel32_data(at, stdin);
                self.asm.add_ri(Reg::Rsp, 0x28);
            }
            Target::Linux => {
                // _start enters 16-aligned; bodies expect rsp ≡ 8.
                self.asm.sub_ri(Reg::Rsp, 8);
            }
        }
        let at = self.asm.jmp();
        self.rel32(at, main);
    }

    // ---- register preservation ----

    fn save_win(&mut self, gp_base: i32, xmm_base: i32) {
        for (i, reg) in WIN_GP_SAVES.into_iter().enumerate() {
            self.asm.mov_mr(Reg::Rsp, gp_base + 8 * i as i32, reg);
        }
        for i in 0..6u8 {
            self.asm
                .movsd_mx(Reg::Rsp, xmm_base + 8 * i as i32, Xmm(i));
        }
    }

    fn restore_win(&mut self, gp_base: i32, xmm_base: i32) {
        for (i, reg) in WIN_GP_SAVES.into_iter().enumerate() {
            self.asm.mov_rm(reg, Reg::Rsp, gp_base + 8 * i as i32);
        }
        for i in 0..6u8 {
            self.asm
                .movsd_xm(Xmm(i), Reg::Rsp, xmm_base + 8 * i as i32);
        }
    }

    fn save_linux(&mut self, base: i32) {
        for (i, reg) in LINUX_GP_SAVES.into_iter().enumerate() {
            self.asm.mov_mr(Reg::Rsp, base + 8 * i as i32, reg);
        }
    }

    fn restore_linux(&mut self, base: i32) {
        for (i, reg) in LINUX_GP_SAVES.into_iter().enumerate() {
            self.asm.mov_rm(reg, Reg::Rsp, base + 8 * i as i32);
        }
    }

    // ---- shared conversion helpers ----

    /// Renders RAX as signed decimal plus a newline, building backward
    /// from `[rsp + buf_end]`. Leaves the text pointer in RDI and its
    /// length in RSI; clobbers RAX, RCX, RDX, R8.
    fn emit_digits(&mut self, buf_end: i32) {
        self.asm.lea(Reg::Rdi, Reg::Rsp, buf_end);
        self.asm.mov_mi8(Reg::Rdi, 0, b'\n');
        self.asm.mov_ri32(Reg::Rsi, 1);
        self.asm.xor_rr(Reg::R8, Reg::R8);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        let positive = self.asm.jcc(cc::NS);
        self.asm.mov_ri32(Reg::R8, 1);
        self.asm.neg_r(Reg::Rax);
        self.asm.patch_here(positive);

        self.asm.mov_ri32(Reg::Rcx, 10);
        let digit = self.asm.len();
        self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
        self.asm.div(Reg::Rcx);
        self.asm.add_ri(Reg::Rdx, b'0' as i32);
        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_m8r(Reg::Rdi, 0, Reg::Rdx);
        self.asm.inc_r(Reg::Rsi);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        let back = self.asm.jcc(cc::NZ);
        self.asm.patch32(back, digit as i32 - (back as i32 + 4));

        self.asm.test_rr(Reg::R8, Reg::R8);
        let unsigned = self.asm.jcc(cc::Z);
        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_mi8(Reg::Rdi, 0, b'-');
        self.asm.inc_r(Reg::Rsi);
        self.asm.patch_here(unsigned);
    }

    /// Renders XMM6 with nine rounded fractional digits plus a newline
    /// (round half away from zero via 10⁹ scaling). Same outputs and
    /// clobbers as [`Self::emit_digits`], plus R9..R11 and XMM8/XMM9.
    fn emit_float_digits(&mut self, buf_end: i32) {
        let (xs0, xs1) = Self::XMM_SCRATCH;

        self.asm.movq_rx(Reg::Rax, Xmm(6));
        self.asm.xor_rr(Reg::R11, Reg::R11);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        let positive = self.asm.jcc(cc::NS);
        self.asm.mov_ri32(Reg::R11, 1);
        self.asm.mov_ri64(Reg::Rcx, 0x7fff_ffff_ffff_ffff);
        self.asm.and_rr(Reg::Rax, Reg::Rcx);
        self.asm.patch_here(positive);
        self.asm.movq_xr(xs0, Reg::Rax);

        // Integer part, truncated toward zero.
        self.asm.cvttsd2si(Reg::R8, xs0);
        self.asm.cvtsi2sd(xs1, Reg::R8);
        self.asm.subsd(xs0, xs1);

        // scaled = trunc(frac * 1e9 + 0.5)
        self.asm.mov_ri64(Reg::Rax, 1e9f64.to_bits() as i64);
        self.asm.movq_xr(xs1, Reg::Rax);
        self.asm.mulsd(xs0, xs1);
        self.asm.mov_ri64(Reg::Rax, 0.5f64.to_bits() as i64);
        self.asm.movq_xr(xs1, Reg::Rax);
        self.asm.addsd(xs0, xs1);
        self.asm.cvttsd2si(Reg::R9, xs0);

        // Rounding may carry into the integer part.
        self.asm.mov_ri32(Reg::Rax, 1_000_000_000);
        self.asm.cmp_rr(Reg::R9, Reg::Rax);
        let no_carry = self.asm.jcc(cc::NE);
        self.asm.xor_rr(Reg::R9, Reg::R9);
        self.asm.inc_r(Reg::R8);
        self.asm.patch_here(no_carry);

        self.asm.lea(Reg::Rdi, Reg::Rsp, buf_end);
        self.asm.mov_mi8(Reg::Rdi, 0, b'\n');
        self.asm.mov_ri32(Reg::Rsi, 1);
        self.asm.mov_ri32(Reg::Rcx, 10);

        // Nine zero-padded fractional digits.
        self.asm.mov_rr(Reg::Rax, Reg::R9);
        self.asm.mov_ri32(Reg::R10, 9);
        let frac = self.asm.len();
        self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
        self.asm.div(Reg::Rcx);
        self.asm.add_ri(Reg::Rdx, b'0' as i32);
        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_m8r(Reg::Rdi, 0, Reg::Rdx);
        self.asm.inc_r(Reg::Rsi);
        self.asm.dec_r(Reg::R10);
        let back = self.asm.jcc(cc::NZ);
        self.asm.patch32(back, frac as i32 - (back as i32 + 4));

        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_mi8(Reg::Rdi, 0, b'.');
        self.asm.inc_r(Reg::Rsi);

        // Integer digits, at least one.
        self.asm.mov_rr(Reg::Rax, Reg::R8);
        let int_digits = self.asm.len();
        self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
        self.asm.div(Reg::Rcx);
        self.asm.add_ri(Reg::Rdx, b'0' as i32);
        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_m8r(Reg::Rdi, 0, Reg::Rdx);
        self.asm.inc_r(Reg::Rsi);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        let back = self.asm.jcc(cc::NZ);
        self.asm.patch32(back, int_digits as i32 - (back as i32 + 4));

        self.asm.test_rr(Reg::R11, Reg::R11);
        let unsigned = self.asm.jcc(cc::Z);
        self.asm.dec_r(Reg::Rdi);
        self.asm.mov_mi8(Reg::Rdi, 0, b'-');
        self.asm.inc_r(Reg::Rsi);
        self.asm.patch_here(unsigned);
    }

    /// NUL-terminated string length: pointer in RAX, length out in RSI.
    fn emit_strlen(&mut self) {
        self.asm.xor_rr(Reg::Rsi, Reg::Rsi);
        let head = self.asm.len();
        self.asm.cmp_mi8_idx(Reg::Rax, Reg::Rsi, 0);
        let done = self.asm.jcc(cc::E);
        self.asm.inc_r(Reg::Rsi);
        let back = self.asm.jmp();
        self.asm.patch32(back, head as i32 - (back as i32 + 4));
        self.asm.patch_here(done);
    }

    /// `WriteFile(stdout, RDX, R8, &written, NULL)`.
    fn emit_writefile(&mut self, written: i32) {
        let stdout = self.stdout_cell.expect("std handle cells exist");
        let at = self.asm.mov_rm_rip(Reg::Rcx);
        self.rel32_data(at, stdout);
        self.asm.lea(Reg::R9, Reg::Rsp, written);
        self.asm.mov_mi32(Reg::Rsp, 0x20, 0);
        self.call_import(ImportSymbol::WriteFile);
    }

    /// `write(1, RSI, RDX)`.
    fn emit_write_linux(&mut self) {
        self.asm.mov_ri32(Reg::Rdi, 1);
        self.asm.mov_ri32(Reg::Rax, SYS_WRITE);
        self.asm.syscall();
    }

    // ---- services ----

    /// `HALT` / `SVC exit`: terminates with the code in `r0`.
    pub fn emit_exit(&mut self) {
        match self.target {
            Target::Windows => {
                self.asm.mov_rr(Reg::Rcx, Reg::Rax);
                self.asm.sub_ri(Reg::Rsp, 0x28);
                self.call_import(ImportSymbol::ExitProcess);
            }
            Target::Linux => {
                self.asm.mov_rr(Reg::Rdi, Reg::Rax);
                self.asm.mov_ri32(Reg::Rax, SYS_EXIT_GROUP);
                self.asm.syscall();
            }
        }
    }

    /// Prints RAX as signed decimal with a trailing newline.
    pub fn emit_print_int(&mut self) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0xb8);
                self.save_win(0x50, 0x80);
                self.emit_digits(0x4f);
                self.asm.mov_rr(Reg::Rdx, Reg::Rdi);
                self.asm.mov_rr(Reg::R8, Reg::Rsi);
                self.emit_writefile(0x28);
                self.restore_win(0x50, 0x80);
                self.asm.add_ri(Reg::Rsp, 0xb8);
            }
            Target::Linux => {
                self.asm.sub_ri(Reg::Rsp, 0x58);
                self.save_linux(0x20);
                self.emit_digits(0x1f);
                self.asm.mov_rr(Reg::Rdx, Reg::Rsi);
                self.asm.mov_rr(Reg::Rsi, Reg::Rdi);
                self.emit_write_linux();
                self.restore_linux(0x20);
                self.asm.add_ri(Reg::Rsp, 0x58);
            }
        }
    }

    /// Prints the NUL-terminated string whose address is in RAX.
    pub fn emit_print_string(&mut self) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0x98);
                self.save_win(0x30, 0x60);
                self.emit_strlen();
                self.asm.mov_rr(Reg::Rdx, Reg::Rax);
                self.asm.mov_rr(Reg::R8, Reg::Rsi);
                self.emit_writefile(0x28);
                self.restore_win(0x30, 0x60);
                self.asm.add_ri(Reg::Rsp, 0x98);
            }
            Target::Linux => {
                self.asm.sub_ri(Reg::Rsp, 0x38);
                self.save_linux(0x00);
                self.emit_strlen();
                self.asm.mov_rr(Reg::Rdx, Reg::Rsi);
                self.asm.mov_rr(Reg::Rsi, Reg::Rax);
                self.emit_write_linux();
                self.restore_linux(0x00);
                self.asm.add_ri(Reg::Rsp, 0x38);
            }
        }
    }

    /// Prints XMM6 with nine fractional digits. XMM0..XMM5 stay
    /// intact for the caller's live float variables.
    pub fn emit_print_float(&mut self) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0xc8);
                self.save_win(0x60, 0x90);
                self.emit_float_digits(0x5f);
                self.asm.mov_rr(Reg::Rdx, Reg::Rdi);
                self.asm.mov_rr(Reg::R8, Reg::Rsi);
                self.emit_writefile(0x28);
                self.restore_win(0x60, 0x90);
                self.asm.add_ri(Reg::Rsp, 0xc8);
            }
            Target::Linux => {
                self.asm.sub_ri(Reg::Rsp, 0x68);
                self.save_linux(0x30);
                self.emit_float_digits(0x2f);
                self.asm.mov_rr(Reg::Rdx, Reg::Rsi);
                self.asm.mov_rr(Reg::Rsi, Reg::Rdi);
                self.emit_write_linux();
                self.restore_linux(0x30);
                self.asm.add_ri(Reg::Rsp, 0x68);
            }
        }
    }

    /// Reads a signed decimal integer from standard input into RAX.
    /// Zero bytes read yields 0.
    pub fn emit_input_int(&mut self) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0xa8);
                self.save_win(0x48, 0x78);
                let stdin = self.stdin_cell.expect("std handle cells exist");
                self.asm.mov_mi32(Reg::Rsp, 0x28, 0);
                let at = self.asm.mov_rm_rip(Reg::Rcx);
                self.rel32_data(at, stdin);
                self.asm.lea(Reg::Rdx, Reg::Rsp, 0x30);
                self.asm.mov_r32i(Reg::R8, 20);
                self.asm.lea(Reg::R9, Reg::Rsp, 0x28);
                self.asm.mov_mi32(Reg::Rsp, 0x20, 0);
                self.call_import(ImportSymbol::ReadFile);
                self.asm.lea(Reg::Rdi, Reg::Rsp, 0x30);
                self.asm.mov_rm(Reg::Rcx, Reg::Rsp, 0x28);
                self.emit_parse_int();
                self.restore_win(0x48, 0x78);
                self.asm.add_ri(Reg::Rsp, 0xa8);
            }
            Target::Linux => {
                self.asm.sub_ri(Reg::Rsp, 0x58);
                self.save_linux(0x20);
                self.asm.xor_rr(Reg::Rdi, Reg::Rdi);
                self.asm.lea(Reg::Rsi, Reg::Rsp, 0);
                self.asm.mov_ri32(Reg::Rdx, 20);
                self.asm.mov_ri32(Reg::Rax, SYS_READ);
                self.asm.syscall();
                self.asm.mov_rr(Reg::Rcx, Reg::Rax);
                self.asm.lea(Reg::Rdi, Reg::Rsp, 0);
                self.emit_parse_int();
                self.restore_linux(0x20);
                self.asm.add_ri(Reg::Rsp, 0x58);
            }
        }
    }

    /// ASCII decimal parse: buffer in RDI, byte count in RCX, result in
    /// RAX. Accepts an optional leading `-`, stops at the first
    /// non-digit.
    fn emit_parse_int(&mut self) {
        self.asm.xor_rr(Reg::Rax, Reg::Rax);
        self.asm.xor_rr(Reg::R11, Reg::R11);
        self.asm.test_rr(Reg::Rcx, Reg::Rcx);
        let empty = self.asm.jcc(cc::Z);
        self.asm.cmp_mi8(Reg::Rdi, 0, b'-');
        let no_sign = self.asm.jcc(cc::NE);
        self.asm.mov_ri32(Reg::R11, 1);
        self.asm.inc_r(Reg::Rdi);
        self.asm.dec_r(Reg::Rcx);
        self.asm.patch_here(no_sign);

        let head = self.asm.len();
        self.asm.test_rr(Reg::Rcx, Reg::Rcx);
        let done = self.asm.jcc(cc::Z);
        self.asm.movzx_r32m8(Reg::Rdx, Reg::Rdi, 0);
        self.asm.sub_ri(Reg::Rdx, b'0' as i32);
        self.asm.cmp_ri(Reg::Rdx, 9);
        let done2 = self.asm.jcc(cc::A);
        self.asm.imul_rri(Reg::Rax, Reg::Rax, 10);
        self.asm.add_rr(Reg::Rax, Reg::Rdx);
        self.asm.inc_r(Reg::Rdi);
        self.asm.dec_r(Reg::Rcx);
        let back = self.asm.jmp();
        self.asm.patch32(back, head as i32 - (back as i32 + 4));
        self.asm.patch_here(done);
        self.asm.patch_here(done2);

        self.asm.test_rr(Reg::R11, Reg::R11);
        let positive = self.asm.jcc(cc::Z);
        self.asm.neg_r(Reg::Rax);
        self.asm.patch_here(positive);
        self.asm.patch_here(empty);
    }

    /// Pause: optionally reports the exit code, waits for Enter, then
    /// terminates with the code that arrived in RAX.
    pub fn emit_pause(&mut self, silent: bool) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0x58);
                self.asm.mov_mr(Reg::Rsp, 0x50, Reg::Rax);
                if !silent {
                    let (head, head_len, tail, tail_len) = self.pause_messages();
                    let at = self.asm.lea_rip(Reg::Rdx);
                    self.rel32_data(at, head);
                    self.asm.mov_r32i(Reg::R8, head_len);
                    self.emit_writefile(0x28);

                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0x50);
                    self.emit_digits(0x4f);
                    self.asm.mov_rr(Reg::Rdx, Reg::Rdi);
                    self.asm.mov_rr(Reg::R8, Reg::Rsi);
                    self.emit_writefile(0x28);

                    let at = self.asm.lea_rip(Reg::Rdx);
                    self.rel32_data(at, tail);
                    self.asm.mov_r32i(Reg::R8, tail_len);
                    self.emit_writefile(0x28);
                }
                let stdin = self.stdin_cell.expect("std handle cells exist");
                let at = self.asm.mov_rm_rip(Reg::Rcx);
                self.rel32_data(at, stdin);
                self.asm.lea(Reg::Rdx, Reg::Rsp, 0x30);
                self.asm.mov_r32i(Reg::R8, 20);
                self.asm.lea(Reg::R9, Reg::Rsp, 0x28);
                self.asm.mov_mi32(Reg::Rsp, 0x20, 0);
                self.call_import(ImportSymbol::ReadConsoleA);
                self.asm.mov_rm(Reg::Rcx, Reg::Rsp, 0x50);
                self.call_import(ImportSymbol::ExitProcess);
            }
            Target::Linux => {
                self.asm.sub_ri(Reg::Rsp, 0x28);
                self.asm.mov_mr(Reg::Rsp, 0x20, Reg::Rax);
                if !silent {
                    let (head, head_len, tail, tail_len) = self.pause_messages();
                    self.data_addr(Reg::Rsi, head);
                    self.asm.mov_ri32(Reg::Rdx, head_len as i32);
                    self.emit_write_linux();

                    self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0x20);
                    self.emit_digits(0x1f);
                    self.asm.mov_rr(Reg::Rdx, Reg::Rsi);
                    self.asm.mov_rr(Reg::Rsi, Reg::Rdi);
                    self.emit_write_linux();

                    self.data_addr(Reg::Rsi, tail);
                    self.asm.mov_ri32(Reg::Rdx, tail_len as i32);
                    self.emit_write_linux();
                }
                self.asm.xor_rr(Reg::Rdi, Reg::Rdi);
                self.asm.lea(Reg::Rsi, Reg::Rsp, 0);
                self.asm.mov_ri32(Reg::Rdx, 20);
                self.asm.mov_ri32(Reg::Rax, SYS_READ);
                self.asm.syscall();
                self.asm.mov_rm(Reg::Rdi, Reg::Rsp, 0x20);
                self.asm.mov_ri32(Reg::Rax, SYS_EXIT_GROUP);
                self.asm.syscall();
            }
        }
    }

    // ---- threads ----

    /// `SPAWN dst, func`: starts a kernel thread running `func`, handle
    /// into `dst`.
    pub fn emit_spawn(&mut self, dst: Reg, func: LabelId) {
        match self.target {
            Target::Windows => {
                // CreateThread(NULL, 0, func, NULL, 0, NULL)
                self.asm.sub_ri(Reg::Rsp, 0x98);
                self.save_win(0x30, 0x60);
                self.asm.xor_rr(Reg::Rcx, Reg::Rcx);
                self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
                let at = self.asm.lea_rip(Reg::R8);
                self.rel32(at, func);
                self.asm.xor_rr(Reg::R9, Reg::R9);
                self.asm.mov_mi32(Reg::Rsp, 0x20, 0);
                self.asm.mov_mi32(Reg::Rsp, 0x28, 0);
                self.call_import(ImportSymbol::CreateThread);
                self.restore_win(0x30, 0x60);
                self.asm.mov_rr(dst, Reg::Rax);
                self.asm.add_ri(Reg::Rsp, 0x98);
            }
            Target::Linux => self.emit_spawn_linux(dst, func),
        }
    }

    /// Linux threads: a fresh `mmap`ed stack and `clone` with
    /// `CLONE_CHILD_CLEARTID`; the handle is the address of the tid
    /// cell the kernel clears and futex-wakes on thread exit.
    fn emit_spawn_linux(&mut self, dst: Reg, func: LabelId) {
        self.asm.sub_ri(Reg::Rsp, 0x48);
        self.save_linux(0x08);

        // mmap(NULL, 1 MiB, RW, MAP_PRIVATE|MAP_ANONYMOUS, -1, 0)
        self.asm.xor_rr(Reg::Rdi, Reg::Rdi);
        self.asm.mov_ri32(Reg::Rsi, 0x10_0000);
        self.asm.mov_ri32(Reg::Rdx, 3);
        self.asm.mov_ri32(Reg::R10, 0x22);
        self.asm.mov_ri32(Reg::R8, -1);
        self.asm.xor_rr(Reg::R9, Reg::R9);
        self.asm.mov_ri32(Reg::Rax, SYS_MMAP);
        self.asm.syscall();

        // Stack top, with the entry address at [top] and the tid cell
        // at [top+8].
        self.asm.lea(Reg::Rcx, Reg::Rax, 0xf_fff0);
        let at = self.asm.lea_rip(Reg::Rdx);
        self.rel32(at, func);
        self.asm.mov_mr(Reg::Rcx, 0, Reg::Rdx);
        self.asm.mov_mi32(Reg::Rcx, 8, 1);
        self.asm.mov_mr(Reg::Rsp, 0, Reg::Rcx);

        // clone(flags, child_stack, NULL, &tid_cell, 0)
        self.asm.mov_ri32(Reg::Rdi, CLONE_THREAD_FLAGS);
        self.asm.mov_rr(Reg::Rsi, Reg::Rcx);
        self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
        self.asm.lea(Reg::R10, Reg::Rcx, 8);
        self.asm.xor_rr(Reg::R8, Reg::R8);
        self.asm.mov_ri32(Reg::Rax, SYS_CLONE);
        self.asm.syscall();
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        let parent = self.asm.jcc(cc::NZ);

        // Child: run the function, then exit this thread with its
        // result.
        self.asm.pop(Reg::Rax);
        self.asm.call_r(Reg::Rax);
        self.asm.mov_rr(Reg::Rdi, Reg::Rax);
        self.asm.mov_ri32(Reg::Rax, SYS_EXIT);
        self.asm.syscall();

        self.asm.patch_here(parent);
        self.asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
        self.asm.add_ri(Reg::Rax, 8);
        self.restore_linux(0x08);
        self.asm.mov_rr(dst, Reg::Rax);
        self.asm.add_ri(Reg::Rsp, 0x48);
    }

    /// `JOIN handle`: infinite wait, then handle cleanup.
    pub fn emit_join(&mut self, handle: Reg) {
        match self.target {
            Target::Windows => {
                self.asm.sub_ri(Reg::Rsp, 0x98);
                self.save_win(0x30, 0x60);
                self.asm.mov_rr(Reg::Rax, handle);
                self.asm.mov_mr(Reg::Rsp, 0x20, Reg::Rax);
                self.asm.mov_rr(Reg::Rcx, Reg::Rax);
                self.asm.mov_r32i(Reg::Rdx, 0xffff_ffff); // INFINITE
                self.call_import(ImportSymbol::WaitForSingleObject);
                self.asm.mov_rm(Reg::Rcx, Reg::Rsp, 0x20);
                self.call_import(ImportSymbol::CloseHandle);
                self.restore_win(0x30, 0x60);
                self.asm.add_ri(Reg::Rsp, 0x98);
            }
            Target::Linux => {
                // futex-wait until the kernel clears the tid cell.
                self.asm.sub_ri(Reg::Rsp, 0x48);
                self.save_linux(0x08);
                self.asm.mov_rr(Reg::Rdi, handle);
                let head = self.asm.len();
                self.asm.mov_r32m(Reg::Rax, Reg::Rdi, 0);
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                let done = self.asm.jcc(cc::Z);
                self.asm.mov_ri32(Reg::Rsi, 0); // FUTEX_WAIT
                self.asm.mov_rr(Reg::Rdx, Reg::Rax);
                self.asm.xor_rr(Reg::R10, Reg::R10);
                self.asm.mov_ri32(Reg::Rax, SYS_FUTEX);
                self.asm.syscall();
                let back = self.asm.jmp();
                self.asm.patch32(back, head as i32 - (back as i32 + 4));
                self.asm.patch_here(done);
                self.restore_linux(0x08);
                self.asm.add_ri(Reg::Rsp, 0x48);
            }
        }
    }
}
