use aurora_asm::{op, Cond};
use aurora_native::layout::LabelTable;
use aurora_native::lower::{condition_cc, Emitter};
use aurora_native::x86::{cc, Asm, Reg};
use aurora_native::Target;

use rstest::rstest;

fn emitter(target: Target) -> Emitter {
    let mut labels = LabelTable::default();
    labels.add("main");
    labels.add("L0");
    Emitter::new(target, labels)
}

#[rstest]
#[case(Cond::Eq, false, cc::E)]
#[case(Cond::Ne, false, cc::NE)]
#[case(Cond::Lt, false, cc::L)]
#[case(Cond::Le, false, cc::LE)]
#[case(Cond::Gt, false, cc::G)]
#[case(Cond::Ge, false, cc::GE)]
#[case(Cond::Eq, true, cc::E)]
#[case(Cond::Ne, true, cc::NE)]
#[case(Cond::Lt, true, cc::B)]
#[case(Cond::Le, true, cc::BE)]
#[case(Cond::Gt, true, cc::A)]
#[case(Cond::Ge, true, cc::AE)]
fn cjmp_cc_tracks_compare_kind(#[case] cond: Cond, #[case] float: bool, #[case] expected: u8) {
    assert_eq!(condition_cc(cond, float), expected);
}

#[test]
fn cjmp_after_fcmp_takes_the_unsigned_jump() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::fcmp(0, 1)).unwrap();
    let before = e.asm.len();
    e.lower(&op::cjmp(Cond::Lt, 1)).unwrap();
    assert_eq!(e.asm.bytes()[before], 0x0f);
    assert_eq!(e.asm.bytes()[before + 1], cc::B);
}

#[test]
fn cjmp_after_cmp_takes_the_signed_jump() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::cmp(1, 2)).unwrap();
    let before = e.asm.len();
    e.lower(&op::cjmp(Cond::Lt, 1)).unwrap();
    assert_eq!(e.asm.bytes()[before], 0x0f);
    assert_eq!(e.asm.bytes()[before + 1], cc::L);

    // An FCMP later flips the selection back.
    e.lower(&op::fcmp(0, 1)).unwrap();
    let before = e.asm.len();
    e.lower(&op::cjmp(Cond::Ge, 1)).unwrap();
    assert_eq!(e.asm.bytes()[before + 1], cc::AE);
}

#[test]
fn division_shuffles_through_scratch_and_preserves_rdx() {
    // Windows mapping: r6 = R11, r7 = RBX; scratch RSI/RDI.
    let mut e = emitter(Target::Windows);
    e.lower(&op::div(6, 7)).unwrap();

    let mut expect = Asm::new();
    expect.mov_rr(Reg::Rsi, Reg::Rbx); // divisor to scratch
    expect.mov_rr(Reg::Rdi, Reg::Rdx); // save rdx
    expect.mov_rr(Reg::Rax, Reg::R11); // dividend
    expect.cqo();
    expect.idiv(Reg::Rsi);
    expect.mov_rr(Reg::R11, Reg::Rax); // quotient
    expect.mov_rr(Reg::Rdx, Reg::Rdi); // restore rdx
    assert_eq!(e.asm.bytes(), expect.bytes());
}

#[test]
fn remainder_takes_rdx_and_skips_the_restore_when_dst_is_rdx() {
    // Windows r2 = RDX.
    let mut e = emitter(Target::Windows);
    e.lower(&op::rem(2, 1)).unwrap();

    let mut expect = Asm::new();
    expect.mov_rr(Reg::Rsi, Reg::Rcx);
    expect.mov_rr(Reg::Rdi, Reg::Rdx);
    expect.mov_rr(Reg::Rax, Reg::Rdx);
    expect.cqo();
    expect.idiv(Reg::Rsi);
    expect.mov_rr(Reg::Rdx, Reg::Rdx); // remainder into dst (= rdx)
    assert_eq!(e.asm.bytes(), expect.bytes());
}

#[test]
fn shifts_go_through_cl_with_rcx_preserved() {
    // Windows r1 = RCX as destination.
    let mut e = emitter(Target::Windows);
    e.lower(&op::shl(1, 6)).unwrap();

    let mut expect = Asm::new();
    expect.mov_rr(Reg::Rsi, Reg::R11); // amount
    expect.mov_rr(Reg::Rdi, Reg::Rcx); // dst value
    expect.mov_rr(Reg::Rcx, Reg::Rsi);
    expect.shl_cl(Reg::Rdi);
    expect.mov_rr(Reg::Rcx, Reg::Rdi);
    assert_eq!(e.asm.bytes(), expect.bytes());
}

#[test]
fn atomic_add_is_lock_xadd() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::atomic_add(0, 1)).unwrap();
    // lea rbx, [rip+cell]; mov r11, rdi; lock xadd [rbx], r11
    let bytes = e.asm.bytes();
    assert_eq!(&bytes[..3], &[0x48, 0x8d, 0x1d]); // lea rbx, [rip+..]
    let tail = &bytes[7..];
    assert_eq!(&tail[..3], &[0x49, 0x89, 0xfb]); // mov r11, rdi
    assert_eq!(&tail[3..8], &[0xf0, 0x4c, 0x0f, 0xc1, 0x1b]); // lock xadd [rbx], r11
    assert_eq!(e.relocs.len(), 1);
}

#[test]
fn atomic_fadd_is_a_cas_loop() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::atomic_fadd(0, 6)).unwrap();
    let bytes = e.asm.bytes().to_vec();

    // One lock cmpxchg and a jne whose displacement lands back on the
    // reload at the loop head.
    let cmpxchg = find(&bytes, &[0xf0, 0x4c, 0x0f, 0xb1]).expect("lock cmpxchg");
    let jne = cmpxchg + 5;
    assert_eq!(&bytes[jne..jne + 2], &[0x0f, 0x85]);
    let disp = i32::from_le_bytes(bytes[jne + 2..jne + 6].try_into().unwrap());
    let target = (jne as i64 + 6 + disp as i64) as usize;
    // Loop head: mov rax, [rbx]
    assert_eq!(&bytes[target..target + 3], &[0x48, 0x8b, 0x03]);
}

#[test]
fn every_stack_reservation_keeps_call_sites_aligned() {
    // Frames and stub reservations are all ≡ 8 (mod 16), so rsp is
    // 16-byte aligned at every CALL below a `sub rsp`.
    for target in [Target::Windows, Target::Linux] {
        let mut e = emitter(target);
        if target == Target::Windows {
            let stdout = e.labels.add("__stdout");
            let stdin = e.labels.add("__stdin");
            e.stdout_cell = Some(stdout);
            e.stdin_cell = Some(stdin);
        }
        for instr in [
            op::svc(aurora_asm::ServiceCode::PrintInt),
            op::svc(aurora_asm::ServiceCode::PrintString),
            op::svc(aurora_asm::ServiceCode::PrintFloat),
            op::svc(aurora_asm::ServiceCode::InputInt),
            op::svc(aurora_asm::ServiceCode::Pause),
            op::svc(aurora_asm::ServiceCode::PauseSilent),
            op::spawn(6, 0),
            op::join(6),
            op::halt(),
        ] {
            e.lower(&instr).unwrap();
        }

        let bytes = e.asm.bytes().to_vec();
        let mut found = 0;
        let mut pos = 0;
        while let Some(at) = find(&bytes[pos..], &[0x48, 0x81, 0xec]) {
            let at = pos + at;
            let imm = i32::from_le_bytes(bytes[at + 3..at + 7].try_into().unwrap());
            assert_eq!(imm % 16, 8, "sub rsp, {imm:#x} misaligns call sites");
            found += 1;
            pos = at + 3;
        }
        assert!(found >= 6, "expected stub frames on {target:?}");
    }
}

#[test]
fn stack_slots_live_above_the_callee_save_area() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::store_stack(0, 1)).unwrap();
    // mov [rsp+0x50], rdi
    assert_eq!(e.asm.bytes(), [0x48, 0x89, 0x7c, 0x24, 0x50]);

    let mut e = emitter(Target::Linux);
    e.lower(&op::load_stack(1, 2)).unwrap();
    // mov rdi, [rsp+0x60]
    assert_eq!(e.asm.bytes(), [0x48, 0x8b, 0x7c, 0x24, 0x60]);
}

#[test]
fn array_access_indexes_off_rsp() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::array_store(2, 6, 7)).unwrap();
    // mov [rsp + r9*8 + 0x60], r10
    assert_eq!(e.asm.bytes(), [0x4e, 0x89, 0x54, 0xcc, 0x60]);

    let mut e = emitter(Target::Linux);
    e.lower(&op::array_load(1, 2, 6)).unwrap();
    // mov rdi, [rsp + r9*8 + 0x60]
    assert_eq!(e.asm.bytes(), [0x4a, 0x8b, 0x7c, 0xcc, 0x60]);
}

#[test]
fn wide_and_float_immediates_use_movabs() {
    let mut e = emitter(Target::Linux);
    e.lower(&op::movi64(1, i64::MIN)).unwrap();
    assert_eq!(&e.asm.bytes()[..2], &[0x48, 0xbf]); // movabs rdi, ..

    let mut e = emitter(Target::Linux);
    e.lower(&op::fmovi(0, 1.5)).unwrap();
    // movabs rbx, bits; movq xmm0, rbx
    assert_eq!(&e.asm.bytes()[..2], &[0x48, 0xbb]);
    let bits = u64::from_le_bytes(e.asm.bytes()[2..10].try_into().unwrap());
    assert_eq!(f64::from_bits(bits), 1.5);
    assert_eq!(&e.asm.bytes()[10..], &[0x66, 0x48, 0x0f, 0x6e, 0xc3]);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
