use strum::IntoEnumIterator;

use crate::*;

#[test]
fn opcode_bytes_round_trip() {
    for opcode in Opcode::iter() {
        let byte: u8 = opcode.into();
        assert_eq!(Opcode::try_from(byte), Ok(opcode));
    }
}

#[test]
fn unknown_opcode_bytes_are_rejected() {
    for byte in [0x1b, 0x1f, 0x27, 0x28, 0x2a, 0x36, 0x7f, 0xff] {
        assert_eq!(Opcode::try_from(byte), Err(InvalidOpcode(byte)));
    }
}

#[test]
fn slot_round_trip() {
    let instructions = vec![
        op::nop(),
        op::mov(1, 2),
        op::movi(3, -7),
        op::movi64(4, i64::MIN),
        op::mov_label(1, 9),
        op::ld(2, 4),
        op::st(4, 2),
        op::add(1, 2),
        op::addi(1, 100),
        op::sub(2, 3),
        op::subi(2, -100),
        op::mul(3, 4),
        op::muli(3, -1),
        op::div(4, 5),
        op::divi(4, 10),
        op::rem(5, 1),
        op::remi(5, 3),
        op::and(1, 2),
        op::andi(1, 0xff),
        op::or(2, 3),
        op::ori(2, 1),
        op::xor(3, 4),
        op::xori(3, 1),
        op::shl(4, 5),
        op::shli(4, 3),
        op::shr(5, 1),
        op::shri(5, 63),
        op::not(1),
        op::cmp(1, 2),
        op::cmpi(1, 0),
        op::jmp(3),
        op::cjmp(Cond::Ge, 5),
        op::call(0),
        op::ret(),
        op::svc(ServiceCode::PrintInt),
        op::halt(),
        op::fmov(0, 1),
        op::fmovi(2, core::f64::consts::PI),
        op::fadd(0, 1),
        op::fsub(1, 2),
        op::fmul(2, 3),
        op::fdiv(3, 4),
        op::fcmp(4, 5),
        op::cvtsi2sd(0, 1),
        op::cvtsd2si(1, 0),
        op::spawn(1, 7),
        op::join(1),
        op::atomic_load(2, 8),
        op::atomic_store(8, 2),
        op::atomic_add(8, 3),
        op::atomic_fadd(8, 6),
        op::store_stack(12, 3),
        op::load_stack(3, 12),
        op::store_stack_f(13, 6),
        op::load_stack_f(6, 13),
        op::array_alloc(4, 300),
        op::array_store(4, 6, 7),
        op::array_load(1, 4, 6),
    ];

    for instr in instructions {
        let bytes = instr.to_bytes();
        let decoded = Instruction::from_bytes(bytes).expect("valid opcode");
        assert_eq!(decoded, instr, "{instr}");

        let lo = instr.low_word();
        let decoded = Instruction::from_words(lo, instr.payload()).expect("valid opcode");
        assert_eq!(decoded, instr, "{instr}");
    }
}

#[test]
fn wide_immediates_use_the_payload_half() {
    let instr = op::movi64(2, -1);
    assert!(instr.has_payload());
    assert_eq!(instr.imm_i64(), -1);

    let instr = op::movi(2, -1);
    assert!(!instr.has_payload());
    assert_eq!(instr.imm_i64(), -1);

    let instr = op::fmovi(3, -0.5);
    assert!(instr.has_payload());
    assert_eq!(instr.imm_f64(), -0.5);
}

#[test]
fn labels_are_only_reported_for_referencing_forms() {
    assert_eq!(op::jmp(4).label(), Some(4));
    assert_eq!(op::cjmp(Cond::Lt, 2).label(), Some(2));
    assert_eq!(op::mov_label(1, 3).label(), Some(3));
    assert_eq!(op::movi(1, 3).label(), None);
    assert_eq!(op::mov(1, 2).label(), None);
    // 0xfe in a count field is not a reference
    assert_eq!(op::array_alloc(0, 0xfe00).label(), None);
}

#[test]
fn negative_imm32_sign_extends() {
    let instr = op::addi(1, -5);
    assert_eq!(instr.imm_i64(), -5);
    let decoded = Instruction::from_bytes(instr.to_bytes()).unwrap();
    assert_eq!(decoded.imm_i64(), -5);
}

#[test]
fn display_is_stable() {
    assert_eq!(op::mov(1, 2).to_string(), "mov r1, r2");
    assert_eq!(op::movi(1, -3).to_string(), "mov r1, -3");
    assert_eq!(op::cjmp(Cond::Le, 7).to_string(), "cjmp le, @7");
    assert_eq!(op::svc(ServiceCode::PrintFloat).to_string(), "svc print_float");
    assert_eq!(op::store_stack_f(2, 6).to_string(), "store_stack 2, xmm6");
    assert_eq!(op::cvtsi2sd(1, 4).to_string(), "cvtsi2sd xmm1, r4");
}

mod props {
    use quickcheck_macros::quickcheck;

    use crate::*;

    /// Any decodable 16-byte slot re-encodes to the same bytes.
    #[quickcheck]
    fn slot_decode_encode(lo: u64, hi: u64) -> bool {
        match Instruction::from_words(lo, hi) {
            Err(_) => true,
            Ok(instr) => instr.low_word() == lo && instr.payload() == hi,
        }
    }
}
