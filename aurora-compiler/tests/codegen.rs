use aurora_asm::{Cond, Directive, Instruction, Manifest, Opcode, ServiceCode};
use aurora_compiler::compile;

fn instructions(manifest: &Manifest) -> Vec<Instruction> {
    manifest
        .directives
        .iter()
        .filter_map(|d| match d {
            Directive::Instr(i) => Some(*i),
            _ => None,
        })
        .collect()
}

fn opcodes(manifest: &Manifest) -> Vec<Opcode> {
    instructions(manifest).iter().map(|i| i.opcode()).collect()
}

#[test]
fn return_42_is_mov_then_halt() {
    let manifest = compile("fn main() -> int { return 42; }").unwrap();
    let instrs = instructions(&manifest);
    // The literal lands in a temporary, moves to r0, and HALT carries
    // r0 out as the exit code.
    let imm = instrs
        .iter()
        .find(|i| i.opcode() == Opcode::MOV && i.is_immediate())
        .expect("mov imm");
    assert_eq!(imm.imm_i64(), 42);
    let to_r0 = instrs
        .iter()
        .find(|i| i.opcode() == Opcode::MOV && i.a() == 0 && !i.is_immediate())
        .expect("mov r0");
    assert_eq!(to_r0.b(), imm.a());
    assert_eq!(instrs.last().map(|i| i.opcode()), Some(Opcode::HALT));
}

#[test]
fn string_print_goes_through_r0_and_the_data_section() {
    let manifest =
        compile("fn main() -> int { let s: string = \"OK\\n\"; print(s); return 0; }").unwrap();

    let svc = instructions(&manifest)
        .into_iter()
        .find(|i| i.opcode() == Opcode::SVC)
        .expect("svc");
    assert_eq!(svc.imm(), ServiceCode::PrintString as u32);

    // The literal lands NUL-terminated under a string label.
    let ascii = manifest
        .directives
        .iter()
        .find_map(|d| match d {
            Directive::Ascii(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .expect("string data");
    assert_eq!(ascii, b"OK\n\0".to_vec());
    assert!(manifest.find_label("str0").is_some());
}

#[test]
fn numeric_prints_pick_the_service_by_type() {
    let manifest = compile(
        "fn main() -> int { print(7); let f: float = 1.5; print(f); return 0; }",
    )
    .unwrap();
    let services: Vec<u32> = instructions(&manifest)
        .into_iter()
        .filter(|i| i.opcode() == Opcode::SVC)
        .map(|i| i.imm())
        .collect();
    assert_eq!(
        services,
        vec![ServiceCode::PrintInt as u32, ServiceCode::PrintFloat as u32]
    );
}

#[test]
fn while_loop_has_guard_and_back_edge() {
    let manifest = compile(
        "fn main() -> int {
             let a = 0;
             let c = 4;
             while c > 0 { a = a + c; c = c - 1; }
             return a;
         }",
    )
    .unwrap();
    let instrs = instructions(&manifest);

    let cjmps: Vec<Instruction> = instrs
        .iter()
        .copied()
        .filter(|i| i.opcode() == Opcode::CJMP)
        .collect();
    assert_eq!(cjmps.len(), 2, "entry guard and back edge");

    // Guard: `c > 0` negated to jump at the exit label.
    assert_eq!(Cond::try_from(cjmps[0].a()), Ok(Cond::Le));
    // Back edge: the plain condition.
    assert_eq!(Cond::try_from(cjmps[1].a()), Ok(Cond::Gt));

    let head = manifest
        .labels()
        .iter()
        .position(|l| l.contains("head"))
        .expect("head label") as u32;
    assert_eq!(cjmps[1].label(), Some(head));
}

#[test]
fn calls_stage_arguments_into_r1_and_r2() {
    let manifest = compile(
        "fn add(a: int, b: int) -> int { return a + b; }
         fn main() -> int { return add(3, 5); }",
    )
    .unwrap();
    let instrs = instructions(&manifest);

    let call_at = instrs
        .iter()
        .position(|i| i.opcode() == Opcode::CALL)
        .expect("call");
    // The two LOAD_STACKs right before the call target r1 and r2.
    let loads: Vec<u8> = instrs[..call_at]
        .iter()
        .rev()
        .take_while(|i| i.opcode() == Opcode::LOAD_STACK)
        .map(|i| i.a())
        .collect();
    assert_eq!(loads, vec![2, 1]);

    let call = instrs[call_at];
    let target = manifest.label_name(call.label().unwrap()).unwrap();
    assert_eq!(target, "fn_add");
}

#[test]
fn short_circuit_and_skips_the_right_side() {
    let manifest = compile(
        "fn main() -> int {
             let a = 1;
             let b = 0;
             if a == 1 && b == 1 { return 1; }
             return 0;
         }",
    )
    .unwrap();
    let instrs = instructions(&manifest);
    // Both comparisons emit their own negated CJMP to the same target.
    let cjmps: Vec<Instruction> = instrs
        .iter()
        .copied()
        .filter(|i| i.opcode() == Opcode::CJMP)
        .collect();
    assert!(cjmps.len() >= 2);
    assert_eq!(cjmps[0].label(), cjmps[1].label());
    assert_eq!(Cond::try_from(cjmps[0].a()), Ok(Cond::Ne));
}

#[test]
fn float_compare_uses_fcmp() {
    let manifest = compile(
        "fn main() -> int {
             let x: float = 1.5;
             if x < 2.0 { return 1; }
             return 0;
         }",
    )
    .unwrap();
    let ops = opcodes(&manifest);
    let fcmp_at = ops.iter().position(|o| *o == Opcode::FCMP).expect("fcmp");
    let cjmp_after = ops[fcmp_at..]
        .iter()
        .find(|o| **o == Opcode::CJMP)
        .is_some();
    assert!(cjmp_after);
    assert!(!ops.contains(&Opcode::CMP), "no integer compare for floats");
}

#[test]
fn for_loop_desugars_to_let_and_while() {
    let manifest = compile(
        "fn main() -> int {
             let sum = 0;
             for i in 0..4 { sum = sum + i; }
             return sum;
         }",
    )
    .unwrap();
    let ops = opcodes(&manifest);
    // Guard + back-edge comparisons on the induction variable.
    assert_eq!(ops.iter().filter(|o| **o == Opcode::CMP).count(), 2);
    assert!(manifest.labels().iter().any(|l| l.contains("step")));
}

#[test]
fn spawn_join_and_atomics_lower_to_their_opcodes() {
    let manifest = compile(
        "shared total: int = 0;
         fn worker() -> int { atomic.add(total, 1); return 0; }
         fn main() -> int {
             let t: thread = spawn worker;
             join t;
             atomic.store(total, 5);
             return atomic.load(total);
         }",
    )
    .unwrap();
    let ops = opcodes(&manifest);
    for expected in [
        Opcode::SPAWN,
        Opcode::JOIN,
        Opcode::ATOMIC_ADD,
        Opcode::ATOMIC_STORE,
        Opcode::ATOMIC_LOAD,
    ] {
        assert!(ops.contains(&expected), "missing {expected}");
    }

    // The shared cell is declared with its initial value.
    let shared = manifest
        .directives
        .iter()
        .find_map(|d| match d {
            Directive::Shared { label, value, .. } => Some((*label, *value)),
            _ => None,
        })
        .expect("shared directive");
    assert_eq!(manifest.label_name(shared.0), Some("shared_total"));
    assert_eq!(shared.1, 0);
}

#[test]
fn float_shared_uses_fadd_cas() {
    let manifest = compile(
        "shared acc: float = 0.0;
         fn main() -> int { atomic.add(acc, 1.5); return 0; }",
    )
    .unwrap();
    assert!(opcodes(&manifest).contains(&Opcode::ATOMIC_FADD));
}

#[test]
fn arrays_reserve_alloc_store_load() {
    let manifest = compile(
        "fn main() -> int {
             let xs: array<int> = [10, 20, 30];
             xs[1] = 21;
             return xs[1];
         }",
    )
    .unwrap();
    let instrs = instructions(&manifest);

    let alloc = instrs
        .iter()
        .find(|i| i.opcode() == Opcode::ARRAY_ALLOC)
        .expect("alloc");
    assert_eq!(alloc.a() as u16 | (alloc.b() as u16) << 8, 3);

    // Three literal stores plus the element assignment.
    let stores = instrs
        .iter()
        .filter(|i| i.opcode() == Opcode::ARRAY_STORE)
        .count();
    assert_eq!(stores, 4);
    assert!(instrs.iter().any(|i| i.opcode() == Opcode::ARRAY_LOAD));
}

#[test]
fn array_literal_counts_survive_past_one_byte() {
    // 300 elements force the count into the high byte of the
    // ARRAY_ALLOC operand pair.
    let elems = vec!["7"; 300].join(", ");
    let source =
        format!("fn main() -> int {{ let xs: array<int> = [{elems}]; return xs[299]; }}");
    let manifest = compile(&source).unwrap();
    let alloc = instructions(&manifest)
        .into_iter()
        .find(|i| i.opcode() == Opcode::ARRAY_ALLOC)
        .expect("alloc");
    assert_eq!(alloc.a() as u16 | (alloc.b() as u16) << 8, 300);
    let stores = instructions(&manifest)
        .iter()
        .filter(|i| i.opcode() == Opcode::ARRAY_STORE)
        .count();
    assert_eq!(stores, 300);
}

#[test]
fn wide_and_float_immediates_carry_payloads() {
    let manifest = compile(
        "fn main() -> int {
             let big = 4294967296;
             let f: float = 3.141592653589793;
             print(f);
             return 0;
         }",
    )
    .unwrap();
    let instrs = instructions(&manifest);
    let wide = instrs
        .iter()
        .find(|i| i.opcode() == Opcode::MOV && i.has_payload())
        .expect("wide mov");
    assert_eq!(wide.imm_i64(), 4294967296);
    let fmov = instrs
        .iter()
        .find(|i| i.opcode() == Opcode::FMOV && i.has_payload())
        .expect("float immediate");
    assert_eq!(fmov.imm_f64(), std::f64::consts::PI);
}

#[test]
fn input_reads_before_the_destination_commits() {
    let manifest = compile("fn main() -> int { let x = input(); return x; }").unwrap();
    let instrs = instructions(&manifest);
    let svc_at = instrs
        .iter()
        .position(|i| i.opcode() == Opcode::SVC)
        .expect("input svc");
    // After the service call, r0 moves into a temporary and only then
    // into the variable's register.
    assert_eq!(instrs[svc_at].imm(), ServiceCode::InputInt as u32);
    let mov = instrs[svc_at + 1];
    assert_eq!(mov.opcode(), Opcode::MOV);
    assert_eq!(mov.b(), 0);
}

#[test]
fn manifest_round_trip_matches_generator_output() {
    let source = "
        shared total: int = 0;
        fn worker() -> int { atomic.add(total, 3); return 0; }
        fn main() -> int {
            let t: thread = spawn worker;
            join t;
            let msg: string = \"done\\n\";
            print(msg);
            let f: float = 2.5;
            print(f);
            for i in 0..10 step 3 { atomic.add(total, i); }
            return atomic.load(total);
        }
    ";
    let manifest = compile(source).unwrap();
    let text = manifest.serialize().unwrap();
    let reparsed = Manifest::parse(&text).unwrap();
    assert_eq!(reparsed, manifest.normalize().unwrap());
}

#[test]
fn register_pressure_spills_and_reloads() {
    // Seven live variables exceed the five-variable bank.
    let manifest = compile(
        "fn main() -> int {
             let a = 1; let b = 2; let c = 3; let d = 4;
             let e = 5; let f = 6; let g = 7;
             return a + b + c + d + e + f + g;
         }",
    )
    .unwrap();
    let ops = opcodes(&manifest);
    assert!(ops.contains(&Opcode::STORE_STACK));
    assert!(ops.contains(&Opcode::LOAD_STACK));
}

#[test]
fn spilled_variables_keep_their_slots() {
    let manifest = compile(
        "fn main() -> int {
             let a = 1; let b = 2; let c = 3; let d = 4;
             let e = 5; let f = 6; let g = 7;
             let x = a + g;
             let y = a + g;
             return x + y;
         }",
    )
    .unwrap();
    let instrs = instructions(&manifest);
    // Every STORE_STACK/LOAD_STACK pair for one slot is consistent:
    // collect slots stored and reloaded; reloads must come from stored
    // slots only.
    let mut stored = std::collections::HashSet::new();
    for i in &instrs {
        match i.opcode() {
            Opcode::STORE_STACK => {
                stored.insert(i.imm());
            }
            Opcode::LOAD_STACK => {
                assert!(stored.contains(&i.imm()), "reload from unwritten slot");
            }
            _ => {}
        }
    }
}
