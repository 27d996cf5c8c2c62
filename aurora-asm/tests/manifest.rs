use aurora_asm::*;
use rstest::rstest;

fn sample() -> Manifest {
    let mut m = Manifest::new("misa64");

    // Labels created out of definition order on purpose: the exit label
    // is allocated before the loop head, as a code generator would.
    let exit = m.fresh_label("L_exit");
    let main = m.fresh_label("main");
    let head = m.fresh_label("L_head");
    let msg = m.fresh_label("str0");
    let counter = m.fresh_label("shared_counter");

    m.place_label(main);
    m.push_instr(op::movi(1, 4));
    m.push_instr(op::movi64(2, 0x1_0000_0000));
    m.place_label(head);
    m.push_instr(op::subi(1, 1));
    m.push_instr(op::cmpi(1, 0));
    m.push_instr(op::cjmp(Cond::Le, exit));
    m.push_instr(op::atomic_add(counter, 1));
    m.push_instr(op::jmp(head));
    m.place_label(exit);
    m.push_instr(op::fmovi(0, 2.5));
    m.push_instr(op::mov_label(1, msg));
    m.push_instr(op::svc(ServiceCode::PrintString));
    m.push_instr(op::halt());

    m.push(Directive::Pad(8));
    m.place_label(msg);
    m.push(Directive::Ascii(b"OK\n\0".to_vec()));
    m.push(Directive::Pad(8));
    m.push(Directive::Shared {
        label: counter,
        ty: SharedType::Int,
        value: 0,
    });

    m
}

#[test]
fn round_trip_preserves_instructions_and_labels() {
    let manifest = sample();
    let text = manifest.serialize().expect("serializable");
    let parsed = Manifest::parse(&text).expect("parseable");
    let normalized = manifest.normalize().expect("well-formed");

    assert_eq!(parsed, normalized);
    assert_eq!(parsed.header, "misa64");

    // Label identity survives the text round trip.
    for name in ["main", "L_head", "L_exit", "str0", "shared_counter"] {
        assert!(parsed.find_label(name).is_some(), "missing {name}");
    }
}

#[test]
fn serialized_references_use_definition_order() {
    let text = sample().serialize().unwrap();
    let parsed = Manifest::parse(&text).unwrap();

    let head = parsed.find_label("L_head").unwrap();
    let back_edge = parsed
        .directives
        .iter()
        .filter_map(|d| match d {
            Directive::Instr(i) if i.opcode() == Opcode::JMP => i.label(),
            _ => None,
        })
        .next()
        .unwrap();
    assert_eq!(back_edge, head);
}

#[test]
fn wide_immediates_occupy_a_second_bytes_line() {
    let text = sample().serialize().unwrap();
    let bytes_lines = text
        .lines()
        .filter(|l| l.trim_start().starts_with("bytes"))
        .count();
    // 10 instruction lines besides `halt`, two of them with payloads.
    assert_eq!(bytes_lines, 12);
    assert_eq!(text.lines().filter(|l| l.trim() == "halt").count(), 1);
}

#[test]
fn comments_and_blank_lines_are_ignored() {
    let text = "\
header misa64
org 0x0
; a comment
# another comment

label start   ; trailing comment
halt
";
    let parsed = Manifest::parse(text).expect("parseable");
    assert_eq!(parsed.directives.len(), 2);
    assert!(parsed.find_label("start").is_some());
}

#[test]
fn ascii_escapes_round_trip() {
    let mut m = Manifest::new("misa64");
    let s = m.fresh_label("s");
    m.place_label(s);
    m.push(Directive::Ascii(b"a;b#c \"quoted\"\\\t\r\n\0".to_vec()));

    let text = m.serialize().unwrap();
    let parsed = Manifest::parse(&text).unwrap();
    assert_eq!(parsed, m.normalize().unwrap());
}

#[test]
fn shared_float_values_round_trip() {
    let mut m = Manifest::new("misa64");
    let pi = m.fresh_label("shared_pi");
    m.push(Directive::Shared {
        label: pi,
        ty: SharedType::Float,
        value: std::f64::consts::PI.to_bits(),
    });
    let parsed = Manifest::parse(&m.serialize().unwrap()).unwrap();
    match &parsed.directives[0] {
        Directive::Shared { ty, value, .. } => {
            assert_eq!(*ty, SharedType::Float);
            assert_eq!(f64::from_bits(*value), std::f64::consts::PI);
        }
        other => panic!("unexpected directive {other:?}"),
    }
}

#[test]
fn duplicate_labels_are_rejected() {
    let mut m = Manifest::new("misa64");
    let a = m.fresh_label("dup");
    let b = m.fresh_label("dup");
    m.place_label(a);
    m.place_label(b);
    assert!(matches!(
        m.serialize(),
        Err(ManifestError::DuplicateLabel(name)) if name == "dup"
    ));
}

#[test]
fn dangling_references_are_rejected() {
    let mut m = Manifest::new("misa64");
    let nowhere = m.fresh_label("nowhere");
    m.push_instr(op::jmp(nowhere));
    assert!(matches!(
        m.serialize(),
        Err(ManifestError::UndefinedLabel(name)) if name == "nowhere"
    ));
}

#[test]
fn truncated_payload_is_rejected() {
    let lo = op::fmovi(0, 1.5).low_word();
    let text = format!("header misa64\norg 0x0\nbytes 0x{lo:016X}\n");
    assert!(matches!(
        Manifest::parse(&text),
        Err(ManifestError::MissingPayload(_))
    ));
}

#[rstest]
#[case("header x\nfrobnicate 1\n", 2)]
#[case("bytes zzz\n", 1)]
#[case("pad\n", 1)]
#[case("ascii unquoted\n", 1)]
#[case("shared s int\n", 1)]
#[case("ascii \"bad \\q escape\"\n", 1)]
fn malformed_lines_are_syntax_errors(#[case] text: &str, #[case] at: usize) {
    match Manifest::parse(text) {
        Err(ManifestError::Syntax { line, .. }) => assert_eq!(line, at, "{text:?}"),
        other => panic!("expected a syntax error for {text:?}, got {other:?}"),
    }
}
