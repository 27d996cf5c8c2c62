use aurora_asm::{op, Manifest};
use aurora_compiler::compile;
use aurora_native::{NativeCompiler, Target};

const HELLO: &str = r#"
fn main() -> int {
    let s: string = "OK\n";
    print(s);
    return 0;
}
"#;

const THREADED: &str = r#"
shared total: int = 0;
fn worker() -> int {
    for i in 0..50 { atomic.add(total, 1); }
    return 0;
}
fn main() -> int {
    let a: thread = spawn worker;
    let b: thread = spawn worker;
    join a;
    join b;
    return atomic.load(total);
}
"#;

fn build(target: Target, source: &str) -> Vec<u8> {
    let manifest = compile(source).unwrap();
    NativeCompiler::new(target).compile(&manifest).unwrap()
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn pe_headers_are_well_formed() {
    let image = build(Target::Windows, HELLO);

    assert_eq!(&image[..2], b"MZ");
    let pe_at = u32_at(&image, 0x3c) as usize;
    assert_eq!(pe_at, 0x80);
    assert_eq!(&image[pe_at..pe_at + 4], b"PE\0\0");
    assert_eq!(u16_at(&image, pe_at + 4), 0x8664);
    assert_eq!(u16_at(&image, pe_at + 6), 3, "three sections");

    // PE32+ optional header with the entry at the start of .text.
    let opt = pe_at + 24;
    assert_eq!(u16_at(&image, opt), 0x020b);
    assert_eq!(u32_at(&image, opt + 16), 0x1000, "entry RVA");
    assert_eq!(u64_at(&image, opt + 24), 0x1_4000_0000, "image base");
    assert_eq!(u32_at(&image, opt + 32), 0x1000, "section alignment");
    assert_eq!(u32_at(&image, opt + 36), 0x200, "file alignment");
    assert_eq!(u16_at(&image, opt + 68), 3, "console subsystem");

    // Section table names.
    let sections = opt + 0xf0;
    assert_eq!(&image[sections..sections + 5], b".text");
    assert_eq!(&image[sections + 40..sections + 46], b".rdata");
    assert_eq!(&image[sections + 80..sections + 85], b".data");
}

#[test]
fn pe_import_directory_lists_all_eight_kernel32_symbols() {
    let image = build(Target::Windows, THREADED);

    // The import directory data directory entry is populated.
    let opt = 0x80 + 24;
    let import_rva = u32_at(&image, opt + 112 + 8);
    let iat_rva = u32_at(&image, opt + 112 + 12 * 8);
    assert_ne!(import_rva, 0);
    assert_ne!(iat_rva, 0);
    assert_eq!(u32_at(&image, opt + 112 + 12 * 8 + 4), 8 * 9, "IAT size");

    for symbol in [
        "ExitProcess",
        "GetStdHandle",
        "WriteFile",
        "ReadFile",
        "ReadConsoleA",
        "CreateThread",
        "WaitForSingleObject",
        "CloseHandle",
    ] {
        assert!(
            contains(&image, symbol.as_bytes()),
            "missing import {symbol}"
        );
    }
    assert!(contains(&image, b"kernel32.dll\0"));
}

#[test]
fn pe_rdata_carries_the_string_literals() {
    let image = build(Target::Windows, HELLO);
    assert!(contains(&image, b"OK\n\0"));
}

#[test]
fn elf_headers_are_well_formed() {
    let image = build(Target::Linux, HELLO);

    assert_eq!(&image[..4], &[0x7f, b'E', b'L', b'F']);
    assert_eq!(image[4], 2, "64-bit");
    assert_eq!(image[5], 1, "little endian");
    assert_eq!(u16_at(&image, 16), 2, "ET_EXEC");
    assert_eq!(u16_at(&image, 18), 0x3e, "x86-64");
    // Entry points at the first byte after the headers.
    assert_eq!(u64_at(&image, 24), 0x40_0078);
    assert_eq!(u16_at(&image, 56), 1, "one program header");

    // PT_LOAD, RWX, whole file.
    assert_eq!(u32_at(&image, 64), 1);
    assert_eq!(u32_at(&image, 68), 7);
    assert_eq!(u64_at(&image, 72), 0, "file offset");
    assert_eq!(u64_at(&image, 80), 0x40_0000, "vaddr");
    assert_eq!(u64_at(&image, 96) as usize, image.len(), "file size");
}

#[test]
fn elf_has_no_import_machinery() {
    let image = build(Target::Linux, THREADED);
    assert!(!contains(&image, b"kernel32"));
    assert!(!contains(&image, b"WriteFile"));
}

#[test]
fn large_array_allocations_size_the_frame_from_both_count_bytes() {
    // ARRAY_ALLOC carries its slot count as a little-endian u16 split
    // across the first two operand bytes; 300 slots only reserve the
    // right frame if the high byte is honored.
    let mut m = Manifest::new("misa64");
    let main = m.fresh_label("main");
    let big = m.fresh_label("fn_big");
    m.place_label(main);
    m.push_instr(op::call(big));
    m.push_instr(op::halt());
    m.place_label(big);
    m.push_instr(op::array_alloc(2, 300));
    m.push_instr(op::ret());

    let image = NativeCompiler::new(Target::Linux).compile(&m).unwrap();

    // slots = 2 + 300, frame = 0x50 + 8·302 rounded to ≡ 8 (mod 16).
    let frame: u32 = 0x9c8;
    let mut sub = vec![0x48, 0x81, 0xec];
    sub.extend_from_slice(&frame.to_le_bytes());
    let mut add = vec![0x48, 0x81, 0xc4];
    add.extend_from_slice(&frame.to_le_bytes());
    assert!(contains(&image, &sub), "prologue reserves 0x{frame:x}");
    assert!(contains(&image, &add), "epilogue releases 0x{frame:x}");
}

#[test]
fn both_targets_accept_the_whole_feature_surface() {
    let source = r#"
        shared total: int = 0;
        shared mean: float = 0.5;

        fn add(a: int, b: int) -> int { return a + b; }

        fn worker() -> int {
            atomic.add(total, 2);
            atomic.add(mean, 0.25);
            return 0;
        }

        fn main() -> int {
            let t: thread = spawn worker;
            join t;
            let xs: array<int> = [1, 2, 3];
            xs[1] = add(xs[0], xs[2]);
            let f: float = 2.5;
            let half = f / 2.0;
            print(half);
            print(xs[1]);
            print("done\n");
            let n = input();
            if n > 0 && half < 2.0 {
                return n % 7;
            }
            for i in 1..4 step 1 {
                atomic.store(total, i << 1);
            }
            return atomic.load(total);
        }
    "#;
    for target in [Target::Windows, Target::Linux] {
        let image = build(target, source);
        assert!(!image.is_empty());
    }
}
