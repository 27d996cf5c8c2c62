use aurora_compiler::error::CompileError;
use aurora_compiler::parser::parse;
use aurora_compiler::validate::check;

use rstest::rstest;

fn check_source(source: &str) -> Result<(), CompileError> {
    check(&parse(source).unwrap())
}

fn type_error(source: &str) -> String {
    match check_source(source) {
        Err(CompileError::Type { message, .. }) => message,
        other => panic!("expected a type error, got {other:?}"),
    }
}

#[test]
fn a_well_typed_program_passes() {
    check_source(
        r#"
        shared total: int = 0;
        shared mean: float = 0.0;

        fn add(a: int, b: int) -> int { return a + b; }

        fn worker() -> int {
            atomic.add(total, 1);
            return 0;
        }

        fn main() -> int {
            let t: thread = spawn worker;
            join t;
            let xs: array<int> = [1, 2, 3];
            xs[0] = add(xs[1], xs[2]);
            let f = 2.0;
            let halved = f / 2.0;
            let rounded = halved as int;
            let back = rounded as float;
            print(back);
            print("done\n");
            if atomic.load(total) == 1 && !(1 > 2) {
                return 0;
            }
            return 1;
        }
        "#,
    )
    .unwrap();
}

#[rstest]
#[case("fn main() { let x = y; }", "undefined variable `y`")]
#[case("fn main() { y = 1; }", "assignment to undefined variable `y`")]
#[case("fn f() {} fn main() { }", "")]
fn scope_errors(#[case] source: &str, #[case] needle: &str) {
    if needle.is_empty() {
        check_source(source).unwrap();
    } else {
        assert!(type_error(source).contains(needle));
    }
}

#[test]
fn missing_main_is_rejected() {
    assert!(type_error("fn helper() { }").contains("no `main`"));
}

#[test]
fn main_signature_is_constrained() {
    assert!(type_error("fn main(a: int) { }").contains("no parameters"));
    assert!(type_error("fn main() -> float { return 1.0; }").contains("int or nothing"));
}

#[rstest]
#[case("fn main() { let x = 1 + 1.5; }", "operand types differ")]
#[case("fn main() { let x = 1.5 % 2.0; }", "`%` needs int operands")]
#[case("fn main() { let x = true + false; }", "arithmetic needs int or float")]
#[case("fn main() { let x = 1.5 & 2.0; }", "bitwise operator needs int")]
#[case("fn main() { let x = 1 && 2; }", "logical operator needs bool")]
#[case("fn main() { let x = \"a\" < \"b\"; }", "cannot order")]
#[case("fn main() { if 1 { } }", "condition must be bool")]
#[case("fn main() { while 1 + 1 { } }", "condition must be bool")]
fn operator_typing(#[case] source: &str, #[case] needle: &str) {
    if needle.is_empty() {
        check_source(source).unwrap();
    } else {
        assert!(type_error(source).contains(needle), "{source}");
    }
}

#[rstest]
#[case("fn main() { let x: float = 1; }", "declared float")]
#[case("fn main() { let x = 1; x = 2.0; }", "cannot assign float")]
#[case("fn main() { let b = true as int; }", "`as` cannot convert")]
#[case("fn main() { let f = 1.0 as float; }", "`as` cannot convert")]
fn conversions_are_explicit_and_closed(#[case] source: &str, #[case] needle: &str) {
    assert!(type_error(source).contains(needle), "{source}");
}

#[test]
fn return_types_must_match() {
    assert!(type_error("fn f() -> int { return 1.0; } fn main() { }")
        .contains("returning float"));
    assert!(type_error("fn f() -> int { return; } fn main() { }")
        .contains("must return int"));
    assert!(type_error("fn f() { return 1; } fn main() { }")
        .contains("no return type"));
}

#[test]
fn spawn_targets_an_arity_zero_function() {
    assert!(
        type_error("fn f(a: int) -> int { return a; } fn main() { let t: thread = spawn f; }")
            .contains("must take no arguments")
    );
    assert!(type_error("fn main() { let t: thread = spawn nope; }")
        .contains("undefined function"));
}

#[test]
fn atomics_require_shared_targets() {
    assert!(type_error("fn main() { let x = 1; atomic.add(x, 1); }")
        .contains("not a shared variable"));
    assert!(type_error(
        "shared f: float = 0.0; fn main() { atomic.add(f, 1); }"
    )
    .contains("atomic operand is int"));
}

#[test]
fn shared_declarations_are_literal_initialized() {
    assert!(type_error("shared n: int = 1 + 1; fn main() { }")
        .contains("must be a literal"));
    assert!(type_error("shared s: string = \"x\"; fn main() { }")
        .contains("must be int or float"));
    check_source("shared n: int = -5; shared f: float = -0.5; fn main() { }").unwrap();
}

#[test]
fn arrays_are_int_or_bool_and_indexed_by_int() {
    assert!(type_error("fn main() { let xs: array<int> = [1.0]; }")
        .contains("array elements must be int or bool"));
    assert!(type_error("fn main() { let xs: array<int> = [1, true]; }")
        .contains("mixed element types"));
    assert!(type_error("fn main() { let xs: array<int> = [1]; let x = xs[1.0]; }")
        .contains("index must be int"));
    assert!(type_error("fn main() { let xs: array<int> = [1]; xs = [2]; }")
        .contains("element-wise"));
    check_source("fn main() { let bs: array<bool> = [true, false]; bs[0] = false; }").unwrap();
}

#[test]
fn break_and_continue_need_a_loop() {
    assert!(type_error("fn main() { break; }").contains("outside of a loop"));
    assert!(type_error("fn main() { continue; }").contains("outside of a loop"));
    check_source("fn main() { while true { break; } for i in 0..3 { continue; } }").unwrap();
}

#[test]
fn join_needs_a_thread_handle() {
    assert!(type_error("fn main() { join 3; }").contains("thread handle"));
}

#[test]
fn print_accepts_int_float_string_only() {
    assert!(
        type_error("fn w() -> int { return 0; } fn main() { let t: thread = spawn w; print(t); }")
            .contains("cannot print")
    );
}

#[test]
fn void_calls_are_statements_only() {
    assert!(type_error("fn f() { } fn main() { let x = f(); }")
        .contains("no return value"));
    check_source("fn f() { } fn main() { f(); }").unwrap();
}

#[test]
fn call_arity_and_types_are_checked() {
    assert!(type_error("fn f(a: int) -> int { return a; } fn main() { let x = f(); }")
        .contains("takes 1 arguments"));
    assert!(
        type_error("fn f(a: int) -> int { return a; } fn main() { let x = f(1.0); }")
            .contains("expected int")
    );
}

#[test]
fn shadowing_in_nested_scopes_is_allowed() {
    check_source(
        "fn main() { let x = 1; if x == 1 { let x = 2.0; print(x); } print(x); }",
    )
    .unwrap();
}
