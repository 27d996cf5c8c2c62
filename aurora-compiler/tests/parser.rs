use aurora_compiler::error::CompileError;
use aurora_compiler::ir::*;
use aurora_compiler::parser::parse;

use rstest::rstest;

fn parse_main_expr(expr: &str) -> Expr {
    let program = parse(&format!("fn main() {{ let v = {expr}; }}")).unwrap();
    match &program.functions[0].body.stmts[0].kind {
        StmtKind::Let { value, .. } => value.clone(),
        other => panic!("expected let, got {other:?}"),
    }
}

fn binop_of(expr: &Expr) -> BinOp {
    match &expr.kind {
        ExprKind::Binary { op, .. } => *op,
        other => panic!("expected binary, got {other:?}"),
    }
}

#[test]
fn module_and_flat_forms_parse_alike() {
    let flat = parse("shared n: int = 0; fn main() -> int { return 0; }").unwrap();
    let modular =
        parse("module demo { shared n: int = 0; fn main() -> int { return 0; } }").unwrap();
    assert_eq!(flat.module, None);
    assert_eq!(modular.module.as_deref(), Some("demo"));
    assert_eq!(flat.shared[0].name, modular.shared[0].name);
    assert_eq!(flat.shared[0].ty, modular.shared[0].ty);
    assert_eq!(flat.functions[0].name, modular.functions[0].name);
    assert_eq!(flat.functions[0].ret, modular.functions[0].ret);
}

#[test]
fn repeated_parses_are_structurally_identical() {
    let source = r#"
        module demo {
            shared total: int = 0;
            fn worker() -> int {
                for i in 0..1000 step 2 {
                    atomic.add(total, i);
                }
                return 0;
            }
            fn main() -> int {
                let t: thread = spawn worker;
                join t;
                let f: float = 1.5;
                print(f);
                if atomic.load(total) > 10 && !false {
                    return 1;
                }
                return 0;
            }
        }
    "#;
    assert_eq!(parse(source).unwrap(), parse(source).unwrap());
}

#[rstest]
#[case("1 + 2 * 3", BinOp::Add)]
#[case("1 * 2 + 3", BinOp::Add)]
#[case("1 < 2 | 3", BinOp::Lt)]
#[case("1 | 2 ^ 3", BinOp::BitOr)]
#[case("1 ^ 2 & 3", BinOp::BitXor)]
#[case("1 & 2 << 3", BinOp::BitAnd)]
#[case("1 << 2 + 3", BinOp::Shl)]
#[case("true && 1 == 2", BinOp::And)]
#[case("false || true && true", BinOp::Or)]
fn precedence_tops_out_at_the_looser_operator(#[case] source: &str, #[case] top: BinOp) {
    assert_eq!(binop_of(&parse_main_expr(source)), top);
}

#[test]
fn left_associativity() {
    // (1 - 2) - 3
    let expr = parse_main_expr("1 - 2 - 3");
    match expr.kind {
        ExprKind::Binary { op: BinOp::Sub, lhs, rhs } => {
            assert!(matches!(lhs.kind, ExprKind::Binary { op: BinOp::Sub, .. }));
            assert!(matches!(rhs.kind, ExprKind::Int(3)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unary_binds_tighter_than_binary() {
    let expr = parse_main_expr("-1 + ~2");
    match expr.kind {
        ExprKind::Binary { op: BinOp::Add, lhs, rhs } => {
            assert!(matches!(lhs.kind, ExprKind::Unary { op: UnOp::Neg, .. }));
            assert!(matches!(rhs.kind, ExprKind::Unary { op: UnOp::BitNot, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn casts_chain_postfix() {
    let expr = parse_main_expr("1 as float as int");
    match expr.kind {
        ExprKind::Cast { ty: Type::Int, expr } => {
            assert!(matches!(expr.kind, ExprKind::Cast { ty: Type::Float, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn assignment_targets() {
    let program = parse("fn main() { x = 1; xs[2] = 3; }").unwrap();
    assert!(matches!(
        program.functions[0].body.stmts[0].kind,
        StmtKind::Assign { .. }
    ));
    assert!(matches!(
        program.functions[0].body.stmts[1].kind,
        StmtKind::ArrayAssign { .. }
    ));
}

#[test]
fn for_loop_with_optional_step() {
    let program = parse("fn main() { for i in 0..10 { } for j in 0..10 step 2 { } }").unwrap();
    match &program.functions[0].body.stmts[0].kind {
        StmtKind::For { step: None, .. } => {}
        other => panic!("unexpected {other:?}"),
    }
    match &program.functions[0].body.stmts[1].kind {
        StmtKind::For { step: Some(_), .. } => {}
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn request_and_shorthand_reduce_to_the_same_node() {
    // Positions differ between the surfaces, the nodes must not.
    fn request_of(source: &str) -> (RequestService, ExprKind) {
        let program = parse(source).unwrap();
        match &program.functions[0].body.stmts[0].kind {
            StmtKind::Request { service, arg } => {
                (*service, arg.as_ref().expect("has an argument").kind.clone())
            }
            other => panic!("expected request, got {other:?}"),
        }
    }
    let a = request_of("fn main() { print(1); }");
    let b = request_of("fn main() { request service print(1); }");
    let c = request_of("fn main() { request print(1); }");
    assert_eq!(a, b);
    assert_eq!(b, c);
}

#[test]
fn atomic_forms() {
    let program = parse(
        "shared n: int = 0;
         fn main() { atomic.add(n, 1); atomic.store(n, 2); let v = atomic.load(n); }",
    )
    .unwrap();
    let stmts = &program.functions[0].body.stmts;
    assert!(matches!(
        stmts[0].kind,
        StmtKind::Atomic { kind: AtomicKind::Add, .. }
    ));
    assert!(matches!(
        stmts[1].kind,
        StmtKind::Atomic { kind: AtomicKind::Store, .. }
    ));
    assert!(matches!(
        stmts[2].kind,
        StmtKind::Let { ref value, .. } if matches!(value.kind, ExprKind::AtomicLoad(_))
    ));
}

#[test]
fn spawn_join_and_array_literals() {
    let program = parse(
        "fn worker() -> int { return 0; }
         fn main() {
             let t: thread = spawn worker;
             let u: thread = spawn(worker);
             join t;
             let xs: array<int> = [1, 2, 3];
             let x = xs[0];
         }",
    )
    .unwrap();
    let stmts = &program.functions[1].body.stmts;
    assert!(matches!(
        stmts[0].kind,
        StmtKind::Let { ref value, .. } if matches!(value.kind, ExprKind::Spawn(_))
    ));
    // `spawn worker` and `spawn(worker)` produce the same node.
    let spawned = |stmt: &Stmt| match &stmt.kind {
        StmtKind::Let { value, .. } => value.kind.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(spawned(&stmts[0]), spawned(&stmts[1]));
    assert!(matches!(stmts[2].kind, StmtKind::Join(_)));
    assert!(matches!(
        stmts[3].kind,
        StmtKind::Let { ref value, .. } if matches!(value.kind, ExprKind::ArrayLit(ref v) if v.len() == 3)
    ));
}

#[test]
fn else_if_chains() {
    let program = parse(
        "fn main() { if 1 == 1 { } else if 2 == 2 { } else { } }",
    )
    .unwrap();
    match &program.functions[0].body.stmts[0].kind {
        StmtKind::If { else_block: Some(else_block), .. } => {
            assert!(matches!(else_block.stmts[0].kind, StmtKind::If { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn parse_errors_carry_positions() {
    let err = parse("fn main( { }").unwrap_err();
    match err {
        CompileError::Parse { line, column, .. } => {
            assert_eq!(line, 1);
            assert!(column >= 10);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn short_circuit_operators_nest_correctly() {
    // `a || b && c` is `a || (b && c)`
    let expr = parse_main_expr("true || false && true");
    match expr.kind {
        ExprKind::Binary { op: BinOp::Or, rhs, .. } => {
            assert_eq!(binop_of(&rhs), BinOp::And);
        }
        other => panic!("unexpected {other:?}"),
    }
}
