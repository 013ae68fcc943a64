//! Parser tests: AST shapes, desugarings and failure modes

use ape_runtime::ast::{Expr, ExprKind, InfixOp, LogicalOp, PrefixOp, StmtKind};
use ape_runtime::error::ErrorKind;
use ape_runtime::parser::parse;

fn parse_expr(input: &str) -> Expr {
    let program = parse(input).unwrap_or_else(|err| panic!("parse failed for {:?}: {}", input, err));
    assert_eq!(program.len(), 1, "{:?}", input);
    match program.into_iter().next().map(|s| s.kind) {
        Some(StmtKind::Expression(expr)) => expr,
        other => panic!("expected expression statement for {:?}, got {:?}", input, other),
    }
}

/// Render an expression back to a parenthesized form for precedence checks
fn render(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Ident(name) => name.clone(),
        ExprKind::NumberLit(n) => format!("{}", n),
        ExprKind::StringLit(s) => format!("{:?}", s),
        ExprKind::BoolLit(b) => format!("{}", b),
        ExprKind::NullLit => "null".to_string(),
        ExprKind::Prefix { op, right } => {
            let op = match op {
                PrefixOp::Minus => "-",
                PrefixOp::Bang => "!",
            };
            format!("({}{})", op, render(right))
        }
        ExprKind::Infix { op, left, right } => {
            format!("({} {} {})", render(left), op, render(right))
        }
        ExprKind::Logical { op, left, right } => {
            let op = match op {
                LogicalOp::And => "&&",
                LogicalOp::Or => "||",
            };
            format!("({} {} {})", render(left), op, render(right))
        }
        ExprKind::Index { left, index } => format!("({}[{}])", render(left), render(index)),
        ExprKind::Call { function, args } => {
            let args: Vec<String> = args.iter().map(render).collect();
            format!("{}({})", render(function), args.join(", "))
        }
        ExprKind::Assign { target, value } => {
            format!("({} = {})", render(target), render(value))
        }
        ExprKind::ArrayLit(elements) => {
            let elements: Vec<String> = elements.iter().map(render).collect();
            format!("[{}]", elements.join(", "))
        }
        ExprKind::MapLit(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", render(k), render(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        ExprKind::FnLit(fn_lit) => {
            let params: Vec<&str> = fn_lit.params.iter().map(|p| p.name.as_str()).collect();
            format!("fn({})", params.join(", "))
        }
    }
}

fn expect_rendered(input: &str, want: &str) {
    let expr = parse_expr(input);
    assert_eq!(render(&expr), want, "input: {}", input);
}

#[test]
fn test_operator_precedence() {
    let cases = [
        ("-a * b", "((-a) * b)"),
        ("!-a", "(!(-a))"),
        ("a + b + c", "((a + b) + c)"),
        ("a + b - c", "((a + b) - c)"),
        ("a * b * c", "((a * b) * c)"),
        ("a * b / c", "((a * b) / c)"),
        ("a + b / c", "(a + (b / c))"),
        ("a + b * c + d / e - f", "(((a + (b * c)) + (d / e)) - f)"),
        ("5 > 4 == 3 < 4", "((5 > 4) == (3 < 4))"),
        ("5 < 4 != 3 > 4", "((5 < 4) != (3 > 4))"),
        ("3 + 4 * 5 == 3 * 1 + 4 * 5", "((3 + (4 * 5)) == ((3 * 1) + (4 * 5)))"),
        ("true == true && false == false", "((true == true) && (false == false))"),
        ("a || b && c", "(a || (b && c))"),
        ("1 + (2 + 3) + 4", "((1 + (2 + 3)) + 4)"),
        ("(5 + 5) * 2", "((5 + 5) * 2)"),
        ("2 / (5 + 5)", "(2 / (5 + 5))"),
        ("-(5 + 5)", "(-(5 + 5))"),
        ("!(true == true)", "(!(true == true))"),
        ("a + add(b * c) + d", "((a + add((b * c))) + d)"),
        ("a * [1, 2][1]", "(a * ([1, 2][1]))"),
        ("x = y = z", "(x = (y = z))"),
        ("x += y * 2", "(x = (x + (y * 2)))"),
        ("a.b.c", "((a[\"b\"])[\"c\"])"),
        ("a.b(c)", "(a[\"b\"])(c)"),
        ("m.x -= 1", "((m[\"x\"]) = ((m[\"x\"]) - 1))"),
    ];
    for (input, want) in cases {
        expect_rendered(input, want);
    }
}

#[test]
fn test_call_argument_parsing() {
    let expr = parse_expr("add(1, 2 * 3, 4 + 5)");
    match expr.kind {
        ExprKind::Call { args, .. } => {
            assert_eq!(args.len(), 3);
            assert_eq!(render(&args[1]), "(2 * 3)");
            assert_eq!(render(&args[2]), "(4 + 5)");
        }
        other => panic!("expected call, got {:?}", other),
    }
}

#[test]
fn test_literals() {
    assert!(matches!(parse_expr("5").kind, ExprKind::NumberLit(n) if n == 5.0));
    assert!(matches!(parse_expr("0xFF").kind, ExprKind::NumberLit(n) if n == 255.0));
    assert!(matches!(parse_expr("1.25").kind, ExprKind::NumberLit(n) if n == 1.25));
    assert!(matches!(parse_expr("true").kind, ExprKind::BoolLit(true)));
    assert!(matches!(parse_expr("null").kind, ExprKind::NullLit));
    assert!(
        matches!(parse_expr("\"a\\nb\"").kind, ExprKind::StringLit(s) if s == "a\nb")
    );
}

#[test]
fn test_array_and_map_literals() {
    expect_rendered("[1, 2 * 2, 3 + 3]", "[1, (2 * 2), (3 + 3)]");
    expect_rendered("{\"one\": 1, two: 2, 3: 3}", "{\"one\": 1, \"two\": 2, 3: 3}");
    expect_rendered("[]", "[]");
    expect_rendered("{}", "{}");
    // trailing commas
    expect_rendered("[1, 2,]", "[1, 2]");
    expect_rendered("{a: 1,}", "{\"a\": 1}");
}

#[test]
fn test_function_literals() {
    let expr = parse_expr("fn(x, y) { return x + y; }");
    match expr.kind {
        ExprKind::FnLit(fn_lit) => {
            assert!(fn_lit.name.is_none());
            assert_eq!(fn_lit.params.len(), 2);
            assert_eq!(fn_lit.params[0].name, "x");
            assert_eq!(fn_lit.body.statements.len(), 1);
            assert!(matches!(fn_lit.body.statements[0].kind, StmtKind::Return(Some(_))));
        }
        other => panic!("expected fn literal, got {:?}", other),
    }
}

#[test]
fn test_named_function_from_const_define() {
    let program = parse("const inc = fn(x) { return x + 1; }").unwrap();
    match &program[0].kind {
        StmtKind::Define { value, .. } => match &value.kind {
            ExprKind::FnLit(fn_lit) => assert_eq!(fn_lit.name.as_deref(), Some("inc")),
            other => panic!("expected fn literal, got {:?}", other),
        },
        other => panic!("expected define, got {:?}", other),
    }
}

#[test]
fn test_statement_forms() {
    let program = parse(
        "var x = 1; \
         const y = 2; \
         if (x) { } else { } \
         while (x) { break; continue; } \
         for (var i = 0; i < 3; i++) { } \
         for (item in [1]) { } \
         return; \
         { var z = 3; } \
         fn named() { recover (e) { return e } }",
    )
    .unwrap();
    let kinds: Vec<&StmtKind> = program.iter().map(|s| &s.kind).collect();
    assert!(matches!(kinds[0], StmtKind::Define { assignable: true, .. }));
    assert!(matches!(kinds[1], StmtKind::Define { assignable: false, .. }));
    assert!(matches!(kinds[2], StmtKind::If { .. }));
    assert!(matches!(kinds[3], StmtKind::While { .. }));
    assert!(matches!(kinds[4], StmtKind::For { .. }));
    assert!(matches!(kinds[5], StmtKind::Foreach { .. }));
    assert!(matches!(kinds[6], StmtKind::Return(None)));
    assert!(matches!(kinds[7], StmtKind::Block(_)));
    assert!(matches!(kinds[8], StmtKind::Define { .. }));
}

#[test]
fn test_parse_errors() {
    let cases = [
        "const x =",
        "const = 1",
        "if (true { }",
        "if true) { }",
        "fn (",
        "fn f(a, { }",
        "{ unclosed",
        "[1, 2",
        "a.",
        "1 +",
        "for (x 1) { }",
        "5 = 3",
    ];
    for input in cases {
        let err = parse(input).expect_err(input);
        assert_eq!(err.kind, ErrorKind::Parse, "{:?}", input);
    }
}

#[test]
fn test_postfix_and_compound_desugar_to_plain_assignment() {
    expect_rendered("i++", "(i = (i + 1))");
    expect_rendered("i--", "(i = (i - 1))");
    expect_rendered("x *= 2", "(x = (x * 2))");
    expect_rendered("x /= 2", "(x = (x / 2))");
    expect_rendered("x %= 2", "(x = (x % 2))");
    expect_rendered("a[0] += 1", "((a[0]) = ((a[0]) + 1))");
}

#[test]
fn test_less_than_is_not_rewritten_by_the_parser() {
    // The compiler, not the parser, swaps `<` into `>`
    expect_rendered("a < b", "(a < b)");
    expect_rendered("a <= b", "(a <= b)");
}
