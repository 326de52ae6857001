use calckern::env::Environment;
use calckern::error::CalcError;
use calckern::expr::Expr;
use calckern::parser::{define_function, parse};

fn roundtrip(src: &str) -> String {
    let mut env = Environment::new();
    let e = parse(&mut env, src).expect("parse should succeed");
    e.repr(&env)
}

#[test]
fn precedence_and_associativity() {
    assert_eq!(roundtrip("x + y * z"), "x + y * z");
    assert_eq!(roundtrip("(x + y) * z"), "(x + y) * z");
    assert_eq!(roundtrip("x - (y - z)"), "x - (y - z)");
    assert_eq!(roundtrip("(x - y) - z"), "x - y - z");
    assert_eq!(roundtrip("x / (y * z)"), "x / (y * z)");
    assert_eq!(roundtrip("x / y * z"), "x / y * z");

    // Power is right associative and binds tighter than prefix minus
    assert_eq!(roundtrip("2^3^4"), "2 ^ 3 ^ 4");
    assert_eq!(roundtrip("(2^3)^4"), "(2 ^ 3) ^ 4");
    assert_eq!(roundtrip("-x^2"), "-x ^ 2");
    assert_eq!(roundtrip("(-x)^2"), "(-x) ^ 2");

    // Logic binds looser than arithmetic
    assert_eq!(roundtrip("x < y == 1"), "x < y == 1");
    assert_eq!(roundtrip("!x && y || z"), "!x && y || z");
    assert_eq!(roundtrip("x && (y || z)"), "x && (y || z)");
    assert_eq!(roundtrip("x % 3"), "x % 3");
}

#[test]
fn literals() {
    assert_eq!(roundtrip("0.5"), "0.5");
    assert_eq!(roundtrip("1e-7"), "1e-7");
    assert_eq!(roundtrip("-3"), "-3");
    assert_eq!(roundtrip("x - -3"), "x - -3");
    assert_eq!(roundtrip("pi"), "3.141592653589793");
    assert_eq!(roundtrip("nan"), "nan");
    assert_eq!(roundtrip("-inf"), "-inf");
}

#[test]
fn calls_and_control() {
    assert_eq!(roundtrip("if(x > 0, x, -x)"), "if(x > 0, x, -x)");
    assert_eq!(roundtrip("sum(i, 1, n, i^2)"), "sum(i, 1, n, i ^ 2)");
    assert_eq!(roundtrip("prod(k, 1, 3, k)"), "prod(k, 1, 3, k)");
    assert_eq!(roundtrip("log(x, 2)"), "log(x, 2)");
    assert_eq!(roundtrip("log(x)"), "log10(x)");
    assert_eq!(roundtrip("max(x, y)"), "max(x, y)");
    assert_eq!(roundtrip("normcdf(x) + lngamma(y)"), "normcdf(x) + lngamma(y)");
}

#[test]
fn printed_form_parses_back_to_the_same_expression() {
    let sources = [
        "x + y * z - 3",
        "-(x + 1) ^ -2",
        "if(x >= 1 && y != 2, sin(x) / cos(y), max(x, y))",
        "sum(i, 1, 10, prod(j, 1, i, j + x))",
        "log(x, 3) + log2(y) % 4",
        "2 ^ x ^ y - -0.25",
        "!(x < 1) || y == 0",
        "1e20 * x + 1.5e-9",
    ];
    for src in sources {
        let mut env = Environment::new();
        let e = parse(&mut env, src).unwrap();
        let printed = e.repr(&env);
        let reparsed = parse(&mut env, &printed).unwrap();
        assert_eq!(reparsed, e, "{src} printed as {printed}");
    }
}

#[test]
fn functions_print_with_their_names() {
    let mut env = Environment::new();
    let f = define_function(&mut env, "f(a, b) = a * b + _0").unwrap();
    let body = &env.function(f).unwrap().body;
    assert_eq!(body.repr(&env), "_0 * _1 + _0");

    let call = parse(&mut env, "f(x, 2) + 1").unwrap();
    assert_eq!(call.repr(&env), "f(x, 2) + 1");
}

#[test]
fn narrow_width_breaks_lines() {
    let mut env = Environment::new();
    let e = parse(&mut env, "max(aaaaaaaaaaaa, bbbbbbbbbbbb)").unwrap();
    assert!(!e.repr(&env).contains('\n'));
    assert!(e.pretty_string(&env, 10).contains('\n'));
}

#[test]
fn null_prints_as_null() {
    let env = Environment::new();
    assert_eq!(Expr::null().repr(&env), "null");
}

#[test]
fn colored_rendering_emits_escape_codes() {
    let mut env = Environment::new();
    let e = parse(&mut env, "sin(x) + 1").unwrap();
    let mut buf = termcolor::Buffer::ansi();
    e.pretty_render_to(&env, 80, &mut buf).unwrap();
    let text = String::from_utf8_lossy(buf.as_slice());
    assert!(text.contains("\x1b["));
    assert!(text.contains("sin"));
}

fn parse_error(src: &str) -> Vec<String> {
    let mut env = Environment::new();
    match parse(&mut env, src) {
        Err(CalcError::Parse(errors)) => errors,
        other => panic!("expected a parse error for `{src}`, got {other:?}"),
    }
}

#[test]
fn syntax_and_lowering_errors() {
    assert!(!parse_error("1 +").is_empty());
    assert!(!parse_error("(x").is_empty());
    assert!(!parse_error("3 $ 4").is_empty());
    assert!(parse_error("foo(1) + bar(2)")[1].contains("unknown function `foo`"));
    assert!(parse_error("sin(1, 2)")[0].contains("expects 1"));
    assert!(parse_error("sum(1, 0, 1, 1)")[0].contains("loop variable"));
    assert!(parse_error("log(1, 2, 3)")[0].contains("log"));
}

#[test]
fn unknown_functions_are_reported_by_name() {
    let mut env = Environment::new();
    match parse(&mut env, "1 + foo(x)") {
        Err(CalcError::UnknownFunction(name)) => assert_eq!(name, "foo"),
        other => panic!("expected an unknown function error, got {other:?}"),
    }
    assert!(matches!(
        define_function(&mut env, "g(a) = h(a)"),
        Err(CalcError::UnknownFunction(_))
    ));
    assert_eq!(env.function_id("g"), None);
}

#[test]
fn definition_errors() {
    let mut env = Environment::new();
    assert!(define_function(&mut env, "sin(x) = x").is_err());
    assert!(define_function(&mut env, "sum(x) = x").is_err());
    assert!(define_function(&mut env, "f(a, a) = a").is_err());
    assert!(define_function(&mut env, "f(a) = sum(a, 1, 2, a)").is_err());
    assert!(define_function(&mut env, "f(a) = _1").is_err());
    assert!(define_function(&mut env, "f(a) a").is_err());
    // Failed fresh definitions leave nothing registered
    assert_eq!(env.function_id("f"), None);
}

#[test]
fn failed_redefinition_keeps_previous_body() {
    let mut env = Environment::new();
    let f = define_function(&mut env, "f(a) = 2 * a").unwrap();
    assert!(define_function(&mut env, "f(a) = nope(a)").is_err());
    assert_eq!(env.function_id("f"), Some(f));

    let call = parse(&mut env, "f(3)").unwrap();
    assert_eq!(call.eval(&mut env), 6.0);
}

#[test]
fn parameters_do_not_allocate_variables() {
    let mut env = Environment::new();
    define_function(&mut env, "f(a, b) = a + b + c").unwrap();
    assert!(!env.is_set("a"));
    assert!(!env.is_set("b"));
    assert!(env.is_set("c"));
}
