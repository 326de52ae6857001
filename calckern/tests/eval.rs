use calckern::env::{Environment, FuncId};
use calckern::eval::IntegerRange;
use calckern::expr::Expr;
use calckern::parser::{define_function, parse};

fn eval(env: &mut Environment, src: &str) -> f64 {
    let e = parse(env, src).expect("parse should succeed");
    e.eval(env)
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * (1.0 + b.abs())
}

#[test]
fn arithmetic_and_precedence() {
    let mut env = Environment::new();
    assert_eq!(eval(&mut env, "1 + 2 * 3"), 7.0);
    assert_eq!(eval(&mut env, "(1 + 2) * 3"), 9.0);
    assert_eq!(eval(&mut env, "2^3^2"), 512.0);
    assert_eq!(eval(&mut env, "-2^2"), -4.0);
    assert_eq!(eval(&mut env, "10 - 4 - 3"), 3.0);
    assert_eq!(eval(&mut env, "2^-1"), 0.5);
}

#[test]
fn modulus_is_floored() {
    let mut env = Environment::new();
    assert_eq!(eval(&mut env, "7 % 3"), 1.0);
    assert_eq!(eval(&mut env, "7 % -3"), -2.0);
    assert_eq!(eval(&mut env, "-7 % 3"), 2.0);
}

#[test]
fn comparisons_and_booleans() {
    let mut env = Environment::new();
    assert_eq!(eval(&mut env, "1 < 2"), 1.0);
    assert_eq!(eval(&mut env, "2 <= 1"), 0.0);
    assert_eq!(eval(&mut env, "3 == 3 && 2 != 2"), 0.0);
    assert_eq!(eval(&mut env, "0 || 5"), 1.0);
    assert_eq!(eval(&mut env, "!0"), 1.0);
    assert_eq!(eval(&mut env, "!7"), 0.0);
}

#[test]
fn nan_propagates_through_logic() {
    let mut env = Environment::new();
    assert!(eval(&mut env, "nan < 1").is_nan());
    assert!(eval(&mut env, "nan == nan").is_nan());
    assert!(eval(&mut env, "nan && 0").is_nan());
    assert!(eval(&mut env, "!nan").is_nan());
    assert!(eval(&mut env, "if(nan, 1, 2)").is_nan());
    assert!(eval(&mut env, "max(nan, 1)").is_nan());
    assert!(eval(&mut env, "min(1, nan)").is_nan());
    // Unset variables are NaN
    assert!(eval(&mut env, "unset + 1").is_nan());
}

#[test]
fn builtin_functions() {
    let mut env = Environment::new();
    assert_eq!(eval(&mut env, "sign(0)"), 0.0);
    assert_eq!(eval(&mut env, "sign(-3)"), -1.0);
    assert_eq!(eval(&mut env, "max(2, 5)"), 5.0);
    assert_eq!(eval(&mut env, "min(2, 5)"), 2.0);
    assert_eq!(eval(&mut env, "factorial(5)"), 120.0);
    assert_eq!(eval(&mut env, "choose(5, 2)"), 10.0);
    assert_eq!(eval(&mut env, "choose(2, 5)"), 0.0);
    assert_eq!(eval(&mut env, "floor(-1.5) + ceil(1.2) + round(2.6)"), 3.0);
    assert!(approx(eval(&mut env, "gamma(5)"), 24.0));
    assert!(approx(eval(&mut env, "log(8, 2)"), 3.0));
    assert!(approx(eval(&mut env, "log(1000)"), 3.0));
    assert!(approx(eval(&mut env, "normcdf(0)"), 0.5));
    assert!(approx(eval(&mut env, "erf(0)"), 0.0));
    assert!(approx(
        eval(&mut env, "zeta(2)"),
        std::f64::consts::PI.powi(2) / 6.0
    ));
    assert!(eval(&mut env, "gamma(-2)").is_nan());
    assert!(eval(&mut env, "ln(-1)").is_nan());
}

#[test]
fn untaken_branch_is_never_evaluated() {
    let mut env = Environment::new();
    // The recursion only terminates because the else branch is skipped at n <= 0
    define_function(&mut env, "tri(n) = if(n <= 0, 0, n + tri(n - 1))").unwrap();
    assert_eq!(eval(&mut env, "tri(10)"), 55.0);

    define_function(&mut env, "fact(n) = if(n <= 1, 1, n * fact(n - 1))").unwrap();
    assert_eq!(eval(&mut env, "fact(5)"), 120.0);

    assert_eq!(eval(&mut env, "if(1, 2, ln(-1))"), 2.0);
    assert_eq!(eval(&mut env, "if(0, ln(-1), 3)"), 3.0);

    // A loop this long would never finish if the branch ran
    env.set("i", 7.0);
    assert_eq!(eval(&mut env, "if(0, sum(i, 1, 1e15, i), i)"), 7.0);
    assert_eq!(eval(&mut env, "if(i > 0, i, prod(i, 1, 1e15, i))"), 7.0);
    assert_eq!(env.get("i"), 7.0);
}

#[test]
fn sums_and_products() {
    let mut env = Environment::new();
    let e = parse(&mut env, "sum(i, 0, a, a * i^2)").unwrap();
    env.set("a", 3.0);
    assert_eq!(e.eval(&mut env), 42.0);

    assert_eq!(eval(&mut env, "prod(i, 1, 3, i)"), 6.0);
    assert_eq!(eval(&mut env, "prod(k, 1, 5, k)"), 120.0);
    // Reversed bounds walk downwards
    assert_eq!(eval(&mut env, "sum(i, 3, 1, i)"), 6.0);
    // No integer inside the range
    assert_eq!(eval(&mut env, "sum(i, 0.5, 0.7, i)"), 0.0);
    assert_eq!(eval(&mut env, "prod(i, 0.5, 0.7, i)"), 1.0);
    // Fractional bounds are rounded inwards
    assert_eq!(eval(&mut env, "sum(i, 0.5, 3.5, i)"), 6.0);
    assert!(eval(&mut env, "sum(i, 0, inf, i)").is_nan());
    assert!(eval(&mut env, "sum(i, nan, 3, i)").is_nan());
}

#[test]
fn loop_bounds_outside_the_integer_range_are_nan() {
    let mut env = Environment::new();
    assert!(eval(&mut env, "sum(i, -1e19, 1e19, 0)").is_nan());
    assert!(eval(&mut env, "prod(i, 1e19, -1e19, 1)").is_nan());
    assert!(eval(&mut env, "sum(i, 0, 1e300, i)").is_nan());
}

#[test]
fn loop_variable_is_restored() {
    let mut env = Environment::new();
    env.set("i", 7.0);
    assert_eq!(eval(&mut env, "sum(i, 1, 3, i)"), 6.0);
    assert_eq!(env.get("i"), 7.0);

    // Inner loop shadows the outer one
    assert_eq!(eval(&mut env, "sum(i, 1, 2, sum(i, 1, 3, i))"), 12.0);
    assert_eq!(eval(&mut env, "sum(i, 1, 2, sum(j, 1, 3, i * j))"), 18.0);
    assert_eq!(env.get("i"), 7.0);
}

#[test]
fn function_calls() {
    let mut env = Environment::new();
    define_function(&mut env, "f(a, b) = a * b + c").unwrap();
    env.set("c", 1.0);
    assert_eq!(eval(&mut env, "f(2, 3)"), 7.0);
    assert_eq!(eval(&mut env, "f(f(1, 1), 2)"), 5.0);

    define_function(&mut env, "g(a, b) = _0 - _1").unwrap();
    assert_eq!(eval(&mut env, "g(5, 2)"), 3.0);

    // Arguments do not leak into the environment
    assert!(!env.is_set("a"));
    assert!(!env.is_set("b"));
}

#[test]
fn broken_calls_evaluate_to_nan() {
    let mut env = Environment::new();
    let f = env.define_function("f", 2, Expr::arg(0) + Expr::arg(1));
    let wrong_arity = Expr::call(f, [Expr::constant(1.0)]);
    assert!(wrong_arity.eval(&mut env).is_nan());

    let unknown = Expr::call(FuncId(42), []);
    assert!(unknown.eval(&mut env).is_nan());

    assert!(Expr::null().eval(&mut env).is_nan());
}

#[test]
fn integer_range_counts() {
    let up: Vec<i64> = IntegerRange::new(-1.5, 2.5).unwrap().collect();
    assert_eq!(up, vec![-1, 0, 1, 2]);

    let down: Vec<i64> = IntegerRange::new(2.0, -1.0).unwrap().collect();
    assert_eq!(down, vec![2, 1, 0, -1]);

    let single = IntegerRange::new(3.0, 3.0).unwrap();
    assert_eq!(single.count_remaining(), 1);

    assert_eq!(IntegerRange::new(0.2, 0.8).unwrap().count_remaining(), 0);
    assert!(IntegerRange::new(f64::NAN, 1.0).is_none());
    assert!(IntegerRange::new(0.0, f64::INFINITY).is_none());
}

#[test]
fn integer_range_handles_extreme_bounds() {
    // Wider than i64 can express as a difference, still countable in u64
    let wide = IntegerRange::new(-5e18, 5e18).unwrap();
    assert_eq!(wide.count_remaining(), 10_000_000_000_000_000_001);
    let wide_down = IntegerRange::new(5e18, -5e18).unwrap();
    assert_eq!(wide_down.count_remaining(), 10_000_000_000_000_000_001);

    let mut edge = IntegerRange::new(-9_223_372_036_854_775_808.0, -9.223372036854775e18).unwrap();
    assert_eq!(edge.next(), Some(i64::MIN));

    assert!(IntegerRange::new(-1e19, 1e19).is_none());
    assert!(IntegerRange::new(0.0, 9.3e18).is_none());
    assert!(IntegerRange::new(-9.3e18, 0.0).is_none());
}
