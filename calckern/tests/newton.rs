use calckern::config::NewtonConfig;
use calckern::env::Environment;
use calckern::expr::Expr;
use calckern::newton::newton;
use calckern::parser::parse;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[test]
fn finds_square_root() {
    let mut env = Environment::new();
    let f = parse(&mut env, "x^2 - 2").unwrap();
    let x = env.resolve("x", true);
    let root = f.newton(x, 1.0, &NewtonConfig::default(), &mut env);
    assert!((root - 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn finds_fixed_point_of_cosine() {
    let mut env = Environment::new();
    let f = parse(&mut env, "cos(x) - x").unwrap();
    let x = env.resolve("x", true);
    let root = f.newton(x, 0.5, &NewtonConfig::default(), &mut env);
    assert!((root - 0.739_085_133_215_160_6).abs() < 1e-9);
}

#[test]
fn random_cubic_roots() {
    let mut env = Environment::new();
    let f = parse(&mut env, "x^3 - a").unwrap();
    let x = env.resolve("x", true);
    let df = f.diff(x, &env);
    let mut rng = ChaCha20Rng::seed_from_u64(0x42);

    for _ in 0..100 {
        let a = rng.random_range(1.0..100.0);
        env.set("a", a);
        let root = f.newton_with_derivative(&df, x, a, &NewtonConfig::default(), &mut env);
        assert!((root - a.cbrt()).abs() < 1e-8, "cbrt({a}) = {root}");
    }
}

#[test]
fn variable_is_restored_after_search() {
    let mut env = Environment::new();
    let f = parse(&mut env, "x - 3").unwrap();
    let x = env.set("x", 42.0);
    let root = f.newton(x, 0.0, &NewtonConfig::default(), &mut env);
    assert_eq!(root, 3.0);
    assert_eq!(env.get("x"), 42.0);
}

#[test]
fn failures_yield_nan() {
    let mut env = Environment::new();
    let x = env.resolve("x", false);
    let config = NewtonConfig::default();

    // No real root
    let f = parse(&mut env, "x^2 + 1").unwrap();
    assert!(f.newton(x, 0.5, &config, &mut env).is_nan());

    // Vanishing derivative at the start
    let f = parse(&mut env, "x^2 - 1").unwrap();
    assert!(f.newton(x, 0.0, &config, &mut env).is_nan());

    // Undefined function value
    let f = parse(&mut env, "ln(x) - 1").unwrap();
    assert!(f.newton(x, -1.0, &config, &mut env).is_nan());

    // No derivative
    let f = parse(&mut env, "zeta(x) - 2").unwrap();
    assert!(f.newton(x, 2.0, &config, &mut env).is_nan());

    assert!(newton(&Expr::null(), &Expr::null(), x, 1.0, &config, &mut env).is_nan());
}

#[test]
fn iterates_outside_bounds_abort() {
    let mut env = Environment::new();
    let f = parse(&mut env, "x^2 - 2").unwrap();
    let x = env.resolve("x", true);
    let config = NewtonConfig {
        lower_bound: 0.0,
        upper_bound: 10.0,
        ..NewtonConfig::default()
    };
    // First step jumps to 10.05
    assert!(f.newton(x, 0.1, &config, &mut env).is_nan());
    assert!((f.newton(x, 1.0, &config, &mut env) - 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn iteration_cap_is_respected() {
    let mut env = Environment::new();
    let f = parse(&mut env, "x^2 - 2").unwrap();
    let x = env.resolve("x", true);
    let config = NewtonConfig {
        max_iterations: 2,
        ..NewtonConfig::default()
    };
    assert!(f.newton(x, 100.0, &config, &mut env).is_nan());
}
