use criterion::{Criterion, black_box, criterion_group, criterion_main};

use calckern::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Large random expression over `x` and `y`. Randomness is seeded for determinism.
fn build_complex_expr(env: &mut Environment) -> Expr {
    let x = env.resolve("x", false);
    let y = env.resolve("y", false);
    let mut rng = ChaCha20Rng::seed_from_u64(0x42);

    fn next_create(budget: usize, rng: &mut ChaCha20Rng, x: Addr, y: Addr) -> Expr {
        if budget == 0 || rng.random_bool(0.2) {
            // Select a leaf uniformly
            return match rng.random_range(0..=2) {
                0 => Expr::var(x),
                1 => Expr::var(y),
                _ => Expr::constant(rng.random_range(0.5..2.0)),
            };
        }

        match rng.random_range(0..=6) {
            0 => next_create(budget - 1, rng, x, y) + next_create(budget - 1, rng, x, y),
            1 => next_create(budget - 1, rng, x, y) * next_create(budget - 1, rng, x, y),
            2 => next_create(budget - 1, rng, x, y) / next_create(budget - 1, rng, x, y),
            3 => Expr::unary(Opcode::Sin, next_create(budget - 1, rng, x, y)),
            4 => Expr::unary(Opcode::Exp, next_create(budget - 1, rng, x, y)),
            5 => next_create(budget - 1, rng, x, y).pow(Expr::constant(2.0)),
            6 => {
                let cond = Expr::binary(Opcode::Gt, Expr::var(x), Expr::var(y));
                let then = next_create(budget - 1, rng, x, y);
                let otherwise = next_create(budget - 1, rng, x, y);
                Expr::branch(cond, then, otherwise)
            }
            _ => unreachable!(),
        }
    }

    next_create(10, &mut rng, x, y)
}

fn bench_evaluate(c: &mut Criterion) {
    let mut env = Environment::new();
    let simple = parse(&mut env, "x^2 + 3 * x - 2").unwrap();
    let series = parse(&mut env, "sum(i, 0, 100, x^i / factorial(i))").unwrap();
    let complex = build_complex_expr(&mut env);
    env.set("x", 0.75);
    env.set("y", 1.25);

    c.bench_function("evaluate_simple", |b| {
        b.iter(|| black_box(simple.eval(&mut env)));
    });

    c.bench_function("evaluate_series", |b| {
        b.iter(|| black_box(series.eval(&mut env)));
    });

    c.bench_function("evaluate_complex", |b| {
        b.iter(|| black_box(complex.eval(&mut env)));
    });
}

fn bench_differentiate(c: &mut Criterion) {
    let mut env = Environment::new();
    let simple = parse(&mut env, "sin(x) * exp(x^2) / (1 + x^2)").unwrap();
    let complex = build_complex_expr(&mut env);
    let x = env.resolve("x", true);

    c.bench_function("diff_simple", |b| {
        b.iter(|| black_box(simple.diff(x, &env)));
    });

    c.bench_function("diff_complex", |b| {
        b.iter(|| black_box(complex.diff(x, &env)));
    });
}

fn bench_optimize(c: &mut Criterion) {
    let mut env = Environment::new();
    let complex = build_complex_expr(&mut env);
    let x = env.resolve("x", true);
    let derivative = complex.diff(x, &env);

    c.bench_function("optimize_complex", |b| {
        b.iter(|| black_box(complex.optimized(&env)));
    });

    c.bench_function("optimize_derivative", |b| {
        b.iter(|| black_box(derivative.optimized(&env)));
    });
}

fn bench_parse(c: &mut Criterion) {
    let src = "if(x >= 1 && y != 2, sum(i, 1, 10, sin(x * i) / i), max(x, y)^2 - log(x, 3))";
    let mut env = Environment::new();

    c.bench_function("parse_medium", |b| {
        b.iter(|| black_box(parse(&mut env, src).unwrap()));
    });
}

fn bench_newton(c: &mut Criterion) {
    let mut env = Environment::new();
    let f = parse(&mut env, "cos(x) - x^3").unwrap();
    let x = env.resolve("x", true);
    let df = f.diff(x, &env);
    let config = NewtonConfig::default();

    c.bench_function("newton_cos_cubic", |b| {
        b.iter(|| black_box(f.newton_with_derivative(&df, x, 0.5, &config, &mut env)));
    });
}

criterion_group!(
    benches,
    bench_evaluate,
    bench_differentiate,
    bench_optimize,
    bench_parse,
    bench_newton,
);
criterion_main!(benches);
