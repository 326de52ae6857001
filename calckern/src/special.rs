//! Special functions backing the numeric opcodes.
//!
//! Gamma, digamma and the error functions come from `statrs`. The polygamma functions of higher
//! order and the Riemann zeta function are computed here. Poles evaluate to NaN rather than to an
//! infinity so that undefined points propagate uniformly through the evaluator.
use std::f64::consts::{FRAC_1_SQRT_2, PI};

use statrs::function::erf;
use statrs::function::gamma as sgamma;

/// `1 / sqrt(2 pi)`
const FRAC_1_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Shift point above which the asymptotic polygamma expansions are used.
const POLYGAMMA_ASYMPTOTIC: f64 = 10.0;

#[inline]
fn is_non_positive_integer(x: f64) -> bool {
    x <= 0.0 && x == x.floor()
}

pub fn gamma(x: f64) -> f64 {
    if x.is_nan() || is_non_positive_integer(x) {
        return f64::NAN;
    }
    sgamma::gamma(x)
}

/// `ln(gamma(x))`, NaN where gamma is negative.
pub fn ln_gamma(x: f64) -> f64 {
    if x.is_nan() || is_non_positive_integer(x) {
        return f64::NAN;
    }
    if x > 0.0 {
        sgamma::ln_gamma(x)
    } else {
        gamma(x).ln()
    }
}

pub fn digamma(x: f64) -> f64 {
    if x.is_nan() || is_non_positive_integer(x) {
        return f64::NAN;
    }
    sgamma::digamma(x)
}

/// First derivative of the digamma function.
pub fn trigamma(x: f64) -> f64 {
    if x.is_nan() || is_non_positive_integer(x) {
        return f64::NAN;
    }
    if x == f64::INFINITY {
        return 0.0;
    }
    if x < 0.0 {
        // psi1(x) + psi1(1 - x) = pi^2 / sin^2(pi x)
        let s = (PI * x).sin();
        return PI * PI / (s * s) - trigamma(1.0 - x);
    }

    let mut x = x;
    let mut acc = 0.0;
    while x < POLYGAMMA_ASYMPTOTIC {
        acc += 1.0 / (x * x);
        x += 1.0;
    }

    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let series = inv
        + 0.5 * inv2
        + inv * inv2
            * (1.0 / 6.0
                + inv2 * (-1.0 / 30.0 + inv2 * (1.0 / 42.0 + inv2 * (-1.0 / 30.0 + inv2 * 5.0 / 66.0))));
    acc + series
}

/// Second derivative of the digamma function.
pub fn tetragamma(x: f64) -> f64 {
    if x.is_nan() || is_non_positive_integer(x) {
        return f64::NAN;
    }
    if x == f64::INFINITY {
        return 0.0;
    }
    if x < 0.0 {
        // psi2(x) - psi2(1 - x) = -2 pi^3 cot(pi x) / sin^2(pi x)
        let (s, c) = (PI * x).sin_cos();
        return tetragamma(1.0 - x) - 2.0 * PI * PI * PI * c / (s * s * s);
    }

    let mut x = x;
    let mut acc = 0.0;
    while x < POLYGAMMA_ASYMPTOTIC {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }

    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let series = -inv2
        - inv2 * inv
        - inv2 * inv2
            * (0.5
                + inv2 * (-1.0 / 6.0 + inv2 * (1.0 / 6.0 + inv2 * (-3.0 / 10.0 + inv2 * 5.0 / 6.0))));
    acc + series
}

/// Number of terms of the Borwein acceleration used by [`zeta`].
const ZETA_TERMS: usize = 40;

/// Riemann zeta function on the real line.
pub fn zeta(s: f64) -> f64 {
    if s.is_nan() || s == 1.0 {
        return f64::NAN;
    }
    if s == f64::INFINITY {
        return 1.0;
    }
    if s == 0.0 {
        return -0.5;
    }
    if s < 0.5 {
        // Functional equation
        let reflected = 1.0 - s;
        return 2f64.powf(s)
            * PI.powf(s - 1.0)
            * (0.5 * PI * s).sin()
            * gamma(reflected)
            * zeta(reflected);
    }

    // Borwein: eta(s) = -1/d_n sum_{k<n} (-1)^k (d_k - d_n) / (k + 1)^s
    let n = ZETA_TERMS as f64;
    let mut d = [0.0f64; ZETA_TERMS + 1];
    let mut term = 1.0 / n;
    let mut partial = term;
    d[0] = n * partial;
    for i in 1..=ZETA_TERMS {
        let fi = i as f64;
        term *= 4.0 * (n + fi - 1.0) * (n - fi + 1.0) / ((2.0 * fi) * (2.0 * fi - 1.0));
        partial += term;
        d[i] = n * partial;
    }

    let dn = d[ZETA_TERMS];
    let mut sum = 0.0;
    for (k, dk) in d.iter().take(ZETA_TERMS).enumerate() {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        sum += sign * (dk - dn) / ((k + 1) as f64).powf(s);
    }
    let eta = -sum / dn;
    eta / (1.0 - 2f64.powf(1.0 - s))
}

pub fn erf(x: f64) -> f64 {
    erf::erf(x)
}

pub fn erfc(x: f64) -> f64 {
    erf::erfc(x)
}

/// Standard normal density.
pub fn norm_pdf(x: f64) -> f64 {
    FRAC_1_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal distribution function.
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x * FRAC_1_SQRT_2)
}

/// `n!` of the rounded argument; NaN for negative integers.
pub fn factorial(x: f64) -> f64 {
    let n = x.round();
    if n.is_nan() || n < 0.0 {
        return f64::NAN;
    }
    if n > 170.0 {
        return f64::INFINITY;
    }
    (2..=n as u32).fold(1.0, |acc, k| acc * k as f64)
}

/// Binomial coefficient of the rounded arguments, zero outside `0 <= k <= n`.
pub fn choose(n: f64, k: f64) -> f64 {
    let (n, k) = (n.round(), k.round());
    if n.is_nan() || k.is_nan() {
        return f64::NAN;
    }
    if k < 0.0 || n < 0.0 || k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    if k <= 64.0 {
        let mut acc = 1.0;
        let mut i = 1.0;
        while i <= k {
            acc = acc * (n - k + i) / i;
            i += 1.0;
        }
        return acc.round();
    }
    (sgamma::ln_gamma(n + 1.0) - sgamma::ln_gamma(k + 1.0) - sgamma::ln_gamma(n - k + 1.0))
        .exp()
        .round()
}

/// Euler beta function `gamma(a) gamma(b) / gamma(a + b)`.
pub fn beta(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a > 0.0 && b > 0.0 {
        return (sgamma::ln_gamma(a) + sgamma::ln_gamma(b) - sgamma::ln_gamma(a + b)).exp();
    }
    let sum = a + b;
    if is_non_positive_integer(sum) && !is_non_positive_integer(a) && !is_non_positive_integer(b) {
        return 0.0;
    }
    gamma(a) * gamma(b) / gamma(sum)
}
