//! Newton–Raphson root finding on a single variable.
use log::{debug, trace};

use crate::config::NewtonConfig;
use crate::env::{Addr, Environment};
use crate::expr::Expr;

/// Search a root of `f` in `var`, starting from `start`.
///
/// The variable is bound for the duration of the search and restored afterwards. Returns NaN when
/// `f` or `df` is NaN at an iterate, when the derivative vanishes, when an iterate leaves the
/// configured bounds or when the iteration cap is reached without convergence.
pub fn newton(
    f: &Expr,
    df: &Expr,
    var: Addr,
    start: f64,
    config: &NewtonConfig,
    env: &mut Environment,
) -> f64 {
    if f.is_null() || df.is_null() {
        return f64::NAN;
    }

    let mut scope = env.bind(var);
    let mut x = start;
    let mut step = f64::INFINITY;

    for iteration in 0..=config.max_iterations {
        scope.set(x);
        let fx = f.eval(&mut scope);
        trace!("newton iteration {iteration}: x = {x}, f(x) = {fx}");
        if fx.is_nan() {
            debug!("newton: f is undefined at x = {x}");
            return f64::NAN;
        }
        if step.abs() <= config.step_tolerance && fx.abs() <= config.abs_tolerance {
            return x;
        }
        if iteration == config.max_iterations {
            break;
        }

        let dfx = df.eval(&mut scope);
        if dfx.is_nan() || dfx == 0.0 {
            debug!("newton: derivative is {dfx} at x = {x}");
            return f64::NAN;
        }

        step = fx / dfx;
        x -= step;
        if !(config.lower_bound..=config.upper_bound).contains(&x) {
            debug!("newton: iterate {x} left the bounds");
            return f64::NAN;
        }
    }

    debug!(
        "newton: no convergence after {} iterations",
        config.max_iterations
    );
    f64::NAN
}

impl Expr {
    /// Root of `self` in `var`, differentiating symbolically once.
    pub fn newton(&self, var: Addr, start: f64, config: &NewtonConfig, env: &mut Environment) -> f64 {
        let derivative = self.diff(var, env);
        newton(self, &derivative, var, start, config, env)
    }

    /// Root of `self` in `var` with a precomputed derivative.
    pub fn newton_with_derivative(
        &self,
        derivative: &Expr,
        var: Addr,
        start: f64,
        config: &NewtonConfig,
        env: &mut Environment,
    ) -> f64 {
        newton(self, derivative, var, start, config, env)
    }
}
