//! Calckern: a flat-encoded symbolic expression kernel.
//!
//! This crate represents mathematical expressions as a compact prefix-order node buffer,
//! evaluates them against a mutable variable [`env::Environment`], computes exact symbolic
//! derivatives, and rewrites them into simpler equivalents.
//!
//! Encoding shape
//!  - One contiguous buffer of [`expr::Node`]s in prefix order: an opcode is followed by its
//!    operand subtrees, each operand consuming exactly its own node count.
//!  - Lazily evaluated operands (branches of `bnz`, bodies of `sums` / `prods`) are wrapped in
//!    thunk spans that any consumer skips in O(1).
//!  - Buffers use `smallvec` and keep up to 8 nodes inline before spilling to the heap.
//!
//! Error model
//!  - Undefined numeric results are NaN and propagate.
//!  - A derivative that cannot be formed is the null expression ([`expr::Expr::null`]);
//!    [`expr::Expr::try_diff`] reports the typed [`error::DiffError`] instead.
//!  - Newton's method returns NaN when it does not converge.
//!
//! Example
//! ```
//! use calckern::prelude::*;
//!
//! let mut env = Environment::new();
//! let f = parse(&mut env, "x^2 - 2").unwrap();
//! let x = env.resolve("x", true);
//!
//! // Derivative and root
//! let df = f.diff(x, &env);
//! env.set("x", 3.0);
//! assert_eq!(df.eval(&mut env), 6.0);
//!
//! let root = f.newton(x, 1.0, &NewtonConfig::default(), &mut env);
//! assert!((root - 2f64.sqrt()).abs() < 1e-9);
//! ```

/// Engine configuration (Newton tolerances, unroll limits, printer width).
pub mod config;
/// Structural symbolic differentiation.
pub mod diff;
/// Variable store and function registry.
pub mod env;
/// Error types shared across the crate.
pub mod error;
/// Numeric evaluation of the flat encoding.
pub mod eval;
/// Flat expression buffer, opcodes, spans and pretty-printing.
pub mod expr;
/// Newton root finder.
pub mod newton;
/// Algebraic simplification.
pub mod optimize;
/// Parser for the infix expression language.
pub mod parser;
/// Special functions backing the numeric opcodes.
pub mod special;

pub mod prelude {
    //! Convenient re-exports for end users.
    pub use crate::config::{DiffConfig, EngineConfig, NewtonConfig, PrettyConfig};
    pub use crate::diff::{DiffTarget, Differentiator};
    pub use crate::env::{Addr, Environment, FuncId, Function};
    pub use crate::error::{CalcError, CalcResult, DiffError, MalformedExpr};
    pub use crate::expr::opcode::Opcode;
    pub use crate::expr::{Expr, Node};
    pub use crate::parser::{define_function, parse};
}
