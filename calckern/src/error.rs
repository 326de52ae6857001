use strum::{EnumIs, EnumTryAs};
use thiserror::Error;

use crate::env::FuncId;
use crate::expr::opcode::Opcode;

/// Structural defect found while walking a flat expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, Error)]
pub enum MalformedExpr {
    /// The walk ran past the end of the node buffer.
    #[error("Expression ended unexpectedly at node {position}, an operand is missing.")]
    Truncated { position: usize },

    /// Nodes remain after the root subtree has been consumed.
    #[error("Expression has {leftover} trailing node(s) after the root subtree ending at {end}.")]
    TrailingNodes { end: usize, leftover: usize },

    /// A `thunk_ret` marker does not point at a matching `thunk_jmp`.
    #[error("Thunk span starting at node {start} is not closed by a matching `thunk_jmp` marker.")]
    UnclosedSpan { start: usize },

    /// A `thunk_jmp` marker appeared where an operand was expected.
    #[error("Unexpected `thunk_jmp` marker at node {position}.")]
    StrayJump { position: usize },

    /// An operand that must be a thunk span is a plain expression.
    #[error("Expected a thunk span at node {position}.")]
    ExpectedSpan { position: usize },

    /// The loop variable slot of `sums`/`prods` does not hold a variable reference.
    #[error("Loop construct at node {position} must bind a variable reference.")]
    ExpectedLoopVariable { position: usize },
}

/// Reasons a symbolic derivative cannot be produced.
///
/// Any of these aborts the whole differentiation: no partial derivative is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, EnumTryAs, Error)]
pub enum DiffError {
    #[error("Opcode `{0}` has no closed-form derivative.")]
    NonDifferentiable(Opcode),

    #[error("Loop bounds must reduce to literal constants to unroll the derivative.")]
    DynamicLoopBounds,

    #[error(
        "Loop of {iterations} iterations exceeds the unroll limit of {limit} iterations."
    )]
    UnrollLimit { iterations: u64, limit: u64 },

    #[error("The modulus of `mod` depends on the differentiation variable.")]
    TargetDependentModulus,

    #[error("The base of `logbase` depends on the differentiation variable.")]
    TargetDependentLogBase,

    #[error("Function `{0}` is already on the differentiation call stack (recursive call).")]
    RecursiveCall(FuncId),

    #[error("Call refers to function `{0}` which is not registered.")]
    UnknownFunction(FuncId),

    #[error("Function `{func}` declares {expected} argument(s) but the call site passes {found}.")]
    ArityMismatch {
        func: FuncId,
        expected: u32,
        found: u32,
    },

    #[error("Cannot differentiate a malformed expression: {0}")]
    Malformed(#[from] MalformedExpr),
}

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file '{file}': {source}")]
    ConfigParse {
        source: toml::de::Error,
        file: String,
    },

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Failed to parse expression: {}", .0.join("; "))]
    Parse(Vec<String>),

    #[error("Unknown function `{0}`")]
    UnknownFunction(String),

    #[error(transparent)]
    Malformed(#[from] MalformedExpr),

    #[error(transparent)]
    Diff(#[from] DiffError),
}

pub type CalcResult<T> = Result<T, CalcError>;
