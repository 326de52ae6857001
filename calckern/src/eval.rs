//! Recursive evaluator over the flat encoding.
//!
//! Every failure inside the walk (missing operand, unknown function, arity mismatch, undefined
//! numeric result) becomes NaN and propagates outward; the evaluator never aborts.
//!
//! Call arguments are evaluated into a frame local to the call and read back by `arg` nodes of
//! the callee body. Loop variables are the only values written into the [`Environment`] during a
//! walk, through a [`ScopedBinding`](crate::env::ScopedBinding) that restores them afterwards.
use smallvec::SmallVec;

use crate::env::{Environment, FuncId};
use crate::expr::opcode::{Opcode, OpcodeClass};
use crate::expr::span::{Cursor, ThunkSpan};
use crate::expr::{Expr, Node};
use crate::special;

/// Evaluate `expr` against `env`.
pub fn evaluate(expr: &Expr, env: &mut Environment) -> f64 {
    if expr.is_null() {
        return f64::NAN;
    }
    let mut cursor = Cursor::new(expr.nodes());
    eval_node(env, &mut cursor, &[])
}

#[inline]
fn truth(value: f64) -> f64 {
    if value != 0.0 { 1.0 } else { 0.0 }
}

/// Apply a single-operand opcode (`not` included).
pub fn apply_unary(op: Opcode, x: f64) -> f64 {
    use Opcode::*;
    match op {
        Not => {
            if x.is_nan() {
                f64::NAN
            } else {
                1.0 - truth(x)
            }
        }
        Neg => -x,
        Abs => x.abs(),
        Sqrt => x.sqrt(),
        Exp => x.exp(),
        Ln => x.ln(),
        Log10 => x.log10(),
        Log2 => x.log2(),
        Sin => x.sin(),
        Cos => x.cos(),
        Tan => x.tan(),
        Asin => x.asin(),
        Acos => x.acos(),
        Atan => x.atan(),
        Sinh => x.sinh(),
        Cosh => x.cosh(),
        Tanh => x.tanh(),
        Asinh => x.asinh(),
        Acosh => x.acosh(),
        Atanh => x.atanh(),
        Gamma => special::gamma(x),
        LnGamma => special::ln_gamma(x),
        Digamma => special::digamma(x),
        Trigamma => special::trigamma(x),
        Tetragamma => special::tetragamma(x),
        Factorial => special::factorial(x),
        Floor => x.floor(),
        Ceil => x.ceil(),
        Round => x.round(),
        Sign => {
            if x.is_nan() {
                f64::NAN
            } else if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Erf => special::erf(x),
        Erfc => special::erfc(x),
        NormPdf => special::norm_pdf(x),
        NormCdf => special::norm_cdf(x),
        Zeta => special::zeta(x),
        _ => f64::NAN,
    }
}

/// Apply a two-operand opcode: arithmetic, comparison, `and`, `or`.
pub fn apply_binary(op: Opcode, a: f64, b: f64) -> f64 {
    use Opcode::*;

    if matches!(op.class(), OpcodeClass::Comparison | OpcodeClass::Boolean)
        && (a.is_nan() || b.is_nan())
    {
        return f64::NAN;
    }

    match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
        // Floored: the result takes the sign of the modulus
        Mod => a - b * (a / b).floor(),
        Power => a.powf(b),
        LogBase => a.ln() / b.ln(),
        Max => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if a >= b {
                a
            } else {
                b
            }
        }
        Min => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if a <= b {
                a
            } else {
                b
            }
        }
        Choose => special::choose(a, b),
        Beta => special::beta(a, b),
        Lt => (a < b) as u8 as f64,
        Le => (a <= b) as u8 as f64,
        Gt => (a > b) as u8 as f64,
        Ge => (a >= b) as u8 as f64,
        Eq => (a == b) as u8 as f64,
        Ne => (a != b) as u8 as f64,
        And => truth(a) * truth(b),
        Or => truth(truth(a) + truth(b)),
        _ => f64::NAN,
    }
}

/// Iterator over the integers of an inclusive loop range.
///
/// With `lower <= upper` it walks up over `ceil(lower)..=floor(upper)`, otherwise it walks down
/// over `floor(lower)..=ceil(upper)`. Both can be empty for non-integer bounds.
#[derive(Debug, Clone, Copy)]
pub struct IntegerRange {
    next: i64,
    last: i64,
    step: i64,
    remaining: u64,
}

impl IntegerRange {
    /// `None` when a bound is NaN or infinite, when a rounded bound does not fit in an `i64`, or
    /// when the iteration count does not fit in a `u64`.
    pub fn new(lower: f64, upper: f64) -> Option<Self> {
        if !lower.is_finite() || !upper.is_finite() {
            return None;
        }

        let (first, last, step) = if lower <= upper {
            (to_index(lower.ceil())?, to_index(upper.floor())?, 1)
        } else {
            (to_index(lower.floor())?, to_index(upper.ceil())?, -1)
        };
        let span = (i128::from(last) - i128::from(first)) * i128::from(step);
        let remaining = if span >= 0 {
            u64::try_from(span + 1).ok()?
        } else {
            0
        };

        Some(Self {
            next: first,
            last,
            step,
            remaining,
        })
    }

    /// Number of iterations left.
    pub fn count_remaining(&self) -> u64 {
        self.remaining
    }
}

/// Exact conversion of an integral float, `None` outside the `i64` range.
fn to_index(value: f64) -> Option<i64> {
    // 2^63 is the first float past i64::MAX
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (-LIMIT..LIMIT).contains(&value).then_some(value as i64)
}

impl Iterator for IntegerRange {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.remaining == 0 {
            return None;
        }
        let value = self.next;
        self.remaining -= 1;
        if value != self.last {
            self.next += self.step;
        }
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, usize::try_from(self.remaining).ok())
    }
}

fn eval_node(env: &mut Environment, cursor: &mut Cursor<'_>, args: &[f64]) -> f64 {
    let Some(node) = cursor.next() else {
        return f64::NAN;
    };

    match node {
        Node::Const(value) => value,
        Node::Ref(addr) => env.value(addr),
        Node::Arg(index) => args.get(index as usize).copied().unwrap_or(f64::NAN),
        Node::Op(op) => match op.class() {
            OpcodeClass::Control => match op {
                Opcode::Bnz => eval_branch(env, cursor, args),
                _ => eval_loop(env, cursor, args, op),
            },
            _ if op.arity() == 1 => {
                let x = eval_node(env, cursor, args);
                apply_unary(op, x)
            }
            _ => {
                let a = eval_node(env, cursor, args);
                let b = eval_node(env, cursor, args);
                apply_binary(op, a, b)
            }
        },
        Node::Call { func, argc } => eval_call(env, cursor, args, func, argc),
        Node::ThunkRet(_) | Node::ThunkJmp(_) => f64::NAN,
    }
}

/// Evaluate the body of `span` with a fresh cursor.
fn eval_span(env: &mut Environment, nodes: &[Node], span: ThunkSpan, args: &[f64]) -> f64 {
    let mut body = Cursor::at(nodes, span.body_start());
    eval_node(env, &mut body, args)
}

fn eval_branch(env: &mut Environment, cursor: &mut Cursor<'_>, args: &[f64]) -> f64 {
    let cond = eval_node(env, cursor, args);
    let Ok(then_span) = cursor.span() else {
        return f64::NAN;
    };
    let Ok(else_span) = ThunkSpan::at(cursor.nodes(), then_span.end()) else {
        return f64::NAN;
    };
    cursor.seek(else_span.end());

    if cond.is_nan() {
        f64::NAN
    } else if cond != 0.0 {
        eval_span(env, cursor.nodes(), then_span, args)
    } else {
        eval_span(env, cursor.nodes(), else_span, args)
    }
}

fn eval_loop(env: &mut Environment, cursor: &mut Cursor<'_>, args: &[f64], op: Opcode) -> f64 {
    let Some(Node::Ref(var)) = cursor.next() else {
        return f64::NAN;
    };
    let lower = eval_node(env, cursor, args);
    let upper = eval_node(env, cursor, args);
    let Ok(body) = cursor.span() else {
        return f64::NAN;
    };
    cursor.seek(body.end());

    let Some(range) = IntegerRange::new(lower, upper) else {
        return f64::NAN;
    };

    let mut acc = if op == Opcode::Sums { 0.0 } else { 1.0 };
    let mut scope = env.bind(var);
    for i in range {
        scope.set(i as f64);
        let value = eval_span(&mut scope, cursor.nodes(), body, args);
        if op == Opcode::Sums {
            acc += value;
        } else {
            acc *= value;
        }
    }
    acc
}

fn eval_call(
    env: &mut Environment,
    cursor: &mut Cursor<'_>,
    args: &[f64],
    func: FuncId,
    argc: u32,
) -> f64 {
    let mut frame = SmallVec::<[f64; 4]>::with_capacity(argc as usize);
    for _ in 0..argc {
        frame.push(eval_node(env, cursor, args));
    }

    let Some(function) = env.function(func).cloned() else {
        return f64::NAN;
    };
    if function.argc != argc || function.body.is_null() {
        return f64::NAN;
    }

    let mut body = Cursor::new(function.body.nodes());
    eval_node(env, &mut body, &frame)
}
