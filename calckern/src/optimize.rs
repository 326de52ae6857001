//! Algebraic simplification.
//!
//! The flat encoding is lifted into a small term graph allocated in a `typed_arena`, rewritten
//! bottom-up, then encoded back. Rewrites preserve the value wherever the input is defined:
//! - constant folding through the evaluator's numeric kernels;
//! - identities and annihilators (`x + 0`, `x * 1`, `x * 0`, `x / 1`, `x ^ 1`, `x ^ 0`, ...);
//! - double negation;
//! - collection of constants across `add` / `mul` chains;
//! - `bnz` with a constant condition, loops with constant bounds and body;
//! - calls to functions whose body is closed.
//!
//! Example
//! ```
//! use calckern::env::Environment;
//! use calckern::expr::Expr;
//!
//! let mut env = Environment::new();
//! let x = env.set("x", 2.0);
//! let e = (Expr::var(x) + 1.0) + 2.0;
//! let o = e.optimized(&env);
//! assert!(o.len() < e.len());
//! assert_eq!(o.eval(&mut env), 5.0);
//! ```
use log::debug;
use typed_arena::Arena;

use crate::env::{Addr, Environment, FuncId};
use crate::error::MalformedExpr;
use crate::eval::{self, IntegerRange};
use crate::expr::opcode::{Opcode, OpcodeClass};
use crate::expr::span::ThunkSpan;
use crate::expr::{Expr, Node};

#[derive(Debug)]
enum Term<'a> {
    Const(f64),
    Ref(Addr),
    Arg(u32),
    Unary(Opcode, &'a Term<'a>),
    Binary(Opcode, &'a Term<'a>, &'a Term<'a>),
    Branch {
        cond: &'a Term<'a>,
        then: &'a Term<'a>,
        otherwise: &'a Term<'a>,
    },
    Loop {
        op: Opcode,
        var: Addr,
        lower: &'a Term<'a>,
        upper: &'a Term<'a>,
        body: &'a Term<'a>,
    },
    Call {
        func: FuncId,
        args: Vec<&'a Term<'a>>,
    },
}

impl Term<'_> {
    fn constant(&self) -> Option<f64> {
        match self {
            Term::Const(value) => Some(*value),
            _ => None,
        }
    }

    fn is(&self, value: f64) -> bool {
        self.constant() == Some(value)
    }
}

/// Allocation context owning every term of one optimization pass.
struct TermArena<'a> {
    arena: Arena<Term<'a>>,
}

impl<'a> TermArena<'a> {
    fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    fn alloc(&'a self, term: Term<'a>) -> &'a Term<'a> {
        self.arena.alloc(term)
    }
}

struct Optimizer<'a, 'e> {
    ctx: &'a TermArena<'a>,
    env: &'e Environment,
    rewrites: usize,
}

impl<'a> Optimizer<'a, '_> {
    fn import(&self, nodes: &[Node], pos: usize) -> Result<(&'a Term<'a>, usize), MalformedExpr> {
        let node = *nodes
            .get(pos)
            .ok_or(MalformedExpr::Truncated { position: pos })?;

        let (term, next) = match node {
            Node::Const(value) => (Term::Const(value), pos + 1),
            Node::Ref(addr) => (Term::Ref(addr), pos + 1),
            Node::Arg(index) => (Term::Arg(index), pos + 1),
            Node::ThunkRet(_) | Node::ThunkJmp(_) => {
                return Err(MalformedExpr::StrayJump { position: pos });
            }
            Node::Call { func, argc } => {
                let mut args = Vec::with_capacity(argc as usize);
                let mut next = pos + 1;
                for _ in 0..argc {
                    let (arg, end) = self.import(nodes, next)?;
                    args.push(arg);
                    next = end;
                }
                (Term::Call { func, args }, next)
            }
            Node::Op(Opcode::Bnz) => {
                let (cond, next) = self.import(nodes, pos + 1)?;
                let then_span = ThunkSpan::at(nodes, next)?;
                let else_span = ThunkSpan::at(nodes, then_span.end())?;
                let (then, _) = self.import(nodes, then_span.body_start())?;
                let (otherwise, _) = self.import(nodes, else_span.body_start())?;
                (
                    Term::Branch {
                        cond,
                        then,
                        otherwise,
                    },
                    else_span.end(),
                )
            }
            Node::Op(op) if op.class() == OpcodeClass::Control => {
                let Some(Node::Ref(var)) = nodes.get(pos + 1).copied() else {
                    return Err(MalformedExpr::ExpectedLoopVariable { position: pos });
                };
                let (lower, next) = self.import(nodes, pos + 2)?;
                let (upper, next) = self.import(nodes, next)?;
                let span = ThunkSpan::at(nodes, next)?;
                let (body, _) = self.import(nodes, span.body_start())?;
                (
                    Term::Loop {
                        op,
                        var,
                        lower,
                        upper,
                        body,
                    },
                    span.end(),
                )
            }
            Node::Op(op) if op.arity() == 1 => {
                let (operand, next) = self.import(nodes, pos + 1)?;
                (Term::Unary(op, operand), next)
            }
            Node::Op(op) => {
                let (lhs, next) = self.import(nodes, pos + 1)?;
                let (rhs, next) = self.import(nodes, next)?;
                (Term::Binary(op, lhs, rhs), next)
            }
        };

        Ok((self.ctx.alloc(term), next))
    }

    fn alloc(&self, term: Term<'a>) -> &'a Term<'a> {
        self.ctx.alloc(term)
    }

    fn constant(&mut self, value: f64) -> &'a Term<'a> {
        self.rewrites += 1;
        self.alloc(Term::Const(value))
    }

    fn rewritten(&mut self, term: &'a Term<'a>) -> &'a Term<'a> {
        self.rewrites += 1;
        term
    }

    fn simplify(&mut self, term: &'a Term<'a>) -> &'a Term<'a> {
        match term {
            Term::Const(_) | Term::Ref(_) | Term::Arg(_) => term,
            Term::Unary(op, operand) => {
                let operand = self.simplify(operand);
                self.simplify_unary(*op, operand)
            }
            Term::Binary(op, lhs, rhs) => {
                let lhs = self.simplify(lhs);
                let rhs = self.simplify(rhs);
                self.simplify_binary(*op, lhs, rhs)
            }
            Term::Branch {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.simplify(cond);
                match cond.constant() {
                    Some(c) if c.is_nan() => self.constant(f64::NAN),
                    Some(c) if c != 0.0 => {
                        let then = self.simplify(then);
                        self.rewritten(then)
                    }
                    Some(_) => {
                        let otherwise = self.simplify(otherwise);
                        self.rewritten(otherwise)
                    }
                    None => {
                        let then = self.simplify(then);
                        let otherwise = self.simplify(otherwise);
                        self.alloc(Term::Branch {
                            cond,
                            then,
                            otherwise,
                        })
                    }
                }
            }
            Term::Loop {
                op,
                var,
                lower,
                upper,
                body,
            } => {
                let lower = self.simplify(lower);
                let upper = self.simplify(upper);
                let body = self.simplify(body);
                self.simplify_loop(*op, *var, lower, upper, body)
            }
            Term::Call { func, args } => {
                let args: Vec<_> = args.iter().map(|arg| self.simplify(arg)).collect();
                self.simplify_call(*func, args)
            }
        }
    }

    fn simplify_unary(&mut self, op: Opcode, operand: &'a Term<'a>) -> &'a Term<'a> {
        if let Some(x) = operand.constant() {
            return self.constant(eval::apply_unary(op, x));
        }
        if let (Opcode::Neg, Term::Unary(Opcode::Neg, inner)) = (op, operand) {
            return self.rewritten(inner);
        }
        self.alloc(Term::Unary(op, operand))
    }

    fn simplify_binary(
        &mut self,
        op: Opcode,
        lhs: &'a Term<'a>,
        rhs: &'a Term<'a>,
    ) -> &'a Term<'a> {
        if let (Some(a), Some(b)) = (lhs.constant(), rhs.constant()) {
            return self.constant(eval::apply_binary(op, a, b));
        }

        match op {
            Opcode::Add | Opcode::Mul => self.collect_chain(op, lhs, rhs),
            Opcode::Sub if rhs.is(0.0) => self.rewritten(lhs),
            Opcode::Sub if lhs.is(0.0) => {
                self.rewrites += 1;
                self.simplify_unary(Opcode::Neg, rhs)
            }
            Opcode::Div if rhs.is(1.0) => self.rewritten(lhs),
            Opcode::Power if rhs.is(1.0) => self.rewritten(lhs),
            Opcode::Power if rhs.is(0.0) => self.constant(1.0),
            _ => self.alloc(Term::Binary(op, lhs, rhs)),
        }
    }

    /// Rebuild an `add` / `mul` chain with all its literal operands merged into one.
    ///
    /// The canonical shape is `((t0 + t1) + ...) + c` for sums and `c * ((t0 * t1) * ...)` for
    /// products, with the constant dropped when it is the identity.
    fn collect_chain(&mut self, op: Opcode, lhs: &'a Term<'a>, rhs: &'a Term<'a>) -> &'a Term<'a> {
        let mut operands = Vec::new();
        flatten_chain(op, lhs, &mut operands);
        flatten_chain(op, rhs, &mut operands);

        let identity = if op == Opcode::Add { 0.0 } else { 1.0 };
        let mut literal = identity;
        let mut literals = 0usize;
        let mut rest = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand.constant() {
                Some(value) => {
                    literal = eval::apply_binary(op, literal, value);
                    literals += 1;
                }
                None => rest.push(operand),
            }
        }

        if rest.is_empty() {
            return self.constant(literal);
        }
        if op == Opcode::Mul && literal == 0.0 {
            return self.constant(0.0);
        }
        if literal.is_nan() {
            return self.constant(f64::NAN);
        }
        if literals > 1 || (literals == 1 && literal == identity) {
            self.rewrites += 1;
        }

        let mut chain = rest[0];
        for operand in &rest[1..] {
            chain = self.alloc(Term::Binary(op, chain, operand));
        }
        if literals == 0 || literal == identity {
            return chain;
        }

        let c = self.alloc(Term::Const(literal));
        if op == Opcode::Add {
            self.alloc(Term::Binary(op, chain, c))
        } else {
            self.alloc(Term::Binary(op, c, chain))
        }
    }

    fn simplify_loop(
        &mut self,
        op: Opcode,
        var: Addr,
        lower: &'a Term<'a>,
        upper: &'a Term<'a>,
        body: &'a Term<'a>,
    ) -> &'a Term<'a> {
        if let (Some(lo), Some(hi), Some(value)) =
            (lower.constant(), upper.constant(), body.constant())
        {
            let folded = match IntegerRange::new(lo, hi) {
                Some(range) => {
                    let count = range.count_remaining() as f64;
                    if op == Opcode::Sums {
                        if count == 0.0 { 0.0 } else { count * value }
                    } else {
                        value.powf(count)
                    }
                }
                None => f64::NAN,
            };
            return self.constant(folded);
        }
        self.alloc(Term::Loop {
            op,
            var,
            lower,
            upper,
            body,
        })
    }

    fn simplify_call(&mut self, func: FuncId, args: Vec<&'a Term<'a>>) -> &'a Term<'a> {
        if let Some(function) = self.env.function(func) {
            if function.argc as usize == args.len() && function.body.is_closed() {
                let mut scratch = Environment::new();
                return self.constant(function.body.eval(&mut scratch));
            }
        }
        self.alloc(Term::Call { func, args })
    }
}

fn flatten_chain<'a>(op: Opcode, term: &'a Term<'a>, out: &mut Vec<&'a Term<'a>>) {
    match term {
        Term::Binary(o, lhs, rhs) if *o == op => {
            flatten_chain(op, lhs, out);
            flatten_chain(op, rhs, out);
        }
        _ => out.push(term),
    }
}

fn encode(term: &Term<'_>) -> Expr {
    match term {
        Term::Const(value) => Expr::constant(*value),
        Term::Ref(addr) => Expr::var(*addr),
        Term::Arg(index) => Expr::arg(*index),
        Term::Unary(op, operand) => Expr::unary(*op, encode(operand)),
        Term::Binary(op, lhs, rhs) => Expr::binary(*op, encode(lhs), encode(rhs)),
        Term::Branch {
            cond,
            then,
            otherwise,
        } => Expr::branch(encode(cond), encode(then), encode(otherwise)),
        Term::Loop {
            op,
            var,
            lower,
            upper,
            body,
        } => Expr::fold_loop(*op, *var, encode(lower), encode(upper), encode(body)),
        Term::Call { func, args } => Expr::call(*func, args.iter().map(|arg| encode(arg))),
    }
}

/// Simplified copy of `expr`. Malformed and null expressions are returned unchanged.
pub fn optimize(expr: &Expr, env: &Environment) -> Expr {
    if expr.is_null() {
        return Expr::null();
    }
    if let Err(e) = expr.validate() {
        debug!("skipping optimization of malformed expression: {e}");
        return expr.clone();
    }

    let ctx = TermArena::new();
    let mut optimizer = Optimizer {
        ctx: &ctx,
        env,
        rewrites: 0,
    };

    let root = match optimizer.import(expr.nodes(), 0) {
        Ok((root, _)) => root,
        Err(e) => {
            debug!("skipping optimization of malformed expression: {e}");
            return expr.clone();
        }
    };
    let root = optimizer.simplify(root);
    let optimized = encode(root);

    debug!(
        "optimizer applied {} rewrite(s), {} -> {} nodes",
        optimizer.rewrites,
        expr.len(),
        optimized.len()
    );
    optimized
}

impl Expr {
    /// Simplify in place.
    pub fn optimize(&mut self, env: &Environment) {
        *self = optimize(self, env);
    }

    pub fn optimized(&self, env: &Environment) -> Expr {
        optimize(self, env)
    }
}
