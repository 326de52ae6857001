//! Structural symbolic differentiation.
//!
//! The derivative is assembled from the flat encoding by one recursive walk. Results are built
//! through small constructors that fold literal zeros and ones, so derivatives of expressions
//! independent of the target collapse to `0` instead of growing trees of `0 * ...` terms.
//!
//! Differentiation is all-or-nothing: any [`DiffError`] aborts the whole walk. [`Expr::diff`]
//! maps failure to the null expression, [`Expr::try_diff`] exposes the reason.
use std::f64::consts::{LN_10, LN_2, PI};

use log::debug;
use smallvec::SmallVec;

use crate::config::DiffConfig;
use crate::env::{Addr, Environment, FuncId};
use crate::error::{DiffError, MalformedExpr};
use crate::eval::{self, IntegerRange};
use crate::expr::opcode::{Opcode, OpcodeClass};
use crate::expr::span::{ThunkSpan, subtree_end};
use crate::expr::{Expr, Node};

/// What a derivative is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffTarget {
    /// A variable of the environment.
    Var(Addr),
    /// A positional parameter, used for the partial derivatives of function bodies.
    Arg(u32),
}

impl DiffTarget {
    fn matches(self, node: Node) -> bool {
        match (self, node) {
            (DiffTarget::Var(target), Node::Ref(addr)) => target == addr,
            (DiffTarget::Arg(target), Node::Arg(index)) => target == index,
            _ => false,
        }
    }
}

/// True if the value of `expr` may depend on `target`, looking through called function bodies.
pub fn depends_on(expr: &Expr, target: DiffTarget, env: &Environment) -> bool {
    let mut visited = SmallVec::<[FuncId; 8]>::new();
    nodes_depend_on(expr.nodes(), target, env, &mut visited)
}

fn nodes_depend_on(
    nodes: &[Node],
    target: DiffTarget,
    env: &Environment,
    visited: &mut SmallVec<[FuncId; 8]>,
) -> bool {
    nodes.iter().any(|&node| match node {
        Node::Call { func, .. } if matches!(target, DiffTarget::Var(_)) => {
            if visited.contains(&func) {
                return false;
            }
            visited.push(func);
            env.function(func)
                .is_some_and(|f| nodes_depend_on(f.body.nodes(), target, env, visited))
        }
        node => target.matches(node),
    })
}

// Folding constructors. Literal operands are folded through the evaluator's numeric kernels.

fn zero() -> Expr {
    Expr::constant(0.0)
}

fn is_zero(e: &Expr) -> bool {
    e.as_constant() == Some(0.0)
}

fn is_one(e: &Expr) -> bool {
    e.as_constant() == Some(1.0)
}

fn c(value: f64) -> Expr {
    Expr::constant(value)
}

fn un(op: Opcode, a: Expr) -> Expr {
    match a.as_constant() {
        Some(x) => c(eval::apply_unary(op, x)),
        None => Expr::unary(op, a),
    }
}

fn bin(op: Opcode, a: Expr, b: Expr) -> Expr {
    match (a.as_constant(), b.as_constant()) {
        (Some(x), Some(y)) => c(eval::apply_binary(op, x, y)),
        _ => Expr::binary(op, a, b),
    }
}

fn add(a: Expr, b: Expr) -> Expr {
    if is_zero(&a) {
        b
    } else if is_zero(&b) {
        a
    } else {
        bin(Opcode::Add, a, b)
    }
}

fn sub(a: Expr, b: Expr) -> Expr {
    if is_zero(&b) {
        a
    } else if is_zero(&a) {
        neg(b)
    } else {
        bin(Opcode::Sub, a, b)
    }
}

fn mul(a: Expr, b: Expr) -> Expr {
    if is_zero(&a) || is_zero(&b) {
        zero()
    } else if is_one(&a) {
        b
    } else if is_one(&b) {
        a
    } else {
        bin(Opcode::Mul, a, b)
    }
}

fn div(a: Expr, b: Expr) -> Expr {
    if is_zero(&a) {
        zero()
    } else if is_one(&b) {
        a
    } else {
        bin(Opcode::Div, a, b)
    }
}

fn neg(a: Expr) -> Expr {
    if let [Node::Op(Opcode::Neg), rest @ ..] = a.nodes() {
        return Expr::from_subtree(rest);
    }
    un(Opcode::Neg, a)
}

fn pow(a: Expr, b: Expr) -> Expr {
    if is_one(&b) {
        a
    } else {
        bin(Opcode::Power, a, b)
    }
}

fn square(a: Expr) -> Expr {
    pow(a, c(2.0))
}

/// Copy of the subtree rooted at `pos` and the index right after it.
fn subtree(nodes: &[Node], pos: usize) -> Result<(Expr, usize), DiffError> {
    let end = subtree_end(nodes, pos)?;
    Ok((Expr::from_subtree(&nodes[pos..end]), end))
}

/// Stateful walker: holds the function call stack used for cycle detection.
pub struct Differentiator<'e> {
    env: &'e Environment,
    config: DiffConfig,
    call_stack: SmallVec<[FuncId; 8]>,
}

impl<'e> Differentiator<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Self::with_config(env, DiffConfig::default())
    }

    pub fn with_config(env: &'e Environment, config: DiffConfig) -> Self {
        Self {
            env,
            config,
            call_stack: SmallVec::new(),
        }
    }

    /// Derivative of `expr` with respect to `target`.
    pub fn differentiate(&mut self, expr: &Expr, target: DiffTarget) -> Result<Expr, DiffError> {
        expr.validate()?;
        self.diff_expr(expr, target)
    }

    fn diff_expr(&mut self, expr: &Expr, target: DiffTarget) -> Result<Expr, DiffError> {
        self.diff_at(expr.nodes(), 0, target).map(|(d, _)| d)
    }

    fn depends(&self, expr: &Expr, target: DiffTarget) -> bool {
        depends_on(expr, target, self.env)
    }

    /// Derivative of the subtree at `pos`, and the index right after that subtree.
    fn diff_at(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
    ) -> Result<(Expr, usize), DiffError> {
        let node = *nodes
            .get(pos)
            .ok_or(MalformedExpr::Truncated { position: pos })?;

        match node {
            Node::Const(_) => Ok((zero(), pos + 1)),
            Node::Ref(_) | Node::Arg(_) => {
                let d = if target.matches(node) { c(1.0) } else { zero() };
                Ok((d, pos + 1))
            }
            Node::ThunkRet(_) | Node::ThunkJmp(_) => {
                Err(MalformedExpr::StrayJump { position: pos }.into())
            }
            Node::Call { func, argc } => self.diff_call(nodes, pos, target, func, argc),
            Node::Op(op) => match op.class() {
                OpcodeClass::Control => match op {
                    Opcode::Bnz => self.diff_branch(nodes, pos, target),
                    _ => self.diff_loop(nodes, pos, target, op),
                },
                _ if op.is_non_differentiable() => Err(DiffError::NonDifferentiable(op)),
                _ if op.is_piecewise_constant() => Ok((zero(), subtree_end(nodes, pos)?)),
                _ if op.arity() == 1 => self.diff_unary(nodes, pos, target, op),
                _ => self.diff_binary(nodes, pos, target, op),
            },
        }
    }

    fn diff_unary(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
        op: Opcode,
    ) -> Result<(Expr, usize), DiffError> {
        use Opcode::*;

        let (u, end) = subtree(nodes, pos + 1)?;
        let (du, _) = self.diff_at(nodes, pos + 1, target)?;
        if is_zero(&du) {
            return Ok((zero(), end));
        }

        let d = match op {
            Neg => neg(du),
            Abs => mul(un(Sign, u), du),
            Sqrt => div(du, mul(c(2.0), un(Sqrt, u))),
            Exp => mul(un(Exp, u), du),
            Ln => div(du, u),
            Log10 => div(du, mul(u, c(LN_10))),
            Log2 => div(du, mul(u, c(LN_2))),
            Sin => mul(un(Cos, u), du),
            Cos => neg(mul(un(Sin, u), du)),
            Tan => div(du, square(un(Cos, u))),
            Asin => div(du, un(Sqrt, sub(c(1.0), square(u)))),
            Acos => neg(div(du, un(Sqrt, sub(c(1.0), square(u))))),
            Atan => div(du, add(c(1.0), square(u))),
            Sinh => mul(un(Cosh, u), du),
            Cosh => mul(un(Sinh, u), du),
            Tanh => div(du, square(un(Cosh, u))),
            Asinh => div(du, un(Sqrt, add(square(u), c(1.0)))),
            Acosh => div(du, un(Sqrt, sub(square(u), c(1.0)))),
            Atanh => div(du, sub(c(1.0), square(u))),
            Gamma => mul(mul(un(Gamma, u.clone()), un(Digamma, u)), du),
            LnGamma => mul(un(Digamma, u), du),
            Digamma => mul(un(Trigamma, u), du),
            Trigamma => mul(un(Tetragamma, u), du),
            Erf => mul(erf_slope(u), du),
            Erfc => neg(mul(erf_slope(u), du)),
            NormPdf => neg(mul(mul(u.clone(), un(NormPdf, u)), du)),
            NormCdf => mul(un(NormPdf, u), du),
            _ => return Err(DiffError::NonDifferentiable(op)),
        };
        Ok((d, end))
    }

    fn diff_binary(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
        op: Opcode,
    ) -> Result<(Expr, usize), DiffError> {
        use Opcode::*;

        let (a, a_end) = subtree(nodes, pos + 1)?;
        let (b, end) = subtree(nodes, a_end)?;
        let lhs = pos + 1;
        let rhs = a_end;

        let d = match op {
            Add => add(
                self.diff_at(nodes, lhs, target)?.0,
                self.diff_at(nodes, rhs, target)?.0,
            ),
            Sub => sub(
                self.diff_at(nodes, lhs, target)?.0,
                self.diff_at(nodes, rhs, target)?.0,
            ),
            Mul => {
                let da = self.diff_at(nodes, lhs, target)?.0;
                let db = self.diff_at(nodes, rhs, target)?.0;
                add(mul(da, b), mul(a, db))
            }
            Div => {
                let da = self.diff_at(nodes, lhs, target)?.0;
                let db = self.diff_at(nodes, rhs, target)?.0;
                if is_zero(&db) {
                    div(da, b)
                } else {
                    div(sub(mul(da, b.clone()), mul(db, a)), square(b))
                }
            }
            Power => {
                if self.depends(&b, target) {
                    // b^e = exp(ln(b) * e)
                    let rewritten = Expr::unary(Exp, Expr::binary(Mul, Expr::unary(Ln, a), b));
                    self.diff_expr(&rewritten, target)?
                } else {
                    let da = self.diff_at(nodes, lhs, target)?.0;
                    if is_zero(&da) {
                        zero()
                    } else {
                        let reduced = sub(b.clone(), c(1.0));
                        mul(mul(b, pow(a, reduced)), da)
                    }
                }
            }
            Mod => {
                if self.depends(&b, target) {
                    return Err(DiffError::TargetDependentModulus);
                }
                self.diff_at(nodes, lhs, target)?.0
            }
            LogBase => {
                if self.depends(&b, target) {
                    return Err(DiffError::TargetDependentLogBase);
                }
                let da = self.diff_at(nodes, lhs, target)?.0;
                div(da, mul(a, un(Ln, b)))
            }
            Max | Min => {
                let da = self.diff_at(nodes, lhs, target)?.0;
                let db = self.diff_at(nodes, rhs, target)?.0;
                if is_zero(&da) && is_zero(&db) {
                    zero()
                } else {
                    let pick = if op == Max { Ge } else { Le };
                    Expr::branch(Expr::binary(pick, a, b), da, db)
                }
            }
            Beta => {
                let da = self.diff_at(nodes, lhs, target)?.0;
                let db = self.diff_at(nodes, rhs, target)?.0;
                if is_zero(&da) && is_zero(&db) {
                    zero()
                } else {
                    let psi_sum = un(Digamma, add(a.clone(), b.clone()));
                    let beta = bin(Beta, a.clone(), b.clone());
                    let da_term = mul(sub(un(Digamma, a), psi_sum.clone()), da);
                    let db_term = mul(sub(un(Digamma, b), psi_sum), db);
                    mul(beta, add(da_term, db_term))
                }
            }
            _ => return Err(DiffError::NonDifferentiable(op)),
        };
        Ok((d, end))
    }

    fn diff_branch(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
    ) -> Result<(Expr, usize), DiffError> {
        let (cond, cond_end) = subtree(nodes, pos + 1)?;
        let then_span = ThunkSpan::at(nodes, cond_end)?;
        let else_span = ThunkSpan::at(nodes, then_span.end())?;

        let (d_then, _) = self.diff_at(nodes, then_span.body_start(), target)?;
        let (d_else, _) = self.diff_at(nodes, else_span.body_start(), target)?;

        let d = if is_zero(&d_then) && is_zero(&d_else) {
            zero()
        } else {
            Expr::branch(cond, d_then, d_else)
        };
        Ok((d, else_span.end()))
    }

    fn diff_loop(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
        op: Opcode,
    ) -> Result<(Expr, usize), DiffError> {
        let Some(Node::Ref(var)) = nodes.get(pos + 1).copied() else {
            return Err(MalformedExpr::ExpectedLoopVariable { position: pos }.into());
        };
        let (lower, lower_end) = subtree(nodes, pos + 2)?;
        let (upper, upper_end) = subtree(nodes, lower_end)?;
        let span = ThunkSpan::at(nodes, upper_end)?;
        let body = Expr::from_subtree(&nodes[span.body_start()..span.body_end()]);

        if !lower.is_closed() || !upper.is_closed() {
            return Err(DiffError::DynamicLoopBounds);
        }
        let mut scratch = Environment::new();
        let (lower, upper) = (lower.eval(&mut scratch), upper.eval(&mut scratch));
        if !lower.is_finite() || !upper.is_finite() {
            return Err(DiffError::DynamicLoopBounds);
        }
        let range = IntegerRange::new(lower, upper).ok_or(DiffError::UnrollLimit {
            iterations: u64::MAX,
            limit: self.config.max_unrolled_iterations,
        })?;

        let iterations = range.count_remaining();
        if iterations > self.config.max_unrolled_iterations {
            return Err(DiffError::UnrollLimit {
                iterations,
                limit: self.config.max_unrolled_iterations,
            });
        }

        let body = self.inline_reading(&body, var)?;
        let terms: Vec<Expr> = range
            .map(|i| body.substitute_var(var, &c(i as f64)))
            .collect();

        let mut derivative = zero();
        if op == Opcode::Sums {
            for term in &terms {
                derivative = add(derivative, self.diff_expr(term, target)?);
            }
        } else {
            for (i, term) in terms.iter().enumerate() {
                let d = self.diff_expr(term, target)?;
                if is_zero(&d) {
                    continue;
                }
                let others = terms
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .fold(c(1.0), |acc, (_, t)| mul(acc, t.clone()));
                derivative = add(derivative, mul(d, others));
            }
        }
        Ok((derivative, span.end()))
    }

    /// Inline every call whose callee reads `var`, so that substituting the loop variable also
    /// reaches through function bodies.
    ///
    /// Each pass inlines one level. Without recursion the call graph is exhausted after as many
    /// passes as there are functions; calls still reading `var` after that are cyclic.
    fn inline_reading(&self, body: &Expr, var: Addr) -> Result<Expr, DiffError> {
        let target = DiffTarget::Var(var);
        let mut body = body.clone();
        let mut last = None;

        for _ in 0..=self.env.function_count() {
            let mut inlined = None;
            body = body.inline_calls(&mut |func: FuncId, args: &[Expr]| -> Option<Expr> {
                let function = self.env.function(func)?;
                if function.argc as usize != args.len()
                    || !depends_on(&function.body, target, self.env)
                {
                    return None;
                }
                inlined = Some(func);
                Some(function.body.substitute_args(args))
            })?;

            match inlined {
                Some(func) => last = Some(func),
                None => return Ok(body),
            }
        }

        match last {
            Some(func) => Err(DiffError::RecursiveCall(func)),
            None => Ok(body),
        }
    }

    fn diff_call(
        &mut self,
        nodes: &[Node],
        pos: usize,
        target: DiffTarget,
        func: FuncId,
        argc: u32,
    ) -> Result<(Expr, usize), DiffError> {
        let function = self
            .env
            .function(func)
            .cloned()
            .ok_or(DiffError::UnknownFunction(func))?;
        if function.argc != argc {
            return Err(DiffError::ArityMismatch {
                func,
                expected: function.argc,
                found: argc,
            });
        }
        if self.call_stack.contains(&func) {
            return Err(DiffError::RecursiveCall(func));
        }

        // Arguments are differentiated in the caller's scope, before `func` joins the call stack
        let mut args = SmallVec::<[Expr; 4]>::with_capacity(argc as usize);
        let mut d_args = SmallVec::<[Expr; 4]>::with_capacity(argc as usize);
        let mut next = pos + 1;
        for _ in 0..argc {
            let (arg, end) = subtree(nodes, next)?;
            let (d_arg, _) = self.diff_at(nodes, next, target)?;
            args.push(arg);
            d_args.push(d_arg);
            next = end;
        }

        self.call_stack.push(func);
        let result = self.chain_rule(&args, &d_args, &function.body, target);
        self.call_stack.pop();
        Ok((result?, next))
    }

    /// `d/dt f(g_0, ..., g_n) = (df/dt)[args] + sum_j g_j' * (df/d arg_j)[args]`
    ///
    /// The direct term covers function bodies that reference the target variable itself.
    fn chain_rule(
        &mut self,
        args: &[Expr],
        d_args: &[Expr],
        body: &Expr,
        target: DiffTarget,
    ) -> Result<Expr, DiffError> {
        let mut total = zero();

        if matches!(target, DiffTarget::Var(_)) {
            let direct = self.diff_expr(body, target)?;
            if !is_zero(&direct) {
                total = add(total, direct.substitute_args(args));
            }
        }

        for (j, d_arg) in d_args.iter().enumerate() {
            if is_zero(d_arg) {
                continue;
            }
            let partial = self.diff_expr(body, DiffTarget::Arg(j as u32))?;
            total = add(total, mul(d_arg.clone(), partial.substitute_args(args)));
        }

        Ok(total)
    }
}

/// `2 / sqrt(pi) * exp(-u^2)`
fn erf_slope(u: Expr) -> Expr {
    mul(c(2.0 / PI.sqrt()), un(Opcode::Exp, neg(square(u))))
}

impl Expr {
    /// Derivative with respect to `addr`, or the typed reason it does not exist.
    pub fn try_diff(&self, addr: Addr, env: &Environment) -> Result<Expr, DiffError> {
        self.try_diff_with(addr, env, &DiffConfig::default())
    }

    pub fn try_diff_with(
        &self,
        addr: Addr,
        env: &Environment,
        config: &DiffConfig,
    ) -> Result<Expr, DiffError> {
        Differentiator::with_config(env, *config).differentiate(self, DiffTarget::Var(addr))
    }

    /// Derivative with respect to `addr`; the null expression when it cannot be formed.
    pub fn diff(&self, addr: Addr, env: &Environment) -> Expr {
        self.diff_with(addr, env, &DiffConfig::default())
    }

    pub fn diff_with(&self, addr: Addr, env: &Environment, config: &DiffConfig) -> Expr {
        match self.try_diff_with(addr, env, config) {
            Ok(derivative) => derivative,
            Err(e) => {
                debug!("differentiation with respect to {addr} failed: {e}");
                Expr::null()
            }
        }
    }
}
