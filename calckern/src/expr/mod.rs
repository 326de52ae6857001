//! Flat prefix-order expression buffer.
//!
//! An [`Expr`] stores its tree as a contiguous sequence of [`Node`]s in prefix order: every
//! opcode is followed by its operand subtrees. Operands of control constructs that must not be
//! evaluated eagerly (branches of `bnz`, loop bodies) are wrapped in thunk spans, see
//! [`span::ThunkSpan`].
//!
//! Encodings of the control constructs:
//! - `bnz`: `[bnz][cond][span then][span else]`
//! - `sums` / `prods`: `[op][ref var][lower][upper][span body]`
//! - calls: `[call f argc][arg 0]...[arg argc-1]`
//!
//! The empty buffer is the canonical *null* expression. It is what failed operations return and
//! it evaluates to NaN. Builders propagate null: combining a null operand yields null.
pub mod opcode;
pub mod pretty;
pub mod span;

use std::ops::{Add, Div, Mul, Neg, Sub};

use smallvec::SmallVec;

use crate::env::{Addr, Environment, FuncId};
use crate::error::MalformedExpr;
use crate::eval;
use crate::expr::opcode::{Opcode, OpcodeClass};
use crate::expr::span::ThunkSpan;

/// One slot of the flat encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node {
    /// Numeric literal.
    Const(f64),
    /// Variable reference, resolved through the [`Environment`].
    Ref(Addr),
    /// Positional parameter inside a function body.
    Arg(u32),
    Op(Opcode),
    /// Call of a registered function with `argc` inline argument subtrees.
    Call { func: FuncId, argc: u32 },
    /// Opening marker of a thunk span, holds the distance to its closing marker.
    ThunkRet(u32),
    /// Closing marker of a thunk span, holds the distance back to its opening marker.
    ThunkJmp(u32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expr {
    nodes: SmallVec<[Node; 8]>,
}

impl Expr {
    /// The canonical null expression.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self::leaf(Node::Const(value))
    }

    pub fn var(addr: Addr) -> Self {
        Self::leaf(Node::Ref(addr))
    }

    pub fn arg(index: u32) -> Self {
        Self::leaf(Node::Arg(index))
    }

    fn leaf(node: Node) -> Self {
        let mut nodes = SmallVec::new();
        nodes.push(node);
        Self { nodes }
    }

    /// Build from raw nodes, checking well-formedness.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self, MalformedExpr> {
        let expr = Self {
            nodes: nodes.into_iter().collect(),
        };
        if !expr.is_null() {
            expr.validate()?;
        }
        Ok(expr)
    }

    /// Build from a slice already known to hold exactly one subtree.
    pub(crate) fn from_subtree(nodes: &[Node]) -> Self {
        Self {
            nodes: SmallVec::from_slice(nodes),
        }
    }

    pub fn unary(op: Opcode, operand: Expr) -> Self {
        debug_assert_eq!(op.arity(), 1, "`{op}` is not a unary opcode");
        if operand.is_null() {
            return Self::null();
        }
        let mut nodes = SmallVec::with_capacity(operand.len() + 1);
        nodes.push(Node::Op(op));
        nodes.extend_from_slice(&operand.nodes);
        Self { nodes }
    }

    pub fn binary(op: Opcode, lhs: Expr, rhs: Expr) -> Self {
        debug_assert!(
            op.arity() == 2 && op.class() != OpcodeClass::Control,
            "`{op}` is not a binary opcode"
        );
        if lhs.is_null() || rhs.is_null() {
            return Self::null();
        }
        let mut nodes = SmallVec::with_capacity(lhs.len() + rhs.len() + 1);
        nodes.push(Node::Op(op));
        nodes.extend_from_slice(&lhs.nodes);
        nodes.extend_from_slice(&rhs.nodes);
        Self { nodes }
    }

    /// `bnz(cond, then, else)`: only the selected branch is evaluated.
    pub fn branch(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        if cond.is_null() || then.is_null() || otherwise.is_null() {
            return Self::null();
        }
        let mut nodes = SmallVec::with_capacity(cond.len() + then.len() + otherwise.len() + 5);
        nodes.push(Node::Op(Opcode::Bnz));
        nodes.extend_from_slice(&cond.nodes);
        push_span(&mut nodes, &then);
        push_span(&mut nodes, &otherwise);
        Self { nodes }
    }

    /// Sum of `body` for `var` over the inclusive integer range `[lower, upper]`.
    pub fn sum(var: Addr, lower: Expr, upper: Expr, body: Expr) -> Self {
        Self::fold_loop(Opcode::Sums, var, lower, upper, body)
    }

    /// Product of `body` for `var` over the inclusive integer range `[lower, upper]`.
    pub fn product(var: Addr, lower: Expr, upper: Expr, body: Expr) -> Self {
        Self::fold_loop(Opcode::Prods, var, lower, upper, body)
    }

    pub(crate) fn fold_loop(op: Opcode, var: Addr, lower: Expr, upper: Expr, body: Expr) -> Self {
        debug_assert!(matches!(op, Opcode::Sums | Opcode::Prods));
        if lower.is_null() || upper.is_null() || body.is_null() {
            return Self::null();
        }
        let mut nodes = SmallVec::with_capacity(lower.len() + upper.len() + body.len() + 4);
        nodes.push(Node::Op(op));
        nodes.push(Node::Ref(var));
        nodes.extend_from_slice(&lower.nodes);
        nodes.extend_from_slice(&upper.nodes);
        push_span(&mut nodes, &body);
        Self { nodes }
    }

    pub fn call(func: FuncId, args: impl IntoIterator<Item = Expr>) -> Self {
        let mut nodes: SmallVec<[Node; 8]> = SmallVec::new();
        nodes.push(Node::Call { func, argc: 0 });
        let mut argc = 0u32;
        for arg in args {
            if arg.is_null() {
                return Self::null();
            }
            nodes.extend_from_slice(&arg.nodes);
            argc += 1;
        }
        nodes[0] = Node::Call { func, argc };
        Self { nodes }
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Self::binary(Opcode::Power, self, exponent)
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The literal value if the expression is a single constant.
    pub fn as_constant(&self) -> Option<f64> {
        match self.nodes.as_slice() {
            [Node::Const(value)] => Some(*value),
            _ => None,
        }
    }

    /// True when the value cannot depend on the environment or on arguments.
    pub fn is_closed(&self) -> bool {
        !self.is_null()
            && self
                .nodes
                .iter()
                .all(|node| !matches!(node, Node::Ref(_) | Node::Arg(_) | Node::Call { .. }))
    }

    /// True if `addr` appears anywhere in this buffer, loop variable slots included.
    pub fn contains_var(&self, addr: Addr) -> bool {
        self.nodes.iter().any(|node| *node == Node::Ref(addr))
    }

    /// True if the value may depend on `addr`, looking through called function bodies.
    pub fn depends_on(&self, addr: Addr, env: &Environment) -> bool {
        crate::diff::depends_on(self, crate::diff::DiffTarget::Var(addr), env)
    }

    pub fn validate(&self) -> Result<(), MalformedExpr> {
        span::validate(&self.nodes)
    }

    /// Replace every free occurrence of `addr` with `value`.
    ///
    /// Loop variable slots are binders: a nested loop over `addr` shadows it, so its body is left
    /// untouched. Span lengths are recomputed for the rebuilt tree.
    pub fn substitute_var(&self, addr: Addr, value: &Expr) -> Expr {
        if self.is_null() {
            return Self::null();
        }
        let mut bound = SmallVec::<[Addr; 4]>::new();
        let mut replace = |node: Node, bound: &[Addr]| match node {
            Node::Ref(a) if a == addr && !bound.contains(&addr) => Some(value.clone()),
            _ => None,
        };
        let mut keep_calls = |_: FuncId, _: &[Expr]| -> Option<Expr> { None };
        rebuild(&self.nodes, 0, &mut replace, &mut keep_calls, &mut bound)
            .map(|(expr, _)| expr)
            .unwrap_or_default()
    }

    /// Replace `arg i` with `args[i]`. Arguments past the end of `args` are kept.
    pub fn substitute_args(&self, args: &[Expr]) -> Expr {
        if self.is_null() {
            return Self::null();
        }
        let mut bound = SmallVec::<[Addr; 4]>::new();
        let mut replace = |node: Node, _: &[Addr]| match node {
            Node::Arg(i) => args.get(i as usize).cloned(),
            _ => None,
        };
        let mut keep_calls = |_: FuncId, _: &[Expr]| -> Option<Expr> { None };
        rebuild(&self.nodes, 0, &mut replace, &mut keep_calls, &mut bound)
            .map(|(expr, _)| expr)
            .unwrap_or_default()
    }

    /// Rebuild with every call for which `inline` returns a replacement swapped out.
    ///
    /// `inline` receives the already rebuilt arguments of the call.
    pub(crate) fn inline_calls(&self, inline: &mut Inline<'_>) -> Result<Expr, MalformedExpr> {
        if self.is_null() {
            return Ok(Self::null());
        }
        let mut bound = SmallVec::<[Addr; 4]>::new();
        let mut keep_leaves = |_: Node, _: &[Addr]| -> Option<Expr> { None };
        rebuild(&self.nodes, 0, &mut keep_leaves, inline, &mut bound).map(|(expr, _)| expr)
    }

    /// Evaluate against `env`. Null and malformed expressions evaluate to NaN.
    pub fn eval(&self, env: &mut Environment) -> f64 {
        eval::evaluate(self, env)
    }
}

fn push_span(nodes: &mut SmallVec<[Node; 8]>, body: &Expr) {
    let distance = (body.len() + 1) as u32;
    nodes.push(Node::ThunkRet(distance));
    nodes.extend_from_slice(&body.nodes);
    nodes.push(Node::ThunkJmp(distance));
}

type Replace<'r> = dyn FnMut(Node, &[Addr]) -> Option<Expr> + 'r;
pub(crate) type Inline<'r> = dyn FnMut(FuncId, &[Expr]) -> Option<Expr> + 'r;

/// Structurally rebuild the subtree at `pos`, letting `replace` swap out leaves.
///
/// `bound` holds the loop variables in scope at `pos`.
fn rebuild(
    nodes: &[Node],
    pos: usize,
    replace: &mut Replace<'_>,
    inline: &mut Inline<'_>,
    bound: &mut SmallVec<[Addr; 4]>,
) -> Result<(Expr, usize), MalformedExpr> {
    let node = *nodes
        .get(pos)
        .ok_or(MalformedExpr::Truncated { position: pos })?;

    match node {
        Node::Const(_) | Node::Ref(_) | Node::Arg(_) => {
            let expr = replace(node, bound).unwrap_or_else(|| Expr::leaf(node));
            Ok((expr, pos + 1))
        }
        Node::ThunkRet(_) | Node::ThunkJmp(_) => Err(MalformedExpr::StrayJump { position: pos }),
        Node::Call { func, argc } => {
            let mut args = SmallVec::<[Expr; 4]>::with_capacity(argc as usize);
            let mut next = pos + 1;
            for _ in 0..argc {
                let (arg, end) = rebuild(nodes, next, replace, inline, bound)?;
                args.push(arg);
                next = end;
            }
            match inline(func, &args) {
                Some(expr) => Ok((expr, next)),
                None => Ok((Expr::call(func, args), next)),
            }
        }
        Node::Op(Opcode::Bnz) => {
            let (cond, next) = rebuild(nodes, pos + 1, replace, inline, bound)?;
            let then_span = ThunkSpan::at(nodes, next)?;
            let (then, _) = rebuild(nodes, then_span.body_start(), replace, inline, bound)?;
            let else_span = ThunkSpan::at(nodes, then_span.end())?;
            let (otherwise, _) =
                rebuild(nodes, else_span.body_start(), replace, inline, bound)?;
            Ok((Expr::branch(cond, then, otherwise), else_span.end()))
        }
        Node::Op(op @ (Opcode::Sums | Opcode::Prods)) => {
            let Some(Node::Ref(var)) = nodes.get(pos + 1).copied() else {
                return Err(MalformedExpr::ExpectedLoopVariable { position: pos });
            };
            let (lower, next) = rebuild(nodes, pos + 2, replace, inline, bound)?;
            let (upper, next) = rebuild(nodes, next, replace, inline, bound)?;
            let body_span = ThunkSpan::at(nodes, next)?;
            bound.push(var);
            let body = rebuild(nodes, body_span.body_start(), replace, inline, bound);
            bound.pop();
            Ok((
                Expr::fold_loop(op, var, lower, upper, body?.0),
                body_span.end(),
            ))
        }
        Node::Op(op) if op.arity() == 1 => {
            let (operand, next) = rebuild(nodes, pos + 1, replace, inline, bound)?;
            Ok((Expr::unary(op, operand), next))
        }
        Node::Op(op) => {
            let (lhs, next) = rebuild(nodes, pos + 1, replace, inline, bound)?;
            let (rhs, next) = rebuild(nodes, next, replace, inline, bound)?;
            Ok((Expr::binary(op, lhs, rhs), next))
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::constant(value)
    }
}

impl From<Addr> for Expr {
    fn from(addr: Addr) -> Self {
        Expr::var(addr)
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $opcode:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($opcode, self, rhs)
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;

            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($opcode, self, Expr::constant(rhs))
            }
        }
    };
}

binary_operator!(Add, add, Opcode::Add);
binary_operator!(Sub, sub, Opcode::Sub);
binary_operator!(Mul, mul, Opcode::Mul);
binary_operator!(Div, div, Opcode::Div);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(Opcode::Neg, self)
    }
}
