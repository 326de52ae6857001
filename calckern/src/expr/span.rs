//! Index cursors and thunk spans over the flat node buffer.
//!
//! A thunk span is laid out as `[thunk_ret n][body ...][thunk_jmp n]`: the leading marker stores
//! the forward distance to its closing marker and the closing marker stores the distance back.
//! Skipping a span is therefore O(1) from either end, which is what lets the evaluator ignore an
//! untaken branch without walking it.
use crate::error::MalformedExpr;
use crate::expr::Node;
use crate::expr::opcode::{Opcode, OpcodeClass};

/// A validated thunk span inside a node buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThunkSpan {
    /// Index of the `thunk_ret` marker.
    pub start: usize,
    /// Number of nodes including both markers.
    pub len: usize,
}

impl ThunkSpan {
    /// Read the span whose `thunk_ret` marker sits at `start`.
    pub fn at(nodes: &[Node], start: usize) -> Result<Self, MalformedExpr> {
        let distance = match nodes.get(start) {
            Some(Node::ThunkRet(distance)) => *distance as usize,
            Some(_) => return Err(MalformedExpr::ExpectedSpan { position: start }),
            None => return Err(MalformedExpr::Truncated { position: start }),
        };

        match nodes.get(start + distance) {
            Some(Node::ThunkJmp(back)) if *back as usize == distance && distance > 0 => {
                Ok(ThunkSpan {
                    start,
                    len: distance + 1,
                })
            }
            _ => Err(MalformedExpr::UnclosedSpan { start }),
        }
    }

    /// Index of the first body node.
    #[inline]
    pub fn body_start(&self) -> usize {
        self.start + 1
    }

    /// Index of the closing `thunk_jmp` marker.
    #[inline]
    pub fn body_end(&self) -> usize {
        self.start + self.len - 1
    }

    /// Index right after the span.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Bounds-checked read position over a node buffer.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'n> {
    nodes: &'n [Node],
    pos: usize,
}

impl<'n> Cursor<'n> {
    pub fn new(nodes: &'n [Node]) -> Self {
        Self { nodes, pos: 0 }
    }

    pub fn at(nodes: &'n [Node], pos: usize) -> Self {
        Self { nodes, pos }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn nodes(&self) -> &'n [Node] {
        self.nodes
    }

    #[inline]
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn peek(&self) -> Option<Node> {
        self.nodes.get(self.pos).copied()
    }

    /// Consume one node; `None` once the buffer is exhausted.
    #[inline]
    pub fn next(&mut self) -> Option<Node> {
        let node = self.peek()?;
        self.pos += 1;
        Some(node)
    }

    /// The span starting at the current position, without consuming it.
    #[inline]
    pub fn span(&self) -> Result<ThunkSpan, MalformedExpr> {
        ThunkSpan::at(self.nodes, self.pos)
    }

    /// Skip the whole subtree starting at the current position.
    pub fn skip_subtree(&mut self) -> Result<(), MalformedExpr> {
        self.pos = subtree_end(self.nodes, self.pos)?;
        Ok(())
    }
}

/// Index right after the subtree rooted at `pos`.
///
/// Thunk spans are skipped through their stored length, so the cost is linear in the number of
/// nodes outside of spans.
pub fn subtree_end(nodes: &[Node], pos: usize) -> Result<usize, MalformedExpr> {
    let mut pending = 1usize;
    let mut i = pos;

    while pending > 0 {
        let node = nodes
            .get(i)
            .ok_or(MalformedExpr::Truncated { position: i })?;
        pending -= 1;
        match *node {
            Node::Const(_) | Node::Ref(_) | Node::Arg(_) => i += 1,
            Node::Op(op) => {
                pending += op.arity();
                i += 1;
            }
            Node::Call { argc, .. } => {
                pending += argc as usize;
                i += 1;
            }
            Node::ThunkRet(_) => i = ThunkSpan::at(nodes, i)?.end(),
            Node::ThunkJmp(_) => return Err(MalformedExpr::StrayJump { position: i }),
        }
    }

    Ok(i)
}

/// Check that `nodes` holds exactly one well-formed expression.
///
/// Unlike [`subtree_end`], this also walks into every span body and checks operand kinds of
/// control constructs.
pub fn validate(nodes: &[Node]) -> Result<(), MalformedExpr> {
    let end = check_subtree(nodes, 0)?;
    if end != nodes.len() {
        return Err(MalformedExpr::TrailingNodes {
            end,
            leftover: nodes.len() - end,
        });
    }
    Ok(())
}

fn check_span(nodes: &[Node], pos: usize) -> Result<usize, MalformedExpr> {
    let span = ThunkSpan::at(nodes, pos)?;
    if check_subtree(nodes, span.body_start())? != span.body_end() {
        return Err(MalformedExpr::UnclosedSpan { start: pos });
    }
    Ok(span.end())
}

fn check_subtree(nodes: &[Node], pos: usize) -> Result<usize, MalformedExpr> {
    let node = nodes
        .get(pos)
        .ok_or(MalformedExpr::Truncated { position: pos })?;

    match *node {
        Node::Const(_) | Node::Ref(_) | Node::Arg(_) => Ok(pos + 1),
        Node::ThunkRet(_) => Err(MalformedExpr::StrayJump { position: pos }),
        Node::ThunkJmp(_) => Err(MalformedExpr::StrayJump { position: pos }),
        Node::Call { argc, .. } => {
            let mut next = pos + 1;
            for _ in 0..argc {
                next = check_subtree(nodes, next)?;
            }
            Ok(next)
        }
        Node::Op(op) if op.class() == OpcodeClass::Control => match op {
            Opcode::Bnz => {
                let next = check_subtree(nodes, pos + 1)?;
                let next = check_span(nodes, next)?;
                check_span(nodes, next)
            }
            _ => {
                if !matches!(nodes.get(pos + 1), Some(Node::Ref(_))) {
                    return Err(MalformedExpr::ExpectedLoopVariable { position: pos });
                }
                let next = check_subtree(nodes, pos + 2)?;
                let next = check_subtree(nodes, next)?;
                check_span(nodes, next)
            }
        },
        Node::Op(op) => {
            let mut next = pos + 1;
            for _ in 0..op.arity() {
                next = check_subtree(nodes, next)?;
            }
            Ok(next)
        }
    }
}
