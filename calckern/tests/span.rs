use calckern::env::Addr;
use calckern::error::MalformedExpr;
use calckern::expr::opcode::Opcode;
use calckern::expr::span::{Cursor, ThunkSpan, subtree_end};
use calckern::expr::{Expr, Node};

#[test]
fn branch_layout_uses_thunk_spans() {
    let e = Expr::branch(
        Expr::constant(1.0),
        Expr::constant(2.0),
        Expr::constant(3.0),
    );
    assert_eq!(
        e.nodes(),
        &[
            Node::Op(Opcode::Bnz),
            Node::Const(1.0),
            Node::ThunkRet(2),
            Node::Const(2.0),
            Node::ThunkJmp(2),
            Node::ThunkRet(2),
            Node::Const(3.0),
            Node::ThunkJmp(2),
        ]
    );

    let then_span = ThunkSpan::at(e.nodes(), 2).unwrap();
    assert_eq!(then_span.len, 3);
    assert_eq!(then_span.body_start(), 3);
    assert_eq!(then_span.body_end(), 4);
    assert_eq!(then_span.end(), 5);
    assert_eq!(subtree_end(e.nodes(), 0), Ok(8));
}

#[test]
fn loop_layout() {
    let i = Addr(0);
    let e = Expr::sum(i, Expr::constant(1.0), Expr::constant(3.0), Expr::var(i) * 2.0);
    assert_eq!(
        e.nodes(),
        &[
            Node::Op(Opcode::Sums),
            Node::Ref(i),
            Node::Const(1.0),
            Node::Const(3.0),
            Node::ThunkRet(4),
            Node::Op(Opcode::Mul),
            Node::Ref(i),
            Node::Const(2.0),
            Node::ThunkJmp(4),
        ]
    );
    assert!(e.validate().is_ok());
}

#[test]
fn cursor_skips_subtrees() {
    let x = Addr(0);
    // (x + 1) * if(x, 2, 3)
    let lhs = Expr::var(x) + 1.0;
    let rhs = Expr::branch(Expr::var(x), Expr::constant(2.0), Expr::constant(3.0));
    let e = lhs * rhs;

    let mut cursor = Cursor::new(e.nodes());
    assert_eq!(cursor.next(), Some(Node::Op(Opcode::Mul)));
    cursor.skip_subtree().unwrap();
    assert_eq!(cursor.peek(), Some(Node::Op(Opcode::Bnz)));
    cursor.skip_subtree().unwrap();
    assert_eq!(cursor.pos(), e.len());
    assert_eq!(cursor.next(), None);
}

#[test]
fn builders_propagate_null() {
    let x = Expr::var(Addr(0));
    assert!(Expr::binary(Opcode::Add, x.clone(), Expr::null()).is_null());
    assert!(Expr::unary(Opcode::Sin, Expr::null()).is_null());
    assert!(Expr::branch(Expr::null(), x.clone(), x.clone()).is_null());
    assert!(Expr::sum(Addr(1), Expr::null(), x.clone(), x.clone()).is_null());
    assert!(Expr::call(calckern::env::FuncId(0), [x, Expr::null()]).is_null());
    assert!(Expr::from_nodes([]).unwrap().is_null());
}

#[test]
fn malformed_buffers_are_rejected() {
    use Node::*;

    assert_eq!(
        Expr::from_nodes([Op(Opcode::Add), Const(1.0)]),
        Err(MalformedExpr::Truncated { position: 2 })
    );
    assert_eq!(
        Expr::from_nodes([Const(1.0), Const(2.0)]),
        Err(MalformedExpr::TrailingNodes {
            end: 1,
            leftover: 1
        })
    );
    assert_eq!(
        Expr::from_nodes([ThunkJmp(1)]),
        Err(MalformedExpr::StrayJump { position: 0 })
    );
    assert_eq!(
        Expr::from_nodes([Op(Opcode::Bnz), Const(1.0), Const(2.0), Const(3.0)]),
        Err(MalformedExpr::ExpectedSpan { position: 2 })
    );
    // Span pointing past its closing marker
    assert_eq!(
        Expr::from_nodes([
            Op(Opcode::Bnz),
            Const(1.0),
            ThunkRet(2),
            Const(2.0),
            Const(3.0),
        ]),
        Err(MalformedExpr::UnclosedSpan { start: 2 })
    );
    // Span body holding two expressions
    assert_eq!(
        Expr::from_nodes([
            Op(Opcode::Bnz),
            Const(1.0),
            ThunkRet(3),
            Const(2.0),
            Const(3.0),
            ThunkJmp(3),
            ThunkRet(2),
            Const(4.0),
            ThunkJmp(2),
        ]),
        Err(MalformedExpr::UnclosedSpan { start: 2 })
    );
    assert_eq!(
        Expr::from_nodes([
            Op(Opcode::Sums),
            Const(1.0),
            Const(1.0),
            Const(2.0),
            ThunkRet(2),
            Const(1.0),
            ThunkJmp(2),
        ]),
        Err(MalformedExpr::ExpectedLoopVariable { position: 0 })
    );
}

#[test]
fn substitution_respects_loop_binders() {
    let x = Addr(0);
    let i = Addr(1);
    // x + sum(x, 1, 2, x * i)
    let inner = Expr::sum(
        x,
        Expr::constant(1.0),
        Expr::constant(2.0),
        Expr::var(x) * Expr::var(i),
    );
    let e = Expr::var(x) + inner.clone();
    let substituted = e.substitute_var(x, &Expr::constant(5.0));
    assert_eq!(substituted, Expr::constant(5.0) + inner);

    // Spans are rebuilt around larger replacements
    let body = Expr::sum(x, Expr::constant(1.0), Expr::constant(2.0), Expr::var(i));
    let y = Addr(2);
    let replaced = body.substitute_var(i, &(Expr::var(y) * 3.0 + 1.0));
    assert!(replaced.validate().is_ok());
    assert_eq!(
        replaced,
        Expr::sum(
            x,
            Expr::constant(1.0),
            Expr::constant(2.0),
            Expr::var(y) * 3.0 + 1.0
        )
    );
}

#[test]
fn argument_substitution() {
    let body = Expr::arg(0) * Expr::arg(1) + Expr::arg(0);
    let replaced = body.substitute_args(&[Expr::constant(2.0), Expr::var(Addr(3))]);
    assert_eq!(
        replaced,
        Expr::constant(2.0) * Expr::var(Addr(3)) + Expr::constant(2.0)
    );
    assert!(!replaced.is_closed());
    assert!((Expr::constant(1.0) + 2.0).is_closed());
}
