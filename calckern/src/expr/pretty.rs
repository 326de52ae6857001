//! RcDoc-based pretty-printer with termcolor annotations for [`Expr`].
//!
//! Documents are built from the flat encoding with precedence-aware parenthesization and
//! rendered either to a plain string or to a `termcolor::WriteColor` sink. Plain output uses the
//! same surface syntax the parser accepts, so it can be read back.
use std::io::{self, Write};

use pretty::{RcDoc, RenderAnnotated};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::env::Environment;
use crate::expr::opcode::{Opcode, OpcodeClass};
use crate::expr::span::ThunkSpan;
use crate::expr::{Expr, Node};

/// Styles that we annotate parts of the document with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Punct, // commas
    /// Parentheses are colored by nesting depth so matching pairs share a color.
    Paren(u8),
    Keyword,  // if, sum, prod
    Operator, // +, *, &&, ||, ==
    Ident,    // variables and parameters
    Function, // builtin and user function names
    Number,
}

impl Style {
    fn to_color_spec(self) -> ColorSpec {
        let mut s = ColorSpec::new();
        match self {
            Style::Punct => {
                s.set_dimmed(true);
            }
            Style::Paren(depth) => {
                let fg = match depth % 6 {
                    0 => Color::Blue,
                    1 => Color::Green,
                    2 => Color::White,
                    3 => Color::Yellow,
                    4 => Color::Red,
                    _ => Color::Magenta,
                };
                s.set_fg(Some(fg)).set_dimmed(true);
            }
            Style::Keyword => {
                s.set_fg(Some(Color::Cyan)).set_bold(true);
            }
            Style::Operator => {
                s.set_fg(Some(Color::Yellow)).set_bold(true);
            }
            Style::Ident => {
                s.set_fg(Some(Color::Green)).set_bold(true);
            }
            Style::Function => {
                s.set_fg(Some(Color::Magenta));
            }
            Style::Number => {
                s.set_fg(Some(Color::Blue));
            }
        }
        s
    }
}

type Doc = RcDoc<'static, Style>;

/// Width large enough that no group ever breaks.
const SINGLE_LINE: usize = u32::MAX as usize;

fn styled(style: Style, s: impl Into<String>) -> Doc {
    RcDoc::text(s.into()).annotate(style)
}

#[inline]
fn lparen(depth: u8) -> Doc {
    RcDoc::as_string("(").annotate(Style::Paren(depth))
}

#[inline]
fn rparen(depth: u8) -> Doc {
    RcDoc::as_string(")").annotate(Style::Paren(depth))
}

/// Binding strength of the construct rooted at a node; atoms bind tightest.
fn precedence(node: Node) -> u8 {
    match node {
        Node::Const(value) if value.is_sign_negative() => 7,
        Node::Op(op) => match op {
            Opcode::Or => 1,
            Opcode::And => 2,
            Opcode::Eq | Opcode::Ne => 3,
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => 4,
            Opcode::Add | Opcode::Sub => 5,
            Opcode::Mul | Opcode::Div | Opcode::Mod => 6,
            Opcode::Neg | Opcode::Not => 7,
            Opcode::Power => 8,
            _ => u8::MAX,
        },
        _ => u8::MAX,
    }
}

fn number(value: f64) -> Doc {
    let text = if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else if value != 0.0 && (value.abs() >= 1e16 || value.abs() < 1e-6) {
        format!("{value:e}")
    } else {
        format!("{value}")
    };
    styled(Style::Number, text)
}

struct Printer<'n, 'e> {
    nodes: &'n [Node],
    env: &'e Environment,
}

impl Printer<'_, '_> {
    /// Operand at `pos`, wrapped in parentheses when it binds looser than `min`.
    fn operand(&self, pos: usize, min: u8, depth: u8) -> Option<(Doc, usize)> {
        let node = *self.nodes.get(pos)?;
        if precedence(node) < min {
            let (inner, next) = self.doc(pos, depth + 1)?;
            let doc = lparen(depth)
                .append(inner)
                .append(rparen(depth))
                .group();
            Some((doc, next))
        } else {
            self.doc(pos, depth)
        }
    }

    /// `name(a, b, ...)` with operands at consecutive positions.
    fn call_like(&self, name: Doc, mut pos: usize, argc: usize, depth: u8) -> Option<(Doc, usize)> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let (arg, next) = self.doc(pos, depth + 1)?;
            args.push(arg);
            pos = next;
        }
        Some((self.wrap_args(name, args, depth), pos))
    }

    fn wrap_args(&self, name: Doc, args: Vec<Doc>, depth: u8) -> Doc {
        let sep = styled(Style::Punct, ",").append(RcDoc::line());
        name.append(lparen(depth))
            .append(RcDoc::intersperse(args, sep).nest(2))
            .append(rparen(depth))
            .group()
    }

    fn span_body(&self, pos: usize, depth: u8) -> Option<(Doc, usize)> {
        let span = ThunkSpan::at(self.nodes, pos).ok()?;
        let (doc, _) = self.doc(span.body_start(), depth)?;
        Some((doc, span.end()))
    }

    fn doc(&self, pos: usize, depth: u8) -> Option<(Doc, usize)> {
        let node = *self.nodes.get(pos)?;
        match node {
            Node::Const(value) => Some((number(value), pos + 1)),
            Node::Ref(addr) => {
                let name = match self.env.name_of(addr) {
                    Some(name) => name.to_string(),
                    None => addr.to_string(),
                };
                Some((styled(Style::Ident, name), pos + 1))
            }
            Node::Arg(index) => Some((styled(Style::Ident, format!("_{index}")), pos + 1)),
            Node::Call { func, argc } => {
                let name = match self.env.function(func) {
                    Some(function) => function.name.clone(),
                    None => func.to_string(),
                };
                self.call_like(styled(Style::Function, name), pos + 1, argc as usize, depth)
            }
            Node::ThunkRet(_) | Node::ThunkJmp(_) => None,
            Node::Op(Opcode::Bnz) => {
                let (cond, next) = self.doc(pos + 1, depth + 1)?;
                let (then, next) = self.span_body(next, depth + 1)?;
                let (otherwise, next) = self.span_body(next, depth + 1)?;
                let doc = self.wrap_args(
                    styled(Style::Keyword, "if"),
                    vec![cond, then, otherwise],
                    depth,
                );
                Some((doc, next))
            }
            Node::Op(op @ (Opcode::Sums | Opcode::Prods)) => {
                let (var, next) = self.doc(pos + 1, depth + 1)?;
                let (lower, next) = self.doc(next, depth + 1)?;
                let (upper, next) = self.doc(next, depth + 1)?;
                let (body, next) = self.span_body(next, depth + 1)?;
                let keyword = if op == Opcode::Sums { "sum" } else { "prod" };
                let doc = self.wrap_args(
                    styled(Style::Keyword, keyword),
                    vec![var, lower, upper, body],
                    depth,
                );
                Some((doc, next))
            }
            Node::Op(op @ (Opcode::Neg | Opcode::Not)) => {
                let symbol = if op == Opcode::Neg { "-" } else { "!" };
                let (operand, next) = self.operand(pos + 1, precedence(node), depth)?;
                Some((styled(Style::Operator, symbol).append(operand), next))
            }
            Node::Op(Opcode::LogBase) => {
                self.call_like(styled(Style::Function, "log"), pos + 1, 2, depth)
            }
            Node::Op(op) => match op.symbol() {
                Some(symbol) => {
                    let prec = precedence(node);
                    // `^` is right associative, every other infix operator left associative
                    let (lhs_min, rhs_min) = if op == Opcode::Power {
                        (prec + 1, prec)
                    } else {
                        (prec, prec + 1)
                    };
                    let (lhs, next) = self.operand(pos + 1, lhs_min, depth)?;
                    let (rhs, next) = self.operand(next, rhs_min, depth)?;
                    let doc = lhs
                        .append(RcDoc::space())
                        .append(styled(Style::Operator, symbol))
                        .append(RcDoc::space())
                        .append(rhs)
                        .group();
                    Some((doc, next))
                }
                None => {
                    debug_assert!(op.class() != OpcodeClass::Control);
                    self.call_like(styled(Style::Function, op.name()), pos + 1, op.arity(), depth)
                }
            },
        }
    }
}

impl Expr {
    /// Build the annotated document of this expression.
    pub fn pretty_doc(&self, env: &Environment) -> Doc {
        if self.is_null() {
            return styled(Style::Keyword, "null");
        }
        if self.validate().is_err() {
            return styled(Style::Keyword, "<malformed>");
        }
        let printer = Printer {
            nodes: self.nodes(),
            env,
        };
        match printer.doc(0, 0) {
            Some((doc, _)) => doc,
            None => styled(Style::Keyword, "<malformed>"),
        }
    }

    /// Render to a `termcolor::WriteColor` with width-aware layout.
    pub fn pretty_render_to<W: WriteColor + Write>(
        &self,
        env: &Environment,
        width: usize,
        out: &mut W,
    ) -> io::Result<()> {
        render_to(&self.pretty_doc(env), width, out)
    }

    /// Print to stdout with colors if supported.
    pub fn pretty_print(&self, env: &Environment) -> io::Result<()> {
        let stdout = StandardStream::stdout(ColorChoice::Auto);
        let mut stdout = stdout.lock();
        self.pretty_render_to(env, terminal_width(), &mut stdout)?;
        writeln!(stdout)
    }

    /// Plain rendering laid out for `width` columns.
    pub fn pretty_string(&self, env: &Environment, width: usize) -> String {
        let mut buf = String::new();
        let _ = self.pretty_doc(env).render_fmt(width, &mut buf);
        buf
    }

    /// Single-line plain rendering.
    pub fn repr(&self, env: &Environment) -> String {
        self.pretty_string(env, SINGLE_LINE)
    }
}

// A writer that maps Style annotations to termcolor ColorSpec on a WriteColor sink.
struct ColorWriter<'w, W: WriteColor + Write> {
    out: &'w mut W,
}

impl<'a, W: WriteColor + Write> RenderAnnotated<'a, Style> for ColorWriter<'_, W> {
    fn push_annotation(&mut self, ann: &'a Style) -> io::Result<()> {
        self.out.set_color(&ann.to_color_spec())
    }
    fn pop_annotation(&mut self) -> io::Result<()> {
        self.out.reset()
    }
}

impl<W: WriteColor + Write> pretty::Render for ColorWriter<'_, W> {
    type Error = io::Error;
    fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.out.write_all(s.as_bytes())?;
        Ok(s.len())
    }
    fn write_str_all(&mut self, s: &str) -> io::Result<()> {
        self.out.write_all(s.as_bytes())
    }
    fn fail_doc(&self) -> Self::Error {
        io::Error::other("render failed")
    }
}

/// Render a document to a `termcolor::WriteColor` with width-aware layout.
pub fn render_to<W: WriteColor + Write>(doc: &Doc, width: usize, out: &mut W) -> io::Result<()> {
    let mut cw = ColorWriter { out };
    doc.render_raw(width, &mut cw)
}

/// Width of the terminal, or 80 if it cannot be determined.
pub fn terminal_width() -> usize {
    term_size::dimensions().map(|(w, _)| w).unwrap_or(80)
}
