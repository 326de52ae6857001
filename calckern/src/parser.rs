//! Parser for the infix expression language using chumsky.
//!
//! Two stages:
//! 1) Tokenisation from input string to a `Token` stream.
//! 2) Parsing tokens into a lightweight arena-allocated AST, then lowering it to an [`Expr`]
//!    against an [`Environment`] (names resolve to addresses, possibly allocating them).
//!
//! The accepted syntax round-trips with the pretty-printer in `expr::pretty`:
//! - Numbers: `3`, `0.25`, `1e-7`; named constants `pi`, `e`, `nan`, `inf`.
//! - Variables: any identifier that is not a parameter or a named constant.
//! - Infix, loosest first: `||`, `&&`, `== !=`, `< <= > >=`, `+ -`, `* / %`, prefix `- !`,
//!   `^` (right-associative, binds tighter than prefix minus: `-x^2 = -(x^2)`).
//! - Builtins by name: `sin(x)`, `beta(a, b)`, ...; `log(x)` is `log10`, `log(x, b)` is `logbase`.
//! - Control: `if(c, a, b)`, `sum(i, lo, hi, body)`, `prod(i, lo, hi, body)`.
//! - Calls of registered functions: `f(a, b)`.
//!
//! Function definitions have the form `f(a, b) = body`; inside `body` the parameters (or the
//! positional names `_0`, `_1`, ...) become `arg` placeholders.
use std::f64::consts::{E, PI};

use chumsky::{input::ValueInput, prelude::*};
use log::debug;
use typed_arena::Arena;

use crate::env::{Environment, FuncId};
use crate::error::{CalcError, CalcResult};
use crate::expr::Expr;
use crate::expr::opcode::{Opcode, OpcodeClass};

pub type Spanned<T> = (T, SimpleSpan);
type Span = SimpleSpan;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),

    // Delimiters & punctuation
    LParen,
    RParen,
    Comma,
    Assign,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Num(value) => write!(f, "{value}"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Assign => write!(f, "="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Caret => write!(f, "^"),
            Token::Bang => write!(f, "!"),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
        }
    }
}

// ---------------- Lexer ----------------

fn lexer<'a>() -> impl Parser<'a, &'a str, Vec<Spanned<Token>>, extra::Err<Rich<'a, char>>> {
    let digits = text::digits(10);
    let number = digits
        .clone()
        .then(just('.').then(digits.clone()).or_not())
        .then(
            one_of("eE")
                .then(one_of("+-").or_not())
                .then(digits)
                .or_not(),
        )
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<f64>()
                .map(Token::Num)
                .map_err(|e| Rich::custom(span, format!("invalid number '{s}': {e}")))
        });

    let ident = text::ascii::ident().map(|s: &str| Token::Ident(s.to_string()));

    // Multi-char operators first to avoid prefix capture
    let op = choice((
        just("||").to(Token::OrOr),
        just("&&").to(Token::AndAnd),
        just("==").to(Token::EqEq),
        just("!=").to(Token::NotEq),
        just("<=").to(Token::Le),
        just(">=").to(Token::Ge),
        just('<').to(Token::Lt),
        just('>').to(Token::Gt),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Star),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
        just('^').to(Token::Caret),
        just('!').to(Token::Bang),
        just('=').to(Token::Assign),
    ));

    let punct = choice((
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
        just(',').to(Token::Comma),
    ));

    choice((number, ident, op, punct))
        .map_with(|tok, e| (tok, e.span()))
        .padded()
        .repeated()
        .collect()
        .then_ignore(end())
}

// ---------------- Arena AST ----------------

#[derive(Debug, Clone)]
enum Ast<'a> {
    Num(f64),
    Name(String),
    Prefix(Opcode, &'a Ast<'a>),
    Infix(Opcode, &'a Ast<'a>, &'a Ast<'a>),
    Call(String, Vec<Ast<'a>>),
    // Error placeholder (used by recovery)
    Error,
}

fn ast_parser<'tokens, I>(
    arena: &'tokens Arena<Ast<'tokens>>,
) -> impl Parser<'tokens, I, Ast<'tokens>, extra::Err<Rich<'tokens, Token, Span>>> + Clone
where
    I: ValueInput<'tokens, Token = Token, Span = Span>,
{
    let infix = move |a: Ast<'tokens>, (op, b): (Opcode, Ast<'tokens>)| {
        Ast::Infix(op, arena.alloc(a), arena.alloc(b))
    };

    recursive(|expr| {
        let number = select! { Token::Num(value) => Ast::Num(value) }.labelled("number");
        let name = select! { Token::Ident(name) => name }.labelled("identifier");

        let args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .labelled("arguments");

        // Parenthesised expressions (recover mismatched/missing parens)
        let paren_expr = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .recover_with(via_parser(nested_delimiters(
                Token::LParen,
                Token::RParen,
                [],
                |_| Ast::Error,
            )))
            .labelled("parentheses");

        let atom = choice((
            number,
            name.then(args.or_not()).map(|(name, args)| match args {
                Some(args) => Ast::Call(name, args),
                None => Ast::Name(name),
            }),
            paren_expr,
        ))
        .labelled("atom");

        // Prefix operators bind looser than `^`, which is right-associative
        let unary = recursive(|unary| {
            let power = atom
                .clone()
                .then(just(Token::Caret).ignore_then(unary.clone()).or_not())
                .map(move |(base, exponent)| match exponent {
                    Some(exponent) => {
                        Ast::Infix(Opcode::Power, arena.alloc(base), arena.alloc(exponent))
                    }
                    None => base,
                });

            let prefix = choice((
                just(Token::Minus).to(Opcode::Neg),
                just(Token::Bang).to(Opcode::Not),
            ))
            .then(unary)
            .map(move |(op, operand)| Ast::Prefix(op, arena.alloc(operand)));

            prefix.or(power)
        });

        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(Opcode::Mul),
                just(Token::Slash).to(Opcode::Div),
                just(Token::Percent).to(Opcode::Mod),
            ))
            .then(unary)
            .repeated(),
            infix,
        );

        let sum = product.clone().foldl(
            choice((
                just(Token::Plus).to(Opcode::Add),
                just(Token::Minus).to(Opcode::Sub),
            ))
            .then(product)
            .repeated(),
            infix,
        );

        let relation = sum.clone().foldl(
            choice((
                just(Token::Le).to(Opcode::Le),
                just(Token::Ge).to(Opcode::Ge),
                just(Token::Lt).to(Opcode::Lt),
                just(Token::Gt).to(Opcode::Gt),
            ))
            .then(sum)
            .repeated(),
            infix,
        );

        let equality = relation.clone().foldl(
            choice((
                just(Token::EqEq).to(Opcode::Eq),
                just(Token::NotEq).to(Opcode::Ne),
            ))
            .then(relation)
            .repeated(),
            infix,
        );

        let conjunction = equality.clone().foldl(
            just(Token::AndAnd)
                .to(Opcode::And)
                .then(equality)
                .repeated(),
            infix,
        );

        conjunction
            .clone()
            .foldl(
                just(Token::OrOr).to(Opcode::Or).then(conjunction).repeated(),
                infix,
            )
            .labelled("expression")
    })
}

/// `name(params) = body`
fn definition_parser<'tokens, I>(
    arena: &'tokens Arena<Ast<'tokens>>,
) -> impl Parser<'tokens, I, ((String, Vec<String>), Ast<'tokens>), extra::Err<Rich<'tokens, Token, Span>>>
+ Clone
where
    I: ValueInput<'tokens, Token = Token, Span = Span>,
{
    let name = select! { Token::Ident(name) => name };
    let params = name
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .labelled("parameters");

    name.then(params)
        .then_ignore(just(Token::Assign))
        .then(ast_parser(arena))
}

// ---------------- Lowering ----------------

struct Lowering<'e> {
    env: &'e mut Environment,
    params: &'e [String],
    /// Set while lowering a function body: `_<i>` names then denote parameters.
    in_function: bool,
    errors: Vec<String>,
    /// First call to a name that is neither a builtin nor a registered function.
    unknown: Option<String>,
}

impl Lowering<'_> {
    fn error(&mut self, message: String) -> Expr {
        self.errors.push(message);
        Expr::null()
    }

    /// Merge the lowering diagnostics into `errors`. A lone unknown call is reported as
    /// [`CalcError::UnknownFunction`].
    fn finish(self, mut errors: Vec<String>) -> CalcResult<()> {
        errors.extend(self.errors);
        match self.unknown {
            None if errors.is_empty() => Ok(()),
            None => Err(CalcError::Parse(errors)),
            Some(name) if errors.is_empty() => Err(CalcError::UnknownFunction(name)),
            Some(name) => {
                errors.push(format!("unknown function `{name}`"));
                Err(CalcError::Parse(errors))
            }
        }
    }

    fn name(&mut self, name: &str) -> Expr {
        if let Some(index) = self.params.iter().position(|p| p == name) {
            return Expr::arg(index as u32);
        }
        if self.in_function {
            if let Some(index) = name.strip_prefix('_').and_then(|i| i.parse::<u32>().ok()) {
                if (index as usize) < self.params.len() {
                    return Expr::arg(index);
                }
                return self.error(format!(
                    "parameter `_{index}` is out of range for {} parameter(s)",
                    self.params.len()
                ));
            }
        }
        match name {
            "pi" => Expr::constant(PI),
            "e" => Expr::constant(E),
            "nan" => Expr::constant(f64::NAN),
            "inf" => Expr::constant(f64::INFINITY),
            _ => Expr::var(self.env.resolve(name, false)),
        }
    }

    fn lower(&mut self, ast: &Ast<'_>) -> Expr {
        match ast {
            Ast::Num(value) => Expr::constant(*value),
            Ast::Name(name) => self.name(name),
            Ast::Prefix(Opcode::Neg, Ast::Num(value)) => Expr::constant(-value),
            Ast::Prefix(op, operand) => {
                let operand = self.lower(operand);
                Expr::unary(*op, operand)
            }
            Ast::Infix(op, lhs, rhs) => {
                let lhs = self.lower(lhs);
                let rhs = self.lower(rhs);
                Expr::binary(*op, lhs, rhs)
            }
            Ast::Call(name, args) => self.call(name, args),
            Ast::Error => Expr::null(),
        }
    }

    fn expect_args(&mut self, name: &str, args: &[Ast<'_>], expected: usize) -> bool {
        if args.len() == expected {
            return true;
        }
        self.errors.push(format!(
            "`{name}` expects {expected} argument(s), found {}",
            args.len()
        ));
        false
    }

    fn call(&mut self, name: &str, args: &[Ast<'_>]) -> Expr {
        match name {
            "if" => {
                if !self.expect_args(name, args, 3) {
                    return Expr::null();
                }
                let cond = self.lower(&args[0]);
                let then = self.lower(&args[1]);
                let otherwise = self.lower(&args[2]);
                return Expr::branch(cond, then, otherwise);
            }
            "sum" | "prod" => {
                if !self.expect_args(name, args, 4) {
                    return Expr::null();
                }
                let Ast::Name(var) = &args[0] else {
                    return self.error(format!("`{name}` expects a loop variable name first"));
                };
                if self.params.contains(var) {
                    return self.error(format!("loop variable `{var}` shadows a parameter"));
                }
                let var = self.env.resolve(var, false);
                let lower = self.lower(&args[1]);
                let upper = self.lower(&args[2]);
                let body = self.lower(&args[3]);
                return if name == "sum" {
                    Expr::sum(var, lower, upper, body)
                } else {
                    Expr::product(var, lower, upper, body)
                };
            }
            "log" => {
                return match args {
                    [x] => Expr::unary(Opcode::Log10, self.lower(x)),
                    [x, base] => {
                        let x = self.lower(x);
                        let base = self.lower(base);
                        Expr::binary(Opcode::LogBase, x, base)
                    }
                    _ => self.error(format!(
                        "`log` expects 1 or 2 argument(s), found {}",
                        args.len()
                    )),
                };
            }
            _ => {}
        }

        if let Ok(op) = name.parse::<Opcode>() {
            if op.class() != OpcodeClass::Control {
                if !self.expect_args(name, args, op.arity()) {
                    return Expr::null();
                }
                let mut operands = args.iter().map(|arg| self.lower(arg)).collect::<Vec<_>>();
                return match operands.len() {
                    1 => Expr::unary(op, operands.remove(0)),
                    _ => {
                        let rhs = operands.remove(1);
                        Expr::binary(op, operands.remove(0), rhs)
                    }
                };
            }
        }

        let Some(func) = self.env.function_id(name) else {
            if self.unknown.is_none() {
                self.unknown = Some(name.to_string());
                return Expr::null();
            }
            return self.error(format!("unknown function `{name}`"));
        };
        let argc = self.env.function(func).map(|f| f.argc).unwrap_or_default();
        if !self.expect_args(name, args, argc as usize) {
            return Expr::null();
        }
        let operands = args.iter().map(|arg| self.lower(arg)).collect::<Vec<_>>();
        Expr::call(func, operands)
    }
}

// ---------------- Public API ----------------

fn lex(src: &str) -> CalcResult<Vec<Token>> {
    let (tokens, lex_errs) = lexer().parse(src).into_output_errors();
    let errors: Vec<String> = lex_errs
        .into_iter()
        .map(|e| format!("lexing error: {e}"))
        .collect();

    match tokens {
        Some(tokens) if errors.is_empty() => Ok(tokens.into_iter().map(|(t, _)| t).collect()),
        _ => Err(CalcError::Parse(errors)),
    }
}

/// Parse an infix expression, resolving names through `env`.
///
/// Unknown variable names are allocated (non-explicit resolution). Returns the diagnostics as
/// [`CalcError::Parse`] on failure.
///
/// Example
/// ```
/// use calckern::env::Environment;
/// use calckern::parser::parse;
///
/// let mut env = Environment::new();
/// let e = parse(&mut env, "sum(i, 0, a, a * i^2)").unwrap();
/// env.set("a", 3.0);
/// assert_eq!(e.eval(&mut env), 42.0);
/// ```
pub fn parse(env: &mut Environment, src: &str) -> CalcResult<Expr> {
    let arena = Arena::new();
    let tokens = lex(src)?;

    let (ast, parse_errs) = ast_parser(&arena)
        .then_ignore(end())
        .parse(tokens.as_slice())
        .into_output_errors();
    let errors: Vec<String> = parse_errs
        .into_iter()
        .map(|e| format!("parse error: {e}"))
        .collect();

    let ast = match ast {
        Some(ast) if errors.is_empty() => ast,
        _ => return Err(CalcError::Parse(errors)),
    };

    let mut lowering = Lowering {
        env: &mut *env,
        params: &[],
        in_function: false,
        errors: Vec::new(),
        unknown: None,
    };
    let expr = lowering.lower(&ast);
    lowering.finish(errors)?;
    Ok(expr)
}

/// Parse and register a function definition `name(p0, p1, ...) = body`.
///
/// The body may call the function itself. Redefining an existing function keeps its id; when the
/// new definition fails to parse the previous one is restored.
pub fn define_function(env: &mut Environment, src: &str) -> CalcResult<FuncId> {
    let arena = Arena::new();
    let tokens = lex(src)?;

    let (definition, parse_errs) = definition_parser(&arena)
        .then_ignore(end())
        .parse(tokens.as_slice())
        .into_output_errors();
    let mut errors: Vec<String> = parse_errs
        .into_iter()
        .map(|e| format!("parse error: {e}"))
        .collect();

    let ((name, params), body) = match definition {
        Some(definition) if errors.is_empty() => definition,
        _ => return Err(CalcError::Parse(errors)),
    };

    if name.parse::<Opcode>().is_ok() || matches!(name.as_str(), "if" | "sum" | "prod" | "log") {
        return Err(CalcError::Parse(vec![format!(
            "cannot redefine builtin `{name}`"
        )]));
    }
    for (i, param) in params.iter().enumerate() {
        if params[..i].contains(param) {
            errors.push(format!("duplicate parameter `{param}`"));
        }
    }
    if !errors.is_empty() {
        return Err(CalcError::Parse(errors));
    }

    // Register first so the body can refer to the function itself
    let argc = params.len() as u32;
    let previous = env
        .function_id(&name)
        .and_then(|id| env.function(id))
        .cloned();
    let id = env.define_function(&name, argc, Expr::null());

    let mut lowering = Lowering {
        env: &mut *env,
        params: &params,
        in_function: true,
        errors: Vec::new(),
        unknown: None,
    };
    let expr = lowering.lower(&body);

    if let Err(err) = lowering.finish(errors) {
        match previous {
            Some(previous) => {
                env.define_function(&name, previous.argc, previous.body.clone());
            }
            None => {
                env.remove_function(&name);
            }
        }
        return Err(err);
    }

    debug!("defined function `{name}` as {id} with {argc} parameter(s)");
    env.define_function(&name, argc, expr);
    Ok(id)
}

impl Expr {
    /// Shorthand for [`parse`].
    pub fn parse(src: &str, env: &mut Environment) -> CalcResult<Expr> {
        parse(env, src)
    }
}
