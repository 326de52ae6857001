//! Closed opcode set of the expression language.
//!
//! Every opcode has a fixed operand count, see [`Opcode::arity`]. Calls are not opcodes: their
//! operand count is stored inline in the call node.
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Category used by consumers to dispatch on groups of opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeClass {
    /// Binary arithmetic (`add`, `power`, `logbase`, ...).
    Arithmetic,
    /// Comparisons producing `1.0` or `0.0`.
    Comparison,
    /// Logical connectives, any nonzero value is true.
    Boolean,
    /// Single-operand numeric functions.
    Unary,
    /// Constructs with thunk span operands (`bnz`, `sums`, `prods`).
    Control,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Opcode {
    // Binary arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    LogBase,
    Max,
    Min,
    Choose,
    Beta,

    // Comparison
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,

    // Boolean
    And,
    Or,
    Not,

    // Unary
    Neg,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Log2,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Gamma,
    LnGamma,
    Digamma,
    Trigamma,
    Tetragamma,
    Factorial,
    Floor,
    Ceil,
    Round,
    Sign,
    Erf,
    Erfc,
    NormPdf,
    NormCdf,
    Zeta,

    // Control
    Bnz,
    Sums,
    Prods,
}

impl Opcode {
    /// Number of operand subtrees following the opcode node.
    ///
    /// For control opcodes the thunk spans and the loop variable slot count as operands.
    pub const fn arity(self) -> usize {
        match self.class() {
            OpcodeClass::Arithmetic | OpcodeClass::Comparison => 2,
            OpcodeClass::Boolean => match self {
                Opcode::Not => 1,
                _ => 2,
            },
            OpcodeClass::Unary => 1,
            OpcodeClass::Control => match self {
                Opcode::Bnz => 3,
                _ => 4,
            },
        }
    }

    pub const fn class(self) -> OpcodeClass {
        use Opcode::*;
        match self {
            Add | Sub | Mul | Div | Mod | Power | LogBase | Max | Min | Choose | Beta => {
                OpcodeClass::Arithmetic
            }
            Lt | Le | Gt | Ge | Eq | Ne => OpcodeClass::Comparison,
            And | Or | Not => OpcodeClass::Boolean,
            Bnz | Sums | Prods => OpcodeClass::Control,
            _ => OpcodeClass::Unary,
        }
    }

    /// Opcodes whose value is piecewise constant, their derivative is zero almost everywhere.
    pub const fn is_piecewise_constant(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Lt | Le
                | Gt
                | Ge
                | Eq
                | Ne
                | And
                | Or
                | Not
                | Floor
                | Ceil
                | Round
                | Sign
                | Factorial
                | Choose
        )
    }

    /// Opcodes without any closed-form derivative in this kernel.
    pub const fn is_non_differentiable(self) -> bool {
        matches!(self, Opcode::Zeta | Opcode::Tetragamma)
    }

    pub const fn is_commutative(self) -> bool {
        use Opcode::*;
        matches!(self, Add | Mul | Max | Min | Eq | Ne | And | Or)
    }

    /// Infix symbol used by the printer and parser, if the opcode has one.
    pub const fn symbol(self) -> Option<&'static str> {
        use Opcode::*;
        Some(match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            Power => "^",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            Eq => "==",
            Ne => "!=",
            And => "&&",
            Or => "||",
            _ => return None,
        })
    }

    /// Name used in function-call syntax (`sin(x)`, `beta(a, b)`).
    pub fn name(self) -> &'static str {
        self.into()
    }
}
