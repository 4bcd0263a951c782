//! Expression language used by schemas for sizes, counts, conditions, switch
//! discriminants, seek targets, endianness selection and field validation.
//!
//! Source strings may be wrapped in `{...}`; the braces are stripped before
//! tokenizing. Parsing is pure: the same text always yields an equal AST.
//!
//! ```text
//! {header_len * 4 - 20}
//! {version >= 2 and not (flags & 0x80 == 0)}
//! {kind == 'IHDR' ? 1 : 0}
//! {offsets[_index]}
//! {parse_int(size_text, 8)}
//! {until_marker(0x0D, 0x0A)}
//! ```

pub mod eval;
pub mod lexer;
pub mod parser;

pub use eval::{evaluate, evaluate_as_bool, evaluate_as_long};

use std::fmt;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("not an array: {0}")]
    NotAnArray(String),
    #[error("index out of range: {index} (length {len})")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("{function}: {message}")]
    ArgumentCount { function: String, message: String },
    #[error("parse_int: base must be 2, 8, 10, or 16 (got {0})")]
    InvalidBase(i64),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow in {0}")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

/// Expression AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    /// Reference to a bound variable (field value, `_index`, promoted sibling).
    Var(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// True if any variable reference in this subtree is named `name`.
    pub fn references(&self, name: &str) -> bool {
        match self {
            Expr::Int(_) | Expr::Str(_) => false,
            Expr::Var(v) => v == name,
            Expr::Unary { operand, .. } => operand.references(name),
            Expr::Binary { lhs, rhs, .. } => lhs.references(name) || rhs.references(name),
            Expr::Ternary { cond, then, otherwise } => {
                cond.references(name) || then.references(name) || otherwise.references(name)
            }
            Expr::Index { target, index } => target.references(name) || index.references(name),
            Expr::Call { args, .. } => args.iter().any(|a| a.references(name)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Str(s) => write!(f, "'{}'", s),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Unary { op: UnaryOp::Neg, operand } => write!(f, "-{}", operand),
            Expr::Unary { op: UnaryOp::Not, operand } => write!(f, "not {}", operand),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Ternary { cond, then, otherwise } => {
                write!(f, "({} ? {} : {})", cond, then, otherwise)
            }
            Expr::Index { target, index } => write!(f, "{}[{}]", target, index),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A parsed expression plus the source text it came from (kept for diagnostics).
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub source: String,
    pub root: Expr,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        parser::parse(text)
    }

    pub fn references(&self, name: &str) -> bool {
        self.root.references(name)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse expression text (optionally `{...}`-wrapped) into an [`Expression`].
pub fn parse(text: &str) -> Result<Expression, ExprError> {
    parser::parse(text)
}
