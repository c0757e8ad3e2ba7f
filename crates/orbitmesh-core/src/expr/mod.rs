//! Expression grammar for step conditions, transforms, and templates.
//!
//! A deliberately small, portable language:
//! - paths into the variable scope: `$.a.b[0].c`
//! - literals: numbers, strings, `true`, `false`, `null`
//! - operators: `== != < <= > >= && || ! + - * / %`
//! - a whitelisted function set: `len`, `contains`, `startsWith`, `endsWith`,
//!   `lower`, `upper`, `int`, `float`, `str`, `bool`, `coalesce`
//! - `${expr}` interpolation inside templates
//!
//! Evaluation is pure: a scope value goes in by reference, a fresh value
//! comes out. Missing paths yield `null`; comparison type mismatches are
//! errors unless both sides are null.

mod eval;
mod parser;

pub use eval::{evaluate, evaluate_bool, interpolate, interpolate_value, truthy};
pub use parser::parse;

use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("parse error in expression '{source_text}': {message}")]
    Parse {
        source_text: String,
        message: String,
    },

    #[error("type mismatch: cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("invalid argument to {function}(): {message}")]
    InvalidArgument {
        function: &'static str,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed expression. Evaluation walks this tree against a JSON scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `$.a.b[0]` -- segments applied left to right from the scope root.
    Path(Vec<PathSegment>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// The whitelisted function set. Unknown names fail at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Len,
    Contains,
    StartsWith,
    EndsWith,
    Lower,
    Upper,
    Int,
    Float,
    Str,
    Bool,
    Coalesce,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Function::Len,
            "contains" => Function::Contains,
            "startsWith" => Function::StartsWith,
            "endsWith" => Function::EndsWith,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "int" => Function::Int,
            "float" => Function::Float,
            "str" => Function::Str,
            "bool" => Function::Bool,
            "coalesce" => Function::Coalesce,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Len => "len",
            Function::Contains => "contains",
            Function::StartsWith => "startsWith",
            Function::EndsWith => "endsWith",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Int => "int",
            Function::Float => "float",
            Function::Str => "str",
            Function::Bool => "bool",
            Function::Coalesce => "coalesce",
        }
    }
}
