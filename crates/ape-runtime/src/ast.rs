//! Abstract syntax tree
//!
//! Every node carries the source position that downstream error reporting
//! relies on: calls carry their `(`, index expressions their `[`, infix
//! expressions their operator token.

use crate::span::Pos;
use std::fmt;

/// An identifier with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub pos: Pos,
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

/// Expression variants
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Ident(String),
    NumberLit(f64),
    StringLit(String),
    BoolLit(bool),
    NullLit,
    ArrayLit(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
    Prefix {
        op: PrefixOp,
        right: Box<Expr>,
    },
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Short-circuit `&&` / `||`
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
    },
    FnLit(FnLit),
    /// Assignment expression; leaves the assigned value on the stack
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

/// Function literal; `name` is set when the literal came from
/// `const f = fn...` or an `fn name(...)` declaration so the compiler can
/// resolve recursive self-references.
#[derive(Debug, Clone, PartialEq)]
pub struct FnLit {
    pub name: Option<String>,
    pub params: Vec<Ident>,
    pub body: Block,
}

/// A braced statement list
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub pos: Pos,
}

/// Prefix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Minus,
    Bang,
}

/// Infix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
}

/// Short-circuit operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Statement node
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

/// Statement variants
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `const name = value` / `var name = value`
    Define {
        name: Ident,
        value: Expr,
        assignable: bool,
    },
    /// `if` with `else if` chain and optional trailing `else`
    If {
        cases: Vec<IfCase>,
        alternative: Option<Block>,
    },
    Return(Option<Expr>),
    Expression(Expr),
    While {
        cond: Expr,
        body: Block,
    },
    Break,
    Continue,
    /// `for (item in source) { ... }`
    Foreach {
        item: Ident,
        source: Expr,
        body: Block,
    },
    /// `for (init; test; update) { ... }`, each section optional
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Block,
    },
    Block(Block),
    /// `recover (e) { ... }`
    Recover {
        error_ident: Ident,
        body: Block,
    },
}

/// One `if`/`else if` arm
#[derive(Debug, Clone, PartialEq)]
pub struct IfCase {
    pub cond: Expr,
    pub body: Block,
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Mod => "%",
            InfixOp::Equal => "==",
            InfixOp::NotEqual => "!=",
            InfixOp::GreaterThan => ">",
            InfixOp::GreaterThanEqual => ">=",
            InfixOp::LessThan => "<",
            InfixOp::LessThanEqual => "<=",
        };
        write!(f, "{}", s)
    }
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Pos) -> Self {
        Self { kind, pos }
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, pos: Pos) -> Self {
        Self { kind, pos }
    }
}
