//! The abstract syntax tree for C* (§4.2 grammar).

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Uint64,
    Pointer,
    Void,
}

#[derive(Debug)]
pub struct Program {
    pub decls: Vec<TopLevelDecl>,
}

#[derive(Debug)]
pub enum TopLevelDecl {
    Global { ty: Type, name: Id, init: Option<Literal>, line: u64 },
    Procedure(Procedure),
}

#[derive(Debug)]
pub struct Procedure {
    pub return_type: Type,
    pub name: Id,
    pub params: Vec<(Type, Id)>,
    /// `None` for a forward declaration (`ident(params);`), `Some` for a
    /// definition with a body.
    pub body: Option<Vec<Stmt>>,
    pub line: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Literal {
    Integer(u64),
    Character(u8),
}

#[derive(Debug)]
pub enum Stmt {
    VarDecl { ty: Type, name: Id, line: u64 },
    Assign { name: Id, value: Expr, line: u64 },
    StoreDeref { address: Expr, value: Expr, line: u64 },
    Call { name: Id, args: Vec<Expr>, line: u64 },
    If { guard: Expr, tt: Vec<Stmt>, ff: Vec<Stmt>, line: u64 },
    While { guard: Expr, body: Vec<Stmt>, line: u64 },
    Return { value: Option<Expr>, line: u64 },
    Block(Vec<Stmt>),
}

#[derive(Debug)]
pub enum Expr {
    Var(Id, u64),
    Literal(Literal, u64),
    StringLiteral(String, u64),
    Call { name: Id, args: Vec<Expr>, line: u64 },
    Deref(Box<Expr>, u64),
    Negate(Box<Expr>, u64),
    Cast { ty: Type, expr: Box<Expr>, line: u64 },
    BinOp { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr>, line: u64 },
}

impl Expr {
    pub fn line(&self) -> u64 {
        match self {
            Expr::Var(_, l)
            | Expr::Literal(_, l)
            | Expr::StringLiteral(_, l)
            | Expr::Call { line: l, .. }
            | Expr::Deref(_, l)
            | Expr::Negate(_, l)
            | Expr::Cast { line: l, .. }
            | Expr::BinOp { line: l, .. } => *l,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}
