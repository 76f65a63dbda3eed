//! The three-address IR that `lower` builds from the AST and `codegen`
//! emits RISC-U for. Every instruction names at most one destination
//! temporary; control flow is basic blocks ending in a single
//! [`Terminator`], which is what lets the code emitter's fixup chains
//! (§4.3) stay a property of *blocks* rather than of arbitrary nested
//! statements.

use crate::common::{Id, Map};
use crate::front::ast::{BinOp, Type};

#[derive(Debug)]
pub struct Program {
    pub globals: Vec<Global>,
    pub procedures: Map<Id, Procedure>,
    /// String literal contents keyed by the synthetic data-segment name
    /// `lower` gave them, since `Instruction::AddrOf` only carries the
    /// name and the emitter needs the bytes to actually allocate them.
    pub strings: Map<Id, Vec<u8>>,
}

#[derive(Debug)]
pub struct Global {
    pub name: Id,
    pub ty: Type,
    pub init: u64,
}

#[derive(Debug)]
pub struct Procedure {
    pub name: Id,
    pub params: Vec<Id>,
    /// Every local declared anywhere in the body, including parameters;
    /// frame layout assigns each one a fixed offset.
    pub locals: Vec<Id>,
    pub blocks: Vec<Block>,
    pub entry: Id,
    /// `None` for a forward declaration with no body (§4.2 "library
    /// procedures"): the emitter lowers a call to one of these to a
    /// syscall trap handled by `vm::kernel`.
    pub is_defined: bool,
}

#[derive(Debug)]
pub struct Block {
    pub label: Id,
    pub insns: Vec<Instruction>,
    pub term: Terminator,
}

#[derive(Debug)]
pub enum Instruction {
    Copy { dst: Id, src: Id },
    Const { dst: Id, value: u64 },
    /// The address of a string/global literal, resolved against the data
    /// segment at emission time.
    AddrOf { dst: Id, name: Id },
    Arith { op: BinOp, dst: Id, lhs: Id, rhs: Id },
    Load { dst: Id, addr: Id },
    Store { addr: Id, src: Id },
    Call { dst: Option<Id>, callee: Id, args: Vec<Id> },
}

#[derive(Debug)]
pub enum Terminator {
    Return(Option<Id>),
    Jump(Id),
    Branch { op: BinOp, lhs: Id, rhs: Id, tt: Id, ff: Id },
}
