//! The RISC-U instruction set: the 32-register file (§3 "Register file")
//! and the decoded [`Instruction`] representation that the code emitter
//! (`back::codegen`) builds and the interpreter (`vm::interpreter`)
//! consumes. Bit-level packing lives in [`format`].

pub mod format;

use derive_more::Display;

/// The 32 general-purpose RISC-V registers. Register 0 ([`Register::Zero`])
/// is hard-wired to the value zero: writes to it are no-ops and reads
/// always yield 0 (§8 "Emulator invariants").
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Register {
    #[display("zero")]
    Zero,
    #[display("ra")]
    Ra,
    #[display("sp")]
    Sp,
    #[display("gp")]
    Gp,
    #[display("tp")]
    Tp,
    #[display("t0")]
    T0,
    #[display("t1")]
    T1,
    #[display("t2")]
    T2,
    #[display("fp")]
    Fp,
    #[display("s1")]
    S1,
    #[display("a0")]
    A0,
    #[display("a1")]
    A1,
    #[display("a2")]
    A2,
    #[display("a3")]
    A3,
    #[display("a4")]
    A4,
    #[display("a5")]
    A5,
    #[display("a6")]
    A6,
    #[display("a7")]
    A7,
    #[display("s2")]
    S2,
    #[display("s3")]
    S3,
    #[display("s4")]
    S4,
    #[display("s5")]
    S5,
    #[display("s6")]
    S6,
    #[display("s7")]
    S7,
    #[display("s8")]
    S8,
    #[display("s9")]
    S9,
    #[display("s10")]
    S10,
    #[display("s11")]
    S11,
    #[display("t3")]
    T3,
    #[display("t4")]
    T4,
    #[display("t5")]
    T5,
    #[display("t6")]
    T6,
}

pub const NUMBER_OF_REGISTERS: usize = 32;

impl Register {
    /// All 32 registers in register-file order (index order matches the
    /// variant's RISC-V register number).
    pub const ALL: [Register; NUMBER_OF_REGISTERS] = [
        Register::Zero,
        Register::Ra,
        Register::Sp,
        Register::Gp,
        Register::Tp,
        Register::T0,
        Register::T1,
        Register::T2,
        Register::Fp,
        Register::S1,
        Register::A0,
        Register::A1,
        Register::A2,
        Register::A3,
        Register::A4,
        Register::A5,
        Register::A6,
        Register::A7,
        Register::S2,
        Register::S3,
        Register::S4,
        Register::S5,
        Register::S6,
        Register::S7,
        Register::S8,
        Register::S9,
        Register::S10,
        Register::S11,
        Register::T3,
        Register::T4,
        Register::T5,
        Register::T6,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u64) -> Register {
        Register::ALL[i as usize % NUMBER_OF_REGISTERS]
    }
}

/// The decoded form of one RISC-U instruction, independent of its bit
/// encoding. This is what the interpreter dispatches on and what the
/// disassembler (a thin wrapper, §1) turns back into text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Lui { rd: Register, imm: i64 },
    Addi { rd: Register, rs1: Register, imm: i64 },
    Add { rd: Register, rs1: Register, rs2: Register },
    Sub { rd: Register, rs1: Register, rs2: Register },
    Mul { rd: Register, rs1: Register, rs2: Register },
    Divu { rd: Register, rs1: Register, rs2: Register },
    Remu { rd: Register, rs1: Register, rs2: Register },
    Sltu { rd: Register, rs1: Register, rs2: Register },
    Ld { rd: Register, rs1: Register, imm: i64 },
    Sd { rs1: Register, rs2: Register, imm: i64 },
    Beq { rs1: Register, rs2: Register, imm: i64 },
    Jal { rd: Register, imm: i64 },
    Jalr { rd: Register, rs1: Register, imm: i64 },
    Ecall,
}

impl Instruction {
    /// The destination register this instruction writes, if any. Used by
    /// the interpreter to enforce the "writes to x0 are ignored" invariant
    /// uniformly.
    pub fn destination(&self) -> Option<Register> {
        use Instruction::*;
        match *self {
            Lui { rd, .. }
            | Addi { rd, .. }
            | Add { rd, .. }
            | Sub { rd, .. }
            | Mul { rd, .. }
            | Divu { rd, .. }
            | Remu { rd, .. }
            | Sltu { rd, .. }
            | Ld { rd, .. }
            | Jal { rd, .. }
            | Jalr { rd, .. } => Some(rd),
            Sd { .. } | Beq { .. } | Ecall => None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction::*;
        match self {
            Lui { rd, imm } => write!(f, "lui {rd}, {imm}"),
            Addi { rd, rs1, imm } => write!(f, "addi {rd}, {rs1}, {imm}"),
            Add { rd, rs1, rs2 } => write!(f, "add {rd}, {rs1}, {rs2}"),
            Sub { rd, rs1, rs2 } => write!(f, "sub {rd}, {rs1}, {rs2}"),
            Mul { rd, rs1, rs2 } => write!(f, "mul {rd}, {rs1}, {rs2}"),
            Divu { rd, rs1, rs2 } => write!(f, "divu {rd}, {rs1}, {rs2}"),
            Remu { rd, rs1, rs2 } => write!(f, "remu {rd}, {rs1}, {rs2}"),
            Sltu { rd, rs1, rs2 } => write!(f, "sltu {rd}, {rs1}, {rs2}"),
            Ld { rd, rs1, imm } => write!(f, "ld {rd}, {imm}({rs1})"),
            Sd { rs1, rs2, imm } => write!(f, "sd {rs2}, {imm}({rs1})"),
            Beq { rs1, rs2, imm } => write!(f, "beq {rs1}, {rs2}, {imm}"),
            Jal { rd, imm } => write!(f, "jal {rd}, {imm}"),
            Jalr { rd, rs1, imm } => write!(f, "jalr {rd}, {rs1}, {imm}"),
            Ecall => write!(f, "ecall"),
        }
    }
}

pub use format::{decode, encode, EncodeError};
