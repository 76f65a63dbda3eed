//! Exact RISC-V bit layouts for the R/I/S/B/U/J instruction formats (§4.3),
//! and the `encode`/`decode` pair that round-trips [`super::Instruction`]
//! through 32-bit words. B and J formats preserve the RISC-V bit
//! permutation described in the ISA manual and drop the always-zero LSB of
//! the immediate; immediates are range-checked and sign-shrunk before
//! packing, and sign-extended on the way back out (§8 "Instruction
//! encoding").

use derive_more::Display;

use crate::common::{get_bits, sign_extend, sign_shrink};

use super::{Instruction, Register};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EncodeError {
    #[display("immediate {imm} does not fit in {bits} signed bits")]
    ImmediateOutOfRange { imm: i64, bits: u32 },
}

impl std::error::Error for EncodeError {}

const OPCODE_LUI: u32 = 0b011_0111;
const OPCODE_OP_IMM: u32 = 0b001_0011;
const OPCODE_OP: u32 = 0b011_0011;
const OPCODE_LOAD: u32 = 0b000_0011;
const OPCODE_STORE: u32 = 0b010_0011;
const OPCODE_BRANCH: u32 = 0b110_0011;
const OPCODE_JAL: u32 = 0b110_1111;
const OPCODE_JALR: u32 = 0b110_0111;
const OPCODE_SYSTEM: u32 = 0b111_0011;

const FUNCT3_ADDI_BEQ_JALR: u32 = 0b000;
const FUNCT3_LD_SD: u32 = 0b011;
const FUNCT3_SLTU: u32 = 0b011;
const FUNCT3_DIVU: u32 = 0b101;
const FUNCT3_REMU: u32 = 0b111;

const FUNCT7_ADD: u32 = 0b000_0000;
const FUNCT7_SUB: u32 = 0b010_0000;
const FUNCT7_MULDIV: u32 = 0b000_0001;

fn reg(n: u32) -> Register {
    Register::from_index(n as u64)
}

fn shrink(imm: i64, bits: u32) -> Result<u64, EncodeError> {
    sign_shrink(imm, bits).ok_or(EncodeError::ImmediateOutOfRange { imm, bits })
}

/// Packs a decoded instruction into its 32-bit word.
pub fn encode(instruction: Instruction) -> Result<u32, EncodeError> {
    use Instruction::*;
    Ok(match instruction {
        Lui { rd, imm } => {
            let imm = shrink(imm, 32)?;
            encode_u(OPCODE_LUI, rd, imm)
        }
        Addi { rd, rs1, imm } => {
            let imm = shrink(imm, 12)?;
            encode_i(OPCODE_OP_IMM, rd, FUNCT3_ADDI_BEQ_JALR, rs1, imm)
        }
        Add { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, 0, rs1, rs2, FUNCT7_ADD),
        Sub { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, 0, rs1, rs2, FUNCT7_SUB),
        Mul { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, 0, rs1, rs2, FUNCT7_MULDIV),
        Divu { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, FUNCT3_DIVU, rs1, rs2, FUNCT7_MULDIV),
        Remu { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, FUNCT3_REMU, rs1, rs2, FUNCT7_MULDIV),
        Sltu { rd, rs1, rs2 } => encode_r(OPCODE_OP, rd, FUNCT3_SLTU, rs1, rs2, FUNCT7_ADD),
        Ld { rd, rs1, imm } => {
            let imm = shrink(imm, 12)?;
            encode_i(OPCODE_LOAD, rd, FUNCT3_LD_SD, rs1, imm)
        }
        Sd { rs1, rs2, imm } => {
            let imm = shrink(imm, 12)?;
            encode_s(OPCODE_STORE, FUNCT3_LD_SD, rs1, rs2, imm)
        }
        Beq { rs1, rs2, imm } => {
            if imm & 1 != 0 {
                return Err(EncodeError::ImmediateOutOfRange { imm, bits: 13 });
            }
            let imm = shrink(imm, 13)?;
            encode_b(OPCODE_BRANCH, FUNCT3_ADDI_BEQ_JALR, rs1, rs2, imm)
        }
        Jal { rd, imm } => {
            if imm & 1 != 0 {
                return Err(EncodeError::ImmediateOutOfRange { imm, bits: 21 });
            }
            let imm = shrink(imm, 21)?;
            encode_j(OPCODE_JAL, rd, imm)
        }
        Jalr { rd, rs1, imm } => {
            let imm = shrink(imm, 12)?;
            encode_i(OPCODE_JALR, rd, FUNCT3_ADDI_BEQ_JALR, rs1, imm)
        }
        Ecall => encode_i(OPCODE_SYSTEM, Register::Zero, 0, Register::Zero, 0),
    })
}

/// Unpacks a 32-bit word into a decoded instruction.
pub fn decode(word: u32) -> Option<Instruction> {
    let opcode = get_bits(word as u64, 0, 6) as u32;
    let rd = reg(get_bits(word as u64, 7, 11) as u32);
    let funct3 = get_bits(word as u64, 12, 14) as u32;
    let rs1 = reg(get_bits(word as u64, 15, 19) as u32);
    let rs2 = reg(get_bits(word as u64, 20, 24) as u32);
    let funct7 = get_bits(word as u64, 25, 31) as u32;

    Some(match opcode {
        OPCODE_LUI => Instruction::Lui { rd, imm: decode_u_imm(word) },
        OPCODE_OP_IMM if funct3 == FUNCT3_ADDI_BEQ_JALR => {
            Instruction::Addi { rd, rs1, imm: decode_i_imm(word) }
        }
        OPCODE_OP => match (funct3, funct7) {
            (0, FUNCT7_ADD) => Instruction::Add { rd, rs1, rs2 },
            (0, FUNCT7_SUB) => Instruction::Sub { rd, rs1, rs2 },
            (0, FUNCT7_MULDIV) => Instruction::Mul { rd, rs1, rs2 },
            (FUNCT3_DIVU, FUNCT7_MULDIV) => Instruction::Divu { rd, rs1, rs2 },
            (FUNCT3_REMU, FUNCT7_MULDIV) => Instruction::Remu { rd, rs1, rs2 },
            (FUNCT3_SLTU, FUNCT7_ADD) => Instruction::Sltu { rd, rs1, rs2 },
            _ => return None,
        },
        OPCODE_LOAD if funct3 == FUNCT3_LD_SD => {
            Instruction::Ld { rd, rs1, imm: decode_i_imm(word) }
        }
        OPCODE_STORE if funct3 == FUNCT3_LD_SD => {
            Instruction::Sd { rs1, rs2, imm: decode_s_imm(word) }
        }
        OPCODE_BRANCH if funct3 == FUNCT3_ADDI_BEQ_JALR => {
            Instruction::Beq { rs1, rs2, imm: decode_b_imm(word) }
        }
        OPCODE_JAL => Instruction::Jal { rd, imm: decode_j_imm(word) },
        OPCODE_JALR if funct3 == FUNCT3_ADDI_BEQ_JALR => {
            Instruction::Jalr { rd, rs1, imm: decode_i_imm(word) }
        }
        OPCODE_SYSTEM => Instruction::Ecall,
        _ => return None,
    })
}

fn encode_r(opcode: u32, rd: Register, funct3: u32, rs1: Register, rs2: Register, funct7: u32) -> u32 {
    opcode
        | ((rd.index() as u32) << 7)
        | (funct3 << 12)
        | ((rs1.index() as u32) << 15)
        | ((rs2.index() as u32) << 20)
        | (funct7 << 25)
}

fn encode_i(opcode: u32, rd: Register, funct3: u32, rs1: Register, imm: u64) -> u32 {
    opcode
        | ((rd.index() as u32) << 7)
        | (funct3 << 12)
        | ((rs1.index() as u32) << 15)
        | ((imm as u32) << 20)
}

fn decode_i_imm(word: u32) -> i64 {
    sign_extend(get_bits(word as u64, 20, 31), 12)
}

fn encode_s(opcode: u32, funct3: u32, rs1: Register, rs2: Register, imm: u64) -> u32 {
    let lo = (imm & 0x1f) as u32;
    let hi = ((imm >> 5) & 0x7f) as u32;
    opcode
        | (lo << 7)
        | (funct3 << 12)
        | ((rs1.index() as u32) << 15)
        | ((rs2.index() as u32) << 20)
        | (hi << 25)
}

fn decode_s_imm(word: u32) -> i64 {
    let lo = get_bits(word as u64, 7, 11);
    let hi = get_bits(word as u64, 25, 31);
    sign_extend((hi << 5) | lo, 12)
}

fn encode_b(opcode: u32, funct3: u32, rs1: Register, rs2: Register, imm: u64) -> u32 {
    // `imm` is the sign-shrunk 13-bit signed offset with bit 0 implicitly 0.
    let imm11 = (imm >> 11) & 1;
    let imm4_1 = (imm >> 1) & 0xf;
    let imm10_5 = (imm >> 5) & 0x3f;
    let imm12 = (imm >> 12) & 1;
    opcode
        | ((imm11 as u32) << 7)
        | ((imm4_1 as u32) << 8)
        | (funct3 << 12)
        | ((rs1.index() as u32) << 15)
        | ((rs2.index() as u32) << 20)
        | ((imm10_5 as u32) << 25)
        | ((imm12 as u32) << 31)
}

fn decode_b_imm(word: u32) -> i64 {
    let imm11 = get_bits(word as u64, 7, 7);
    let imm4_1 = get_bits(word as u64, 8, 11);
    let imm10_5 = get_bits(word as u64, 25, 30);
    let imm12 = get_bits(word as u64, 31, 31);
    let imm = (imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1);
    sign_extend(imm, 13)
}

fn encode_u(opcode: u32, rd: Register, imm: u64) -> u32 {
    // `imm` is the sign-shrunk 32-bit signed value; only the upper 20 bits
    // (the part lui actually loads) are packed.
    let upper20 = (imm >> 12) & 0xf_ffff;
    opcode | ((rd.index() as u32) << 7) | ((upper20 as u32) << 12)
}

fn decode_u_imm(word: u32) -> i64 {
    let upper20 = get_bits(word as u64, 12, 31);
    sign_extend(upper20 << 12, 32)
}

fn encode_j(opcode: u32, rd: Register, imm: u64) -> u32 {
    let imm20 = (imm >> 20) & 1;
    let imm10_1 = (imm >> 1) & 0x3ff;
    let imm11 = (imm >> 11) & 1;
    let imm19_12 = (imm >> 12) & 0xff;
    opcode
        | ((rd.index() as u32) << 7)
        | ((imm19_12 as u32) << 12)
        | ((imm11 as u32) << 20)
        | ((imm10_1 as u32) << 21)
        | ((imm20 as u32) << 31)
}

fn decode_j_imm(word: u32) -> i64 {
    let imm19_12 = get_bits(word as u64, 12, 19);
    let imm11 = get_bits(word as u64, 20, 20);
    let imm10_1 = get_bits(word as u64, 21, 30);
    let imm20 = get_bits(word as u64, 31, 31);
    let imm = (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1);
    sign_extend(imm, 21)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Instruction::*;
    use Register::*;

    fn roundtrip(instr: Instruction) {
        let word = encode(instr).expect("should encode");
        assert_eq!(decode(word), Some(instr), "roundtrip failed for {word:#010x}");
    }

    #[test]
    fn roundtrips_every_shape() {
        roundtrip(Lui { rd: T0, imm: 0x1_2345_000 });
        roundtrip(Addi { rd: T0, rs1: Zero, imm: -7 });
        roundtrip(Add { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Sub { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Mul { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Divu { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Remu { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Sltu { rd: T0, rs1: T1, rs2: T2 });
        roundtrip(Ld { rd: T0, rs1: Sp, imm: -8 });
        roundtrip(Sd { rs1: Sp, rs2: T0, imm: 2040 });
        roundtrip(Beq { rs1: T0, rs2: T1, imm: -4096 });
        roundtrip(Beq { rs1: T0, rs2: T1, imm: 4094 });
        roundtrip(Jal { rd: Ra, imm: -1_048_576 });
        roundtrip(Jal { rd: Ra, imm: 1_048_574 });
        roundtrip(Jalr { rd: Ra, rs1: T0, imm: 0 });
        roundtrip(Ecall);
    }

    #[test]
    fn branch_and_jump_immediates_reject_odd_offsets() {
        assert!(encode(Beq { rs1: T0, rs2: T1, imm: 1 }).is_err());
        assert!(encode(Jal { rd: Ra, imm: 3 }).is_err());
    }

    #[test]
    fn encoder_rejects_out_of_range_immediates() {
        assert!(encode(Addi { rd: T0, rs1: Zero, imm: 4096 }).is_err());
        assert!(encode(Beq { rs1: T0, rs2: T1, imm: 1 << 13 }).is_err());
        assert!(encode(Jal { rd: Ra, imm: 1 << 21 }).is_err());
    }
}
