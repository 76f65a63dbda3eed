//! The ELF writer/loader (§4.12): a fixed 120-byte ELF64 header template
//! followed by an 8-byte code-length prefix and the combined code+data
//! payload, packed two RISC-U instructions per double word (§5).

use derive_more::Display;

use crate::common::SIZE_OF_UINT64;
use crate::isa::{decode, encode, Instruction};

pub const ELF_HEADER_LEN: usize = 120;
const ENTRY_POINT: u64 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ElfError {
    #[display("binary too short to contain an ELF header")]
    Truncated,
    #[display("ELF header does not match the selfie template")]
    BadHeader,
    #[display("declared binary length {declared} does not fit the virtual address space")]
    TooLarge { declared: u64 },
    #[display("{0}")]
    Io(String),
}

impl std::error::Error for ElfError {}

impl From<std::io::Error> for ElfError {
    fn from(e: std::io::Error) -> Self {
        ElfError::Io(e.to_string())
    }
}

/// Builds the fixed 120-byte ELF64 header for a binary of `len` bytes
/// (code + data, not counting the header itself or the length prefix).
pub fn create_elf_header(len: u64) -> [u8; ELF_HEADER_LEN] {
    let mut header = [0u8; ELF_HEADER_LEN];
    header[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    header[4] = 2; // ELFCLASS64
    header[5] = 1; // little-endian
    header[6] = 1; // EI_VERSION
    header[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    header[18..20].copy_from_slice(&0xf3u16.to_le_bytes()); // EM_RISCV
    header[24..32].copy_from_slice(&ENTRY_POINT.to_le_bytes());
    header[32..40].copy_from_slice(&(ELF_HEADER_LEN as u64).to_le_bytes()); // e_phoff
    header[54..56].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    // One PT_LOAD program header with RWX flags, sized to the payload.
    let ph_off = 64;
    header[ph_off..ph_off + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    header[ph_off + 4..ph_off + 8].copy_from_slice(&7u32.to_le_bytes()); // RWX
    header[ph_off + 8..ph_off + 16].copy_from_slice(&(ELF_HEADER_LEN as u64).to_le_bytes()); // p_offset
    header[ph_off + 16..ph_off + 24].copy_from_slice(&ENTRY_POINT.to_le_bytes()); // p_vaddr
    header[ph_off + 24..ph_off + 32].copy_from_slice(&ENTRY_POINT.to_le_bytes()); // p_paddr
    header[ph_off + 32..ph_off + 40].copy_from_slice(&len.to_le_bytes()); // p_filesz
    header[ph_off + 40..ph_off + 48].copy_from_slice(&len.to_le_bytes()); // p_memsz
    header
}

/// Confirms every template word matches and that the declared payload
/// length fits the guest virtual address space.
pub fn validate_elf_header(header: &[u8], virtual_memory_size: u64) -> Result<u64, ElfError> {
    if header.len() < ELF_HEADER_LEN {
        return Err(ElfError::Truncated);
    }
    if header[0..4] != [0x7f, b'E', b'L', b'F'] || header[4] != 2 || header[5] != 1 {
        return Err(ElfError::BadHeader);
    }
    let entry = u64::from_le_bytes(header[24..32].try_into().unwrap());
    if entry != ENTRY_POINT {
        return Err(ElfError::BadHeader);
    }
    let ph_off = 64;
    let declared = u64::from_le_bytes(header[ph_off + 32..ph_off + 40].try_into().unwrap());
    if declared >= virtual_memory_size {
        return Err(ElfError::TooLarge { declared });
    }
    Ok(declared)
}

pub struct Binary {
    pub code: Vec<Instruction>,
    pub data: Vec<u8>,
}

/// Serializes `binary` as `header + code_length (8 bytes) + payload`,
/// packing two instructions per double word (§5).
pub fn save(binary: &Binary) -> Result<Vec<u8>, ElfError> {
    let code_length = binary.code.len() as u64 * crate::common::INSTRUCTION_SIZE;
    let mut packed_code = Vec::with_capacity(binary.code.len() * 4);
    for pair in binary.code.chunks(2) {
        let low = encode(pair[0]).map_err(|e| ElfError::Io(e.to_string()))?;
        let high = pair.get(1).copied().map(encode).transpose().map_err(|e| ElfError::Io(e.to_string()))?.unwrap_or(0);
        let word = (low as u64) | ((high as u64) << 32);
        packed_code.extend_from_slice(&word.to_le_bytes());
    }
    let mut payload = packed_code;
    payload.extend_from_slice(&binary.data);

    let header = create_elf_header(payload.len() as u64);
    let mut out = Vec::with_capacity(ELF_HEADER_LEN + 8 + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&code_length.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn load(bytes: &[u8], virtual_memory_size: u64) -> Result<Binary, ElfError> {
    if bytes.len() < ELF_HEADER_LEN + 8 {
        return Err(ElfError::Truncated);
    }
    let declared = validate_elf_header(&bytes[..ELF_HEADER_LEN], virtual_memory_size)?;
    let code_length = u64::from_le_bytes(bytes[ELF_HEADER_LEN..ELF_HEADER_LEN + 8].try_into().unwrap());
    let payload = &bytes[ELF_HEADER_LEN + 8..];
    if (payload.len() as u64) != declared {
        return Err(ElfError::BadHeader);
    }

    let code_words = (code_length / SIZE_OF_UINT64) as usize;
    let mut code = Vec::new();
    for i in 0..code_words {
        let word = u64::from_le_bytes(payload[i * 8..i * 8 + 8].try_into().unwrap());
        let low = word as u32;
        let high = (word >> 32) as u32;
        code.push(decode(low).ok_or(ElfError::BadHeader)?);
        // A trailing zero half-word in the final double word pads an odd
        // instruction count rather than decoding to a real instruction.
        if let Some(insn) = decode(high) {
            code.push(insn);
        }
    }
    let data = payload[code_length as usize..].to_vec();
    Ok(Binary { code, data })
}

pub fn save_to_file(path: &std::path::Path, binary: &Binary) -> Result<(), ElfError> {
    std::fs::write(path, save(binary)?)?;
    Ok(())
}

pub fn load_from_file(path: &std::path::Path, virtual_memory_size: u64) -> Result<Binary, ElfError> {
    let bytes = std::fs::read(path)?;
    load(&bytes, virtual_memory_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Register;

    fn sample_binary() -> Binary {
        Binary {
            code: vec![
                Instruction::Addi { rd: Register::A0, rs1: Register::Zero, imm: 42 },
                Instruction::Ecall,
            ],
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    #[test]
    fn round_trips_a_binary() {
        let binary = sample_binary();
        let bytes = save(&binary).unwrap();
        let loaded = load(&bytes, 1 << 32).unwrap();
        assert_eq!(loaded.code, binary.code);
        assert_eq!(loaded.data, binary.data);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(load(&[0u8; 10], 1 << 32), Err(ElfError::Truncated)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let binary = sample_binary();
        let bytes = save(&binary).unwrap();
        assert!(matches!(load(&bytes, 4), Err(ElfError::TooLarge { .. })));
    }
}
