//! Minimal x86-64 encoder for the PLT stubs written at instance load time

use std::convert::TryFrom;

/// Size of the immediate or displacement of an instruction
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperandSize {
    /// None
    S0 = 0,
    /// 32 bit
    S32 = 32,
}

impl OperandSize {
    fn bytes(self) -> usize {
        match self {
            OperandSize::S0 => 0,
            OperandSize::S32 => 4,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct X86ModRm {
    mode: u8,
    r: u8,
    m: u8,
}

impl X86ModRm {
    const fn encode(self) -> u8 {
        (self.mode << 6) | ((self.r & 0b111) << 3) | (self.m & 0b111)
    }
}

/// Mode 0 with r/m 0b101 addresses `[rip + disp32]`
const RIP_RELATIVE: u8 = 0b101;

/// A single instruction without REX prefix
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct X86Instruction {
    opcode: u8,
    modrm: Option<X86ModRm>,
    displacement_size: OperandSize,
    displacement: i32,
    immediate_size: OperandSize,
    immediate: i64,
}

impl X86Instruction {
    /// Template the constructors start from
    pub const DEFAULT: X86Instruction = X86Instruction {
        opcode: 0,
        modrm: None,
        displacement_size: OperandSize::S0,
        displacement: 0,
        immediate_size: OperandSize::S0,
        immediate: 0,
    };

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        1usize
            .saturating_add(self.modrm.is_some() as usize)
            .saturating_add(self.displacement_size.bytes())
            .saturating_add(self.immediate_size.bytes())
    }

    /// Writes the instruction at the start of `buf`, returns the number of
    /// bytes written or `None` if `buf` is too short
    pub fn emit(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.len();
        let out = buf.get_mut(..len)?;
        let mut offset = 0usize;
        out[offset] = self.opcode;
        offset = offset.saturating_add(1);
        if let Some(modrm) = self.modrm {
            out[offset] = modrm.encode();
            offset = offset.saturating_add(1);
        }
        let displacement = self.displacement.to_le_bytes();
        let displacement_end = offset.saturating_add(self.displacement_size.bytes());
        out[offset..displacement_end]
            .copy_from_slice(&displacement[..self.displacement_size.bytes()]);
        offset = displacement_end;
        let immediate = self.immediate.to_le_bytes();
        let immediate_end = offset.saturating_add(self.immediate_size.bytes());
        out[offset..immediate_end].copy_from_slice(&immediate[..self.immediate_size.bytes()]);
        Some(len)
    }

    /// jmp [rip + displacement]
    pub const fn jump_indirect_rip(displacement: i32) -> Self {
        Self {
            opcode: 0xFF,
            modrm: Some(X86ModRm {
                mode: 0,
                r: 4,
                m: RIP_RELATIVE,
            }),
            displacement_size: OperandSize::S32,
            displacement,
            ..Self::DEFAULT
        }
    }

    /// int3
    pub const fn breakpoint() -> Self {
        Self {
            opcode: 0xCC,
            ..Self::DEFAULT
        }
    }
}

/// Size of one PLT stub
pub const PLT_STUB_SIZE: usize = 16;

/// Rewrites a PLT stub placed at `stub_address` to jump through the GOT slot
/// at `slot_address`. Bytes after the jump are filled with `int3`.
///
/// Returns `None` if the slot is out of `rip` relative reach or `stub` is
/// shorter than [PLT_STUB_SIZE].
pub fn emit_plt_stub(stub: &mut [u8], stub_address: u64, slot_address: u64) -> Option<()> {
    let stub = stub.get_mut(..PLT_STUB_SIZE)?;
    let jump_length = X86Instruction::jump_indirect_rip(0).len() as u64;
    let next_instruction = stub_address.wrapping_add(jump_length);
    let displacement = slot_address.wrapping_sub(next_instruction) as i64;
    let displacement = i32::try_from(displacement).ok()?;
    let written = X86Instruction::jump_indirect_rip(displacement).emit(stub)?;
    let mut offset = written;
    while offset < PLT_STUB_SIZE {
        offset = offset.saturating_add(X86Instruction::breakpoint().emit(&mut stub[offset..])?);
    }
    Some(())
}
