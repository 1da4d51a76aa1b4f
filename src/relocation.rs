//! Relocation records and the delta relocation algorithm
//!
//! Buckets move independently of each other, so every referenced link time
//! address is rebased through the bucket that contains it:
//! `target(bucket) + (address - original(bucket))`.
//!
//! Relocation types follow the x86-64 psABI. `S` is the resolved symbol
//! address, `A` the addend and `P` the target address of the patched field.

use crate::{
    elf::{Bucket, ExecutableCode},
    elf_parser::consts::{
        R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
        R_X86_64_NONE, R_X86_64_PC32, R_X86_64_PC64, R_X86_64_PLT32, R_X86_64_RELATIVE,
    },
    error::RelocationError,
};
use byteorder::{ByteOrder, LittleEndian};
use std::convert::TryFrom;

/// Relocation tables of the section vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationTableKind {
    /// `.rela.text`, patches the code bucket
    Text,
    /// `.rela.plt`, patches the GOT slots behind the PLT stubs
    Plt,
    /// `.rela.eh_frame`, patches the unwind tables
    EhFrame,
}

impl RelocationTableKind {
    /// Section name of the table
    pub fn section_name(self) -> &'static str {
        match self {
            RelocationTableKind::Text => ".rela.text",
            RelocationTableKind::Plt => ".rela.plt",
            RelocationTableKind::EhFrame => ".rela.eh_frame",
        }
    }

    /// Bucket patched by the table
    pub fn bucket(self) -> Bucket {
        match self {
            RelocationTableKind::Text => Bucket::Code,
            RelocationTableKind::Plt => Bucket::Got,
            RelocationTableKind::EhFrame => Bucket::EhFrame,
        }
    }
}

/// Supported x86-64 relocation types
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationType {
    /// No relocation, placeholder
    R_X86_64_None,
    /// `S + A`, 64 bit
    R_X86_64_64,
    /// `S + A - P`, 32 bit signed
    R_X86_64_Pc32,
    /// `S + A - P`, 32 bit signed. Symbols are bound directly, without
    /// going through their PLT stub.
    R_X86_64_Plt32,
    /// `S`, 64 bit GOT entry
    R_X86_64_GlobDat,
    /// `S`, 64 bit GOT entry behind a PLT stub
    R_X86_64_JumpSlot,
    /// Rebased link time address, taken from `A` or from the stored value
    /// when `A` is zero
    R_X86_64_Relative,
    /// `S + A`, 32 bit zero extended
    R_X86_64_32,
    /// `S + A`, 32 bit sign extended
    R_X86_64_32S,
    /// `S + A - P`, 64 bit
    R_X86_64_Pc64,
}

impl RelocationType {
    /// Decodes the `ELF64_R_TYPE` part of `r_info`
    pub fn from_x86_relocation_type(from: u32) -> Option<RelocationType> {
        match from {
            R_X86_64_NONE => Some(RelocationType::R_X86_64_None),
            R_X86_64_64 => Some(RelocationType::R_X86_64_64),
            R_X86_64_PC32 => Some(RelocationType::R_X86_64_Pc32),
            R_X86_64_PLT32 => Some(RelocationType::R_X86_64_Plt32),
            R_X86_64_GLOB_DAT => Some(RelocationType::R_X86_64_GlobDat),
            R_X86_64_JUMP_SLOT => Some(RelocationType::R_X86_64_JumpSlot),
            R_X86_64_RELATIVE => Some(RelocationType::R_X86_64_Relative),
            R_X86_64_32 => Some(RelocationType::R_X86_64_32),
            R_X86_64_32S => Some(RelocationType::R_X86_64_32S),
            R_X86_64_PC64 => Some(RelocationType::R_X86_64_Pc64),
            _ => None,
        }
    }

    /// Raw type value
    pub fn raw(self) -> u32 {
        match self {
            RelocationType::R_X86_64_None => R_X86_64_NONE,
            RelocationType::R_X86_64_64 => R_X86_64_64,
            RelocationType::R_X86_64_Pc32 => R_X86_64_PC32,
            RelocationType::R_X86_64_Plt32 => R_X86_64_PLT32,
            RelocationType::R_X86_64_GlobDat => R_X86_64_GLOB_DAT,
            RelocationType::R_X86_64_JumpSlot => R_X86_64_JUMP_SLOT,
            RelocationType::R_X86_64_Relative => R_X86_64_RELATIVE,
            RelocationType::R_X86_64_32 => R_X86_64_32,
            RelocationType::R_X86_64_32S => R_X86_64_32S,
            RelocationType::R_X86_64_Pc64 => R_X86_64_PC64,
        }
    }

    /// Width in bytes of the patched field
    pub fn width(self) -> u64 {
        match self {
            RelocationType::R_X86_64_None => 0,
            RelocationType::R_X86_64_Pc32
            | RelocationType::R_X86_64_Plt32
            | RelocationType::R_X86_64_32
            | RelocationType::R_X86_64_32S => 4,
            RelocationType::R_X86_64_64
            | RelocationType::R_X86_64_GlobDat
            | RelocationType::R_X86_64_JumpSlot
            | RelocationType::R_X86_64_Relative
            | RelocationType::R_X86_64_Pc64 => 8,
        }
    }
}

/// Symbol referenced by a relocation, resolved as far as possible at parse time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolRef {
    /// Symbol index 0
    None,
    /// Defined in this executable at a link time address
    Defined(u64),
    /// `SHN_ABS` value, never rebased
    Absolute(u64),
    /// Provided by the runtime
    Undefined {
        /// Symbol name
        name: String,
        /// `STB_WEAK` binding
        weak: bool,
    },
}

/// One RELA entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Link time address of the patched field
    pub offset: u64,
    /// Relocation type
    pub r_type: RelocationType,
    /// Referenced symbol
    pub symbol: SymbolRef,
    /// Explicit addend
    pub addend: i64,
}

/// A parsed relocation table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationTable {
    /// Which table this is
    pub kind: RelocationTableKind,
    /// Entries in file order
    pub entries: Vec<Relocation>,
}

/// Which addresses are known while relocating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Only the shared buckets have target addresses
    Shared,
    /// Every bucket has a target address
    Instance,
}

/// Link time and target addresses of every bucket
pub(crate) struct Layout<'a> {
    executable: &'a ExecutableCode,
    targets: [Option<u64>; Bucket::COUNT],
    phase: Phase,
}

impl<'a> Layout<'a> {
    pub(crate) fn new(
        executable: &'a ExecutableCode,
        targets: [Option<u64>; Bucket::COUNT],
        phase: Phase,
    ) -> Self {
        Self {
            executable,
            targets,
            phase,
        }
    }

    /// Target address of a bucket
    pub(crate) fn target(&self, bucket: Bucket) -> Option<u64> {
        self.targets[bucket.index()]
    }

    /// Finds the bucket holding a link time address. The end address of a
    /// bucket still belongs to it, so that end-of-section symbols resolve.
    fn bucket_of(&self, address: u64) -> Option<Bucket> {
        let mut end_match = None;
        for bucket in Bucket::ALL.iter().copied() {
            let original = match self.executable.original_address(bucket) {
                Some(original) => original,
                None => continue,
            };
            let size = self.executable.section_info().get(bucket).size;
            let offset = match address.checked_sub(original) {
                Some(offset) => offset,
                None => continue,
            };
            if offset < size {
                return Some(bucket);
            }
            if offset == size && end_match.is_none() {
                end_match = Some(bucket);
            }
        }
        end_match
    }

    /// Moves a link time address to its target address
    pub(crate) fn rebase(&self, address: u64, site: u64) -> Result<u64, RelocationError> {
        let bucket = self
            .bucket_of(address)
            .ok_or(RelocationError::UnmappedAddress(address))?;
        let original = self
            .executable
            .original_address(bucket)
            .ok_or(RelocationError::UnmappedAddress(address))?;
        let target = match (self.target(bucket), self.phase) {
            (Some(target), _) => target,
            (None, Phase::Shared) if !bucket.is_shared() => {
                return Err(RelocationError::SharedReferencesInstance {
                    offset: site,
                    bucket,
                })
            }
            (None, _) => return Err(RelocationError::MissingAddress(bucket)),
        };
        Ok(target.wrapping_add(address.wrapping_sub(original)))
    }

    fn resolve(&self, relocation: &Relocation) -> Result<u64, RelocationError> {
        match &relocation.symbol {
            SymbolRef::None => Ok(0),
            SymbolRef::Defined(address) => self.rebase(*address, relocation.offset),
            SymbolRef::Absolute(value) => Ok(*value),
            SymbolRef::Undefined { name, weak } => {
                let loader = self.executable.get_loader();
                if let Some(address) = loader.get_symbol_registry().lookup_by_name(name) {
                    Ok(address)
                } else if *weak && loader.get_config().resolve_weak_symbols_to_zero {
                    Ok(0)
                } else {
                    Err(RelocationError::UnresolvedSymbol(name.clone()))
                }
            }
        }
    }

    /// Applies one relocation to the target copy `bytes` of `bucket`
    pub(crate) fn apply(
        &self,
        bucket: Bucket,
        table: RelocationTableKind,
        relocation: &Relocation,
        bytes: &mut [u8],
    ) -> Result<(), RelocationError> {
        if relocation.r_type == RelocationType::R_X86_64_None {
            return Ok(());
        }
        let out_of_bounds = RelocationError::OffsetOutOfBounds {
            table: table.section_name(),
            offset: relocation.offset,
            bucket,
        };
        let site = self
            .executable
            .original_address(bucket)
            .and_then(|original| relocation.offset.checked_sub(original))
            .ok_or_else(|| out_of_bounds.clone())?;
        let place = self
            .target(bucket)
            .ok_or(RelocationError::MissingAddress(bucket))?
            .wrapping_add(site);
        let start = usize::try_from(site).map_err(|_| out_of_bounds.clone())?;
        let end = start
            .checked_add(relocation.r_type.width() as usize)
            .ok_or_else(|| out_of_bounds.clone())?;
        let field = bytes.get_mut(start..end).ok_or(out_of_bounds)?;
        let addend = relocation.addend;
        let out_of_range = || RelocationError::ValueOutOfRange {
            offset: relocation.offset,
            r_type: relocation.r_type.raw(),
        };

        match relocation.r_type {
            RelocationType::R_X86_64_None => {}
            RelocationType::R_X86_64_64 => {
                let symbol = self.resolve(relocation)?;
                LittleEndian::write_u64(field, symbol.wrapping_add(addend as u64));
            }
            RelocationType::R_X86_64_Pc32 | RelocationType::R_X86_64_Plt32 => {
                let symbol = self.resolve(relocation)?;
                let value = (symbol as i128)
                    .saturating_add(addend as i128)
                    .saturating_sub(place as i128);
                let value = i32::try_from(value).map_err(|_| out_of_range())?;
                LittleEndian::write_i32(field, value);
            }
            RelocationType::R_X86_64_GlobDat | RelocationType::R_X86_64_JumpSlot => {
                let symbol = self.resolve(relocation)?;
                LittleEndian::write_u64(field, symbol);
            }
            RelocationType::R_X86_64_Relative => {
                let address = if addend != 0 {
                    addend as u64
                } else {
                    LittleEndian::read_u64(field)
                };
                let rebased = self.rebase(address, relocation.offset)?;
                LittleEndian::write_u64(field, rebased);
            }
            RelocationType::R_X86_64_32 => {
                let symbol = self.resolve(relocation)?;
                let value = (symbol as i128).saturating_add(addend as i128);
                let value = u32::try_from(value).map_err(|_| out_of_range())?;
                LittleEndian::write_u32(field, value);
            }
            RelocationType::R_X86_64_32S => {
                let symbol = self.resolve(relocation)?;
                let value = (symbol as i64 as i128).saturating_add(addend as i128);
                let value = i32::try_from(value).map_err(|_| out_of_range())?;
                LittleEndian::write_i32(field, value);
            }
            RelocationType::R_X86_64_Pc64 => {
                let symbol = self.resolve(relocation)?;
                let value = symbol.wrapping_add(addend as u64).wrapping_sub(place);
                LittleEndian::write_u64(field, value);
            }
        }
        Ok(())
    }
}
