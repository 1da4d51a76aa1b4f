//! ELF64 records, decoded field by field from little endian byte slices

#![allow(missing_docs)]

use super::ElfParserError;
use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;

pub type Elf64Half = u16;
pub type Elf64Word = u32;
pub type Elf64Xword = u64;
pub type Elf64Sxword = i64;
pub type Elf64Addr = u64;
pub type Elf64Off = u64;

/// Sequential reader over a record, every access is bounds checked
struct Fields<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ElfParserError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(ElfParserError::OutOfBounds)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(ElfParserError::OutOfBounds)?;
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ElfParserError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ElfParserError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, ElfParserError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, ElfParserError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn i64(&mut self) -> Result<i64, ElfParserError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ElfParserError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Ident {
    pub ei_mag: [u8; 4],
    pub ei_class: u8,
    pub ei_data: u8,
    pub ei_version: u8,
    pub ei_osabi: u8,
    pub ei_abiversion: u8,
    pub ei_pad: [u8; 7],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Ehdr {
    pub e_ident: Elf64Ident,
    pub e_type: Elf64Half,
    pub e_machine: Elf64Half,
    pub e_version: Elf64Word,
    pub e_entry: Elf64Addr,
    pub e_phoff: Elf64Off,
    pub e_shoff: Elf64Off,
    pub e_flags: Elf64Word,
    pub e_ehsize: Elf64Half,
    pub e_phentsize: Elf64Half,
    pub e_phnum: Elf64Half,
    pub e_shentsize: Elf64Half,
    pub e_shnum: Elf64Half,
    pub e_shstrndx: Elf64Half,
}

impl Elf64Ehdr {
    pub const SIZE: usize = 64;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            e_ident: Elf64Ident {
                ei_mag: fields.array()?,
                ei_class: fields.u8()?,
                ei_data: fields.u8()?,
                ei_version: fields.u8()?,
                ei_osabi: fields.u8()?,
                ei_abiversion: fields.u8()?,
                ei_pad: fields.array()?,
            },
            e_type: fields.u16()?,
            e_machine: fields.u16()?,
            e_version: fields.u32()?,
            e_entry: fields.u64()?,
            e_phoff: fields.u64()?,
            e_shoff: fields.u64()?,
            e_flags: fields.u32()?,
            e_ehsize: fields.u16()?,
            e_phentsize: fields.u16()?,
            e_phnum: fields.u16()?,
            e_shentsize: fields.u16()?,
            e_shnum: fields.u16()?,
            e_shstrndx: fields.u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Phdr {
    pub p_type: Elf64Word,
    pub p_flags: Elf64Word,
    pub p_offset: Elf64Off,
    pub p_vaddr: Elf64Addr,
    pub p_paddr: Elf64Addr,
    pub p_filesz: Elf64Xword,
    pub p_memsz: Elf64Xword,
    pub p_align: Elf64Xword,
}

impl Elf64Phdr {
    pub const SIZE: usize = 56;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            p_type: fields.u32()?,
            p_flags: fields.u32()?,
            p_offset: fields.u64()?,
            p_vaddr: fields.u64()?,
            p_paddr: fields.u64()?,
            p_filesz: fields.u64()?,
            p_memsz: fields.u64()?,
            p_align: fields.u64()?,
        })
    }

    /// Byte range of the segment in the file
    pub fn file_range(&self) -> Option<Range<u64>> {
        Some(self.p_offset..self.p_offset.checked_add(self.p_filesz)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Elf64Shdr {
    pub sh_name: Elf64Word,
    pub sh_type: Elf64Word,
    pub sh_flags: Elf64Xword,
    pub sh_addr: Elf64Addr,
    pub sh_offset: Elf64Off,
    pub sh_size: Elf64Xword,
    pub sh_link: Elf64Word,
    pub sh_info: Elf64Word,
    pub sh_addralign: Elf64Xword,
    pub sh_entsize: Elf64Xword,
}

impl Elf64Shdr {
    pub const SIZE: usize = 64;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            sh_name: fields.u32()?,
            sh_type: fields.u32()?,
            sh_flags: fields.u64()?,
            sh_addr: fields.u64()?,
            sh_offset: fields.u64()?,
            sh_size: fields.u64()?,
            sh_link: fields.u32()?,
            sh_info: fields.u32()?,
            sh_addralign: fields.u64()?,
            sh_entsize: fields.u64()?,
        })
    }

    /// Byte range of the section in the file, `None` for `SHT_NOBITS`
    pub fn file_range(&self) -> Option<Range<u64>> {
        (self.sh_type != super::consts::SHT_NOBITS)
            .then(|| Some(self.sh_offset..self.sh_offset.checked_add(self.sh_size)?))
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Dyn {
    pub d_tag: Elf64Sxword,
    pub d_val: Elf64Xword,
}

impl Elf64Dyn {
    pub const SIZE: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            d_tag: fields.i64()?,
            d_val: fields.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Rela {
    pub r_offset: Elf64Addr,
    pub r_info: Elf64Xword,
    pub r_addend: Elf64Sxword,
}

impl Elf64Rela {
    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            r_offset: fields.u64()?,
            r_info: fields.u64()?,
            r_addend: fields.i64()?,
        })
    }

    pub fn r_sym(&self) -> Elf64Word {
        self.r_info.checked_shr(32).unwrap_or(0) as Elf64Word
    }

    pub fn r_type(&self) -> Elf64Word {
        (self.r_info & 0xFFFF_FFFF) as Elf64Word
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Sym {
    pub st_name: Elf64Word,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: Elf64Half,
    pub st_value: Elf64Addr,
    pub st_size: Elf64Xword,
}

impl Elf64Sym {
    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfParserError> {
        let mut fields = Fields::new(bytes);
        Ok(Self {
            st_name: fields.u32()?,
            st_info: fields.u8()?,
            st_other: fields.u8()?,
            st_shndx: fields.u16()?,
            st_value: fields.u64()?,
            st_size: fields.u64()?,
        })
    }

    pub fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn st_type(&self) -> u8 {
        self.st_info & 0xF
    }
}

/// Decodes a table of fixed size records
pub fn parse_table<T>(
    bytes: &[u8],
    entry_size: usize,
    parse: fn(&[u8]) -> Result<T, ElfParserError>,
) -> Result<Vec<T>, ElfParserError> {
    if entry_size == 0 || bytes.len() % entry_size != 0 {
        return Err(ElfParserError::InvalidSize);
    }
    bytes.chunks_exact(entry_size).map(parse).collect()
}
