//! Reader for the header tables of an ELF64 little endian file

pub mod consts;
pub mod types;

use crate::{error::Error, reader::ByteSource};
use consts::{SHN_UNDEF, SHT_STRTAB};
use std::{convert::TryFrom, ops::Range, str};
use types::{parse_table, Elf64Ehdr, Elf64Phdr, Elf64Shdr};

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ElfParserError {
    /// ELF file header is inconsistent or unsupported
    #[error("invalid file header")]
    InvalidFileHeader,
    /// Program header is inconsistent or unsupported
    #[error("invalid program header")]
    InvalidProgramHeader,
    /// Section header is inconsistent or unsupported
    #[error("invalid section header")]
    InvalidSectionHeader,
    /// Section or symbol name is not a NUL terminated UTF-8 string
    #[error("invalid string")]
    InvalidString,
    /// Size of a table is not a multiple of its entry size
    #[error("invalid size")]
    InvalidSize,
    /// No section name string table found
    #[error("no section name string table found")]
    NoSectionNameStringTable,
    /// Dynamic section table is inconsistent
    #[error("invalid dynamic section table")]
    InvalidDynamicSectionTable,
    /// Relocation table is inconsistent
    #[error("invalid relocation table")]
    InvalidRelocationTable,
    /// Symbol table is inconsistent
    #[error("invalid symbol table")]
    InvalidSymbolTable,
    /// No string table found for a symbol table
    #[error("no string table")]
    NoStringTable,
    /// Offset or value is out of bounds
    #[error("value out of bounds")]
    OutOfBounds,
}

/// Reads `range` of the source, bounds checked against the file size
pub fn read_range<S: ByteSource>(
    source: &mut S,
    file_size: u64,
    range: Range<u64>,
) -> Result<Vec<u8>, Error> {
    if range.start > range.end || range.end > file_size {
        return Err(ElfParserError::OutOfBounds.into());
    }
    let len = usize::try_from(range.end.saturating_sub(range.start))
        .map_err(|_| ElfParserError::OutOfBounds)?;
    let mut bytes = vec![0u8; len];
    source
        .read_exact_at(range.start, &mut bytes)
        .map_err(Error::io(format!("failed to read ELF bytes at {:#x}", range.start)))?;
    Ok(bytes)
}

/// Returns the NUL terminated string at `offset` of a string table
pub fn get_string_in_table(table: &[u8], offset: u32) -> Result<&str, ElfParserError> {
    let bytes = table
        .get(offset as usize..)
        .ok_or(ElfParserError::OutOfBounds)?;
    let end = bytes
        .iter()
        .position(|byte| *byte == 0)
        .ok_or(ElfParserError::InvalidString)?;
    str::from_utf8(&bytes[..end]).map_err(|_| ElfParserError::InvalidString)
}

/// Header tables of an ELF64 file
#[derive(Debug, Clone)]
pub struct Elf64 {
    file_size: u64,
    program_header_table: Vec<Elf64Phdr>,
    section_header_table: Vec<Elf64Shdr>,
    section_names: Vec<u8>,
}

impl Elf64 {
    /// Reads and decodes the file header, without validating it
    pub fn parse_file_header<S: ByteSource>(source: &mut S) -> Result<(u64, Elf64Ehdr), Error> {
        let file_size = source
            .size()
            .map_err(Error::io("failed to query ELF size"))?;
        let bytes = read_range(source, file_size, 0..Elf64Ehdr::SIZE as u64)?;
        Ok((file_size, Elf64Ehdr::parse(&bytes)?))
    }

    /// Reads the program header table, the section header table and the
    /// section name string table described by `file_header`
    pub fn read<S: ByteSource>(
        source: &mut S,
        file_size: u64,
        file_header: Elf64Ehdr,
    ) -> Result<Self, Error> {
        if file_header.e_ehsize as usize != Elf64Ehdr::SIZE {
            return Err(ElfParserError::InvalidFileHeader.into());
        }

        let program_header_table = if file_header.e_phnum == 0 {
            Vec::new()
        } else {
            if file_header.e_phentsize as usize != Elf64Phdr::SIZE {
                return Err(ElfParserError::InvalidProgramHeader.into());
            }
            let range =
                Self::table_range(file_header.e_phoff, file_header.e_phnum, Elf64Phdr::SIZE)?;
            let bytes = read_range(source, file_size, range)?;
            parse_table(&bytes, Elf64Phdr::SIZE, Elf64Phdr::parse)?
        };

        let section_header_table = if file_header.e_shnum == 0 {
            Vec::new()
        } else {
            if file_header.e_shentsize as usize != Elf64Shdr::SIZE {
                return Err(ElfParserError::InvalidSectionHeader.into());
            }
            let range =
                Self::table_range(file_header.e_shoff, file_header.e_shnum, Elf64Shdr::SIZE)?;
            let bytes = read_range(source, file_size, range)?;
            parse_table(&bytes, Elf64Shdr::SIZE, Elf64Shdr::parse)?
        };

        let section_names = if section_header_table.is_empty() {
            Vec::new()
        } else {
            let names_header = (file_header.e_shstrndx != SHN_UNDEF)
                .then(|| section_header_table.get(file_header.e_shstrndx as usize))
                .flatten()
                .ok_or(ElfParserError::NoSectionNameStringTable)?;
            if names_header.sh_type != SHT_STRTAB {
                return Err(ElfParserError::NoSectionNameStringTable.into());
            }
            let range = names_header
                .file_range()
                .ok_or(ElfParserError::OutOfBounds)?;
            read_range(source, file_size, range)?
        };

        Ok(Self {
            file_size,
            program_header_table,
            section_header_table,
            section_names,
        })
    }

    fn table_range(
        offset: u64,
        count: u16,
        entry_size: usize,
    ) -> Result<Range<u64>, ElfParserError> {
        let len = (count as u64)
            .checked_mul(entry_size as u64)
            .ok_or(ElfParserError::OutOfBounds)?;
        let end = offset.checked_add(len).ok_or(ElfParserError::OutOfBounds)?;
        Ok(offset..end)
    }

    /// Size of the underlying file
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get the program header table
    pub fn program_header_table(&self) -> &[Elf64Phdr] {
        &self.program_header_table
    }

    /// Get the section header table
    pub fn section_header_table(&self) -> &[Elf64Shdr] {
        &self.section_header_table
    }

    /// Get the name of a section
    pub fn section_name(&self, sh_name: u32) -> Result<&str, ElfParserError> {
        get_string_in_table(&self.section_names, sh_name)
    }

    /// Reads the content of a section, bounds checked against the file size
    pub fn section_bytes<S: ByteSource>(
        &self,
        source: &mut S,
        section_header: &Elf64Shdr,
    ) -> Result<Vec<u8>, Error> {
        let range = section_header
            .file_range()
            .ok_or(ElfParserError::OutOfBounds)?;
        read_range(source, self.file_size, range)
    }
}
