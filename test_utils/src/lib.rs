// Copyright 2026 alt-os Maintainers
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(dead_code)]

//! Synthesizes alt-os ELF images for tests, benchmarks and fuzzing

use altos_code::elf_parser::consts::{
    DT_JMPREL, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_SYMENT, ELFCLASS64,
    ELFDATA2LSB, ELFMAG, ELFOSABI_ALT_OS, ELF_ABI_VERSION, EM_X86_64, ET_DYN, EV_CURRENT,
    PT_DYNAMIC, PT_INTERP, PT_LOAD, R_X86_64_JUMP_SLOT, SHN_UNDEF, SHT_DYNAMIC, SHT_DYNSYM,
    SHT_NOBITS, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, STB_GLOBAL, STT_FUNC,
};
use byteorder::{LittleEndian, WriteBytesExt};

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const SHDR_SIZE: usize = 64;
pub const DYN_SIZE: usize = 16;
pub const RELA_SIZE: usize = 24;
pub const SYM_SIZE: usize = 24;

/// Link time address of the dynamic segment
pub const DYNAMIC_VADDR: u64 = 0x8000;
/// Link time address of the `.rela.plt` table emitted by [ElfBuilder::plt_got]
pub const RELA_PLT_VADDR: u64 = 0x9000;

/// One section of the image, the builder places its contents
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub align: u64,
    pub data: Vec<u8>,
    /// `sh_size`, may differ from `data.len()`
    pub size: u64,
    /// `sh_link`, `None` links RELA tables to `.dynsym`
    pub link: Option<u32>,
    pub entsize: u64,
    /// `sh_offset`, `None` places the contents after the previous blob
    pub offset: Option<u64>,
}

/// One entry of a RELA table
#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub offset: u64,
    pub r_type: u32,
    pub sym: u32,
    pub addend: i64,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    value: u64,
    shndx: u16,
    info: u8,
}

/// Builds alt-os executables field by field. The defaults describe a valid
/// image once a `.text` section is added.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    pub class: u8,
    pub data: u8,
    pub ident_version: u8,
    pub osabi: u8,
    pub abi_version: u8,
    pub e_type: u16,
    pub machine: u16,
    pub version: u32,
    /// Raw `PT_INTERP` contents, `None` omits the segment
    pub interp: Option<Vec<u8>>,
    pub load_segment: bool,
    pub dynamic_segments: usize,
    /// Emit a `.dynamic` section header at [Self::dynamic_vaddr]
    pub dynamic_section_header: bool,
    pub dynamic_vaddr: u64,
    /// Dynamic entries, `DT_NULL` is appended
    pub dynamic: Vec<(i64, u64)>,
    pub sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn intern(table: &mut Vec<u8>, name: &str) -> u32 {
    if name.is_empty() {
        return 0;
    }
    let offset = table.len() as u32;
    table.extend_from_slice(name.as_bytes());
    table.push(0);
    offset
}

fn append(file: &mut Vec<u8>, bytes: &[u8]) -> u64 {
    while file.len() % 8 != 0 {
        file.push(0);
    }
    let offset = file.len() as u64;
    file.extend_from_slice(bytes);
    offset
}

#[allow(clippy::too_many_arguments)]
fn write_shdr(
    out: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    align: u64,
    entsize: u64,
) {
    out.write_u32::<LittleEndian>(name).unwrap();
    out.write_u32::<LittleEndian>(sh_type).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(addr).unwrap();
    out.write_u64::<LittleEndian>(offset).unwrap();
    out.write_u64::<LittleEndian>(size).unwrap();
    out.write_u32::<LittleEndian>(link).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(align).unwrap();
    out.write_u64::<LittleEndian>(entsize).unwrap();
}

fn write_phdr(out: &mut Vec<u8>, p_type: u32, offset: u64, vaddr: u64, size: u64) {
    out.write_u32::<LittleEndian>(p_type).unwrap();
    out.write_u32::<LittleEndian>(4).unwrap();
    out.write_u64::<LittleEndian>(offset).unwrap();
    out.write_u64::<LittleEndian>(vaddr).unwrap();
    out.write_u64::<LittleEndian>(vaddr).unwrap();
    out.write_u64::<LittleEndian>(size).unwrap();
    out.write_u64::<LittleEndian>(size).unwrap();
    out.write_u64::<LittleEndian>(8).unwrap();
}

impl ElfBuilder {
    pub fn new() -> Self {
        let mut interp = altos_code::elf_parser::consts::ELF_INTERP.as_bytes().to_vec();
        interp.push(0);
        Self {
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            ident_version: EV_CURRENT as u8,
            osabi: ELFOSABI_ALT_OS,
            abi_version: ELF_ABI_VERSION,
            e_type: ET_DYN,
            machine: EM_X86_64,
            version: EV_CURRENT,
            interp: Some(interp),
            load_segment: true,
            dynamic_segments: 1,
            dynamic_section_header: true,
            dynamic_vaddr: DYNAMIC_VADDR,
            dynamic: vec![(DT_SYMENT, SYM_SIZE as u64)],
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// A valid image with `code` as `.text` at 0x1000
    pub fn with_text(code: &[u8]) -> Self {
        let mut builder = Self::new();
        builder.progbits(".text", 0x1000, 16, code);
        builder
    }

    pub fn push_section(&mut self, section: Section) -> &mut Self {
        self.sections.push(section);
        self
    }

    pub fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        addr: u64,
        align: u64,
        data: &[u8],
    ) -> &mut Self {
        self.push_section(Section {
            name: name.to_string(),
            sh_type,
            addr,
            align,
            data: data.to_vec(),
            size: data.len() as u64,
            link: None,
            entsize: 0,
            offset: None,
        })
    }

    pub fn progbits(&mut self, name: &str, addr: u64, align: u64, data: &[u8]) -> &mut Self {
        self.section(name, SHT_PROGBITS, addr, align, data)
    }

    pub fn nobits(&mut self, name: &str, addr: u64, align: u64, size: u64) -> &mut Self {
        self.push_section(Section {
            name: name.to_string(),
            sh_type: SHT_NOBITS,
            addr,
            align,
            data: Vec::new(),
            size,
            link: None,
            entsize: 0,
            offset: None,
        })
    }

    /// Adds a RELA table linked to `.dynsym`
    pub fn rela(&mut self, name: &str, addr: u64, entries: &[Rela]) -> &mut Self {
        let mut data = Vec::with_capacity(entries.len() * RELA_SIZE);
        for entry in entries {
            data.write_u64::<LittleEndian>(entry.offset).unwrap();
            data.write_u64::<LittleEndian>((u64::from(entry.sym) << 32) | u64::from(entry.r_type))
                .unwrap();
            data.write_i64::<LittleEndian>(entry.addend).unwrap();
        }
        self.push_section(Section {
            name: name.to_string(),
            sh_type: SHT_RELA,
            addr,
            align: 8,
            size: data.len() as u64,
            data,
            link: None,
            entsize: RELA_SIZE as u64,
            offset: None,
        })
    }

    /// Adds a function to `.dynsym` and returns its index
    pub fn symbol(&mut self, name: &str, value: u64, shndx: u16, bind: u8) -> u32 {
        self.typed_symbol(name, value, shndx, bind, STT_FUNC)
    }

    /// Adds a `.dynsym` entry of any type and returns its index
    pub fn typed_symbol(
        &mut self,
        name: &str,
        value: u64,
        shndx: u16,
        bind: u8,
        st_type: u8,
    ) -> u32 {
        self.symbols.push(Symbol {
            name: name.to_string(),
            value,
            shndx,
            info: (bind << 4) | st_type,
        });
        self.symbols.len() as u32
    }

    pub fn dynamic_entry(&mut self, tag: i64, value: u64) -> &mut Self {
        self.dynamic.push((tag, value));
        self
    }

    /// Adds a PLT stub and a GOT slot per import, the `.rela.plt` table
    /// binding them and the dynamic entries describing it
    pub fn plt_got(&mut self, plt_addr: u64, got_addr: u64, imports: &[&str]) -> &mut Self {
        let entries = imports
            .iter()
            .enumerate()
            .map(|(index, name)| Rela {
                offset: got_addr + 8 * (index as u64 + 2),
                r_type: R_X86_64_JUMP_SLOT,
                sym: self.symbol(name, 0, SHN_UNDEF, STB_GLOBAL),
                addend: 0,
            })
            .collect::<Vec<_>>();
        self.progbits(".plt", plt_addr, 16, &vec![0x90u8; 16 * imports.len()]);
        self.progbits(".got", got_addr, 8, &vec![0u8; 8 * (imports.len() + 2)]);
        self.rela(".rela.plt", RELA_PLT_VADDR, &entries);
        self.dynamic_entry(DT_JMPREL, RELA_PLT_VADDR)
            .dynamic_entry(DT_PLTRELSZ, (RELA_SIZE * imports.len()) as u64)
            .dynamic_entry(DT_PLTREL, DT_RELA as u64)
            .dynamic_entry(DT_PLTGOT, got_addr)
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = usize::from(self.interp.is_some())
            + usize::from(self.load_segment)
            + self.dynamic_segments;
        let mut file = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        let interp = self
            .interp
            .as_ref()
            .map(|interp| (append(&mut file, interp), interp.len() as u64));

        let mut dynamic = Vec::new();
        for (tag, value) in self.dynamic.iter().chain(std::iter::once(&(DT_NULL, 0))) {
            dynamic.write_i64::<LittleEndian>(*tag).unwrap();
            dynamic.write_u64::<LittleEndian>(*value).unwrap();
        }
        let dynamic_offset = append(&mut file, &dynamic);

        let mut dynstr = vec![0u8];
        let mut dynsym = vec![0u8; SYM_SIZE];
        for symbol in &self.symbols {
            dynsym
                .write_u32::<LittleEndian>(intern(&mut dynstr, &symbol.name))
                .unwrap();
            dynsym.write_u8(symbol.info).unwrap();
            dynsym.write_u8(0).unwrap();
            dynsym.write_u16::<LittleEndian>(symbol.shndx).unwrap();
            dynsym.write_u64::<LittleEndian>(symbol.value).unwrap();
            dynsym.write_u64::<LittleEndian>(0).unwrap();
        }

        let section_offsets = self
            .sections
            .iter()
            .map(|section| {
                let offset = append(&mut file, &section.data);
                section.offset.unwrap_or(offset)
            })
            .collect::<Vec<_>>();
        let dynsym_offset = append(&mut file, &dynsym);
        let dynstr_offset = append(&mut file, &dynstr);

        let user_count = self.sections.len() as u32;
        let interp_index = user_count + 1;
        let dynamic_index = interp_index + u32::from(self.interp.is_some());
        let dynsym_index = dynamic_index + u32::from(self.dynamic_section_header);
        let dynstr_index = dynsym_index + 1;
        let shstrtab_index = dynstr_index + 1;

        let mut shstrtab = vec![0u8];
        let mut headers = vec![0u8; SHDR_SIZE];
        for (section, offset) in self.sections.iter().zip(section_offsets) {
            let link = match section.link {
                Some(link) => link,
                None if section.sh_type == SHT_RELA => dynsym_index,
                None => 0,
            };
            let name = intern(&mut shstrtab, &section.name);
            write_shdr(
                &mut headers,
                name,
                section.sh_type,
                section.addr,
                offset,
                section.size,
                link,
                section.align,
                section.entsize,
            );
        }
        if let Some((offset, size)) = interp {
            let name = intern(&mut shstrtab, ".interp");
            write_shdr(&mut headers, name, SHT_PROGBITS, 0, offset, size, 0, 1, 0);
        }
        if self.dynamic_section_header {
            let name = intern(&mut shstrtab, ".dynamic");
            write_shdr(
                &mut headers,
                name,
                SHT_DYNAMIC,
                self.dynamic_vaddr,
                dynamic_offset,
                dynamic.len() as u64,
                dynstr_index,
                8,
                DYN_SIZE as u64,
            );
        }
        let name = intern(&mut shstrtab, ".dynsym");
        write_shdr(
            &mut headers,
            name,
            SHT_DYNSYM,
            0,
            dynsym_offset,
            dynsym.len() as u64,
            dynstr_index,
            8,
            SYM_SIZE as u64,
        );
        let name = intern(&mut shstrtab, ".dynstr");
        write_shdr(
            &mut headers,
            name,
            SHT_STRTAB,
            0,
            dynstr_offset,
            dynstr.len() as u64,
            0,
            1,
            0,
        );
        let name = intern(&mut shstrtab, ".shstrtab");
        let shstrtab_offset = append(&mut file, &shstrtab);
        write_shdr(
            &mut headers,
            name,
            SHT_STRTAB,
            0,
            shstrtab_offset,
            shstrtab.len() as u64,
            0,
            1,
            0,
        );
        let shoff = append(&mut file, &headers);
        let shnum = headers.len() / SHDR_SIZE;

        let mut prefix = Vec::with_capacity(EHDR_SIZE + phnum * PHDR_SIZE);
        prefix.extend_from_slice(&ELFMAG);
        prefix.extend_from_slice(&[
            self.class,
            self.data,
            self.ident_version,
            self.osabi,
            self.abi_version,
        ]);
        prefix.extend_from_slice(&[0; 7]);
        prefix.write_u16::<LittleEndian>(self.e_type).unwrap();
        prefix.write_u16::<LittleEndian>(self.machine).unwrap();
        prefix.write_u32::<LittleEndian>(self.version).unwrap();
        prefix.write_u64::<LittleEndian>(0x1000).unwrap();
        prefix.write_u64::<LittleEndian>(EHDR_SIZE as u64).unwrap();
        prefix.write_u64::<LittleEndian>(shoff).unwrap();
        prefix.write_u32::<LittleEndian>(0).unwrap();
        prefix.write_u16::<LittleEndian>(EHDR_SIZE as u16).unwrap();
        prefix.write_u16::<LittleEndian>(PHDR_SIZE as u16).unwrap();
        prefix.write_u16::<LittleEndian>(phnum as u16).unwrap();
        prefix.write_u16::<LittleEndian>(SHDR_SIZE as u16).unwrap();
        prefix.write_u16::<LittleEndian>(shnum as u16).unwrap();
        prefix.write_u16::<LittleEndian>(shstrtab_index as u16).unwrap();

        if let Some((offset, size)) = interp {
            write_phdr(&mut prefix, PT_INTERP, offset, 0, size);
        }
        if self.load_segment {
            write_phdr(&mut prefix, PT_LOAD, 0, 0, file.len() as u64);
        }
        for _ in 0..self.dynamic_segments {
            write_phdr(
                &mut prefix,
                PT_DYNAMIC,
                dynamic_offset,
                self.dynamic_vaddr,
                dynamic.len() as u64,
            );
        }
        file[..prefix.len()].copy_from_slice(&prefix);
        file
    }
}

#[macro_export]
macro_rules! assert_error {
    ($result:expr, $($error:expr),+) => {
        assert!(format!("{:?}", $result).contains(&format!($($error),+)));
    }
}
