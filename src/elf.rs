//! This module loads and relocates alt-os executables
//!
//! An alt-os executable is an ELF64 x86-64 dynamic executable tagged with the
//! alt-os OS/ABI and interpreter. Loading runs once per file and yields an
//! [ExecutableCode] template: every section of a closed vocabulary is sorted
//! into one of seven buckets, each bucket is read into a buffer padded to its
//! alignment, and the relocation tables are parsed.
//!
//! The code and read only data buckets are shared by every instance of the
//! program. [ExecutableCode::load_shared] relocates them in place once, then
//! [ExecutableCode::load_instance] produces relocated private copies of the
//! remaining buckets for as many instances as needed.

use crate::{
    elf_parser::{
        consts::{
            dynamic_tag_name, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS, DT_HASH, DT_INIT_ARRAY,
            DT_INIT_ARRAYSZ, DT_JMPREL, DT_LOOS, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ,
            DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ, DT_RELA, DT_STRSZ, DT_STRTAB, DT_SYMENT,
            DT_SYMTAB, ELFCLASS64, ELFDATA2LSB, ELFOSABI_ALT_OS, ELF_ABI_VERSION, ELF_INTERP,
            EM_X86_64, ET_DYN, EV_CURRENT, PT_DYNAMIC, PT_INTERP, PT_LOAD, SHN_ABS, SHN_UNDEF,
            SHT_DYNSYM, SHT_NOBITS, SHT_NULL, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
            STB_GLOBAL, STB_WEAK, STT_FUNC,
        },
        get_string_in_table, read_range,
        types::{parse_table, Elf64Dyn, Elf64Ehdr, Elf64Phdr, Elf64Rela, Elf64Shdr, Elf64Sym},
        Elf64, ElfParserError,
    },
    error::{Error, FormatError, RelocationError, Result, UnsupportedFeatureError},
    limits::LimitExceededError,
    program::{Loader, SymbolRegistry},
    reader::{self, ByteSource},
    relocation::{
        Layout, Phase, Relocation, RelocationTable, RelocationTableKind, RelocationType,
        SymbolRef,
    },
    x86,
};
use log::{debug, trace};
use serde::Serialize;
use std::{
    convert::TryFrom,
    fmt,
    io::{self, Cursor, Read, Seek},
    path::Path,
    sync::Arc,
};

/// Size of one PLT stub
pub const ELF_PLT_ENTRY_SIZE: u64 = x86::PLT_STUB_SIZE as u64;
/// Size of one GOT slot
pub const ELF_GOT_ENTRY_SIZE: u64 = 8;
/// GOT slots reserved for loader metadata in front of the PLT slots
pub const ELF_GOT_RESERVED_ENTRIES: u64 = 2;

/// Name under which the executable size limit is reported
const MAX_EXECUTABLE_SIZE_NAME: &str = "MAX_EXECUTABLE_SIZE";

/// Memory regions an executable is loaded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Bucket {
    /// `.text`, shared
    Code,
    /// `.data`
    Data,
    /// `.rodata`, shared
    RoData,
    /// `.bss`
    Bss,
    /// `.plt`
    Plt,
    /// `.got`
    Got,
    /// `.eh_frame`
    EhFrame,
}

impl Bucket {
    /// Number of buckets
    pub const COUNT: usize = 7;

    /// All buckets in layout order
    pub const ALL: [Bucket; Bucket::COUNT] = [
        Bucket::Code,
        Bucket::Data,
        Bucket::RoData,
        Bucket::Bss,
        Bucket::Plt,
        Bucket::Got,
        Bucket::EhFrame,
    ];

    /// Whether the bucket is mapped once and shared by all instances
    pub fn is_shared(self) -> bool {
        matches!(self, Bucket::Code | Bucket::RoData)
    }

    /// Name of the section loaded into the bucket
    pub fn section_name(self) -> &'static str {
        match self {
            Bucket::Code => ".text",
            Bucket::Data => ".data",
            Bucket::RoData => ".rodata",
            Bucket::Bss => ".bss",
            Bucket::Plt => ".plt",
            Bucket::Got => ".got",
            Bucket::EhFrame => ".eh_frame",
        }
    }

    fn section_type(self) -> u32 {
        match self {
            Bucket::Bss => SHT_NOBITS,
            _ => SHT_PROGBITS,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section_name())
    }
}

/// In-memory size and alignment of a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    /// Size padded to the alignment
    pub size: u64,
    /// Declared alignment, 0 means none
    pub alignment: u64,
}

/// Memory information about every bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionMemoryInfo {
    /// Code
    pub code: SectionInfo,
    /// Data
    pub data: SectionInfo,
    /// Read only data
    pub rodata: SectionInfo,
    /// Zero initialized data
    pub bss: SectionInfo,
    /// PLT stubs
    pub plt: SectionInfo,
    /// GOT slots
    pub got: SectionInfo,
    /// Unwind tables
    pub eh_frame: SectionInfo,
}

impl SectionMemoryInfo {
    /// Info of one bucket
    pub fn get(&self, bucket: Bucket) -> SectionInfo {
        match bucket {
            Bucket::Code => self.code,
            Bucket::Data => self.data,
            Bucket::RoData => self.rodata,
            Bucket::Bss => self.bss,
            Bucket::Plt => self.plt,
            Bucket::Got => self.got,
            Bucket::EhFrame => self.eh_frame,
        }
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut SectionInfo {
        match bucket {
            Bucket::Code => &mut self.code,
            Bucket::Data => &mut self.data,
            Bucket::RoData => &mut self.rodata,
            Bucket::Bss => &mut self.bss,
            Bucket::Plt => &mut self.plt,
            Bucket::Got => &mut self.got,
            Bucket::EhFrame => &mut self.eh_frame,
        }
    }

    /// Bytes shared among instances
    pub fn shared_size(&self) -> u64 {
        self.sum(Bucket::ALL.iter().copied().filter(|bucket| bucket.is_shared()))
    }

    /// Bytes duplicated for every instance
    pub fn unshared_size(&self) -> u64 {
        self.sum(Bucket::ALL.iter().copied().filter(|bucket| !bucket.is_shared()))
    }

    fn sum(&self, buckets: impl Iterator<Item = Bucket>) -> u64 {
        buckets.fold(0u64, |total, bucket| total.saturating_add(self.get(bucket).size))
    }
}

/// Target addresses of the shared buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "fuzzer-not-safe-for-production",
    derive(arbitrary::Arbitrary)
)]
pub struct SharedAddresses {
    /// Where the code bucket is mapped
    pub code_addr: Option<u64>,
    /// Where the read only data bucket is mapped
    pub rodata_addr: Option<u64>,
}

impl SharedAddresses {
    fn get(&self, bucket: Bucket) -> Option<u64> {
        match bucket {
            Bucket::Code => self.code_addr,
            Bucket::RoData => self.rodata_addr,
            _ => None,
        }
    }
}

/// Target addresses of the buckets private to one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "fuzzer-not-safe-for-production",
    derive(arbitrary::Arbitrary)
)]
pub struct InstanceAddresses {
    /// Where the data bucket is mapped
    pub data_addr: Option<u64>,
    /// Where the bss bucket is mapped
    pub bss_addr: Option<u64>,
    /// Where the PLT bucket is mapped
    pub plt_addr: Option<u64>,
    /// Where the GOT bucket is mapped
    pub got_addr: Option<u64>,
    /// Where the unwind tables are mapped
    pub eh_frame_addr: Option<u64>,
}

impl InstanceAddresses {
    fn get(&self, bucket: Bucket) -> Option<u64> {
        match bucket {
            Bucket::Data => self.data_addr,
            Bucket::Bss => self.bss_addr,
            Bucket::Plt => self.plt_addr,
            Bucket::Got => self.got_addr,
            Bucket::EhFrame => self.eh_frame_addr,
            _ => None,
        }
    }
}

/// Relocated contents of every bucket as seen by one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedInstance {
    /// Shared code, identical for all instances
    pub code: Arc<[u8]>,
    /// Private data
    pub data: Vec<u8>,
    /// Shared read only data, identical for all instances
    pub rodata: Arc<[u8]>,
    /// Private zero initialized data
    pub bss: Vec<u8>,
    /// Private PLT stubs
    pub plt: Vec<u8>,
    /// Private GOT slots
    pub got: Vec<u8>,
    /// Private unwind tables
    pub eh_frame: Vec<u8>,
}

impl LoadedInstance {
    /// Contents of one bucket
    pub fn bytes(&self, bucket: Bucket) -> &[u8] {
        match bucket {
            Bucket::Code => &self.code,
            Bucket::Data => &self.data,
            Bucket::RoData => &self.rodata,
            Bucket::Bss => &self.bss,
            Bucket::Plt => &self.plt,
            Bucket::Got => &self.got,
            Bucket::EhFrame => &self.eh_frame,
        }
    }

    fn bytes_mut(&mut self, bucket: Bucket) -> Option<&mut Vec<u8>> {
        match bucket {
            Bucket::Code | Bucket::RoData => None,
            Bucket::Data => Some(&mut self.data),
            Bucket::Bss => Some(&mut self.bss),
            Bucket::Plt => Some(&mut self.plt),
            Bucket::Got => Some(&mut self.got),
            Bucket::EhFrame => Some(&mut self.eh_frame),
        }
    }
}

/// What the dynamic segment declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DynamicInfo {
    /// `DT_JMPREL`
    pub plt_relocation_table_vaddr: u64,
    /// `DT_PLTRELSZ`
    pub plt_relocation_table_size: u64,
    /// `DT_PLTRELSZ` divided by the RELA entry size
    pub plt_relocation_count: u64,
    /// `DT_PLTGOT`
    pub got_vaddr: u64,
    /// `DT_SYMENT`
    pub symbol_entry_size: u64,
}

/// How a section header is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionClass {
    Ignored,
    Bucket(Bucket),
    RelocationTable(RelocationTableKind),
    Unsupported,
}

fn classify_section(name: &str, section_type: u32) -> SectionClass {
    match (name, section_type) {
        ("", _) | (_, SHT_NULL) | (".comment", _) | (".hash", _) | (".eh_frame_hdr", _) => {
            SectionClass::Ignored
        }
        _ if name.starts_with(".gnu") => SectionClass::Ignored,
        (".rela.text", SHT_RELA) => SectionClass::RelocationTable(RelocationTableKind::Text),
        (".rela.plt", SHT_RELA) => SectionClass::RelocationTable(RelocationTableKind::Plt),
        (".rela.eh_frame", SHT_RELA) => {
            SectionClass::RelocationTable(RelocationTableKind::EhFrame)
        }
        // Consumed while parsing
        (".interp", _)
        | (".dynamic", _)
        | (".dynsym", _)
        | (".dynstr", _)
        | (".strtab", _)
        | (".symtab", _)
        | (".shstrtab", _) => SectionClass::Ignored,
        _ => Bucket::ALL
            .iter()
            .copied()
            .find(|bucket| bucket.section_name() == name && bucket.section_type() == section_type)
            .map(SectionClass::Bucket)
            .unwrap_or(SectionClass::Unsupported),
    }
}

/// Rounds `size` up to `alignment`, saturating on overflow
fn aligned_size(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return size;
    }
    size.checked_next_multiple_of(alignment).unwrap_or(u64::MAX)
}

/// Result of the section walk
#[derive(Debug, Default)]
struct MemoryPlan {
    sections: [Option<Elf64Shdr>; Bucket::COUNT],
    section_info: SectionMemoryInfo,
    relocation_tables: Vec<(RelocationTableKind, Elf64Shdr)>,
    plt_entry_count: u64,
    got_entry_count: u64,
}

/// A parsed alt-os executable, the template its instances are loaded from
#[derive(Debug)]
pub struct ExecutableCode {
    /// Configuration and runtime symbols
    loader: Arc<Loader>,
    /// Padded size and alignment of every bucket
    section_info: SectionMemoryInfo,
    /// Dynamic segment summary
    dynamic_info: DynamicInfo,
    /// Number of 16 byte PLT stubs
    plt_entry_count: u64,
    /// Number of 8 byte GOT slots
    got_entry_count: u64,
    /// Bucket contents, empty for `.bss` and absent buckets
    bytes: [Arc<[u8]>; Bucket::COUNT],
    /// Link time address of every present bucket
    original_addresses: [Option<u64>; Bucket::COUNT],
    /// Parsed relocation tables
    relocation_tables: Vec<RelocationTable>,
    /// Defined global functions by link time address
    exports: Vec<(String, u64)>,
    /// Set once the shared buckets are relocated
    shared_addresses: Option<SharedAddresses>,
}

impl ExecutableCode {
    /// Reads an executable from a file with the default [Loader]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_loader(path, Arc::new(Loader::default()))
    }

    /// Reads an executable from a file
    pub fn from_file_with_loader<P: AsRef<Path>>(path: P, loader: Arc<Loader>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = reader::open(path)?;
        let executable = Self::load_from_reader(&mut file, loader)?;
        debug!(
            "loaded {}: {} shared bytes, {} unshared bytes",
            path.display(),
            executable.shared_size(),
            executable.unshared_size()
        );
        Ok(executable)
    }

    /// Parses an executable held in memory
    pub fn load(bytes: &[u8], loader: Arc<Loader>) -> Result<Self> {
        Self::load_from_reader(&mut Cursor::new(bytes), loader)
    }

    /// Parses an executable from any seekable reader
    pub fn load_from_reader<R: Read + Seek>(source: &mut R, loader: Arc<Loader>) -> Result<Self> {
        reader::check_magic(source)?;

        let (file_size, file_header) = Elf64::parse_file_header(source)?;
        Self::validate(&file_header)?;
        let elf = Elf64::read(source, file_size, file_header)?;
        let dynamic_segment = Self::validate_program_headers(&elf, source)?;
        let dynamic_info = Self::parse_dynamic(&elf, source, &dynamic_segment)?;
        let plan = Self::plan_memory(&elf, &loader, &dynamic_info)?;

        let mut executable = Self {
            loader,
            section_info: plan.section_info,
            dynamic_info,
            plt_entry_count: plan.plt_entry_count,
            got_entry_count: plan.got_entry_count,
            bytes: std::array::from_fn(|_| Arc::from(&[][..])),
            original_addresses: [None; Bucket::COUNT],
            relocation_tables: Vec::new(),
            exports: Vec::new(),
            shared_addresses: None,
        };
        executable.load_contents(&plan, file_size, source)?;
        let relocation_tables = plan
            .relocation_tables
            .iter()
            .map(|(kind, header)| executable.parse_relocation_table(&elf, source, *kind, header))
            .collect::<Result<Vec<_>>>()?;
        executable.relocation_tables = relocation_tables;
        executable.exports = Self::parse_exports(&elf, source)?;
        debug!(
            "parsed executable: {} bytes in memory, {} relocation tables",
            executable.size(),
            executable.relocation_tables.len()
        );
        Ok(executable)
    }

    /// Get the total number of memory bytes
    pub fn size(&self) -> u64 {
        self.shared_size().saturating_add(self.unshared_size())
    }

    /// Get the number of bytes that can be shared among instances
    pub fn shared_size(&self) -> u64 {
        self.section_info.shared_size()
    }

    /// Get the number of bytes that must be duplicated for instances
    pub fn unshared_size(&self) -> u64 {
        self.section_info.unshared_size()
    }

    /// Get the memory information about every bucket
    pub fn section_info(&self) -> &SectionMemoryInfo {
        &self.section_info
    }

    /// Get the dynamic segment summary
    pub fn dynamic_info(&self) -> &DynamicInfo {
        &self.dynamic_info
    }

    /// Get the number of PLT stubs
    pub fn plt_entry_count(&self) -> u64 {
        self.plt_entry_count
    }

    /// Get the number of GOT slots, including the reserved ones
    pub fn got_entry_count(&self) -> u64 {
        self.got_entry_count
    }

    /// Get the link time address of a bucket, `None` if its section is absent
    pub fn original_address(&self, bucket: Bucket) -> Option<u64> {
        self.original_addresses[bucket.index()]
    }

    /// Get the template contents of a bucket.
    ///
    /// `.bss` has no template contents, instances receive zeroed memory.
    pub fn bucket_bytes(&self, bucket: Bucket) -> &[u8] {
        &self.bytes[bucket.index()]
    }

    /// Get the parsed relocation tables
    pub fn relocation_tables(&self) -> &[RelocationTable] {
        &self.relocation_tables
    }

    /// Get the addresses passed to [Self::load_shared], if it ran
    pub fn shared_addresses(&self) -> Option<&SharedAddresses> {
        self.shared_addresses.as_ref()
    }

    /// Whether [Self::load_shared] completed
    pub fn is_shared_loaded(&self) -> bool {
        self.shared_addresses.is_some()
    }

    /// Get the loader
    pub fn get_loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    /// Relocates the shared buckets in place for the given target addresses.
    ///
    /// Runs at most once, before any instance is loaded.
    pub fn load_shared(&mut self, addresses: SharedAddresses) -> Result<()> {
        if self.shared_addresses.is_some() {
            return Err(RelocationError::SharedAlreadyLoaded.into());
        }
        let mut targets = [None; Bucket::COUNT];
        for bucket in Bucket::ALL.iter().copied().filter(|b| b.is_shared()) {
            targets[bucket.index()] = self.checked_target(bucket, addresses.get(bucket))?;
        }

        let mut code = self.bytes[Bucket::Code.index()].to_vec();
        let mut rodata = self.bytes[Bucket::RoData.index()].to_vec();
        {
            let layout = Layout::new(self, targets, Phase::Shared);
            for table in self.relocation_tables.iter() {
                let bucket = table.kind.bucket();
                let bytes = match bucket {
                    Bucket::Code => &mut code,
                    Bucket::RoData => &mut rodata,
                    _ => continue,
                };
                for relocation in table.entries.iter() {
                    layout.apply(bucket, table.kind, relocation, bytes)?;
                }
            }
        }
        self.bytes[Bucket::Code.index()] = Arc::from(code);
        self.bytes[Bucket::RoData.index()] = Arc::from(rodata);
        self.shared_addresses = Some(addresses);
        debug!(
            "relocated shared sections to code {:x?}, rodata {:x?}",
            addresses.code_addr, addresses.rodata_addr
        );
        Ok(())
    }

    /// Target addresses of the global functions this executable defines.
    ///
    /// Code is shared, so the addresses hold for every instance. Requires
    /// [Self::load_shared] to have completed.
    pub fn exported_symbols(&self) -> Result<SymbolRegistry> {
        let mut registry = SymbolRegistry::default();
        self.export_symbols(&mut registry)?;
        Ok(registry)
    }

    /// Adds the exported functions to `registry`, a name already registered
    /// at another address is rejected
    pub fn export_symbols(&self, registry: &mut SymbolRegistry) -> Result<()> {
        let shared_addresses = self
            .shared_addresses
            .ok_or(RelocationError::SharedNotLoaded)?;
        let mut targets = [None; Bucket::COUNT];
        for bucket in Bucket::ALL.iter().copied().filter(|b| b.is_shared()) {
            targets[bucket.index()] = shared_addresses.get(bucket);
        }
        let layout = Layout::new(self, targets, Phase::Shared);
        for (name, address) in self.exports.iter() {
            let address = layout.rebase(*address, *address)?;
            registry.register_symbol(name.as_str(), address)?;
        }
        Ok(())
    }

    /// Copies and relocates the instance buckets for the given target
    /// addresses, the template is left untouched.
    ///
    /// Requires [Self::load_shared] to have completed, then it is safe to
    /// call from any number of threads.
    pub fn load_instance(&self, addresses: InstanceAddresses) -> Result<LoadedInstance> {
        let shared_addresses = self
            .shared_addresses
            .ok_or(RelocationError::SharedNotLoaded)?;
        let mut targets = [None; Bucket::COUNT];
        for bucket in Bucket::ALL.iter().copied() {
            targets[bucket.index()] = if bucket.is_shared() {
                shared_addresses.get(bucket)
            } else {
                self.checked_target(bucket, addresses.get(bucket))?
            };
        }

        let bss_size = usize::try_from(self.section_info.bss.size)
            .map_err(|_| ElfParserError::OutOfBounds)?;
        let mut instance = LoadedInstance {
            code: Arc::clone(&self.bytes[Bucket::Code.index()]),
            data: self.bucket_bytes(Bucket::Data).to_vec(),
            rodata: Arc::clone(&self.bytes[Bucket::RoData.index()]),
            bss: vec![0u8; bss_size],
            plt: self.bucket_bytes(Bucket::Plt).to_vec(),
            got: self.bucket_bytes(Bucket::Got).to_vec(),
            eh_frame: self.bucket_bytes(Bucket::EhFrame).to_vec(),
        };

        let layout = Layout::new(self, targets, Phase::Instance);
        for table in self.relocation_tables.iter() {
            let bucket = table.kind.bucket();
            let bytes = match instance.bytes_mut(bucket) {
                Some(bytes) => bytes,
                None => continue,
            };
            for relocation in table.entries.iter() {
                layout.apply(bucket, table.kind, relocation, bytes)?;
            }
        }
        if self.loader.get_config().rewrite_plt_stubs {
            self.rewrite_plt_stubs(&layout, &mut instance.plt)?;
        }
        Ok(instance)
    }

    /// Points every PLT stub at its GOT slot, skipping the reserved slots
    fn rewrite_plt_stubs(&self, layout: &Layout, plt: &mut [u8]) -> Result<()> {
        let (plt_addr, got_addr) = match (layout.target(Bucket::Plt), layout.target(Bucket::Got)) {
            (Some(plt_addr), Some(got_addr)) => (plt_addr, got_addr),
            _ => return Ok(()),
        };
        for (index, stub) in plt
            .chunks_exact_mut(x86::PLT_STUB_SIZE)
            .take(self.plt_entry_count as usize)
            .enumerate()
        {
            let index = index as u64;
            let stub_address = plt_addr.wrapping_add(index.saturating_mul(ELF_PLT_ENTRY_SIZE));
            let slot_address = got_addr.wrapping_add(
                index
                    .saturating_add(ELF_GOT_RESERVED_ENTRIES)
                    .saturating_mul(ELF_GOT_ENTRY_SIZE),
            );
            x86::emit_plt_stub(stub, stub_address, slot_address).ok_or_else(|| {
                RelocationError::ValueOutOfRange {
                    offset: self
                        .original_address(Bucket::Plt)
                        .unwrap_or_default()
                        .wrapping_add(index.saturating_mul(ELF_PLT_ENTRY_SIZE)),
                    r_type: RelocationType::R_X86_64_JumpSlot.raw(),
                }
            })?;
        }
        Ok(())
    }

    /// A non-empty bucket needs a target address
    fn checked_target(&self, bucket: Bucket, target: Option<u64>) -> Result<Option<u64>> {
        if target.is_none() && self.section_info.get(bucket).size != 0 {
            return Err(RelocationError::MissingAddress(bucket).into());
        }
        Ok(target)
    }

    // Functions exposed for tests

    /// Validates the file header against the alt-os profile
    pub fn validate(header: &Elf64Ehdr) -> Result<()> {
        if header.e_ident.ei_class != ELFCLASS64 {
            return Err(FormatError::WrongClass(header.e_ident.ei_class).into());
        }
        if header.e_ident.ei_data != ELFDATA2LSB {
            return Err(FormatError::WrongByteOrder(header.e_ident.ei_data).into());
        }
        if header.e_ident.ei_version as u32 != EV_CURRENT
            || header.e_version != EV_CURRENT
            || header.e_ident.ei_abiversion != ELF_ABI_VERSION
        {
            return Err(FormatError::WrongVersion {
                version: if header.e_version != EV_CURRENT {
                    header.e_version
                } else {
                    header.e_ident.ei_version as u32
                },
                abi_version: header.e_ident.ei_abiversion,
            }
            .into());
        }
        if header.e_type != ET_DYN {
            return Err(FormatError::WrongType(header.e_type).into());
        }
        if header.e_ident.ei_osabi != ELFOSABI_ALT_OS {
            return Err(FormatError::WrongOsAbi(header.e_ident.ei_osabi).into());
        }
        if header.e_machine != EM_X86_64 {
            return Err(FormatError::UnhandledArchitecture(header.e_machine).into());
        }
        Ok(())
    }

    /// Checks for a loadable segment, the interpreter and a single dynamic
    /// segment, which is returned
    fn validate_program_headers<S: ByteSource>(elf: &Elf64, source: &mut S) -> Result<Elf64Phdr> {
        let mut is_loadable = false;
        let mut interpreter = String::new();
        let mut dynamic_segment: Option<&Elf64Phdr> = None;
        for program_header in elf.program_header_table() {
            match program_header.p_type {
                PT_LOAD => is_loadable = true,
                PT_DYNAMIC => {
                    if dynamic_segment.is_some() {
                        return Err(FormatError::MultipleDynamicSegments.into());
                    }
                    dynamic_segment = Some(program_header);
                }
                PT_INTERP => {
                    let range = program_header
                        .file_range()
                        .ok_or(ElfParserError::InvalidProgramHeader)?;
                    let mut bytes = read_range(source, elf.file_size(), range)?;
                    if bytes.last() == Some(&0) {
                        bytes.pop();
                    }
                    interpreter = String::from_utf8_lossy(&bytes).into_owned();
                }
                _ => {}
            }
        }
        if !is_loadable {
            return Err(FormatError::NotLoadable.into());
        }
        if interpreter != ELF_INTERP {
            return Err(FormatError::WrongInterpreter(interpreter).into());
        }
        dynamic_segment
            .cloned()
            .ok_or_else(|| FormatError::MissingDynamicSegment.into())
    }

    /// Walks the dynamic entries up to `DT_NULL`
    fn parse_dynamic<S: ByteSource>(
        elf: &Elf64,
        source: &mut S,
        dynamic_segment: &Elf64Phdr,
    ) -> Result<DynamicInfo> {
        let entry_count = match elf
            .section_header_table()
            .iter()
            .find(|section| section.sh_addr == dynamic_segment.p_vaddr && section.sh_entsize != 0)
        {
            Some(section) => {
                if section.sh_entsize != Elf64Dyn::SIZE as u64 {
                    return Err(ElfParserError::InvalidDynamicSectionTable.into());
                }
                section.sh_size / section.sh_entsize
            }
            None => dynamic_segment.p_filesz / Elf64Dyn::SIZE as u64,
        };
        let table_size = entry_count
            .checked_mul(Elf64Dyn::SIZE as u64)
            .filter(|size| *size <= dynamic_segment.p_filesz)
            .ok_or(ElfParserError::InvalidDynamicSectionTable)?;
        let table_end = dynamic_segment
            .p_offset
            .checked_add(table_size)
            .ok_or(ElfParserError::InvalidDynamicSectionTable)?;
        let bytes = read_range(source, elf.file_size(), dynamic_segment.p_offset..table_end)?;

        let mut info = DynamicInfo::default();
        for entry in bytes.chunks_exact(Elf64Dyn::SIZE) {
            let entry = Elf64Dyn::parse(entry)?;
            trace!("dynamic entry {} = {:#x}", dynamic_tag_name(entry.d_tag), entry.d_val);
            match entry.d_tag {
                DT_NULL => break,
                DT_FLAGS | DT_HASH | DT_SYMTAB | DT_STRTAB | DT_STRSZ => {}
                DT_JMPREL => info.plt_relocation_table_vaddr = entry.d_val,
                DT_PLTRELSZ => {
                    info.plt_relocation_table_size = entry.d_val;
                    info.plt_relocation_count = entry.d_val / Elf64Rela::SIZE as u64;
                }
                DT_PLTREL => {
                    if entry.d_val != DT_RELA as u64 {
                        return Err(FormatError::RelocationsWithoutAddend(entry.d_val).into());
                    }
                }
                DT_PLTGOT => info.got_vaddr = entry.d_val,
                DT_SYMENT => info.symbol_entry_size = entry.d_val,
                DT_PREINIT_ARRAY | DT_PREINIT_ARRAYSZ | DT_INIT_ARRAY | DT_INIT_ARRAYSZ
                | DT_FINI_ARRAY | DT_FINI_ARRAYSZ => {
                    return Err(UnsupportedFeatureError::DynamicTag {
                        tag: entry.d_tag,
                        name: dynamic_tag_name(entry.d_tag),
                    }
                    .into());
                }
                tag if tag < DT_LOOS => {
                    return Err(UnsupportedFeatureError::UnrecognizedDynamicTag(tag).into());
                }
                _ => {}
            }
        }

        if info.symbol_entry_size == 0 {
            return Err(FormatError::NoSymbols.into());
        }
        if (info.plt_relocation_count != 0 || info.plt_relocation_table_vaddr != 0)
            && info.got_vaddr == 0
        {
            return Err(FormatError::MissingGot.into());
        }
        if (info.plt_relocation_table_size != 0 || info.got_vaddr != 0)
            && info.plt_relocation_table_vaddr == 0
        {
            return Err(FormatError::MissingPltRelocations.into());
        }
        Ok(info)
    }

    /// Sorts every section into a bucket and sizes the buckets
    fn plan_memory(
        elf: &Elf64,
        loader: &Loader,
        dynamic_info: &DynamicInfo,
    ) -> Result<MemoryPlan> {
        let mut plan = MemoryPlan::default();
        for section_header in elf.section_header_table() {
            let name = elf.section_name(section_header.sh_name)?;
            match classify_section(name, section_header.sh_type) {
                SectionClass::Ignored => {}
                SectionClass::Unsupported => {
                    return Err(UnsupportedFeatureError::Section {
                        name: name.to_string(),
                        section_type: section_header.sh_type,
                    }
                    .into());
                }
                SectionClass::RelocationTable(kind) => {
                    if plan.relocation_tables.iter().any(|(other, _)| *other == kind) {
                        return Err(FormatError::DuplicateSection(name.to_string()).into());
                    }
                    plan.relocation_tables.push((kind, section_header.clone()));
                }
                SectionClass::Bucket(bucket) => {
                    let alignment = section_header.sh_addralign;
                    if alignment != 0 && !alignment.is_power_of_two() {
                        return Err(FormatError::InvalidAlignment {
                            section: name.to_string(),
                            alignment,
                        }
                        .into());
                    }
                    let slot = &mut plan.sections[bucket.index()];
                    if slot.is_some() {
                        return Err(FormatError::DuplicateSection(name.to_string()).into());
                    }
                    *slot = Some(section_header.clone());
                    let memory_size = aligned_size(section_header.sh_size, alignment);
                    *plan.section_info.get_mut(bucket) = SectionInfo {
                        size: memory_size,
                        alignment,
                    };
                    trace!(
                        "section {} at {:#x}: {} bytes in file, {} in memory",
                        name,
                        section_header.sh_addr,
                        section_header.sh_size,
                        memory_size
                    );
                }
            }
        }

        if plan.sections[Bucket::Code.index()].is_none() || plan.section_info.code.size == 0 {
            return Err(FormatError::NoTextSection.into());
        }
        let size = plan
            .section_info
            .shared_size()
            .saturating_add(plan.section_info.unshared_size());
        LimitExceededError::check(
            MAX_EXECUTABLE_SIZE_NAME,
            loader.get_config().max_executable_size(),
            size,
        )?;
        plan.plt_entry_count = plan.section_info.plt.size / ELF_PLT_ENTRY_SIZE;
        plan.got_entry_count = plan.section_info.got.size / ELF_GOT_ENTRY_SIZE;
        if plan.plt_entry_count != 0
            && plan.got_entry_count.checked_sub(ELF_GOT_RESERVED_ENTRIES)
                != Some(plan.plt_entry_count)
        {
            return Err(RelocationError::GotPltMismatch {
                plt_entries: plan.plt_entry_count,
                got_entries: plan.got_entry_count,
            }
            .into());
        }

        let got_addr = plan.sections[Bucket::Got.index()]
            .as_ref()
            .map(|header| header.sh_addr);
        if dynamic_info.got_vaddr != 0 && got_addr != Some(dynamic_info.got_vaddr) {
            return Err(FormatError::DynamicAddressMismatch {
                section: Bucket::Got.section_name(),
                declared: dynamic_info.got_vaddr,
                actual: got_addr,
            }
            .into());
        }
        let plt_relocation_table_addr = plan
            .relocation_tables
            .iter()
            .find(|(kind, _)| *kind == RelocationTableKind::Plt)
            .map(|(_, header)| header.sh_addr);
        if dynamic_info.plt_relocation_table_vaddr != 0
            && plt_relocation_table_addr != Some(dynamic_info.plt_relocation_table_vaddr)
        {
            return Err(FormatError::DynamicAddressMismatch {
                section: RelocationTableKind::Plt.section_name(),
                declared: dynamic_info.plt_relocation_table_vaddr,
                actual: plt_relocation_table_addr,
            }
            .into());
        }
        Ok(plan)
    }

    /// Reads every bucket into a zero filled buffer of its memory size
    fn load_contents<S: ByteSource>(
        &mut self,
        plan: &MemoryPlan,
        file_size: u64,
        source: &mut S,
    ) -> Result<()> {
        for bucket in Bucket::ALL.iter().copied() {
            let section_header = match &plan.sections[bucket.index()] {
                Some(section_header) => section_header,
                None => continue,
            };
            self.original_addresses[bucket.index()] = Some(section_header.sh_addr);
            if bucket == Bucket::Bss {
                continue;
            }
            let context = format!("failed to read ELF {} section", bucket);
            let in_file = section_header
                .sh_offset
                .checked_add(section_header.sh_size)
                .map_or(false, |end| end <= file_size);
            if !in_file {
                return Err(Error::io(context)(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "section extends past the end of the file",
                )));
            }
            let memory_size = usize::try_from(self.section_info.get(bucket).size)
                .map_err(|_| ElfParserError::OutOfBounds)?;
            let content_size = usize::try_from(section_header.sh_size)
                .map_err(|_| ElfParserError::OutOfBounds)?;
            let mut bytes = vec![0u8; memory_size];
            source
                .read_exact_at(section_header.sh_offset, &mut bytes[..content_size])
                .map_err(Error::io(context))?;
            self.bytes[bucket.index()] = Arc::from(bytes);
        }
        Ok(())
    }

    /// Parses a RELA table and resolves the symbols of its entries against
    /// the linked symbol table
    fn parse_relocation_table<S: ByteSource>(
        &self,
        elf: &Elf64,
        source: &mut S,
        kind: RelocationTableKind,
        section_header: &Elf64Shdr,
    ) -> Result<RelocationTable> {
        if section_header.sh_entsize != 0 && section_header.sh_entsize != Elf64Rela::SIZE as u64 {
            return Err(ElfParserError::InvalidRelocationTable.into());
        }
        let bytes = elf.section_bytes(source, section_header)?;
        let entries = parse_table(&bytes, Elf64Rela::SIZE, Elf64Rela::parse)
            .map_err(|_| ElfParserError::InvalidRelocationTable)?;

        let symbols = if entries.iter().any(|entry| entry.r_sym() != 0) {
            Some(Self::read_symbol_table(elf, source, section_header.sh_link)?)
        } else {
            None
        };

        let bucket = kind.bucket();
        let original = self.original_address(bucket);
        let size = self.section_info.get(bucket).size;
        let mut relocations = Vec::with_capacity(entries.len());
        for entry in entries {
            let r_type = RelocationType::from_x86_relocation_type(entry.r_type())
                .ok_or_else(|| RelocationError::UnknownType(entry.r_type()))?;
            let in_bucket = original
                .and_then(|original| entry.r_offset.checked_sub(original))
                .and_then(|site| site.checked_add(r_type.width()))
                .map_or(false, |end| end <= size);
            if !in_bucket && r_type != RelocationType::R_X86_64_None {
                return Err(RelocationError::OffsetOutOfBounds {
                    table: kind.section_name(),
                    offset: entry.r_offset,
                    bucket,
                }
                .into());
            }
            if kind == RelocationTableKind::Plt {
                self.check_jump_slot(r_type, entry.r_offset)?;
            }
            let symbol = match (&symbols, entry.r_sym() as usize) {
                (_, 0) => SymbolRef::None,
                (Some((symbols, names)), index) => {
                    let symbol = symbols
                        .get(index)
                        .ok_or(RelocationError::UnknownSymbol(index))?;
                    match symbol.st_shndx {
                        SHN_UNDEF => SymbolRef::Undefined {
                            name: get_string_in_table(names, symbol.st_name)?.to_string(),
                            weak: symbol.st_bind() == STB_WEAK,
                        },
                        SHN_ABS => SymbolRef::Absolute(symbol.st_value),
                        _ => SymbolRef::Defined(symbol.st_value),
                    }
                }
                (None, index) => return Err(RelocationError::UnknownSymbol(index).into()),
            };
            relocations.push(Relocation {
                offset: entry.r_offset,
                r_type,
                symbol,
                addend: entry.r_addend,
            });
        }
        Ok(RelocationTable {
            kind,
            entries: relocations,
        })
    }

    /// `.rela.plt` may only fill the GOT slot behind a PLT stub, slot `i + 2`
    /// for stub `i`
    fn check_jump_slot(&self, r_type: RelocationType, offset: u64) -> Result<()> {
        let bad_jump_slot = RelocationError::BadJumpSlot { offset };
        if r_type != RelocationType::R_X86_64_JumpSlot {
            return Err(bad_jump_slot.into());
        }
        let got_offset = self
            .original_address(Bucket::Got)
            .and_then(|got_addr| offset.checked_sub(got_addr))
            .ok_or_else(|| bad_jump_slot.clone())?;
        let slot = got_offset / ELF_GOT_ENTRY_SIZE;
        let first_slot = ELF_GOT_RESERVED_ENTRIES;
        let end_slot = first_slot.saturating_add(self.plt_entry_count);
        if got_offset % ELF_GOT_ENTRY_SIZE != 0 || slot < first_slot || slot >= end_slot {
            return Err(bad_jump_slot.into());
        }
        Ok(())
    }

    /// Collects the defined global functions of the dynamic symbol table,
    /// or of the static one when there is none
    fn parse_exports<S: ByteSource>(elf: &Elf64, source: &mut S) -> Result<Vec<(String, u64)>> {
        let section_headers = elf.section_header_table();
        let index = section_headers
            .iter()
            .position(|header| header.sh_type == SHT_DYNSYM)
            .or_else(|| {
                section_headers
                    .iter()
                    .position(|header| header.sh_type == SHT_SYMTAB)
            });
        let index = match index {
            Some(index) => index as u32,
            None => return Ok(Vec::new()),
        };
        let (symbols, names) = Self::read_symbol_table(elf, source, index)?;
        let mut exports = Vec::new();
        for symbol in symbols.iter().filter(|symbol| {
            symbol.st_bind() == STB_GLOBAL
                && symbol.st_type() == STT_FUNC
                && symbol.st_value != 0
                && symbol.st_shndx != SHN_UNDEF
                && symbol.st_shndx != SHN_ABS
        }) {
            let name = get_string_in_table(&names, symbol.st_name)?;
            trace!("export {} at {:#x}", name, symbol.st_value);
            exports.push((name.to_string(), symbol.st_value));
        }
        Ok(exports)
    }

    /// Reads the symbol table at `index` and its string table
    fn read_symbol_table<S: ByteSource>(
        elf: &Elf64,
        source: &mut S,
        index: u32,
    ) -> Result<(Vec<Elf64Sym>, Vec<u8>)> {
        let section_headers = elf.section_header_table();
        let symbol_table = section_headers
            .get(index as usize)
            .filter(|header| header.sh_type == SHT_SYMTAB || header.sh_type == SHT_DYNSYM)
            .ok_or(ElfParserError::InvalidSymbolTable)?;
        if symbol_table.sh_entsize != 0 && symbol_table.sh_entsize != Elf64Sym::SIZE as u64 {
            return Err(ElfParserError::InvalidSymbolTable.into());
        }
        let string_table = section_headers
            .get(symbol_table.sh_link as usize)
            .filter(|header| header.sh_type == SHT_STRTAB)
            .ok_or(ElfParserError::NoStringTable)?;
        let symbols = parse_table(
            &elf.section_bytes(source, symbol_table)?,
            Elf64Sym::SIZE,
            Elf64Sym::parse,
        )
        .map_err(|_| ElfParserError::InvalidSymbolTable)?;
        let names = elf.section_bytes(source, string_table)?;
        Ok((symbols, names))
    }
}
