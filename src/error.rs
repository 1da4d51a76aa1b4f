//! Error taxonomy of the loader
//!
//! Every failure is terminal for the operation that raised it. Nothing is
//! retried and nothing is logged here, callers decide how to report.

use crate::{
    elf::Bucket, elf_parser::ElfParserError, limits::LimitExceededError,
    program::SymbolRegistryError,
};
use std::io;

/// Loader errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening or reading the executable failed
    #[error("{context}: {source}")]
    Io {
        /// What was being read
        context: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The executable does not match the supported format
    #[error("bad ELF format: {0}")]
    Format(#[from] FormatError),
    /// The executable uses a feature the loader does not implement
    #[error("unsupported ELF feature: {0}")]
    Unsupported(#[from] UnsupportedFeatureError),
    /// The executable is too large
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceededError),
    /// Relocation information is inconsistent or cannot be applied
    #[error("relocation failed: {0}")]
    Relocation(#[from] RelocationError),
    /// Exported symbols clash with registered ones
    #[error("symbol export failed: {0}")]
    Symbol(#[from] SymbolRegistryError),
}

impl Error {
    /// Returns a closure wrapping an [io::Error] with `context`
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }
}

impl From<ElfParserError> for Error {
    fn from(err: ElfParserError) -> Self {
        Error::Format(FormatError::Parse(err))
    }
}

/// Loader result
pub type Result<T> = std::result::Result<T, Error>;

/// The executable is not an alt-os dynamic executable
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum FormatError {
    /// Does not start with `\x7fELF`
    #[error("bad ELF prefix")]
    BadMagic,
    /// Malformed header tables
    #[error("{0}")]
    Parse(#[from] ElfParserError),
    /// `e_version`/`EI_VERSION` is not current or `EI_ABIVERSION` is not 0
    #[error("unexpected ELF version: {version}, {abi_version}")]
    WrongVersion {
        /// ELF version
        version: u32,
        /// ABI version
        abi_version: u8,
    },
    /// `e_type` is not `ET_DYN`
    #[error("bad ELF type: {0}")]
    WrongType(u16),
    /// `EI_OSABI` is not the alt-os value
    #[error("bad ELF OSABI: {0}")]
    WrongOsAbi(u8),
    /// `EI_DATA` is not little endian
    #[error("bad ELF byte order: {0}")]
    WrongByteOrder(u8),
    /// `EI_CLASS` is not 64 bit
    #[error("bad ELF class: {0}")]
    WrongClass(u8),
    /// `e_machine` is not a supported architecture
    #[error("unhandled architecture: ELF machine {0}")]
    UnhandledArchitecture(u16),
    /// No `PT_LOAD` segment
    #[error("ELF not loadable")]
    NotLoadable,
    /// More than one `PT_DYNAMIC` segment
    #[error("multiple ELF dynamic sections")]
    MultipleDynamicSegments,
    /// No `PT_DYNAMIC` segment
    #[error("missing ELF dynamic section")]
    MissingDynamicSegment,
    /// `PT_INTERP` names another interpreter
    #[error("bad ELF interp: expected 'alt-os' but got '{0}'")]
    WrongInterpreter(String),
    /// `DT_PLTREL` is not `DT_RELA`
    #[error("ELF relocations missing addend (DT_PLTREL = {0})")]
    RelocationsWithoutAddend(u64),
    /// `DT_SYMENT` missing or zero
    #[error("no ELF symbols")]
    NoSymbols,
    /// PLT relocations declared without a GOT
    #[error("missing GOT")]
    MissingGot,
    /// GOT or PLT relocation size declared without the PLT relocation table
    #[error("missing PLT relocations")]
    MissingPltRelocations,
    /// No `.text` section or an empty one
    #[error("no .text section")]
    NoTextSection,
    /// A section of the fixed vocabulary appears twice
    #[error("duplicate ELF section '{0}'")]
    DuplicateSection(String),
    /// Section alignment is neither 0 nor a power of two
    #[error("bad alignment {alignment} of ELF section '{section}'")]
    InvalidAlignment {
        /// Section name
        section: String,
        /// Declared alignment
        alignment: u64,
    },
    /// A dynamic entry places a section elsewhere than its section header
    #[error("dynamic segment places {section} at {declared:#x} but the section is at {actual:?}")]
    DynamicAddressMismatch {
        /// Section name
        section: &'static str,
        /// Address from the dynamic segment
        declared: u64,
        /// Address from the section header, `None` if the section is absent
        actual: Option<u64>,
    },
}

/// The executable needs something this loader does not do
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum UnsupportedFeatureError {
    /// A known dynamic tag the loader refuses, e.g. constructor arrays
    #[error("the ELF dynamic tag {name} ({tag}) is unsupported")]
    DynamicTag {
        /// Raw tag
        tag: i64,
        /// Tag name
        name: &'static str,
    },
    /// A dynamic tag below `DT_LOOS` that is not recognized
    #[error("unrecognized ELF dynamic tag: {0}")]
    UnrecognizedDynamicTag(i64),
    /// A section outside the fixed vocabulary
    #[error("unsupported ELF section '{name}' (type {section_type})")]
    Section {
        /// Section name
        name: String,
        /// Section type
        section_type: u32,
    },
}

/// Relocation failures
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum RelocationError {
    /// PLT and GOT entry counts disagree, the first two GOT slots are reserved
    #[error("bad GOT entries: {plt_entries} PLT entries but {got_entries} GOT entries")]
    GotPltMismatch {
        /// Number of PLT stubs
        plt_entries: u64,
        /// Number of GOT slots
        got_entries: u64,
    },
    /// No target address given for a non-empty bucket
    #[error("missing target address for {0}")]
    MissingAddress(Bucket),
    /// Relocation site outside of the bucket its table applies to
    #[error("relocation in {table} at {offset:#x} is outside of {bucket}")]
    OffsetOutOfBounds {
        /// Relocation table name
        table: &'static str,
        /// Link time address of the site
        offset: u64,
        /// Bucket the table applies to
        bucket: Bucket,
    },
    /// Undefined symbol with no registered address
    #[error("unresolved symbol '{0}'")]
    UnresolvedSymbol(String),
    /// Relocation type outside of the supported x86-64 subset
    #[error("unknown relocation type {0}")]
    UnknownType(u32),
    /// Symbol index past the end of the linked symbol table
    #[error("unknown symbol with index {0}")]
    UnknownSymbol(usize),
    /// Referenced link time address lies in no bucket
    #[error("address {0:#x} is not inside any loaded section")]
    UnmappedAddress(u64),
    /// Relocated value does not fit the relocation field
    #[error("relocated value does not fit relocation type {r_type} at {offset:#x}")]
    ValueOutOfRange {
        /// Link time address of the site
        offset: u64,
        /// Relocation type
        r_type: u32,
    },
    /// A shared section refers to a per-instance section
    #[error("shared relocation at {offset:#x} refers to per-instance {bucket}")]
    SharedReferencesInstance {
        /// Link time address of the site
        offset: u64,
        /// Referenced bucket
        bucket: Bucket,
    },
    /// `load_shared` was already applied to this template
    #[error("shared sections already relocated")]
    SharedAlreadyLoaded,
    /// `load_instance` called before `load_shared`
    #[error("shared sections not relocated yet")]
    SharedNotLoaded,
    /// A `.rela.plt` entry is not a jump slot of a PLT stub
    #[error("bad jump slot relocation at {offset:#x}")]
    BadJumpSlot {
        /// Link time address of the site
        offset: u64,
    },
}
