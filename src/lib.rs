//! Loader for alt-os executable code
//!
//! Parses alt-os ELF64 x86-64 position independent executables into a
//! template whose shared sections are relocated once and whose private
//! sections are copied and relocated per instance.
#![warn(clippy::arithmetic_side_effects)]
#![warn(missing_docs)]
#![allow(clippy::upper_case_acronyms)]

pub mod elf;
pub mod elf_parser;
pub mod error;
pub mod limits;
pub mod program;
pub mod reader;
pub mod relocation;
pub mod runtime;
pub mod x86;

pub use crate::{
    elf::{Bucket, ExecutableCode, InstanceAddresses, LoadedInstance, SharedAddresses},
    error::{Error, Result},
    program::Loader,
    runtime::{Config, InstanceSupervisor},
};
