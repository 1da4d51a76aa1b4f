use altos_code::{
    elf::{Bucket, ExecutableCode, InstanceAddresses, SectionInfo, SharedAddresses},
    elf_parser::consts::{
        DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_JMPREL,
        DT_NEEDED, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ,
        DT_REL, DT_SYMENT, R_X86_64_32, R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT,
        R_X86_64_PC32, R_X86_64_RELATIVE, SHN_UNDEF, SHT_PROGBITS, STB_GLOBAL, STB_LOCAL,
        STB_WEAK, STT_FUNC, STT_OBJECT,
    },
    error::{Error, FormatError, RelocationError, UnsupportedFeatureError},
    limits::{LimitExceededError, MAX_EXECUTABLE_SIZE},
    program::{Loader, SymbolRegistry, SymbolRegistryError},
    relocation::{RelocationTableKind, RelocationType, SymbolRef},
    runtime::Config,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{io, sync::Arc};
use test_utils::{assert_error, ElfBuilder, Rela, RELA_PLT_VADDR};

fn loader() -> Arc<Loader> {
    Arc::new(Loader::default())
}

fn load(builder: &ElfBuilder) -> Result<ExecutableCode, Error> {
    ExecutableCode::load(&builder.build(), loader())
}

fn shared(code_addr: u64) -> SharedAddresses {
    SharedAddresses {
        code_addr: Some(code_addr),
        ..SharedAddresses::default()
    }
}

#[test]
fn test_validate() {
    let executable = load(&ElfBuilder::with_text(&[0xC3; 16])).unwrap();
    assert_eq!(executable.section_info().code.size, 16);
    assert_eq!(executable.original_address(Bucket::Code), Some(0x1000));
    assert_eq!(executable.original_address(Bucket::Data), None);
    assert_eq!(executable.plt_entry_count(), 0);
    assert_eq!(executable.got_entry_count(), 0);
    assert!(executable.relocation_tables().is_empty());
    assert!(!executable.is_shared_loaded());
}

#[test]
fn test_bad_magic() {
    for bytes in [&b""[..], &b"\x7fEL"[..], &b"\x7fELG and then some more bytes"[..]] {
        let err = ExecutableCode::load(bytes, loader()).unwrap_err();
        assert!(matches!(err, Error::Format(FormatError::BadMagic)), "{:?}", err);
    }
}

#[test]
fn test_truncated_header() {
    let err = ExecutableCode::load(b"\x7fELF\x02\x01\x01", loader()).unwrap_err();
    assert_error!(err, "OutOfBounds");
}

#[test]
fn test_header_fields() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.class = 1;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongClass(1))
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.data = 2;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongByteOrder(2))
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.abi_version = 1;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongVersion {
            version: 1,
            abi_version: 1
        })
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.e_type = 2;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongType(2))
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.osabi = 0;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongOsAbi(0))
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.machine = 0xF7;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::UnhandledArchitecture(0xF7))
    ));
}

#[test]
fn test_program_headers() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.interp = Some(b"not-alt-os\0".to_vec());
    match load(&builder).unwrap_err() {
        Error::Format(FormatError::WrongInterpreter(interp)) => assert_eq!(interp, "not-alt-os"),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.interp = None;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::WrongInterpreter(_))
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.load_segment = false;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::NotLoadable)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_segments = 0;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::MissingDynamicSegment)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_segments = 2;
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::MultipleDynamicSegments)
    ));
}

#[test]
fn test_dynamic_section() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic.clear();
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::NoSymbols)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_entry(DT_PLTRELSZ, 48);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::MissingGot)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_entry(DT_JMPREL, 0x9000);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::MissingGot)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_entry(DT_PLTGOT, 0x7000);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::MissingPltRelocations)
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_entry(DT_PLTREL, DT_REL as u64);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::RelocationsWithoutAddend(17))
    ));

    for (tag, name) in [
        (DT_PREINIT_ARRAY, "DT_PREINIT_ARRAY"),
        (DT_PREINIT_ARRAYSZ, "DT_PREINIT_ARRAYSZ"),
        (DT_INIT_ARRAY, "DT_INIT_ARRAY"),
        (DT_INIT_ARRAYSZ, "DT_INIT_ARRAYSZ"),
        (DT_FINI_ARRAY, "DT_FINI_ARRAY"),
        (DT_FINI_ARRAYSZ, "DT_FINI_ARRAYSZ"),
    ] {
        let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
        builder.dynamic_entry(tag, 0x5000);
        match load(&builder).unwrap_err() {
            Error::Unsupported(err) => {
                assert_eq!(err, UnsupportedFeatureError::DynamicTag { tag, name })
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_entry(DT_NEEDED, 1);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Unsupported(UnsupportedFeatureError::UnrecognizedDynamicTag(1))
    ));

    // Tags at and above DT_LOOS and informational tags are ignored
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .dynamic_entry(DT_FLAGS, 0)
        .dynamic_entry(0x6FFF_FFFB, 1)
        .dynamic_entry(0x7000_0001, 2);
    load(&builder).unwrap();

    // Entries after DT_NULL are never read
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic.insert(0, (0, 0));
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::NoSymbols)
    ));
}

#[test]
fn test_dynamic_without_section_header() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.dynamic_section_header = false;
    builder.dynamic_entry(DT_SYMENT, 24);
    let executable = load(&builder).unwrap();
    assert_eq!(executable.dynamic_info().symbol_entry_size, 24);
}

#[test]
fn test_size_identity() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 10]);
    builder
        .progbits(".rodata", 0x2000, 8, b"hello")
        .progbits(".data", 0x3000, 4, &[1, 2, 3])
        .nobits(".bss", 0x4000, 16, 100)
        .progbits(".eh_frame", 0x5000, 0, &[0xEE; 12]);
    let executable = load(&builder).unwrap();
    let info = executable.section_info();
    assert_eq!(info.code, SectionInfo { size: 16, alignment: 16 });
    assert_eq!(info.rodata.size, 8);
    assert_eq!(info.data.size, 4);
    assert_eq!(info.bss.size, 112);
    assert_eq!(info.eh_frame.size, 12);
    assert_eq!(executable.shared_size(), 24);
    assert_eq!(executable.unshared_size(), 128);
    assert_eq!(
        executable.size(),
        executable.shared_size() + executable.unshared_size()
    );
    assert_eq!(
        executable.size(),
        Bucket::ALL
            .iter()
            .map(|bucket| info.get(*bucket).size)
            .sum::<u64>()
    );
}

#[test]
fn test_contents_are_padded_with_zeros() {
    let code = [0x55, 0x48, 0x89, 0xE5, 0x90, 0x90, 0x90, 0x5D, 0xC3, 0xCC];
    let mut builder = ElfBuilder::with_text(&code);
    builder
        .progbits(".rodata", 0x2000, 8, b"hello")
        .nobits(".bss", 0x4000, 16, 100);
    let executable = load(&builder).unwrap();
    let text = executable.bucket_bytes(Bucket::Code);
    assert_eq!(text.len(), 16);
    assert_eq!(&text[..10], &code);
    assert!(text[10..].iter().all(|byte| *byte == 0));
    assert_eq!(executable.bucket_bytes(Bucket::RoData), b"hello\0\0\0");
    assert!(executable.bucket_bytes(Bucket::Bss).is_empty());
    assert!(executable.bucket_bytes(Bucket::Data).is_empty());
}

#[test]
fn test_sections() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".comment", 0, 1, b"clang\0")
        .progbits(".gnu.version", 0, 2, &[0; 4])
        .progbits(".eh_frame_hdr", 0x5100, 4, &[0; 8])
        .progbits(".symtab", 0, 8, &[]);
    load(&builder).unwrap();

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".tdata", 0x6000, 8, &[0; 8]);
    match load(&builder).unwrap_err() {
        Error::Unsupported(err) => assert_eq!(
            err,
            UnsupportedFeatureError::Section {
                name: ".tdata".to_string(),
                section_type: SHT_PROGBITS
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }

    // .bss must not occupy file space
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".bss", 0x4000, 8, &[0; 8]);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Unsupported(UnsupportedFeatureError::Section { .. })
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".text", 0x6000, 16, &[0xC3; 16]);
    match load(&builder).unwrap_err() {
        Error::Format(FormatError::DuplicateSection(name)) => assert_eq!(name, ".text"),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".data", 0x3000, 3, &[0; 8]);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::InvalidAlignment { alignment: 3, .. })
    ));
}

#[test]
fn test_no_text_section() {
    let mut builder = ElfBuilder::new();
    builder.progbits(".data", 0x3000, 8, &[0; 8]);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::NoTextSection)
    ));

    let builder = ElfBuilder::with_text(&[]);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::NoTextSection)
    ));
}

#[test]
fn test_executable_size_limit() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.nobits(".bss", 0x4000, 16, MAX_EXECUTABLE_SIZE);
    match load(&builder).unwrap_err() {
        Error::LimitExceeded(err) => assert_eq!(
            err,
            LimitExceededError {
                limit_name: "MAX_EXECUTABLE_SIZE",
                limit_value: MAX_EXECUTABLE_SIZE,
                actual_value: MAX_EXECUTABLE_SIZE + 16,
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.nobits(".bss", 0x4000, 16, 64);
    let config = Config {
        max_executable_size: 64,
        ..Config::default()
    };
    let err = ExecutableCode::load(&builder.build(), Arc::new(Loader::new(config))).unwrap_err();
    assert_error!(err, "actual_value: 80");
}

#[test]
fn test_got_plt_mismatch() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".plt", 0x6000, 16, &[0x90; 32])
        .progbits(".got", 0x7000, 8, &[0; 24]);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::GotPltMismatch {
            plt_entries: 2,
            got_entries: 3
        })
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".plt", 0x6000, 16, &[0x90; 32])
        .progbits(".got", 0x7000, 8, &[0; 32]);
    let executable = load(&builder).unwrap();
    assert_eq!(executable.plt_entry_count(), 2);
    assert_eq!(executable.got_entry_count(), 4);
}

#[test]
fn test_section_past_end_of_file() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".data", 0x3000, 8, &[0; 8]);
    builder.sections[1].size = 0x10_0000;
    match load(&builder).unwrap_err() {
        Error::Io { context, source } => {
            assert_eq!(context, "failed to read ELF .data section");
            assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[test]
fn test_from_file() {
    let path = std::env::temp_dir().join(format!("altos-code-test-{}.elf", std::process::id()));
    std::fs::write(&path, ElfBuilder::with_text(&[0xC3; 16]).build()).unwrap();
    let executable = ExecutableCode::from_file(&path);
    std::fs::remove_file(&path).unwrap();
    assert_eq!(executable.unwrap().size(), 16);

    let err = ExecutableCode::from_file("/nonexistent/altos-code.elf").unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[test]
fn test_relative_relocation_in_shared_code() {
    let mut code = [0u8; 16];
    LittleEndian::write_u64(&mut code[8..], 0x1004);
    let mut builder = ElfBuilder::with_text(&code[..10]);
    builder.sections[0].data = code.to_vec();
    builder.sections[0].size = 16;
    builder.rela(
        ".rela.text",
        0,
        &[
            Rela {
                offset: 0x1000,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0x1008,
            },
            Rela {
                offset: 0x1008,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0,
            },
        ],
    );
    let mut executable = load(&builder).unwrap();
    assert_eq!(executable.relocation_tables().len(), 1);
    assert_eq!(
        executable.relocation_tables()[0].kind,
        RelocationTableKind::Text
    );

    executable.load_shared(shared(0x2000)).unwrap();
    let text = executable.bucket_bytes(Bucket::Code);
    assert_eq!(LittleEndian::read_u64(&text[0..8]), 0x2008);
    assert_eq!(LittleEndian::read_u64(&text[8..16]), 0x2004);
    assert_eq!(executable.shared_addresses(), Some(&shared(0x2000)));
}

#[test]
fn test_unaligned_text_is_rebased() {
    let mut builder = ElfBuilder::with_text(&[0u8; 10]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_RELATIVE,
            sym: 0,
            addend: 0x1002,
        }],
    );
    let mut executable = load(&builder).unwrap();
    assert_eq!(executable.section_info().code.size, 16);
    assert_eq!(executable.shared_size(), 16);
    assert_eq!(executable.unshared_size(), 0);
    assert_eq!(executable.size(), 16);
    executable.load_shared(shared(0x2000)).unwrap();
    let text = executable.bucket_bytes(Bucket::Code);
    assert_eq!(text.len(), 16);
    assert_eq!(LittleEndian::read_u64(&text[0..8]), 0x2002);
}

#[test]
fn test_pc_relative_relocation_across_buckets() {
    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.progbits(".rodata", 0x2000, 16, &[0u8; 16]);
    let table = builder.symbol("table", 0x2000, 2, STB_GLOBAL);
    builder.rela(
        ".rela.text",
        0,
        &[
            Rela {
                offset: 0x1004,
                r_type: R_X86_64_PC32,
                sym: table,
                addend: -4,
            },
            Rela {
                offset: 0x1008,
                r_type: R_X86_64_64,
                sym: table,
                addend: 8,
            },
        ],
    );
    let mut executable = load(&builder).unwrap();
    assert_eq!(
        executable.relocation_tables()[0].entries[0].symbol,
        SymbolRef::Defined(0x2000)
    );
    assert_eq!(
        executable.relocation_tables()[0].entries[0].r_type,
        RelocationType::R_X86_64_Pc32
    );
    executable
        .load_shared(SharedAddresses {
            code_addr: Some(0x40_0000),
            rodata_addr: Some(0x50_0000),
        })
        .unwrap();
    let text = executable.bucket_bytes(Bucket::Code);
    assert_eq!(LittleEndian::read_i32(&text[4..8]), 0x50_0000 - 4 - 0x40_0004);
    assert_eq!(LittleEndian::read_u64(&text[8..16]), 0x50_0008);
}

#[test]
fn test_relocation_value_out_of_range() {
    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_32,
            sym: 0,
            addend: -1,
        }],
    );
    let mut executable = load(&builder).unwrap();
    assert!(matches!(
        executable.load_shared(shared(0x2000)).unwrap_err(),
        Error::Relocation(RelocationError::ValueOutOfRange {
            offset: 0x1000,
            r_type: R_X86_64_32
        })
    ));
}

#[test]
fn test_invalid_relocations() {
    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: 9,
            sym: 0,
            addend: 0,
        }],
    );
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::UnknownType(9))
    ));

    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x100C,
            r_type: R_X86_64_64,
            sym: 0,
            addend: 0,
        }],
    );
    match load(&builder).unwrap_err() {
        Error::Relocation(err) => assert_eq!(
            err,
            RelocationError::OffsetOutOfBounds {
                table: ".rela.text",
                offset: 0x100C,
                bucket: Bucket::Code
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_64,
            sym: 5,
            addend: 0,
        }],
    );
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::UnknownSymbol(5))
    ));

    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(".rela.text", 0, &[]);
    builder.sections[1].data = vec![0; 20];
    builder.sections[1].size = 20;
    assert_error!(load(&builder).unwrap_err(), "InvalidRelocationTable");
}

#[test]
fn test_shared_must_not_reference_instance_sections() {
    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.progbits(".data", 0x3000, 8, &[0; 8]).rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_RELATIVE,
            sym: 0,
            addend: 0x3004,
        }],
    );
    let mut executable = load(&builder).unwrap();
    match executable.load_shared(shared(0x2000)).unwrap_err() {
        Error::Relocation(err) => assert_eq!(
            err,
            RelocationError::SharedReferencesInstance {
                offset: 0x1000,
                bucket: Bucket::Data
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }
    assert!(!executable.is_shared_loaded());

    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_RELATIVE,
            sym: 0,
            addend: 0x7777,
        }],
    );
    let mut executable = load(&builder).unwrap();
    assert!(matches!(
        executable.load_shared(shared(0x2000)).unwrap_err(),
        Error::Relocation(RelocationError::UnmappedAddress(0x7777))
    ));
}

#[test]
fn test_load_order() {
    let mut executable = load(&ElfBuilder::with_text(&[0xC3; 16])).unwrap();
    assert!(matches!(
        executable.load_instance(InstanceAddresses::default()).unwrap_err(),
        Error::Relocation(RelocationError::SharedNotLoaded)
    ));
    assert!(matches!(
        executable.load_shared(SharedAddresses::default()).unwrap_err(),
        Error::Relocation(RelocationError::MissingAddress(Bucket::Code))
    ));
    executable.load_shared(shared(0x1000)).unwrap();
    assert!(matches!(
        executable.load_shared(shared(0x1000)).unwrap_err(),
        Error::Relocation(RelocationError::SharedAlreadyLoaded)
    ));
    let instance = executable
        .load_instance(InstanceAddresses::default())
        .unwrap();
    assert_eq!(&instance.code[..], &[0xC3; 16]);
    assert!(instance.data.is_empty());
}

fn import_builder(imports: &[&str]) -> ElfBuilder {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.plt_got(0x6000, 0x7000, imports);
    builder
}

fn import_addresses() -> InstanceAddresses {
    InstanceAddresses {
        plt_addr: Some(0x20_0000),
        got_addr: Some(0x30_0000),
        ..InstanceAddresses::default()
    }
}

#[test]
fn test_plt_and_got() {
    let mut loader = Loader::default();
    loader.register_symbol("memcpy", 0xAAAA_0000).unwrap();
    loader.register_symbol("abort", 0xBBBB_0000).unwrap();
    let mut executable =
        ExecutableCode::load(&import_builder(&["memcpy", "abort"]).build(), Arc::new(loader))
            .unwrap();
    assert_eq!(executable.plt_entry_count(), 2);
    assert_eq!(executable.got_entry_count(), 4);
    assert_eq!(executable.dynamic_info().plt_relocation_count, 2);
    assert_eq!(executable.dynamic_info().got_vaddr, 0x7000);
    executable.load_shared(shared(0x10_0000)).unwrap();

    assert!(matches!(
        executable
            .load_instance(InstanceAddresses::default())
            .unwrap_err(),
        Error::Relocation(RelocationError::MissingAddress(Bucket::Plt))
    ));

    let instance = executable.load_instance(import_addresses()).unwrap();
    assert_eq!(&instance.got[..16], &[0; 16]);
    assert_eq!(LittleEndian::read_u64(&instance.got[16..24]), 0xAAAA_0000);
    assert_eq!(LittleEndian::read_u64(&instance.got[24..32]), 0xBBBB_0000);

    // jmp [rip + (0x300010 - 0x200006)]
    assert_eq!(&instance.plt[..6], &[0xFF, 0x25, 0x0A, 0x00, 0x10, 0x00]);
    assert!(instance.plt[6..16].iter().all(|byte| *byte == 0xCC));
    // jmp [rip + (0x300018 - 0x200016)]
    assert_eq!(&instance.plt[16..22], &[0xFF, 0x25, 0x02, 0x00, 0x10, 0x00]);

    // The template is not modified by loading instances
    assert!(executable.bucket_bytes(Bucket::Got).iter().all(|byte| *byte == 0));
    assert!(executable.bucket_bytes(Bucket::Plt).iter().all(|byte| *byte == 0x90));
}

#[test]
fn test_plt_stubs_kept() {
    let mut loader = Loader::new(Config {
        rewrite_plt_stubs: false,
        ..Config::default()
    });
    loader.register_symbol("memcpy", 0xAAAA_0000).unwrap();
    let mut executable =
        ExecutableCode::load(&import_builder(&["memcpy"]).build(), Arc::new(loader)).unwrap();
    executable.load_shared(shared(0x10_0000)).unwrap();
    let instance = executable.load_instance(import_addresses()).unwrap();
    assert_eq!(&instance.plt[..], &[0x90; 16]);
    assert_eq!(LittleEndian::read_u64(&instance.got[16..24]), 0xAAAA_0000);
}

#[test]
fn test_unresolved_symbols() {
    let mut executable = load(&import_builder(&["memcpy"])).unwrap();
    match &executable.relocation_tables()[0].entries[0].symbol {
        SymbolRef::Undefined { name, weak } => {
            assert_eq!(name, "memcpy");
            assert!(!weak);
        }
        symbol => panic!("unexpected symbol {:?}", symbol),
    }
    executable.load_shared(shared(0x10_0000)).unwrap();
    match executable.load_instance(import_addresses()).unwrap_err() {
        Error::Relocation(err) => {
            assert_eq!(err, RelocationError::UnresolvedSymbol("memcpy".to_string()))
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[test]
fn test_weak_symbols() {
    let mut builder = ElfBuilder::with_text(&[0u8; 16]);
    let hook = builder.symbol("optional_hook", 0, SHN_UNDEF, STB_WEAK);
    builder.rela(
        ".rela.text",
        0,
        &[Rela {
            offset: 0x1000,
            r_type: R_X86_64_64,
            sym: hook,
            addend: 0,
        }],
    );
    builder.sections[0].data = vec![0xFF; 16];
    let image = builder.build();

    let mut executable = ExecutableCode::load(&image, loader()).unwrap();
    executable.load_shared(shared(0x10_0000)).unwrap();
    assert_eq!(
        LittleEndian::read_u64(&executable.bucket_bytes(Bucket::Code)[..8]),
        0
    );

    let strict = Loader::new(Config {
        resolve_weak_symbols_to_zero: false,
        ..Config::default()
    });
    let mut executable = ExecutableCode::load(&image, Arc::new(strict)).unwrap();
    assert!(matches!(
        executable.load_shared(shared(0x10_0000)).unwrap_err(),
        Error::Relocation(RelocationError::UnresolvedSymbol(_))
    ));
}

#[test]
fn test_instances_are_isolated() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".data", 0x3000, 8, &[7; 16])
        .nobits(".bss", 0x4000, 8, 32)
        .progbits(".eh_frame", 0x5000, 8, &[0; 16])
        .rela(
            ".rela.eh_frame",
            0,
            &[Rela {
                offset: 0x5008,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0x3008,
            }],
        );
    let mut executable = load(&builder).unwrap();
    executable.load_shared(shared(0x10_0000)).unwrap();

    let mut rng = rand::thread_rng();
    let mut addresses = || {
        use rand::Rng;
        let page = |rng: &mut rand::rngs::ThreadRng| rng.gen_range(0x100u64..0x10_0000) << 12;
        InstanceAddresses {
            data_addr: Some(page(&mut rng)),
            bss_addr: Some(page(&mut rng)),
            eh_frame_addr: Some(page(&mut rng)),
            ..InstanceAddresses::default()
        }
    };
    let first_addresses = addresses();
    let second_addresses = addresses();

    let mut first = executable.load_instance(first_addresses).unwrap();
    let second = executable.load_instance(second_addresses).unwrap();
    assert!(Arc::ptr_eq(&first.code, &second.code));
    assert_eq!(first.bss, vec![0; 32]);
    assert_eq!(
        LittleEndian::read_u64(&first.eh_frame[8..16]),
        first_addresses.data_addr.unwrap() + 8
    );
    assert_eq!(
        LittleEndian::read_u64(&second.eh_frame[8..16]),
        second_addresses.data_addr.unwrap() + 8
    );

    first.data[0] = 42;
    first.bss[0] = 42;
    assert_eq!(second.data[0], 7);
    assert_eq!(second.bss[0], 0);
    assert_eq!(executable.bucket_bytes(Bucket::Data)[0], 7);
    assert_eq!(
        LittleEndian::read_u64(&executable.bucket_bytes(Bucket::EhFrame)[8..16]),
        0
    );
}

/// Rewrites entry `index` of `.rela.plt`
fn patch_plt_relocation(builder: &mut ElfBuilder, index: usize, offset: u64, r_type: u32) {
    let section = builder
        .sections
        .iter_mut()
        .find(|section| section.name == ".rela.plt")
        .unwrap();
    let entry = &mut section.data[index * 24..(index + 1) * 24];
    LittleEndian::write_u64(&mut entry[0..8], offset);
    LittleEndian::write_u32(&mut entry[8..12], r_type);
}

#[test]
fn test_bad_jump_slots() {
    // Reserved GOT slot
    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 0, 0x7000, R_X86_64_JUMP_SLOT);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::BadJumpSlot { offset: 0x7000 })
    ));

    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 1, 0x7008, R_X86_64_JUMP_SLOT);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::BadJumpSlot { offset: 0x7008 })
    ));

    // Straddles two slots
    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 0, 0x7014, R_X86_64_JUMP_SLOT);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::BadJumpSlot { offset: 0x7014 })
    ));

    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 0, 0x7010, R_X86_64_GLOB_DAT);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::BadJumpSlot { offset: 0x7010 })
    ));

    // Past the end of the GOT
    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 1, 0x7020, R_X86_64_JUMP_SLOT);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Relocation(RelocationError::OffsetOutOfBounds {
            offset: 0x7020,
            bucket: Bucket::Got,
            ..
        })
    ));

    // Slots may be bound in any order
    let mut builder = import_builder(&["memcpy", "abort"]);
    patch_plt_relocation(&mut builder, 0, 0x7018, R_X86_64_JUMP_SLOT);
    patch_plt_relocation(&mut builder, 1, 0x7010, R_X86_64_JUMP_SLOT);
    let executable = load(&builder).unwrap();
    assert_eq!(executable.relocation_tables()[0].entries[0].offset, 0x7018);
}

#[test]
fn test_dynamic_addresses_match_sections() {
    let mut builder = import_builder(&["memcpy"]);
    for entry in builder.dynamic.iter_mut() {
        if entry.0 == DT_PLTGOT {
            entry.1 = 0xDEAD_0000;
        }
    }
    match load(&builder).unwrap_err() {
        Error::Format(err) => assert_eq!(
            err,
            FormatError::DynamicAddressMismatch {
                section: ".got",
                declared: 0xDEAD_0000,
                actual: Some(0x7000)
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = import_builder(&["memcpy"]);
    for entry in builder.dynamic.iter_mut() {
        if entry.0 == DT_JMPREL {
            entry.1 = RELA_PLT_VADDR + 0x100;
        }
    }
    match load(&builder).unwrap_err() {
        Error::Format(err) => assert_eq!(
            err,
            FormatError::DynamicAddressMismatch {
                section: ".rela.plt",
                declared: RELA_PLT_VADDR + 0x100,
                actual: Some(RELA_PLT_VADDR)
            }
        ),
        err => panic!("unexpected error {:?}", err),
    }

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".got", 0x7000, 8, &[0; 16])
        .dynamic_entry(DT_PLTGOT, 0x7000)
        .dynamic_entry(DT_JMPREL, RELA_PLT_VADDR);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::DynamicAddressMismatch {
            section: ".rela.plt",
            actual: None,
            ..
        })
    ));

    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .rela(".rela.plt", RELA_PLT_VADDR, &[])
        .dynamic_entry(DT_PLTGOT, 0x7000)
        .dynamic_entry(DT_JMPREL, RELA_PLT_VADDR);
    assert!(matches!(
        load(&builder).unwrap_err(),
        Error::Format(FormatError::DynamicAddressMismatch {
            section: ".got",
            actual: None,
            ..
        })
    ));
}

#[test]
fn test_exported_symbols() {
    let mut builder = ElfBuilder::with_text(&[0xC3; 32]);
    builder.progbits(".rodata", 0x2000, 8, &[0; 8]);
    builder.symbol("entry", 0x1000, 1, STB_GLOBAL);
    builder.symbol("helper", 0x1010, 1, STB_GLOBAL);
    builder.symbol("local_helper", 0x1008, 1, STB_LOCAL);
    builder.symbol("weak_helper", 0x1018, 1, STB_WEAK);
    builder.symbol("memcpy", 0, SHN_UNDEF, STB_GLOBAL);
    builder.typed_symbol("table", 0x2000, 2, STB_GLOBAL, STT_OBJECT);
    let mut executable = load(&builder).unwrap();
    assert!(matches!(
        executable.exported_symbols().unwrap_err(),
        Error::Relocation(RelocationError::SharedNotLoaded)
    ));

    executable
        .load_shared(SharedAddresses {
            code_addr: Some(0x40_0000),
            rodata_addr: Some(0x50_0000),
        })
        .unwrap();
    let exports = executable.exported_symbols().unwrap();
    assert_eq!(
        exports.iter().collect::<Vec<_>>(),
        vec![("entry", 0x40_0000), ("helper", 0x40_0010)]
    );

    // Symbols of other executables stay, clashing addresses are rejected
    let mut registry = SymbolRegistry::default();
    registry.register_symbol("entry", 0x40_0000).unwrap();
    registry.register_symbol("puts", 0x7F00_0000).unwrap();
    executable.export_symbols(&mut registry).unwrap();
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.lookup_by_name("helper"), Some(0x40_0010));

    let mut registry = SymbolRegistry::default();
    registry.register_symbol("helper", 0x1234).unwrap();
    match executable.export_symbols(&mut registry).unwrap_err() {
        Error::Symbol(err) => assert_eq!(
            err,
            SymbolRegistryError::DuplicateSymbol("helper".to_string())
        ),
        err => panic!("unexpected error {:?}", err),
    }

    // Functions outside the shared code have no address common to all
    // instances
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder.progbits(".data", 0x3000, 8, &[0; 8]);
    builder.typed_symbol("callback", 0x3000, 2, STB_GLOBAL, STT_FUNC);
    let mut executable = load(&builder).unwrap();
    executable.load_shared(shared(0x40_0000)).unwrap();
    assert!(matches!(
        executable.exported_symbols().unwrap_err(),
        Error::Relocation(RelocationError::SharedReferencesInstance {
            bucket: Bucket::Data,
            ..
        })
    ));
}
