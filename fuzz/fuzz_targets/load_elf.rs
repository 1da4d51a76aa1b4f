#![no_main]

use libfuzzer_sys::fuzz_target;

use altos_code::{
    elf::{ExecutableCode, InstanceAddresses, SharedAddresses},
    elf_parser::consts::R_X86_64_RELATIVE,
    program::Loader,
};
use std::sync::Arc;
use test_utils::{ElfBuilder, Rela};

#[derive(arbitrary::Arbitrary, Debug)]
struct FuzzData {
    /// Patches applied to a well formed image
    patches: Vec<(u16, u8)>,
    /// Image used as is when `patches` is empty
    raw: Vec<u8>,
    shared: SharedAddresses,
    instance: InstanceAddresses,
}

fn seed_image() -> Vec<u8> {
    let mut builder = ElfBuilder::with_text(&[0xC3; 32]);
    builder
        .progbits(".rodata", 0x2000, 8, &[0x11; 24])
        .progbits(".data", 0x3000, 8, &[0x22; 16])
        .nobits(".bss", 0x4000, 16, 64)
        .progbits(".eh_frame", 0x5000, 8, &[0; 16])
        .rela(
            ".rela.text",
            0,
            &[Rela {
                offset: 0x1008,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0x2008,
            }],
        )
        .rela(
            ".rela.eh_frame",
            0,
            &[Rela {
                offset: 0x5000,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0x3000,
            }],
        )
        .plt_got(0x6000, 0x7000, &["memcpy"]);
    builder.build()
}

fuzz_target!(|data: FuzzData| {
    let image = if data.patches.is_empty() {
        data.raw
    } else {
        let mut image = seed_image();
        let len = image.len();
        for (offset, value) in data.patches {
            image[offset as usize % len] = value;
        }
        image
    };
    let mut loader = Loader::default();
    loader.register_symbol("memcpy", 0x7F00_0000).unwrap();
    let mut executable = match ExecutableCode::load(&image, Arc::new(loader)) {
        Ok(executable) => executable,
        Err(_) => return,
    };
    assert_eq!(
        executable.size(),
        executable.shared_size().saturating_add(executable.unshared_size())
    );
    if executable.load_shared(data.shared).is_err() || executable.unshared_size() > 1 << 24 {
        return;
    }
    let _ = executable.exported_symbols();
    if let Ok(instance) = executable.load_instance(data.instance) {
        assert_eq!(instance.data.len() as u64, executable.section_info().data.size);
        assert_eq!(instance.bss.len() as u64, executable.section_info().bss.size);
    }
});
