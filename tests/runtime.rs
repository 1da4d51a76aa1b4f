use altos_code::{
    elf::{Bucket, ExecutableCode, InstanceAddresses, SharedAddresses},
    elf_parser::consts::R_X86_64_RELATIVE,
    error::{Error, RelocationError},
    program::Loader,
    runtime::InstanceSupervisor,
};
use byteorder::{ByteOrder, LittleEndian};
use rand::Rng;
use std::sync::Arc;
use test_utils::{ElfBuilder, Rela};

fn template() -> ExecutableCode {
    let mut builder = ElfBuilder::with_text(&[0xC3; 16]);
    builder
        .progbits(".data", 0x3000, 8, &[1; 8])
        .progbits(".eh_frame", 0x5000, 8, &[0; 8])
        .rela(
            ".rela.eh_frame",
            0,
            &[Rela {
                offset: 0x5000,
                r_type: R_X86_64_RELATIVE,
                sym: 0,
                addend: 0x3004,
            }],
        );
    ExecutableCode::load(&builder.build(), Arc::new(Loader::default())).unwrap()
}

fn instance_addresses(data_addr: u64) -> InstanceAddresses {
    InstanceAddresses {
        data_addr: Some(data_addr),
        eh_frame_addr: Some(data_addr + 0x1000),
        ..InstanceAddresses::default()
    }
}

fn shared_addresses() -> SharedAddresses {
    SharedAddresses {
        code_addr: Some(0x40_0000),
        rodata_addr: None,
    }
}

#[test]
fn test_supervisor() {
    let mut supervisor = InstanceSupervisor::new(template(), shared_addresses()).unwrap();
    assert!(supervisor.is_empty());
    assert!(supervisor.template().is_shared_loaded());

    let mut rng = rand::thread_rng();
    let mut ids = Vec::new();
    for _ in 0..8 {
        let data_addr = rng.gen_range(0x100u64..0x10_0000) << 12;
        let id = supervisor.spawn(instance_addresses(data_addr)).unwrap();
        let instance = supervisor.get(id).unwrap();
        assert_eq!(
            LittleEndian::read_u64(&instance.eh_frame[..8]),
            data_addr + 4
        );
        ids.push(id);
    }
    assert_eq!(supervisor.len(), 8);
    ids.dedup();
    assert_eq!(ids.len(), 8);

    let terminated = supervisor.terminate(ids[3]).unwrap();
    assert_eq!(terminated.data, vec![1; 8]);
    assert!(supervisor.get(ids[3]).is_none());
    assert!(supervisor.terminate(ids[3]).is_none());
    assert_eq!(supervisor.len(), 7);
    assert_eq!(supervisor.iter().count(), 7);

    let id = supervisor.spawn(instance_addresses(0x10_0000)).unwrap();
    assert!(!ids.contains(&id));
}

#[test]
fn test_supervisor_errors() {
    let err = InstanceSupervisor::new(template(), SharedAddresses::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::Relocation(RelocationError::MissingAddress(Bucket::Code))
    ));

    let mut supervisor = InstanceSupervisor::new(template(), shared_addresses()).unwrap();
    let err = supervisor
        .spawn(InstanceAddresses {
            data_addr: Some(0x10_0000),
            ..InstanceAddresses::default()
        })
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Relocation(RelocationError::MissingAddress(Bucket::EhFrame))
    ));
    assert!(supervisor.is_empty());
}

#[test]
fn test_concurrent_instances() {
    let supervisor = InstanceSupervisor::new(template(), shared_addresses()).unwrap();
    let handles = (0..4u64)
        .map(|index| {
            let template = supervisor.template().clone();
            std::thread::spawn(move || {
                let data_addr = 0x100_0000 * (index + 1);
                let instance = template
                    .load_instance(instance_addresses(data_addr))
                    .unwrap();
                (data_addr, instance)
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        let (data_addr, instance) = handle.join().unwrap();
        assert_eq!(
            LittleEndian::read_u64(&instance.eh_frame[..8]),
            data_addr + 4
        );
        assert!(Arc::ptr_eq(
            &instance.code,
            &supervisor.template().load_instance(instance_addresses(0x1000)).unwrap().code
        ));
    }
}

#[cfg(feature = "shuttle-test")]
#[test]
fn test_concurrent_instances_model_check() {
    shuttle::check_random(
        || {
            let supervisor = InstanceSupervisor::new(template(), shared_addresses()).unwrap();
            let handles = (0..2u64)
                .map(|index| {
                    let template = supervisor.template().clone();
                    shuttle::thread::spawn(move || {
                        template
                            .load_instance(instance_addresses(0x100_0000 * (index + 1)))
                            .unwrap()
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                let instance = handle.join().unwrap();
                assert_eq!(instance.data, vec![1; 8]);
            }
        },
        100,
    );
}
