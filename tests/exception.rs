//! Exception directory registration, dispatch, and panic containment.

mod common;

use common::{code_section, register, RX};
use lodestone::prelude::*;

#[test]
fn dispatch_resolves_registered_ranges() {
    let space = ProcessSpace::new();

    let bytes = ImageBuilder::new(PlatformAbi::Width64)
        .section(0x1000, vec![0u8; 0x200], RX)
        .exception(0x1000, 0x1080, 0x1100)
        .exception(0x1080, 0x1100, 0x1110)
        .build()
        .unwrap();

    let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", bytes)
        .map_and_initialize()
        .unwrap();
    let base = mapped.base();

    assert_eq!(space.dispatch_exception(base + 0x1040), Some(base + 0x1100));
    assert_eq!(space.dispatch_exception(base + 0x1080), Some(base + 0x1110));
    // Inside the image, outside every function range
    assert_eq!(space.dispatch_exception(base + 0x1180), None);

    mapped.unmap().unwrap();
    // Deregistration happened before the memory went away
    assert_eq!(space.dispatch_exception(base + 0x1040), None);
}

#[test]
fn routine_catching_its_own_panic_succeeds() {
    let space = ProcessSpace::new();

    let entry = register(&space, |frame| {
        let caught = std::panic::catch_unwind(|| panic!("handled internally")).is_err();
        frame.set_marker("caught", u64::from(caught));
        1
    });

    let bytes = ImageBuilder::new(PlatformAbi::Width64)
        .entry_point(0x1000)
        .section(0x1000, code_section(0x20, &[(0, entry)]), RX)
        .build()
        .unwrap();

    let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", bytes)
        .map_and_initialize()
        .unwrap();

    assert_eq!(mapped.record().marker("caught"), Some(1));
    mapped.unmap().unwrap();
}

#[test]
fn escaped_panic_is_contained_and_the_process_stays_usable() {
    let space = ProcessSpace::new();

    let panicking = register(&space, |_| panic!("escaped"));
    let bad = ImageBuilder::new(PlatformAbi::Width64)
        .entry_point(0x1000)
        .section(0x1000, code_section(0x20, &[(0, panicking)]), RX)
        .build()
        .unwrap();

    let result = ModuleMapper::new_from_mem(&space, "bad.lmd", bad).map_and_initialize();
    assert!(matches!(
        result,
        Err(lodestone::Error::EntryPointPanic {
            reason: NotificationReason::ProcessAttach
        })
    ));
    assert_eq!(space.module_count(), 0);

    // The same process maps a well-behaved module afterwards
    let good_entry = register(&space, |_| 1);
    let good = ImageBuilder::new(PlatformAbi::Width64)
        .entry_point(0x1000)
        .section(0x1000, code_section(0x20, &[(0, good_entry)]), RX)
        .build()
        .unwrap();

    let mapped = ModuleMapper::new_from_mem(&space, "good.lmd", good)
        .map_and_initialize()
        .unwrap();
    assert!(mapped.record().runtime_state().attached);
    mapped.unmap().unwrap();
}

#[test]
fn invalid_exception_directory_aborts_the_mapping() {
    let space = ProcessSpace::new();

    // Overlapping ranges fail validation before anything is registered
    let bytes = ImageBuilder::new(PlatformAbi::Width64)
        .section(0x1000, vec![0u8; 0x200], RX)
        .exception(0x1000, 0x1100, 0x1180)
        .exception(0x1080, 0x1180, 0x1190)
        .build()
        .unwrap();

    let result = ModuleMapper::new_from_mem(&space, "probe.lmd", bytes).map_and_initialize();
    assert!(matches!(
        result,
        Err(lodestone::Error::ExceptionRegistration(_))
    ));
    assert_eq!(space.module_count(), 0);
    assert!(space.exceptions().registered_bases().is_empty());
}
