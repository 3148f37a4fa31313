//! Manifest-driven side-by-side dependency redirection.

mod common;

use common::{RW, RX};
use lodestone::{mapper::activation::ActivationContext, prelude::*};

const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <dependency>
    <dependentAssembly>
      <assemblyIdentity type="win32" name="dep" version="2.0.0.0"
                        processorArchitecture="*" publicKeyToken="6595b64144ccf1df" language="*"/>
    </dependentAssembly>
  </dependency>
</assembly>"#;

fn redirected_origin() -> String {
    let context = ActivationContext::parse(MANIFEST.as_bytes(), PlatformAbi::Width64).unwrap();
    format!("{}/dep.lmd", context.identities()[0].store_directory())
}

fn dep_image() -> Vec<u8> {
    ImageBuilder::new(PlatformAbi::Width64)
        .section(0x1000, vec![0u8; 0x40], RX)
        .export("greet", 1, 0x1010)
        .build()
        .unwrap()
}

fn probe_image() -> Vec<u8> {
    ImageBuilder::new(PlatformAbi::Width64)
        .section(0x1000, vec![0u8; 0x40], RW)
        .import(
            "dep.lmd",
            vec![(ImportTarget::Name("greet".to_string()), 0x1000)],
        )
        .manifest(MANIFEST)
        .build()
        .unwrap()
}

#[test]
fn side_by_side_maps_the_redirected_image() {
    let space = ProcessSpace::new();
    let origin = redirected_origin();
    space.store().publish(&origin, dep_image());
    // A decoy under the plain name must not be picked up
    space.store().publish("dep.lmd", dep_image());

    let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", probe_image())
        .map_and_initialize()
        .unwrap();

    let origins = space.module_origins();
    assert!(origins.contains(&origin));
    assert!(!origins.contains(&"dep.lmd".to_string()));

    mapped.unmap().unwrap();
    assert_eq!(space.module_count(), 0);
}

#[test]
fn missing_redirect_is_an_error_not_a_fallback() {
    let space = ProcessSpace::new();
    // Only the plain name is published; the declared redirect stays authoritative
    space.store().publish("dep.lmd", dep_image());

    let result = ModuleMapper::new_from_mem(&space, "probe.lmd", probe_image()).map_and_initialize();
    assert!(matches!(
        result,
        Err(lodestone::Error::DependencyNotFound { .. })
    ));
    assert_eq!(space.module_count(), 0);
}

#[test]
fn private_policy_ignores_the_manifest() {
    let space = ProcessSpace::new();
    space.store().publish("dep.lmd", dep_image());

    let config = MappingConfig {
        policy: SxsPolicy::Private,
        ..MappingConfig::default()
    };
    let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", probe_image())
        .with_config(config)
        .map_and_initialize()
        .unwrap();

    assert!(space.module_origins().contains(&"dep.lmd".to_string()));
    mapped.unmap().unwrap();
}

#[test]
fn resolution_is_deterministic_across_processes() {
    let origin = redirected_origin();

    for _ in 0..2 {
        let space = ProcessSpace::new();
        space.store().publish(&origin, dep_image());

        let mapped = ModuleMapper::new_from_mem(&space, "probe.lmd", probe_image())
            .map_and_initialize()
            .unwrap();
        assert!(space.module_origins().contains(&origin));
        mapped.unmap().unwrap();
    }
}
