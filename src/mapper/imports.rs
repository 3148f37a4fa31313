//! Import resolution and address table patching.
//!
//! Each declared dependency is resolved through the module's activation
//! context, mapped (recursively, with a depth limit) if not already present,
//! and its exports are written into the importing image's slots at the image's
//! pointer width. Dependencies are mapped in declaration order and each is
//! mapped once per importing module, however many descriptors refer to it.
//!
//! Any failure releases the dependencies this module already pulled in, so a
//! half-resolved import table never outlives the mapping attempt.

use std::sync::Arc;

use crate::{
    image::ModuleImage,
    mapper::{activation, activation::ActivationContext, loader, MappingConfig},
    process::{ModuleRecord, ProcessSpace},
    Error::ImportResolution,
    Result,
};

/// Resolve every import descriptor and patch the module's slots.
///
/// Returns the dependency records this module now holds references on, in
/// first-seen order.
///
/// # Errors
/// Fails on an unresolvable dependency, a missing export, the dependency depth
/// limit, or any error mapping a dependency.
pub(crate) fn patch(
    space: &Arc<ProcessSpace>,
    image: &ModuleImage,
    base: u64,
    context: Option<&ActivationContext>,
    config: &MappingConfig,
    depth: usize,
) -> Result<Vec<Arc<ModuleRecord>>> {
    let mut deps: Vec<Arc<ModuleRecord>> = Vec::new();

    match patch_descriptors(space, image, base, context, config, depth, &mut deps) {
        Ok(()) => Ok(deps),
        Err(e) => {
            for dep in deps.iter().rev() {
                loader::release_dependency(space, dep);
            }
            Err(e)
        }
    }
}

fn patch_descriptors(
    space: &Arc<ProcessSpace>,
    image: &ModuleImage,
    base: u64,
    context: Option<&ActivationContext>,
    config: &MappingConfig,
    depth: usize,
    deps: &mut Vec<Arc<ModuleRecord>>,
) -> Result<()> {
    for descriptor in image.imports()? {
        let origin = activation::resolve_origin(
            context,
            space.store(),
            &descriptor.dependency,
            config.policy,
        )?;

        let dep = match deps.iter().find(|dep| dep.origin() == origin) {
            Some(existing) => existing.clone(),
            None => {
                let mapped = loader::map_dependency(
                    space,
                    &descriptor.dependency,
                    &origin,
                    config,
                    depth + 1,
                )?;
                deps.push(mapped.clone());
                mapped
            }
        };

        for binding in &descriptor.bindings {
            let address =
                dep.export_address(&binding.target)
                    .ok_or_else(|| ImportResolution {
                        dependency: descriptor.dependency.clone(),
                        symbol: binding.target.to_string(),
                    })?;

            let bytes = image.abi().pointer_bytes(address);
            space
                .memory()
                .write(base + u64::from(binding.slot_rva), &bytes)?;
        }
    }

    Ok(())
}
