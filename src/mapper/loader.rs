//! The mapping pipeline.
//!
//! [`map_image`] drives every stage in order: allocate, copy, relocate,
//! resolve the activation context, patch imports, apply final protections,
//! assign TLS, register the exception directory, publish the module record,
//! and deliver the attach notification. Every stage's effect is recorded in a
//! transaction, and any failure rolls the committed effects back in reverse,
//! so a failed mapping leaves the process exactly as it found it.
//!
//! Mapping an origin that is already resident does none of this; the existing
//! record's reference count is bumped and handed back.

use std::sync::Arc;

use crate::{
    image::{format::SectionProtection, ModuleImage},
    mapper::{activation::ActivationContext, entry, exceptions, imports, relocate, tls,
             MappingConfig, MappingFlags},
    process::{ModuleInit, ModuleRecord, ProcessSpace},
    Error::RecursionLimit,
    Result,
};

/// Transitive dependency chains deeper than this abort the mapping. Cyclic
/// import graphs also terminate here, since a module is published only after
/// its own imports resolve.
pub(crate) const MAX_DEPENDENCY_DEPTH: usize = 16;

const RW: SectionProtection = SectionProtection::READ.union(SectionProtection::WRITE);

struct Transaction {
    space: Arc<ProcessSpace>,
    base: u64,
    tls_slot: Option<usize>,
    exceptions_registered: bool,
    deps: Vec<Arc<ModuleRecord>>,
    registered: Option<Arc<ModuleRecord>>,
}

impl Transaction {
    fn rollback(self) {
        if let Some(record) = &self.registered {
            record.update_state(|state| state.torn_down = true);
            self.space.remove_module(self.base);
        }

        if self.exceptions_registered {
            let _ = self.space.exceptions().deregister(self.base);
        }

        if let Some(slot) = self.tls_slot {
            let _ = self.space.tls().release(slot);
        }

        for dep in self.deps.iter().rev() {
            release_dependency(&self.space, dep);
        }

        let _ = self.space.memory().free(self.base);
    }
}

/// Map image bytes into the process and run the module's initialization.
pub(crate) fn map_image(
    space: &Arc<ProcessSpace>,
    name: &str,
    origin: &str,
    bytes: Vec<u8>,
    config: &MappingConfig,
    depth: usize,
    dependency: bool,
) -> Result<Arc<ModuleRecord>> {
    if depth > MAX_DEPENDENCY_DEPTH {
        return Err(RecursionLimit(MAX_DEPENDENCY_DEPTH));
    }

    if let Some(existing) = space.find_module(origin) {
        existing.add_ref();
        return Ok(existing);
    }

    let image = ModuleImage::from_mem(bytes)?;
    let base = space
        .memory()
        .allocate(u64::from(image.size_of_image()), RW)?;

    let mut txn = Transaction {
        space: space.clone(),
        base,
        tls_slot: None,
        exceptions_registered: false,
        deps: Vec::new(),
        registered: None,
    };

    match run_stages(space, &image, name, origin, config, depth, dependency, &mut txn) {
        Ok(record) => Ok(record),
        Err(e) => {
            txn.rollback();
            Err(e)
        }
    }
}

/// Map a dependency by store origin, reusing it if already resident.
pub(crate) fn map_dependency(
    space: &Arc<ProcessSpace>,
    name: &str,
    origin: &str,
    config: &MappingConfig,
    depth: usize,
) -> Result<Arc<ModuleRecord>> {
    if let Some(existing) = space.find_module(origin) {
        existing.add_ref();
        return Ok(existing);
    }

    let bytes = space.store().fetch(origin)?;
    map_image(space, name, origin, bytes.as_ref().clone(), config, depth, true)
}

/// Drop one reference on a dependency, tearing it down at zero.
pub(crate) fn release_dependency(space: &Arc<ProcessSpace>, dep: &Arc<ModuleRecord>) {
    if dep.release_ref() == 0 {
        let _ = unmap_record(space, dep);
    }
}

/// Drop the caller's reference on a module, tearing it down at zero.
///
/// Unmapping a record that is already torn down is a no-op.
///
/// # Errors
/// Propagates the first teardown error; the remaining steps still run.
pub(crate) fn unmap_module(space: &Arc<ProcessSpace>, record: &Arc<ModuleRecord>) -> Result<()> {
    if record.runtime_state().torn_down {
        return Ok(());
    }

    if record.release_ref() > 0 {
        return Ok(());
    }

    unmap_record(space, record)
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    space: &Arc<ProcessSpace>,
    image: &ModuleImage,
    name: &str,
    origin: &str,
    config: &MappingConfig,
    depth: usize,
    dependency: bool,
    txn: &mut Transaction,
) -> Result<Arc<ModuleRecord>> {
    let base = txn.base;
    let discard_headers = config.flags.contains(MappingFlags::DISCARD_HEADERS);

    if !discard_headers {
        space
            .memory()
            .write(base, &image.data()[..image.size_of_headers() as usize])?;
    }

    for section in image.sections() {
        let raw = &image.data()
            [section.raw_offset as usize..(section.raw_offset + section.raw_size) as usize];
        space
            .memory()
            .write(base + u64::from(section.virtual_offset), raw)?;
    }

    relocate::apply(space.memory(), image, base)?;

    let context = match image.manifest()? {
        Some(xml) => Some(ActivationContext::parse(xml, image.abi())?),
        None => None,
    };

    txn.deps = imports::patch(space, image, base, context.as_ref(), config, depth)?;

    // Protections go on only after every write into the image is done
    let header_protection = if discard_headers {
        SectionProtection::empty()
    } else {
        SectionProtection::READ
    };
    space
        .memory()
        .protect(base, u64::from(image.size_of_headers()), header_protection)?;

    for section in image.sections() {
        space.memory().protect(
            base + u64::from(section.virtual_offset),
            u64::from(section.virtual_size),
            section.protection,
        )?;
    }

    let assignment = tls::initialize(space, image, base)?;
    let (tls_slot, tls_callbacks) = match assignment {
        Some(assignment) => {
            txn.tls_slot = Some(assignment.slot);
            (Some(assignment.slot), assignment.callbacks)
        }
        None => (None, Vec::new()),
    };

    txn.exceptions_registered = exceptions::register(space, image, base)?;

    let record = ModuleRecord::new(ModuleInit {
        name: name.to_string(),
        origin: origin.to_string(),
        base,
        span: u64::from(image.size_of_image()),
        abi: image.abi(),
        entry_point: image.entry_point().map(|rva| base + u64::from(rva)),
        tls_slot,
        tls_callbacks,
        exports: image.exports()?,
        dependency,
        routines_enabled: !config.flags.contains(MappingFlags::SKIP_INIT_ROUTINES),
        deps: txn.deps.clone(),
    });

    space.register_module(record.clone());
    txn.registered = Some(record.clone());

    entry::attach(space, &record)?;
    Ok(record)
}

/// Tear a module down unconditionally: detach, TLS release, exception
/// deregistration, dependency release, registry removal, memory free.
///
/// Teardown is best-effort; every step runs and the first error is reported.
pub(crate) fn unmap_record(space: &Arc<ProcessSpace>, record: &Arc<ModuleRecord>) -> Result<()> {
    let mut already = false;
    record.update_state(|state| {
        if state.torn_down {
            already = true;
        } else {
            state.torn_down = true;
        }
    });
    if already {
        return Ok(());
    }

    let mut first_error = None;
    let mut note = |result: Result<()>| {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    };

    let state = record.runtime_state();
    if record.routines_enabled() && state.attached && !state.detached {
        note(entry::detach(space, record));
    }

    if let Some(slot) = record.tls_slot() {
        note(space.tls().release(slot));
    }

    if space
        .exceptions()
        .registered_bases()
        .contains(&record.base())
    {
        note(space.exceptions().deregister(record.base()));
    }

    for dep in record.deps().iter().rev() {
        release_dependency(space, dep);
    }

    space.remove_module(record.base());
    note(space.memory().free(record.base()));

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
