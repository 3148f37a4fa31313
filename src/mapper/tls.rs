//! TLS slot assignment for a freshly mapped module.
//!
//! The initialization template is captured from mapped memory rather than the
//! image file, so relocations and import patches already applied to the
//! template region are part of every thread's initial block.

use std::sync::Arc;

use crate::{
    image::ModuleImage,
    process::{tls::TlsTemplate, ProcessSpace},
    Result,
};

/// What the TLS stage contributes to the module record.
pub(crate) struct TlsAssignment {
    pub slot: usize,
    pub callbacks: Vec<u64>,
}

/// Claim a slot for the module's TLS directory, if it has one.
///
/// # Errors
/// Fails when the slot table is exhausted or the template region falls outside
/// the mapped image.
pub(crate) fn initialize(
    space: &Arc<ProcessSpace>,
    image: &ModuleImage,
    base: u64,
) -> Result<Option<TlsAssignment>> {
    let Some(directory) = image.tls()? else {
        return Ok(None);
    };

    let data = space.memory().read(
        base + u64::from(directory.template_rva),
        directory.template_size as usize,
    )?;

    let slot = space.tls().allocate(TlsTemplate {
        data,
        zero_fill: directory.zero_fill as usize,
    })?;

    let callbacks = directory
        .callbacks
        .iter()
        .map(|rva| base + u64::from(*rva))
        .collect();

    Ok(Some(TlsAssignment { slot, callbacks }))
}
