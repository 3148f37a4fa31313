//! Lifecycle notification delivery for mapping and teardown.
//!
//! Thread notifications are delivered by the process itself when threads come
//! and go; this module owns the two process-scoped notifications. On attach a
//! zero entry routine result is a refusal: the caller unmaps the module, so
//! from the outside it is indistinguishable from a mapping failure. On detach
//! a zero result is reported, but teardown continues regardless.

use std::sync::Arc;

use crate::{
    process::{routines::NotificationReason, ModuleRecord, ProcessSpace},
    Error::EntryPointFailure,
    Result,
};

/// Deliver the process attach notification.
///
/// # Errors
/// Fails on a fault, an escaped panic, or a zero entry routine result.
pub(crate) fn attach(space: &Arc<ProcessSpace>, record: &Arc<ModuleRecord>) -> Result<()> {
    let result = space.notify_module(record, NotificationReason::ProcessAttach)?;

    if result == Some(0) {
        return Err(EntryPointFailure {
            reason: NotificationReason::ProcessAttach,
        });
    }

    record.update_state(|state| state.attached = true);
    Ok(())
}

/// Deliver the process detach notification.
///
/// The detached flag is set whether or not the routine cooperated, so teardown
/// never delivers it twice.
///
/// # Errors
/// Fails on a fault, an escaped panic, or a zero entry routine result.
pub(crate) fn detach(space: &Arc<ProcessSpace>, record: &Arc<ModuleRecord>) -> Result<()> {
    let result = space.notify_module(record, NotificationReason::ProcessDetach);
    record.update_state(|state| state.detached = true);

    if result? == Some(0) {
        return Err(EntryPointFailure {
            reason: NotificationReason::ProcessDetach,
        });
    }

    Ok(())
}
