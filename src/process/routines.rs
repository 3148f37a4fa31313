//! Routine registration and dispatch.
//!
//! Mapped code is modeled rather than executed natively: the bytes at an entry
//! point or callback address hold a little-endian `u32` token, and the token is
//! resolved through a process-wide table to a host closure. An instruction fetch
//! through [`crate::process::memory::VirtualMemory::read_code_u32`] still goes
//! through page protection checks, so calling into a non-executable page faults
//! exactly like a real indirect call would.
//!
//! Closures receive a [`RoutineFrame`] describing the module and notification
//! being delivered, plus enough of the process surface to touch thread-local
//! storage and per-module markers. No engine lock is held while a closure runs.

use std::sync::Arc;

use dashmap::DashMap;
use strum::{Display, FromRepr};

use crate::{
    process::{ModuleRecord, ProcessSpace},
    Result,
};

/// First token value handed out; zero stays invalid so uninitialized code faults.
const TOKEN_FLOOR: u32 = 0x1000;

/// Why a module's entry point or callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u32)]
pub enum NotificationReason {
    /// The module is being removed from the process.
    ProcessDetach = 0,
    /// The module has just been mapped and initialized.
    ProcessAttach = 1,
    /// A new thread is starting.
    ThreadAttach = 2,
    /// A thread is exiting.
    ThreadDetach = 3,
}

/// Opaque handle identifying a registered routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutineToken(pub u32);

impl RoutineToken {
    /// Little-endian encoding placed in image code bytes at the routine's address.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Host closure standing in for a routine inside a mapped module.
pub type Routine = Arc<dyn Fn(&RoutineFrame) -> u32 + Send + Sync>;

/// Per-process table mapping tokens to routines.
pub struct RoutineTable {
    routines: DashMap<u32, Routine>,
    next: std::sync::atomic::AtomicU32,
}

impl Default for RoutineTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutineTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        RoutineTable {
            routines: DashMap::new(),
            next: std::sync::atomic::AtomicU32::new(TOKEN_FLOOR),
        }
    }

    /// Register a routine and return its token.
    pub fn register(&self, routine: Routine) -> RoutineToken {
        let token = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.routines.insert(token, routine);
        RoutineToken(token)
    }

    /// Look up the routine behind a token fetched from mapped code.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] for unknown tokens, treating the
    /// stale bytes as a jump into unmapped code.
    pub fn resolve(&self, token: u32) -> Result<Routine> {
        self.routines
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or(crate::Error::AccessViolation {
                address: u64::from(token),
            })
    }
}

/// The context a routine observes while it runs.
pub struct RoutineFrame<'a> {
    space: &'a Arc<ProcessSpace>,
    module: &'a Arc<ModuleRecord>,
    reason: NotificationReason,
}

impl<'a> RoutineFrame<'a> {
    pub(crate) fn new(
        space: &'a Arc<ProcessSpace>,
        module: &'a Arc<ModuleRecord>,
        reason: NotificationReason,
    ) -> Self {
        RoutineFrame {
            space,
            module,
            reason,
        }
    }

    /// The notification being delivered.
    #[must_use]
    pub fn reason(&self) -> NotificationReason {
        self.reason
    }

    /// The module the routine belongs to.
    #[must_use]
    pub fn module(&self) -> &Arc<ModuleRecord> {
        self.module
    }

    /// The process the module is mapped into.
    #[must_use]
    pub fn space(&self) -> &Arc<ProcessSpace> {
        self.space
    }

    /// Read a `u32` from this module's thread-local block on the calling thread.
    ///
    /// # Errors
    /// Fails if the module carries no thread-local storage or the offset is out
    /// of range.
    pub fn tls_read_u32(&self, offset: usize) -> Result<u32> {
        let slot = self.module.tls_slot().ok_or(crate::Error::TlsMissing)?;
        self.space.tls().read_u32(slot, offset)
    }

    /// Write a `u32` into this module's thread-local block on the calling thread.
    ///
    /// # Errors
    /// Fails if the module carries no thread-local storage or the offset is out
    /// of range.
    pub fn tls_write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let slot = self.module.tls_slot().ok_or(crate::Error::TlsMissing)?;
        self.space.tls().write_u32(slot, offset, value)
    }

    /// Record an observation under `key` in the module's marker table.
    pub fn set_marker(&self, key: &str, value: u64) {
        self.module.set_marker(key, value);
    }

    /// Read back a previously recorded marker.
    #[must_use]
    pub fn marker(&self, key: &str) -> Option<u64> {
        self.module.marker(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_discriminants() {
        assert_eq!(NotificationReason::ProcessDetach as u32, 0);
        assert_eq!(NotificationReason::ProcessAttach as u32, 1);
        assert_eq!(NotificationReason::ThreadAttach as u32, 2);
        assert_eq!(NotificationReason::ThreadDetach as u32, 3);

        assert_eq!(
            NotificationReason::from_repr(1),
            Some(NotificationReason::ProcessAttach)
        );
        assert_eq!(NotificationReason::from_repr(4), None);
    }

    #[test]
    fn tokens_are_unique_and_resolvable() {
        let table = RoutineTable::new();
        let first = table.register(Arc::new(|_| 1));
        let second = table.register(Arc::new(|_| 2));

        assert_ne!(first, second);
        assert!(first.0 >= TOKEN_FLOOR);
        assert!(table.resolve(first.0).is_ok());
        assert!(table.resolve(0).is_err());
    }
}
