//! Runtime exception dispatch registrations.
//!
//! Registrations mirror an inverted function table: each mapped module with an
//! exception directory contributes one entry holding its base address and the
//! absolute function ranges derived from the directory. Dispatch walks the
//! registrations and returns the unwind handler for the faulting address, or
//! nothing when the address belongs to no registered module.
//!
//! Entries are deregistered before the owning module's memory is freed, so a
//! lookup can never hand back a handler pointing into released memory.

use std::sync::Mutex;

use crate::{Error::ExceptionRegistration, Result};

/// A function range registered for a module, in absolute addresses.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredRange {
    /// First address of the routine
    pub begin: u64,
    /// One past the last address of the routine
    pub end: u64,
    /// Absolute address of the unwind handler
    pub unwind: u64,
}

struct FunctionTableRegistration {
    base: u64,
    span: u64,
    ranges: Vec<RegisteredRange>,
}

/// Process-wide table of per-module exception registrations.
pub struct DispatchTable {
    registrations: Mutex<Vec<FunctionTableRegistration>>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    /// Create an empty dispatch table.
    #[must_use]
    pub fn new() -> Self {
        DispatchTable {
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Register the function ranges of the module mapped at `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::ExceptionRegistration`] if the module already has
    /// a registration.
    pub fn register(&self, base: u64, span: u64, ranges: Vec<RegisteredRange>) -> Result<()> {
        let mut registrations = lock!(self.registrations);

        if registrations.iter().any(|entry| entry.base == base) {
            return Err(ExceptionRegistration(format!(
                "module at {base:#x} already registered"
            )));
        }

        registrations.push(FunctionTableRegistration { base, span, ranges });
        Ok(())
    }

    /// Remove the registration of the module mapped at `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::ExceptionRegistration`] if no registration exists,
    /// so teardown bookkeeping bugs surface instead of passing silently.
    pub fn deregister(&self, base: u64) -> Result<()> {
        let mut registrations = lock!(self.registrations);

        let index = registrations
            .iter()
            .position(|entry| entry.base == base)
            .ok_or_else(|| {
                ExceptionRegistration(format!("module at {base:#x} is not registered"))
            })?;

        registrations.remove(index);
        Ok(())
    }

    /// Find the unwind handler covering `address`, if any module registered one.
    #[must_use]
    pub fn dispatch(&self, address: u64) -> Option<u64> {
        let registrations = lock!(self.registrations);

        let entry = registrations
            .iter()
            .find(|entry| address >= entry.base && address < entry.base + entry.span)?;

        // Ranges are validated sorted and non-overlapping before registration
        entry
            .ranges
            .iter()
            .find(|range| address >= range.begin && address < range.end)
            .map(|range| range.unwind)
    }

    /// Base addresses with a live registration.
    #[must_use]
    pub fn registered_bases(&self) -> Vec<u64> {
        let registrations = lock!(self.registrations);
        registrations.iter().map(|entry| entry.base).collect()
    }
}
