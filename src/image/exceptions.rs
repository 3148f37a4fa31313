//! Exception / unwind function table.
//!
//! An ascending, non-overlapping sequence of `(begin, end, unwind)` triples relative
//! to the module base. The dispatch mechanism relies on ordered lookup, so the
//! registrar rejects a table that violates the ordering invariant before it ever
//! reaches the process-wide registration list.

use crate::{image::parser::Parser, Error::ExceptionRegistration, Result};

/// One function table entry: a half-open code range and its unwind metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    /// Start of the covered code range (inclusive), relative to the module base
    pub begin_rva: u32,
    /// End of the covered code range (exclusive)
    pub end_rva: u32,
    /// RVA of the unwind metadata for the range
    pub unwind_rva: u32,
}

/// The parsed exception directory of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDirectory {
    entries: Vec<FunctionEntry>,
}

impl ExceptionDirectory {
    /// Parse the exception directory payload. Structural only; ordering is checked
    /// by [`ExceptionDirectory::validate`] at registration time.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation.
    pub fn parse(data: &[u8]) -> Result<ExceptionDirectory> {
        let mut parser = Parser::new(data);
        let count = parser.read_u32()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(FunctionEntry {
                begin_rva: parser.read_u32()?,
                end_rva: parser.read_u32()?,
                unwind_rva: parser.read_u32()?,
            });
        }

        Ok(ExceptionDirectory { entries })
    }

    /// Check the ordering invariant: every range non-empty, entries ascending and
    /// non-overlapping.
    ///
    /// # Errors
    /// Returns [`crate::Error::ExceptionRegistration`] naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        let mut previous_end = 0u32;

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.begin_rva >= entry.end_rva {
                return Err(ExceptionRegistration(format!(
                    "entry {index} has an empty range {:#x}..{:#x}",
                    entry.begin_rva, entry.end_rva
                )));
            }

            if entry.begin_rva < previous_end {
                return Err(ExceptionRegistration(format!(
                    "entry {index} at {:#x} overlaps or precedes the entry ending at {:#x}",
                    entry.begin_rva, previous_end
                )));
            }

            previous_end = entry.end_rva;
        }

        Ok(())
    }

    /// The function table entries, in file order.
    #[must_use]
    pub fn entries(&self) -> &[FunctionEntry] {
        &self.entries
    }
}
