//! Base relocation directory.
//!
//! The directory is a flat list of `(rva, kind)` entries in file order. The applier
//! rewrites each target exactly once with the delta between the actual and the
//! preferred base; unknown kinds are rejected at parse time so a corrupted table can
//! never be half-applied.

use crate::{
    image::parser::Parser,
    Error::Relocation,
    Result,
};

/// The rewrite width and placement of one relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u16)]
pub enum RelocationKind {
    /// Padding entry, applied as a no-op
    Absolute = 0,
    /// Full 32-bit address rewrite
    Full32 = 1,
    /// Full 64-bit address rewrite
    Full64 = 2,
    /// Upper 16 bits of a 32-bit address
    High16 = 3,
    /// Lower 16 bits of a 32-bit address
    Low16 = 4,
}

/// One entry of the relocation directory.
///
/// Applying an entry more than once would corrupt the target, so the applier walks
/// the directory exactly once, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// RVA of the value to rewrite
    pub rva: u32,
    /// How to rewrite it
    pub kind: RelocationKind,
}

/// Parse the relocation directory payload.
///
/// # Errors
/// Returns [`crate::Error::Relocation`] naming the kind and offset of the first
/// undefined relocation kind, or [`crate::Error::OutOfBounds`] on truncation.
pub fn parse_relocations(data: &[u8]) -> Result<Vec<RelocationEntry>> {
    let mut parser = Parser::new(data);
    let count = parser.read_u32()? as usize;

    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        let rva = parser.read_u32()?;
        let raw_kind = parser.read_u16()?;
        parser.read_u16()?; // padding

        let Some(kind) = RelocationKind::from_repr(raw_kind) else {
            return Err(Relocation {
                kind: raw_kind,
                offset: rva,
            });
        };

        entries.push(RelocationEntry { rva, kind });
    }

    Ok(entries)
}
