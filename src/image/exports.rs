//! Export directory.
//!
//! The engine never constructs export tables; it consumes the ones dependency images
//! already carry, to resolve import bindings against them.

use crate::{
    image::{imports::ImportTarget, parser::Parser},
    Result,
};

/// One exported routine of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedRoutine {
    /// Export name
    pub name: String,
    /// Export ordinal
    pub ordinal: u32,
    /// RVA of the routine within the exporting image
    pub rva: u32,
}

/// The parsed export directory of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportDirectory {
    entries: Vec<ExportedRoutine>,
}

impl ExportDirectory {
    /// Parse the export directory payload.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation or
    /// [`crate::Error::Malformed`] on an invalid name encoding.
    pub fn parse(data: &[u8]) -> Result<ExportDirectory> {
        let mut parser = Parser::new(data);
        let count = parser.read_u32()? as usize;

        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let name = parser.read_prefixed_str()?;
            let ordinal = parser.read_u32()?;
            let rva = parser.read_u32()?;
            entries.push(ExportedRoutine { name, ordinal, rva });
        }

        Ok(ExportDirectory { entries })
    }

    /// Look up an export by import target, returning its RVA.
    #[must_use]
    pub fn find(&self, target: &ImportTarget) -> Option<u32> {
        self.entries
            .iter()
            .find(|entry| match target {
                ImportTarget::Name(name) => entry.name == *name,
                ImportTarget::Ordinal(ordinal) => entry.ordinal == *ordinal,
            })
            .map(|entry| entry.rva)
    }

    /// All exported routines, in file order.
    #[must_use]
    pub fn entries(&self) -> &[ExportedRoutine] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> ExportDirectory {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        for (name, ordinal, rva) in [("alloc", 1u32, 0x1000u32), ("free", 2, 0x1040)] {
            bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(&ordinal.to_le_bytes());
            bytes.extend_from_slice(&rva.to_le_bytes());
        }
        ExportDirectory::parse(&bytes).unwrap()
    }

    #[test]
    fn lookup_by_name_and_ordinal() {
        let exports = directory();

        assert_eq!(
            exports.find(&ImportTarget::Name("alloc".to_string())),
            Some(0x1000)
        );
        assert_eq!(exports.find(&ImportTarget::Ordinal(2)), Some(0x1040));
        assert_eq!(exports.find(&ImportTarget::Name("gone".to_string())), None);
        assert_eq!(exports.find(&ImportTarget::Ordinal(3)), None);
    }
}
