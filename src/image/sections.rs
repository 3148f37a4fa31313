//! Section table entries.

use crate::{
    image::{format::SectionProtection, parser::Parser},
    Result,
};

/// One entry of the image's section table.
///
/// Describes where the section's raw bytes live in the file, where the section lands
/// in the mapped image, and which protection the loader applies once all writes to
/// the mapped range have completed. The virtual size may exceed the raw size; the
/// remainder is zero-filled by the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset of the section within the mapped image
    pub virtual_offset: u32,
    /// Extent of the section within the mapped image
    pub virtual_size: u32,
    /// Offset of the raw data within the image file
    pub raw_offset: u32,
    /// Length of the raw data within the image file
    pub raw_size: u32,
    /// Final protection of the mapped range
    pub protection: SectionProtection,
}

impl SectionHeader {
    /// Parse one section table entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on a truncated table or
    /// [`crate::Error::Malformed`] on undefined protection bits or a raw size
    /// exceeding the virtual size.
    pub fn parse(parser: &mut Parser) -> Result<SectionHeader> {
        let virtual_offset = parser.read_u32()?;
        let virtual_size = parser.read_u32()?;
        let raw_offset = parser.read_u32()?;
        let raw_size = parser.read_u32()?;
        let protection_bits = parser.read_u32()?;

        let Some(protection) = SectionProtection::from_bits(protection_bits) else {
            return Err(malformed_error!(
                "Undefined section protection bits {:#x}",
                protection_bits
            ));
        };

        if raw_size > virtual_size {
            return Err(malformed_error!(
                "Section raw size {:#x} exceeds virtual size {:#x}",
                raw_size,
                virtual_size
            ));
        }

        Ok(SectionHeader {
            virtual_offset,
            virtual_size,
            raw_offset,
            raw_size,
            protection,
        })
    }

    /// End of the section within the mapped image.
    #[must_use]
    pub fn virtual_end(&self) -> u64 {
        u64::from(self.virtual_offset) + u64::from(self.virtual_size)
    }

    /// Returns `true` if the RVA falls inside this section's mapped range.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_offset && u64::from(rva) < self.virtual_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(voff: u32, vsize: u32, roff: u32, rsize: u32, prot: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for value in [voff, vsize, roff, rsize, prot] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parse_roundtrip() {
        let bytes = raw_header(0x1000, 0x2000, 0x200, 0x180, 0b101);
        let section = SectionHeader::parse(&mut Parser::new(&bytes)).unwrap();

        assert_eq!(section.virtual_offset, 0x1000);
        assert_eq!(section.virtual_size, 0x2000);
        assert_eq!(section.raw_offset, 0x200);
        assert_eq!(section.raw_size, 0x180);
        assert_eq!(
            section.protection,
            SectionProtection::READ | SectionProtection::EXECUTE
        );
        assert_eq!(section.virtual_end(), 0x3000);
        assert!(section.contains_rva(0x1000));
        assert!(section.contains_rva(0x2FFF));
        assert!(!section.contains_rva(0x3000));
        assert!(!section.contains_rva(0xFFF));
    }

    #[test]
    fn rejects_bad_protection_bits() {
        let bytes = raw_header(0, 0x1000, 0, 0, 0xFF);
        assert!(SectionHeader::parse(&mut Parser::new(&bytes)).is_err());
    }

    #[test]
    fn rejects_raw_beyond_virtual() {
        let bytes = raw_header(0, 0x100, 0, 0x200, 0b011);
        assert!(SectionHeader::parse(&mut Parser::new(&bytes)).is_err());
    }
}
