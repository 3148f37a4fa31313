//! Wire-format constants and primitives of the module-image format.
//!
//! A module image is a little-endian container with a fixed header, a section table and
//! six optional directories (relocation, import, export, TLS, exception, manifest),
//! all addressed by RVA relative to the image base:
//!
//! ```text
//! +--------------------+
//! | Header             |  72 bytes
//! +--------------------+
//! | Section table      |  20 bytes per section
//! +--------------------+
//! | Section raw data   |  addressed via the section table
//! +--------------------+
//! ```
//!
//! The header carries the magic, the architecture width, the preferred base, the
//! virtual image size, the entry-point RVA and a `(rva, size)` pair per directory.

use bitflags::bitflags;

/// Image header magic, `b"LMD1"` as a little-endian `u32`.
pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"LMD1");

/// Fixed size of the image header in bytes.
pub const HEADER_SIZE: usize = 72;

/// Size of one section table entry in bytes.
pub const SECTION_HEADER_SIZE: usize = 20;

/// Number of directory slots in the header.
pub const DIRECTORY_COUNT: usize = 6;

/// Page granularity of the modeled address space; sections and protections align to it.
pub const PAGE_SIZE: u64 = 0x1000;

/// Identifies one of the six directory slots in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum DirectoryKind {
    /// Base relocation directory
    Relocation,
    /// Import directory
    Import,
    /// Export directory
    Export,
    /// Thread-local storage directory
    Tls,
    /// Exception / unwind function table
    Exception,
    /// Embedded side-by-side manifest
    Manifest,
}

impl DirectoryKind {
    /// Index of this directory within the header's directory table.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Location and extent of one directory, relative to the image base.
///
/// A zero `rva` and `size` means the directory is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the directory payload
    pub rva: u32,
    /// Size of the directory payload in bytes
    pub size: u32,
}

impl DataDirectory {
    /// Returns `true` if the directory is present in the image.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.size != 0
    }
}

/// Architecture width of an image, selected once at parse time.
///
/// All width-dependent behavior in the pipeline (pointer size for import patches,
/// which full-width relocation kind is acceptable) goes through this type instead of
/// scattering width checks through the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PlatformAbi {
    /// 32-bit image; pointers are four bytes
    Width32,
    /// 64-bit image; pointers are eight bytes
    Width64,
}

impl PlatformAbi {
    /// Select the ABI from the header's width byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for any width other than 32 or 64.
    pub fn from_width(width: u8) -> crate::Result<Self> {
        match width {
            32 => Ok(PlatformAbi::Width32),
            64 => Ok(PlatformAbi::Width64),
            _ => Err(crate::Error::NotSupported),
        }
    }

    /// The header width byte for this ABI.
    #[must_use]
    pub fn width(self) -> u8 {
        match self {
            PlatformAbi::Width32 => 32,
            PlatformAbi::Width64 => 64,
        }
    }

    /// Pointer size in bytes.
    #[must_use]
    pub fn pointer_size(self) -> usize {
        match self {
            PlatformAbi::Width32 => 4,
            PlatformAbi::Width64 => 8,
        }
    }

    /// Encode a pointer value at this ABI's width.
    ///
    /// 64-bit values are truncated to 32 bits on [`PlatformAbi::Width32`], matching
    /// the wrapping pointer arithmetic the relocation applier uses.
    #[must_use]
    pub fn pointer_bytes(self, value: u64) -> Vec<u8> {
        match self {
            PlatformAbi::Width32 => (value as u32).to_le_bytes().to_vec(),
            PlatformAbi::Width64 => value.to_le_bytes().to_vec(),
        }
    }
}

bitflags! {
    /// Memory protection flags of a section, applied to the mapped range after all
    /// loader writes complete.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionProtection: u32 {
        /// Readable
        const READ = 0b001;
        /// Writable
        const WRITE = 0b010;
        /// Executable
        const EXECUTE = 0b100;
    }
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_selection() {
        assert_eq!(PlatformAbi::from_width(32).unwrap(), PlatformAbi::Width32);
        assert_eq!(PlatformAbi::from_width(64).unwrap(), PlatformAbi::Width64);
        assert!(PlatformAbi::from_width(16).is_err());

        assert_eq!(PlatformAbi::Width32.pointer_size(), 4);
        assert_eq!(PlatformAbi::Width64.pointer_size(), 8);
    }

    #[test]
    fn pointer_encoding() {
        assert_eq!(
            PlatformAbi::Width32.pointer_bytes(0x1122_3344_5566_7788),
            vec![0x88, 0x77, 0x66, 0x55]
        );
        assert_eq!(
            PlatformAbi::Width64.pointer_bytes(0x01),
            vec![0x01, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn directory_indices_cover_the_table() {
        use strum::IntoEnumIterator;

        let indices: Vec<usize> = DirectoryKind::iter().map(DirectoryKind::index).collect();
        assert_eq!(indices, (0..DIRECTORY_COUNT).collect::<Vec<usize>>());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
    }
}
