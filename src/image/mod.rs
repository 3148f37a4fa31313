//! Module-image abstraction and parsing.
//!
//! This module provides the input side of the mapping pipeline: parsing a raw module
//! image (headers, section table, directories) from disk or memory into a
//! [`crate::image::ModuleImage`] the mapper consumes.
//!
//! # Architecture
//!
//! - **Backend layer** - [`crate::image::Backend`] abstracts the data source; the
//!   [`crate::image::memory::Memory`] backend owns a buffer, the
//!   [`crate::image::physical::Physical`] backend memory-maps a file.
//! - **Header and section table** - parsed eagerly and validated against the
//!   backend's bounds, so a [`ModuleImage`] in hand is structurally sound.
//! - **Directories** - relocation, import, export, TLS, exception and manifest
//!   payloads are located through RVA translation and decoded on demand by the
//!   sibling modules ([`relocations`], [`imports`], [`exports`], [`tls`],
//!   [`exceptions`]).
//! - **Builder** - [`crate::image::builder::ImageBuilder`] assembles well-formed
//!   images; conformance probes use it to encode their contracts.
//!
//! # Examples
//!
//! ```rust
//! use lodestone::image::{builder::ImageBuilder, ModuleImage};
//! use lodestone::image::format::{PlatformAbi, SectionProtection};
//!
//! let bytes = ImageBuilder::new(PlatformAbi::Width64)
//!     .preferred_base(0x40_0000)
//!     .section(0x1000, vec![0xCC; 16], SectionProtection::READ | SectionProtection::EXECUTE)
//!     .build()?;
//!
//! let image = ModuleImage::from_mem(bytes)?;
//! assert_eq!(image.abi(), PlatformAbi::Width64);
//! assert_eq!(image.sections().len(), 1);
//! # Ok::<(), lodestone::Error>(())
//! ```

pub mod builder;
pub mod exceptions;
pub mod exports;
pub mod format;
pub mod imports;
pub mod parser;
pub mod relocations;
pub mod sections;
pub mod tls;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::Empty, Error::NotSupported, Result};

use exceptions::ExceptionDirectory;
use exports::ExportDirectory;
use format::{
    DataDirectory, DirectoryKind, PlatformAbi, DIRECTORY_COUNT, HEADER_SIZE, IMAGE_MAGIC,
    SECTION_HEADER_SIZE,
};
use imports::ImportDescriptor;
use memory::Memory;
use parser::Parser;
use physical::Physical;
use relocations::RelocationEntry;
use sections::SectionHeader;
use tls::TlsDirectory;

/// Backend trait for image data sources.
///
/// Abstracts over the source of image bytes, allowing both in-memory and on-disk
/// representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// The parsed fixed header of a module image.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    /// Architecture width of the image
    pub abi: PlatformAbi,
    /// Base address the image was linked against
    pub preferred_base: u64,
    /// Virtual size of the mapped image
    pub size_of_image: u32,
    /// Entry-routine RVA, zero when the image has none
    pub entry_point: u32,
    /// Directory table, indexed by [`DirectoryKind`]
    pub directories: [DataDirectory; DIRECTORY_COUNT],
    /// Bytes covered by header plus section table
    pub size_of_headers: u32,
}

/// A parsed module image ready to hand to the mapper.
///
/// Owns its backend (buffer or file mapping) plus the eagerly validated header and
/// section table; directory payloads are decoded on demand through RVA translation.
pub struct ModuleImage {
    data: Box<dyn Backend>,
    header: ImageHeader,
    sections: Vec<SectionHeader>,
}

impl ModuleImage {
    /// Parse a module image from a file on disk, via the memory-mapped backend.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, or any
    /// parse error [`ModuleImage::from_mem`] can produce.
    pub fn from_file(path: &Path) -> Result<ModuleImage> {
        Self::from_backend(Box::new(Physical::new(path)?))
    }

    /// Parse a module image from an in-memory buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for an empty buffer,
    /// [`crate::Error::NotSupported`] for a wrong magic or width, and
    /// [`crate::Error::Malformed`] / [`crate::Error::OutOfBounds`] for structural
    /// damage.
    pub fn from_mem(data: Vec<u8>) -> Result<ModuleImage> {
        if data.is_empty() {
            return Err(Empty);
        }

        Self::from_backend(Box::new(Memory::new(data)))
    }

    fn from_backend(data: Box<dyn Backend>) -> Result<ModuleImage> {
        let (header, sections) = Self::parse_headers(data.as_ref())?;

        Ok(ModuleImage {
            data,
            header,
            sections,
        })
    }

    fn parse_headers(data: &dyn Backend) -> Result<(ImageHeader, Vec<SectionHeader>)> {
        let mut parser = Parser::new(data.data());

        let magic = parser.read_u32()?;
        if magic != IMAGE_MAGIC {
            return Err(NotSupported);
        }

        let width = parser.read_u8()?;
        let abi = PlatformAbi::from_width(width)?;

        parser.read_u8()?; // reserved
        let section_count = parser.read_u16()? as usize;
        let preferred_base = parser.read_u64()?;
        let size_of_image = parser.read_u32()?;
        let entry_point = parser.read_u32()?;

        let mut directories = [DataDirectory::default(); DIRECTORY_COUNT];
        for directory in &mut directories {
            directory.rva = parser.read_u32()?;
            directory.size = parser.read_u32()?;
        }

        let size_of_headers = (HEADER_SIZE + section_count * SECTION_HEADER_SIZE) as u32;
        if size_of_headers > size_of_image {
            return Err(malformed_error!(
                "Headers ({:#x} bytes) exceed the declared image size {:#x}",
                size_of_headers,
                size_of_image
            ));
        }

        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let section = SectionHeader::parse(&mut parser)?;

            let raw_end = section.raw_offset as usize + section.raw_size as usize;
            if raw_end > data.len() {
                return Err(malformed_error!(
                    "Section {} raw data {:#x}..{:#x} exceeds the image file",
                    index,
                    section.raw_offset,
                    raw_end
                ));
            }

            if section.virtual_end() > u64::from(size_of_image) {
                return Err(malformed_error!(
                    "Section {} extends past the declared image size {:#x}",
                    index,
                    size_of_image
                ));
            }

            sections.push(section);
        }

        let header = ImageHeader {
            abi,
            preferred_base,
            size_of_image,
            entry_point,
            directories,
            size_of_headers,
        };

        Ok((header, sections))
    }

    /// The architecture width of the image.
    #[must_use]
    pub fn abi(&self) -> PlatformAbi {
        self.header.abi
    }

    /// The base address the image was linked against.
    #[must_use]
    pub fn preferred_base(&self) -> u64 {
        self.header.preferred_base
    }

    /// The virtual size of the mapped image.
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.header.size_of_image
    }

    /// Bytes covered by the header and section table.
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.header.size_of_headers
    }

    /// The entry-routine RVA, if the image declares one.
    #[must_use]
    pub fn entry_point(&self) -> Option<u32> {
        (self.header.entry_point != 0).then_some(self.header.entry_point)
    }

    /// The parsed section table.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// The directory table slot for `kind`.
    #[must_use]
    pub fn directory(&self, kind: DirectoryKind) -> DataDirectory {
        self.header.directories[kind.index()]
    }

    /// `true` if the image carries a TLS directory.
    #[must_use]
    pub fn has_tls(&self) -> bool {
        self.directory(DirectoryKind::Tls).is_present()
    }

    /// `true` if the image carries an exception directory.
    #[must_use]
    pub fn has_exception_table(&self) -> bool {
        self.directory(DirectoryKind::Exception).is_present()
    }

    /// `true` if the image embeds a side-by-side manifest.
    #[must_use]
    pub fn has_manifest(&self) -> bool {
        self.directory(DirectoryKind::Manifest).is_present()
    }

    /// Raw bytes of the image file.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Translate an RVA to an offset within the image file.
    ///
    /// RVAs below the header extent map identically; anything else must fall inside
    /// the raw range of some section.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if no section's raw data covers the RVA.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        if rva < self.header.size_of_headers {
            return Ok(rva as usize);
        }

        for section in &self.sections {
            if section.contains_rva(rva) {
                let delta = rva - section.virtual_offset;
                if delta < section.raw_size {
                    return Ok(section.raw_offset as usize + delta as usize);
                }
                // Falls into the zero-filled tail; no file bytes back it.
                return Err(out_of_bounds_error!());
            }
        }

        Err(out_of_bounds_error!())
    }

    /// The raw payload of a directory, or `None` when the directory is absent.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the directory's declared range is
    /// not backed by section raw data.
    pub fn directory_data(&self, kind: DirectoryKind) -> Result<Option<&[u8]>> {
        let directory = self.directory(kind);
        if !directory.is_present() {
            return Ok(None);
        }

        let offset = self.rva_to_offset(directory.rva)?;
        Ok(Some(self.data.data_slice(offset, directory.size as usize)?))
    }

    /// Decode the relocation directory; empty when absent.
    ///
    /// # Errors
    /// See [`relocations::parse_relocations`].
    pub fn relocations(&self) -> Result<Vec<RelocationEntry>> {
        match self.directory_data(DirectoryKind::Relocation)? {
            Some(data) => relocations::parse_relocations(data),
            None => Ok(Vec::new()),
        }
    }

    /// Decode the import directory; empty when absent.
    ///
    /// # Errors
    /// See [`imports::parse_imports`].
    pub fn imports(&self) -> Result<Vec<ImportDescriptor>> {
        match self.directory_data(DirectoryKind::Import)? {
            Some(data) => imports::parse_imports(data),
            None => Ok(Vec::new()),
        }
    }

    /// Decode the export directory; empty when absent.
    ///
    /// # Errors
    /// See [`exports::ExportDirectory::parse`].
    pub fn exports(&self) -> Result<ExportDirectory> {
        match self.directory_data(DirectoryKind::Export)? {
            Some(data) => ExportDirectory::parse(data),
            None => Ok(ExportDirectory::default()),
        }
    }

    /// Decode the TLS directory, if present.
    ///
    /// # Errors
    /// See [`tls::TlsDirectory::parse`].
    pub fn tls(&self) -> Result<Option<TlsDirectory>> {
        match self.directory_data(DirectoryKind::Tls)? {
            Some(data) => Ok(Some(TlsDirectory::parse(data)?)),
            None => Ok(None),
        }
    }

    /// Decode the exception directory, if present.
    ///
    /// # Errors
    /// See [`exceptions::ExceptionDirectory::parse`].
    pub fn exceptions(&self) -> Result<Option<ExceptionDirectory>> {
        match self.directory_data(DirectoryKind::Exception)? {
            Some(data) => Ok(Some(ExceptionDirectory::parse(data)?)),
            None => Ok(None),
        }
    }

    /// The embedded manifest payload, if present.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the declared manifest range is not
    /// backed by section data.
    pub fn manifest(&self) -> Result<Option<&[u8]>> {
        self.directory_data(DirectoryKind::Manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder::ImageBuilder;
    use format::SectionProtection;

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(ModuleImage::from_mem(vec![]), Err(Empty)));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = ImageBuilder::new(PlatformAbi::Width64).build().unwrap();
        bytes[0] = b'X';
        assert!(matches!(ModuleImage::from_mem(bytes), Err(NotSupported)));
    }

    #[test]
    fn rejects_wrong_width() {
        let mut bytes = ImageBuilder::new(PlatformAbi::Width64).build().unwrap();
        bytes[4] = 48;
        assert!(matches!(ModuleImage::from_mem(bytes), Err(NotSupported)));
    }

    #[test]
    fn rejects_truncated_section_data() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0xAA; 64], SectionProtection::READ)
            .build()
            .unwrap();

        // Chop off the section raw bytes
        let truncated = bytes[..bytes.len() - 32].to_vec();
        assert!(ModuleImage::from_mem(truncated).is_err());
    }

    #[test]
    fn translates_rvas() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0xAB; 0x20], SectionProtection::READ)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let offset = image.rva_to_offset(0x1004).unwrap();
        assert_eq!(image.data()[offset], 0xAB);

        // Header region maps identically
        assert_eq!(image.rva_to_offset(0).unwrap(), 0);

        // Unbacked RVA
        assert!(image.rva_to_offset(0x8000_0000).is_err());
    }

    #[test]
    fn capability_flags() {
        let plain = ModuleImage::from_mem(
            ImageBuilder::new(PlatformAbi::Width32).build().unwrap(),
        )
        .unwrap();
        assert!(!plain.has_tls());
        assert!(!plain.has_exception_table());
        assert!(!plain.has_manifest());
        assert_eq!(plain.entry_point(), None);
        assert_eq!(plain.abi(), PlatformAbi::Width32);
    }
}
