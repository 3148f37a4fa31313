//! Writer for module images.
//!
//! [`ImageBuilder`] assembles a well-formed image from sections and directory
//! declarations: probes use it to encode their contracts, and the unit tests use it
//! to produce malformed-adjacent inputs by post-editing the bytes. Directory
//! payloads are serialised into a synthetic read-only metadata section appended
//! after the declared sections, so every directory is backed by section raw data
//! the way the parser expects.

use crate::{
    image::format::{
        align_up, DataDirectory, DirectoryKind, PlatformAbi, SectionProtection, DIRECTORY_COUNT,
        HEADER_SIZE, IMAGE_MAGIC, PAGE_SIZE, SECTION_HEADER_SIZE,
    },
    image::imports::ImportTarget,
    image::relocations::RelocationKind,
    Result,
};

struct SectionSpec {
    virtual_offset: u32,
    virtual_size: u32,
    protection: SectionProtection,
    data: Vec<u8>,
}

struct TlsSpec {
    template_rva: u32,
    template_size: u32,
    zero_fill: u32,
    callbacks: Vec<u32>,
}

/// Builds the byte representation of a module image.
///
/// All positions are RVAs; sections must start page-aligned because the mapped
/// address space applies protections at page granularity.
///
/// # Examples
///
/// ```rust
/// use lodestone::image::builder::ImageBuilder;
/// use lodestone::image::format::{PlatformAbi, SectionProtection};
/// use lodestone::image::relocations::RelocationKind;
///
/// let bytes = ImageBuilder::new(PlatformAbi::Width64)
///     .preferred_base(0x40_0000)
///     .section(
///         0x1000,
///         0x40_2000u64.to_le_bytes().to_vec(),
///         SectionProtection::READ | SectionProtection::WRITE,
///     )
///     .relocation(0x1000, RelocationKind::Full64)
///     .build()?;
/// # Ok::<(), lodestone::Error>(())
/// ```
pub struct ImageBuilder {
    abi: PlatformAbi,
    preferred_base: u64,
    entry_point: u32,
    sections: Vec<SectionSpec>,
    relocations: Vec<(u32, RelocationKind)>,
    imports: Vec<(String, Vec<(ImportTarget, u32)>)>,
    exports: Vec<(String, u32, u32)>,
    tls: Option<TlsSpec>,
    exceptions: Vec<(u32, u32, u32)>,
    manifest: Option<String>,
}

impl ImageBuilder {
    /// Start a builder for the given architecture width.
    #[must_use]
    pub fn new(abi: PlatformAbi) -> Self {
        ImageBuilder {
            abi,
            preferred_base: 0x0040_0000,
            entry_point: 0,
            sections: Vec::new(),
            relocations: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            tls: None,
            exceptions: Vec::new(),
            manifest: None,
        }
    }

    /// Set the base address the image is linked against.
    #[must_use]
    pub fn preferred_base(mut self, base: u64) -> Self {
        self.preferred_base = base;
        self
    }

    /// Declare the entry-routine RVA.
    #[must_use]
    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    /// Add a section whose virtual size equals its raw data length.
    #[must_use]
    pub fn section(self, virtual_offset: u32, data: Vec<u8>, protection: SectionProtection) -> Self {
        let virtual_size = data.len() as u32;
        self.section_with_size(virtual_offset, data, virtual_size, protection)
    }

    /// Add a section with an explicit virtual size; any tail beyond the raw data is
    /// zero-filled by the loader.
    #[must_use]
    pub fn section_with_size(
        mut self,
        virtual_offset: u32,
        data: Vec<u8>,
        virtual_size: u32,
        protection: SectionProtection,
    ) -> Self {
        self.sections.push(SectionSpec {
            virtual_offset,
            virtual_size,
            protection,
            data,
        });
        self
    }

    /// Add a relocation entry, kept in insertion (file) order.
    #[must_use]
    pub fn relocation(mut self, rva: u32, kind: RelocationKind) -> Self {
        self.relocations.push((rva, kind));
        self
    }

    /// Declare a dependency with its import bindings: `(target, slot_rva)` pairs.
    #[must_use]
    pub fn import(mut self, dependency: &str, bindings: Vec<(ImportTarget, u32)>) -> Self {
        self.imports.push((dependency.to_string(), bindings));
        self
    }

    /// Declare an exported routine.
    #[must_use]
    pub fn export(mut self, name: &str, ordinal: u32, rva: u32) -> Self {
        self.exports.push((name.to_string(), ordinal, rva));
        self
    }

    /// Declare the TLS directory.
    #[must_use]
    pub fn tls(
        mut self,
        template_rva: u32,
        template_size: u32,
        zero_fill: u32,
        callbacks: Vec<u32>,
    ) -> Self {
        self.tls = Some(TlsSpec {
            template_rva,
            template_size,
            zero_fill,
            callbacks,
        });
        self
    }

    /// Add an exception function-table entry.
    #[must_use]
    pub fn exception(mut self, begin_rva: u32, end_rva: u32, unwind_rva: u32) -> Self {
        self.exceptions.push((begin_rva, end_rva, unwind_rva));
        self
    }

    /// Embed a side-by-side manifest.
    #[must_use]
    pub fn manifest(mut self, xml: &str) -> Self {
        self.manifest = Some(xml.to_string());
        self
    }

    /// Serialise the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unaligned or overlapping sections.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut sections = self.sections;
        sections.sort_by_key(|section| section.virtual_offset);

        let mut highest_end = PAGE_SIZE;
        for section in &sections {
            if u64::from(section.virtual_offset) % PAGE_SIZE != 0 {
                return Err(malformed_error!(
                    "Section at {:#x} is not page aligned",
                    section.virtual_offset
                ));
            }

            if u64::from(section.virtual_offset) < highest_end {
                return Err(malformed_error!(
                    "Section at {:#x} overlaps the previous section or the header page",
                    section.virtual_offset
                ));
            }

            if section.data.len() as u32 > section.virtual_size {
                return Err(malformed_error!(
                    "Section at {:#x} has more raw data than virtual space",
                    section.virtual_offset
                ));
            }

            highest_end = align_up(
                u64::from(section.virtual_offset) + u64::from(section.virtual_size),
                PAGE_SIZE,
            );
        }

        // Serialise directory payloads into the synthetic metadata section.
        let meta_rva = highest_end as u32;
        let mut meta = Vec::new();
        let mut directories = [DataDirectory::default(); DIRECTORY_COUNT];

        let mut place = |kind: DirectoryKind, payload: Vec<u8>, meta: &mut Vec<u8>| {
            if !payload.is_empty() {
                directories[kind.index()] = DataDirectory {
                    rva: meta_rva + meta.len() as u32,
                    size: payload.len() as u32,
                };
                meta.extend_from_slice(&payload);
            }
        };

        place(
            DirectoryKind::Relocation,
            encode_relocations(&self.relocations),
            &mut meta,
        );
        place(DirectoryKind::Import, encode_imports(&self.imports), &mut meta);
        place(DirectoryKind::Export, encode_exports(&self.exports), &mut meta);
        place(
            DirectoryKind::Tls,
            self.tls.as_ref().map(encode_tls).unwrap_or_default(),
            &mut meta,
        );
        place(
            DirectoryKind::Exception,
            encode_exceptions(&self.exceptions),
            &mut meta,
        );
        place(
            DirectoryKind::Manifest,
            self.manifest
                .as_ref()
                .map(|xml| xml.as_bytes().to_vec())
                .unwrap_or_default(),
            &mut meta,
        );

        if !meta.is_empty() {
            let virtual_size = meta.len() as u32;
            sections.push(SectionSpec {
                virtual_offset: meta_rva,
                virtual_size,
                protection: SectionProtection::READ,
                data: meta,
            });
            highest_end = align_up(u64::from(meta_rva) + u64::from(virtual_size), PAGE_SIZE);
        }

        let size_of_image = highest_end as u32;
        let size_of_headers = HEADER_SIZE + sections.len() * SECTION_HEADER_SIZE;
        if size_of_headers as u64 > PAGE_SIZE {
            return Err(malformed_error!(
                "Section table spills past the header page ({} sections)",
                sections.len()
            ));
        }

        // Header
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        bytes.push(self.abi.width());
        bytes.push(0); // reserved
        bytes.extend_from_slice(&(sections.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.preferred_base.to_le_bytes());
        bytes.extend_from_slice(&size_of_image.to_le_bytes());
        bytes.extend_from_slice(&self.entry_point.to_le_bytes());
        for directory in &directories {
            bytes.extend_from_slice(&directory.rva.to_le_bytes());
            bytes.extend_from_slice(&directory.size.to_le_bytes());
        }

        // Section table, raw offsets assigned sequentially after the headers
        let mut raw_offset = size_of_headers as u32;
        for section in &sections {
            bytes.extend_from_slice(&section.virtual_offset.to_le_bytes());
            bytes.extend_from_slice(&section.virtual_size.to_le_bytes());
            bytes.extend_from_slice(&raw_offset.to_le_bytes());
            bytes.extend_from_slice(&(section.data.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&section.protection.bits().to_le_bytes());
            raw_offset += section.data.len() as u32;
        }

        // Raw data
        for section in &sections {
            bytes.extend_from_slice(&section.data);
        }

        Ok(bytes)
    }
}

fn encode_relocations(relocations: &[(u32, RelocationKind)]) -> Vec<u8> {
    if relocations.is_empty() {
        return Vec::new();
    }

    let mut bytes = (relocations.len() as u32).to_le_bytes().to_vec();
    for (rva, kind) in relocations {
        bytes.extend_from_slice(&rva.to_le_bytes());
        bytes.extend_from_slice(&(*kind as u16).to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
    }
    bytes
}

fn encode_prefixed(name: &str, bytes: &mut Vec<u8>) {
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
}

fn encode_imports(imports: &[(String, Vec<(ImportTarget, u32)>)]) -> Vec<u8> {
    if imports.is_empty() {
        return Vec::new();
    }

    let mut bytes = (imports.len() as u32).to_le_bytes().to_vec();
    for (dependency, bindings) in imports {
        encode_prefixed(dependency, &mut bytes);
        bytes.extend_from_slice(&(bindings.len() as u32).to_le_bytes());
        for (target, slot_rva) in bindings {
            match target {
                ImportTarget::Name(name) => {
                    bytes.push(0);
                    encode_prefixed(name, &mut bytes);
                }
                ImportTarget::Ordinal(ordinal) => {
                    bytes.push(1);
                    bytes.extend_from_slice(&ordinal.to_le_bytes());
                }
            }
            bytes.extend_from_slice(&slot_rva.to_le_bytes());
        }
    }
    bytes
}

fn encode_exports(exports: &[(String, u32, u32)]) -> Vec<u8> {
    if exports.is_empty() {
        return Vec::new();
    }

    let mut bytes = (exports.len() as u32).to_le_bytes().to_vec();
    for (name, ordinal, rva) in exports {
        encode_prefixed(name, &mut bytes);
        bytes.extend_from_slice(&ordinal.to_le_bytes());
        bytes.extend_from_slice(&rva.to_le_bytes());
    }
    bytes
}

fn encode_tls(tls: &TlsSpec) -> Vec<u8> {
    let mut bytes = Vec::new();
    for value in [
        tls.template_rva,
        tls.template_size,
        tls.zero_fill,
        tls.callbacks.len() as u32,
    ] {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    for callback in &tls.callbacks {
        bytes.extend_from_slice(&callback.to_le_bytes());
    }
    bytes
}

fn encode_exceptions(exceptions: &[(u32, u32, u32)]) -> Vec<u8> {
    if exceptions.is_empty() {
        return Vec::new();
    }

    let mut bytes = (exceptions.len() as u32).to_le_bytes().to_vec();
    for (begin, end, unwind) in exceptions {
        bytes.extend_from_slice(&begin.to_le_bytes());
        bytes.extend_from_slice(&end.to_le_bytes());
        bytes.extend_from_slice(&unwind.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ModuleImage;

    #[test]
    fn roundtrips_directories() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .preferred_base(0x10_0000)
            .entry_point(0x1000)
            .section(
                0x1000,
                vec![0xCC; 0x40],
                SectionProtection::READ | SectionProtection::EXECUTE,
            )
            .relocation(0x1008, RelocationKind::Full64)
            .import(
                "dep.mod",
                vec![(ImportTarget::Name("alloc".to_string()), 0x1010)],
            )
            .export("probe", 1, 0x1000)
            .tls(0x1020, 4, 4, vec![0x1004])
            .exception(0x1000, 0x1040, 0x1020)
            .manifest("<assembly/>")
            .build()
            .unwrap();

        let image = ModuleImage::from_mem(bytes).unwrap();

        assert_eq!(image.preferred_base(), 0x10_0000);
        assert_eq!(image.entry_point(), Some(0x1000));
        assert!(image.has_tls());
        assert!(image.has_exception_table());
        assert!(image.has_manifest());

        assert_eq!(image.relocations().unwrap().len(), 1);
        assert_eq!(image.imports().unwrap()[0].dependency, "dep.mod");
        assert_eq!(
            image
                .exports()
                .unwrap()
                .find(&ImportTarget::Ordinal(1)),
            Some(0x1000)
        );
        assert_eq!(image.tls().unwrap().unwrap().callbacks, vec![0x1004]);
        assert_eq!(image.exceptions().unwrap().unwrap().entries().len(), 1);
        assert_eq!(image.manifest().unwrap().unwrap(), b"<assembly/>");
    }

    #[test]
    fn rejects_unaligned_section() {
        let result = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1004, vec![0; 4], SectionProtection::READ)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_overlapping_sections() {
        let result = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0; 0x1800], SectionProtection::READ)
            .section(0x2000, vec![0; 0x10], SectionProtection::READ)
            .build();
        assert!(result.is_err());
    }
}
