//! Exception directory registration.
//!
//! The directory is validated before anything is registered: function ranges
//! must be non-empty, sorted and non-overlapping, and must fall inside the
//! mapped image. A directory that fails validation aborts the mapping rather
//! than registering a table dispatch could walk incorrectly.

use std::sync::Arc;

use crate::{
    image::ModuleImage,
    process::{exceptions::RegisteredRange, ProcessSpace},
    Error::ExceptionRegistration,
    Result,
};

/// Register the module's function table, returning whether one was registered.
///
/// # Errors
/// Returns [`crate::Error::ExceptionRegistration`] for an invalid directory or
/// an entry pointing outside the image.
pub(crate) fn register(
    space: &Arc<ProcessSpace>,
    image: &ModuleImage,
    base: u64,
) -> Result<bool> {
    let Some(directory) = image.exceptions()? else {
        return Ok(false);
    };

    directory.validate()?;

    let span = u64::from(image.size_of_image());
    let mut ranges = Vec::with_capacity(directory.entries().len());
    for entry in directory.entries() {
        if u64::from(entry.end_rva) > span || u64::from(entry.unwind_rva) >= span {
            return Err(ExceptionRegistration(format!(
                "function range {:#x}..{:#x} falls outside the image",
                entry.begin_rva, entry.end_rva
            )));
        }

        ranges.push(RegisteredRange {
            begin: base + u64::from(entry.begin_rva),
            end: base + u64::from(entry.end_rva),
            unwind: base + u64::from(entry.unwind_rva),
        });
    }

    space.exceptions().register(base, span, ranges)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{
        builder::ImageBuilder,
        format::{PlatformAbi, SectionProtection},
    };

    const RW: SectionProtection = SectionProtection::READ.union(SectionProtection::WRITE);

    fn space_and_base(image: &ModuleImage) -> (Arc<ProcessSpace>, u64) {
        let space = ProcessSpace::new();
        let base = space
            .memory()
            .allocate(u64::from(image.size_of_image()), RW)
            .unwrap();
        (space, base)
    }

    #[test]
    fn registers_absolute_ranges() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x100], RW)
            .exception(0x1000, 0x1040, 0x1080)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let (space, base) = space_and_base(&image);
        assert!(register(&space, &image, base).unwrap());
        assert_eq!(space.dispatch_exception(base + 0x1020), Some(base + 0x1080));
        assert_eq!(space.dispatch_exception(base + 0x1040), None);
    }

    #[test]
    fn no_directory_registers_nothing() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x10], RW)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let (space, base) = space_and_base(&image);
        assert!(!register(&space, &image, base).unwrap());
        assert!(space.exceptions().registered_bases().is_empty());
    }

    #[test]
    fn overlapping_directory_rejected_before_registration() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x100], RW)
            .exception(0x1000, 0x1040, 0x1080)
            .exception(0x1020, 0x1060, 0x1090)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let (space, base) = space_and_base(&image);
        assert!(register(&space, &image, base).is_err());
        assert!(space.exceptions().registered_bases().is_empty());
    }

    #[test]
    fn range_outside_image_rejected() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x100], RW)
            .exception(0x1000, 0xFFFF_0000, 0x1080)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let (space, base) = space_and_base(&image);
        assert!(register(&space, &image, base).is_err());
    }
}
