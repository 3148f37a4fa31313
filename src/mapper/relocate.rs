//! Relocation application.
//!
//! The delta between the allocated base and the image's preferred base is
//! applied to every entry of the relocation directory, in the order the image
//! stores them. The walk runs even when the delta is zero so a bad entry is
//! rejected on every mapping, not just the relocated ones; a single bad entry
//! aborts the mapping, since a skipped rewrite leaves a pointer every later
//! stage would trust.

use crate::{
    image::{
        format::PlatformAbi,
        relocations::{RelocationEntry, RelocationKind},
        ModuleImage,
    },
    process::memory::VirtualMemory,
    Error::Relocation,
    Result,
};

/// Apply the image's relocation directory to the mapping at `base`.
///
/// # Errors
/// Returns [`crate::Error::Relocation`] for a kind that does not match the
/// image's pointer width or a target outside the mapped image.
pub(crate) fn apply(memory: &VirtualMemory, image: &ModuleImage, base: u64) -> Result<()> {
    let entries = image.relocations()?;
    if entries.is_empty() {
        return Ok(());
    }

    let delta = base.wrapping_sub(image.preferred_base());
    for entry in &entries {
        apply_entry(memory, image, base, delta, entry)?;
    }

    Ok(())
}

fn apply_entry(
    memory: &VirtualMemory,
    image: &ModuleImage,
    base: u64,
    delta: u64,
    entry: &RelocationEntry,
) -> Result<()> {
    let failed = || Relocation {
        kind: entry.kind as u16,
        offset: entry.rva,
    };

    let width = match entry.kind {
        RelocationKind::Absolute => return Ok(()),
        RelocationKind::Full32 => {
            if image.abi() != PlatformAbi::Width32 {
                return Err(failed());
            }
            4u32
        }
        RelocationKind::Full64 => {
            if image.abi() != PlatformAbi::Width64 {
                return Err(failed());
            }
            8u32
        }
        RelocationKind::High16 | RelocationKind::Low16 => 2u32,
    };

    let end = entry.rva.checked_add(width).ok_or_else(failed)?;
    if end > image.size_of_image() {
        return Err(failed());
    }

    let address = base + u64::from(entry.rva);
    match entry.kind {
        RelocationKind::Absolute => {}
        RelocationKind::Full32 => {
            let value = memory.read_u32(address)?;
            let patched = value.wrapping_add(delta as u32);
            memory.write(address, &patched.to_le_bytes())?;
        }
        RelocationKind::Full64 => {
            let value = memory.read_u64(address)?;
            let patched = value.wrapping_add(delta);
            memory.write(address, &patched.to_le_bytes())?;
        }
        RelocationKind::Low16 => {
            let value = read_u16(memory, address)?;
            let patched = value.wrapping_add(delta as u16);
            memory.write(address, &patched.to_le_bytes())?;
        }
        RelocationKind::High16 => {
            let value = read_u16(memory, address)?;
            let patched = value.wrapping_add((delta >> 16) as u16);
            memory.write(address, &patched.to_le_bytes())?;
        }
    }

    Ok(())
}

fn read_u16(memory: &VirtualMemory, address: u64) -> Result<u16> {
    let bytes = memory.read(address, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{builder::ImageBuilder, format::SectionProtection};

    const RW: SectionProtection = SectionProtection::READ.union(SectionProtection::WRITE);

    fn mapped(image: &ModuleImage, memory: &VirtualMemory) -> u64 {
        let base = memory
            .allocate(u64::from(image.size_of_image()), RW)
            .unwrap();
        for section in image.sections() {
            let offset = section.raw_offset as usize;
            let bytes = &image.data()[offset..offset + section.raw_size as usize];
            memory
                .write(base + u64::from(section.virtual_offset), bytes)
                .unwrap();
        }
        base
    }

    #[test]
    fn full64_applies_delta() {
        let preferred = 0x40_0000u64;
        let mut data = vec![0u8; 0x100];
        data[0..8].copy_from_slice(&(preferred + 0x1010).to_le_bytes());

        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .preferred_base(preferred)
            .section(0x1000, data, RW)
            .relocation(0x1000, RelocationKind::Full64)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let memory = VirtualMemory::new();
        let base = mapped(&image, &memory);
        apply(&memory, &image, base).unwrap();

        assert_eq!(memory.read_u64(base + 0x1000).unwrap(), base + 0x1010);
    }

    #[test]
    fn width_mismatch_rejected() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x100], RW)
            .relocation(0x1000, RelocationKind::Full32)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let memory = VirtualMemory::new();
        let base = mapped(&image, &memory);

        assert!(matches!(
            apply(&memory, &image, base),
            Err(Relocation { kind: 1, offset: 0x1000 })
        ));
    }

    #[test]
    fn target_outside_image_rejected() {
        let bytes = ImageBuilder::new(PlatformAbi::Width64)
            .section(0x1000, vec![0u8; 0x100], RW)
            .relocation(0xFFFF_FFF0, RelocationKind::Full64)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let memory = VirtualMemory::new();
        let base = mapped(&image, &memory);

        assert!(apply(&memory, &image, base).is_err());
    }

    #[test]
    fn zero_delta_still_validates() {
        // The first allocation of a fresh address space lands at the floor, so
        // an image preferring that exact base maps with a zero delta.
        let bytes = ImageBuilder::new(PlatformAbi::Width32)
            .preferred_base(0x0100_0000)
            .section(0x1000, vec![0u8; 0x100], RW)
            .relocation(0x1000, RelocationKind::Full64)
            .build()
            .unwrap();
        let image = ModuleImage::from_mem(bytes).unwrap();

        let memory = VirtualMemory::new();
        let base = mapped(&image, &memory);
        assert_eq!(base, image.preferred_base());

        // Width mismatch surfaces even though nothing would move
        assert!(apply(&memory, &image, base).is_err());
    }
}
