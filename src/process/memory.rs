//! The modeled virtual address space of a target process.
//!
//! Regions are handed out by a bump allocator that never returns the preferred base
//! of a typical image, so the relocation stage is exercised on every mapping.
//! Protections are tracked at page granularity; reads, writes and instruction
//! fetches check them the way hardware would, surfacing
//! [`crate::Error::AccessViolation`] instead of silently succeeding.
//!
//! The interior mutex is held only for the duration of a single memory operation,
//! never across anything that can call back into module code.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{
    image::format::{SectionProtection, PAGE_SIZE},
    Error::AccessViolation,
    Result,
};

/// Lowest address the allocator hands out.
const ALLOCATION_FLOOR: u64 = 0x0100_0000;

/// Alignment of region base addresses.
const ALLOCATION_GRANULARITY: u64 = 0x1_0000;

struct Region {
    size: u64,
    data: Vec<u8>,
    /// Protection per page of the region
    pages: Vec<SectionProtection>,
}

struct MemoryState {
    regions: BTreeMap<u64, Region>,
    next_base: u64,
}

/// A byte-addressable address space with page-granular protections.
pub struct VirtualMemory {
    state: Mutex<MemoryState>,
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory {
    /// Create an empty address space.
    #[must_use]
    pub fn new() -> Self {
        VirtualMemory {
            state: Mutex::new(MemoryState {
                regions: BTreeMap::new(),
                next_base: ALLOCATION_FLOOR,
            }),
        }
    }

    /// Reserve and commit a zero-filled region, returning its base address.
    ///
    /// The region is committed with the given initial protection (the loader asks
    /// for read-write and tightens per section once all writes are done).
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for a zero-sized request.
    pub fn allocate(&self, size: u64, protection: SectionProtection) -> Result<u64> {
        if size == 0 {
            return Err(crate::Error::Empty);
        }

        let rounded = crate::image::format::align_up(size, PAGE_SIZE);
        let mut state = lock!(self.state);

        let base = state.next_base;
        state.next_base = crate::image::format::align_up(
            base + rounded + ALLOCATION_GRANULARITY,
            ALLOCATION_GRANULARITY,
        );

        state.regions.insert(
            base,
            Region {
                size: rounded,
                data: vec![0; rounded as usize],
                pages: vec![protection; (rounded / PAGE_SIZE) as usize],
            },
        );

        Ok(base)
    }

    /// Release the region starting at `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] if `base` is not a region base.
    pub fn free(&self, base: u64) -> Result<()> {
        let mut state = lock!(self.state);

        if state.regions.remove(&base).is_none() {
            return Err(AccessViolation { address: base });
        }

        Ok(())
    }

    /// Change the protection of every page the range touches.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] if the range is not fully mapped.
    pub fn protect(&self, address: u64, len: u64, protection: SectionProtection) -> Result<()> {
        if len == 0 {
            return Ok(());
        }

        let mut state = lock!(self.state);
        let (base, region) = Self::region_mut(&mut state, address, len)?;

        let first_page = ((address - base) / PAGE_SIZE) as usize;
        let last_page = ((address - base + len - 1) / PAGE_SIZE) as usize;
        for page in &mut region.pages[first_page..=last_page] {
            *page = protection;
        }

        Ok(())
    }

    /// Read `len` bytes, checking the READ protection.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] on unmapped or unreadable pages.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        self.access(address, len as u64, SectionProtection::READ, |region, offset| {
            region.data[offset..offset + len].to_vec()
        })
    }

    /// Write bytes, checking the WRITE protection.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] on unmapped or unwritable pages.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut state = lock!(self.state);
        let (base, region) = Self::region_mut(&mut state, address, bytes.len() as u64)?;
        Self::check_pages(
            base,
            region,
            address,
            bytes.len() as u64,
            SectionProtection::WRITE,
        )?;

        let offset = (address - base) as usize;
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a little-endian `u32`, checking READ.
    ///
    /// # Errors
    /// Propagates [`VirtualMemory::read`] failures.
    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian `u64`, checking READ.
    ///
    /// # Errors
    /// Propagates [`VirtualMemory::read`] failures.
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read(address, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Fetch a little-endian `u32` as an instruction read, checking EXECUTE.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessViolation`] if the page is not executable.
    pub fn read_code_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.access(address, 4, SectionProtection::EXECUTE, |region, offset| {
            [
                region.data[offset],
                region.data[offset + 1],
                region.data[offset + 2],
                region.data[offset + 3],
            ]
        })?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn access<T>(
        &self,
        address: u64,
        len: u64,
        required: SectionProtection,
        read: impl FnOnce(&Region, usize) -> T,
    ) -> Result<T> {
        let mut state = lock!(self.state);
        let (base, region) = Self::region_mut(&mut state, address, len)?;
        Self::check_pages(base, region, address, len, required)?;

        let offset = (address - base) as usize;
        Ok(read(region, offset))
    }

    fn region_mut<'a>(
        state: &'a mut MemoryState,
        address: u64,
        len: u64,
    ) -> Result<(u64, &'a mut Region)> {
        let Some((base, region)) = state.regions.range_mut(..=address).next_back() else {
            return Err(AccessViolation { address });
        };

        let end = address.checked_add(len).ok_or(AccessViolation { address })?;
        if address < *base || end > *base + region.size {
            return Err(AccessViolation { address });
        }

        Ok((*base, region))
    }

    fn check_pages(
        base: u64,
        region: &Region,
        address: u64,
        len: u64,
        required: SectionProtection,
    ) -> Result<()> {
        let first_page = ((address - base) / PAGE_SIZE) as usize;
        let last_page = ((address - base + len - 1) / PAGE_SIZE) as usize;

        for page in &region.pages[first_page..=last_page] {
            if !page.contains(required) {
                return Err(AccessViolation { address });
            }
        }

        Ok(())
    }
}
