//! Process-wide thread-local storage slots.
//!
//! Each module with a TLS directory owns one slot for its whole mapped lifetime.
//! The slot carries the module's initialization template; per-thread storage for
//! a slot is created lazily, and the template is copied in before any module code
//! can observe the block, so every thread starts from the image-defined initial
//! values. Releasing a slot sweeps the storage of every thread at once, which
//! keeps a remapped module from inheriting stale blocks through slot reuse.
//!
//! A thread's block lives until its slot is released, even after the thread
//! exits, so a slot's storage is bounded by the number of distinct threads
//! that touched it over the owning module's mapped lifetime.

use std::{
    sync::{Arc, Mutex},
    thread::ThreadId,
};

use dashmap::DashMap;

use crate::{
    Error::{TlsSlotUnassigned, TlsSlotsExhausted},
    Result,
};

/// Number of slots in the process-wide table.
pub const TLS_SLOT_CAPACITY: usize = 64;

/// The image-defined initial contents of a module's TLS block.
#[derive(Debug, Clone)]
pub struct TlsTemplate {
    /// Raw bytes copied from the mapped template region
    pub data: Vec<u8>,
    /// Additional zeroed bytes appended after the template
    pub zero_fill: usize,
}

impl TlsTemplate {
    fn instantiate(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(self.data.len() + self.zero_fill);
        block.extend_from_slice(&self.data);
        block.resize(self.data.len() + self.zero_fill, 0);
        block
    }
}

/// Allocation bitmap plus per-thread storage for all TLS slots.
pub struct TlsSlotTable {
    bitmap: Mutex<u64>,
    templates: DashMap<usize, TlsTemplate>,
    storage: DashMap<(ThreadId, usize), Arc<Mutex<Vec<u8>>>>,
}

impl Default for TlsSlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsSlotTable {
    /// Create a table with every slot free.
    #[must_use]
    pub fn new() -> Self {
        TlsSlotTable {
            bitmap: Mutex::new(0),
            templates: DashMap::new(),
            storage: DashMap::new(),
        }
    }

    /// Claim the lowest free slot and bind `template` to it.
    ///
    /// # Errors
    /// Returns [`crate::Error::TlsSlotsExhausted`] when all slots are taken.
    pub fn allocate(&self, template: TlsTemplate) -> Result<usize> {
        let mut bitmap = lock!(self.bitmap);

        let slot = (0..TLS_SLOT_CAPACITY)
            .find(|slot| *bitmap & (1u64 << slot) == 0)
            .ok_or(TlsSlotsExhausted)?;

        *bitmap |= 1u64 << slot;
        self.templates.insert(slot, template);
        Ok(slot)
    }

    /// Release a slot and drop every thread's storage for it.
    ///
    /// # Errors
    /// Returns [`crate::Error::TlsSlotUnassigned`] if the slot is not allocated,
    /// so a double release is caught instead of clobbering a reused slot.
    pub fn release(&self, slot: usize) -> Result<()> {
        {
            let mut bitmap = lock!(self.bitmap);
            if slot >= TLS_SLOT_CAPACITY || *bitmap & (1u64 << slot) == 0 {
                return Err(TlsSlotUnassigned { slot });
            }
            *bitmap &= !(1u64 << slot);
        }

        self.templates.remove(&slot);
        self.storage.retain(|(_, stored), _| *stored != slot);
        Ok(())
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        let bitmap = lock!(self.bitmap);
        bitmap.count_ones() as usize
    }

    /// The calling thread's block for `slot`, created from the template on first use.
    ///
    /// # Errors
    /// Returns [`crate::Error::TlsSlotUnassigned`] for a slot with no template.
    pub fn slot_storage(&self, slot: usize) -> Result<Arc<Mutex<Vec<u8>>>> {
        let key = (std::thread::current().id(), slot);

        if let Some(existing) = self.storage.get(&key) {
            return Ok(existing.value().clone());
        }

        let template = self
            .templates
            .get(&slot)
            .ok_or(TlsSlotUnassigned { slot })?;
        let block = Arc::new(Mutex::new(template.instantiate()));
        drop(template);

        // Another call on this thread cannot race; the entry API keeps the first
        // inserted block either way.
        let entry = self.storage.entry(key).or_insert(block);
        Ok(entry.value().clone())
    }

    /// Read a little-endian `u32` at `offset` in the calling thread's block.
    ///
    /// # Errors
    /// Fails on an unassigned slot or an out-of-range offset.
    pub fn read_u32(&self, slot: usize, offset: usize) -> Result<u32> {
        let storage = self.slot_storage(slot)?;
        let block = storage.lock().map_err(|_| crate::Error::LockError)?;

        let end = offset.checked_add(4).ok_or(out_of_bounds_error!())?;
        if end > block.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(u32::from_le_bytes([
            block[offset],
            block[offset + 1],
            block[offset + 2],
            block[offset + 3],
        ]))
    }

    /// Write a little-endian `u32` at `offset` in the calling thread's block.
    ///
    /// # Errors
    /// Fails on an unassigned slot or an out-of-range offset.
    pub fn write_u32(&self, slot: usize, offset: usize, value: u32) -> Result<()> {
        let storage = self.slot_storage(slot)?;
        let mut block = storage.lock().map_err(|_| crate::Error::LockError)?;

        let end = offset.checked_add(4).ok_or(out_of_bounds_error!())?;
        if end > block.len() {
            return Err(out_of_bounds_error!());
        }

        block[offset..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Stable identity of the calling thread's block for `slot`.
    ///
    /// Two reads on the same thread return the same value for as long as the
    /// slot stays allocated.
    ///
    /// # Errors
    /// Fails on an unassigned slot.
    pub fn storage_address(&self, slot: usize) -> Result<usize> {
        let storage = self.slot_storage(slot)?;
        Ok(Arc::as_ptr(&storage) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(bytes: &[u8], zero_fill: usize) -> TlsTemplate {
        TlsTemplate {
            data: bytes.to_vec(),
            zero_fill,
        }
    }

    #[test]
    fn allocate_initialize_release() {
        let table = TlsSlotTable::new();
        let slot = table.allocate(template(&[0xAA, 0xBB, 0xCC, 0xDD], 4)).unwrap();

        assert_eq!(table.read_u32(slot, 0).unwrap(), 0xDDCC_BBAA);
        assert_eq!(table.read_u32(slot, 4).unwrap(), 0);

        table.write_u32(slot, 4, 7).unwrap();
        assert_eq!(table.read_u32(slot, 4).unwrap(), 7);

        table.release(slot).unwrap();
        assert!(table.read_u32(slot, 0).is_err());
        assert!(matches!(table.release(slot), Err(TlsSlotUnassigned { .. })));
    }

    #[test]
    fn slots_exhaust_at_capacity() {
        let table = TlsSlotTable::new();

        for _ in 0..TLS_SLOT_CAPACITY {
            table.allocate(template(&[0; 4], 0)).unwrap();
        }
        assert!(matches!(
            table.allocate(template(&[0; 4], 0)),
            Err(TlsSlotsExhausted)
        ));
    }

    #[test]
    fn released_slot_is_reusable_without_stale_data() {
        let table = TlsSlotTable::new();
        let slot = table.allocate(template(&[1, 0, 0, 0], 0)).unwrap();

        table.write_u32(slot, 0, 0xFFFF_FFFF).unwrap();
        table.release(slot).unwrap();

        let reused = table.allocate(template(&[2, 0, 0, 0], 0)).unwrap();
        assert_eq!(reused, slot);
        assert_eq!(table.read_u32(reused, 0).unwrap(), 2);
    }

    #[test]
    fn exited_thread_storage_is_swept_on_release() {
        let table = Arc::new(TlsSlotTable::new());
        let slot = table.allocate(template(&[1, 0, 0, 0], 0)).unwrap();

        let worker = table.clone();
        std::thread::spawn(move || worker.write_u32(slot, 0, 0x77).unwrap())
            .join()
            .unwrap();

        // The exited thread's block is only dropped by the release sweep
        table.release(slot).unwrap();
        let reused = table.allocate(template(&[2, 0, 0, 0], 0)).unwrap();
        assert_eq!(reused, slot);
        assert_eq!(table.read_u32(reused, 0).unwrap(), 2);
    }

    #[test]
    fn per_thread_blocks_are_independent() {
        let table = Arc::new(TlsSlotTable::new());
        let slot = table.allocate(template(&[0x11, 0x22, 0x33, 0x44], 0)).unwrap();

        table.write_u32(slot, 0, 0x5555_5555).unwrap();

        let worker_table = table.clone();
        let initial = std::thread::spawn(move || {
            // New threads start from the template, not this thread's writes
            worker_table.read_u32(slot, 0).unwrap()
        })
        .join()
        .unwrap();

        assert_eq!(initial, 0x4433_2211);
        assert_eq!(table.read_u32(slot, 0).unwrap(), 0x5555_5555);
    }

    #[test]
    fn storage_identity_is_stable() {
        let table = TlsSlotTable::new();
        let slot = table.allocate(template(&[0; 8], 0)).unwrap();

        let first = table.storage_address(slot).unwrap();
        table.write_u32(slot, 0, 9).unwrap();
        let second = table.storage_address(slot).unwrap();

        assert_eq!(first, second);
    }
}
