//! Shared region layout
//!
//! ```text
//! +--------------------+  0
//! | StoreHeader        |
//! +--------------------+  cache-line aligned
//! | write cursors [S]  |  u32 each, next slot to write per shard
//! +--------------------+
//! | read cursors [S]   |  u32 each, persistent scan position per shard
//! +--------------------+
//! | fill counts [S]    |  u32 each, slots ever written, saturating at C
//! +--------------------+
//! | slots [S * C]      |  K key bytes then V value bytes per slot
//! +--------------------+
//! ```
//!
//! Shard `i` owns slots `i*C .. (i+1)*C`.

use crate::config::StoreConfig;
use crate::error::{KvError, Result};
use crate::monitor::{Held, WriteGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number for layout validation
pub const STORE_MAGIC: u32 = 0x4B56_5348; // "KVSH"

/// Layout version
pub const STORE_VERSION: u32 = 1;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

#[inline]
const fn align(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Header at the start of the region
#[repr(C)]
pub struct StoreHeader {
    magic: AtomicU32,
    version: AtomicU32,
    initialized: AtomicU32,
    reader_count: AtomicU32,
    shards: AtomicU32,
    capacity: AtomicU32,
    key_size: AtomicU32,
    value_size: AtomicU32,
}

/// Typed view over a mapped store region
pub struct Layout {
    base: NonNull<u8>,
    read_cursors: usize,
    fill_counts: usize,
    slots: usize,
    shards: usize,
    capacity: usize,
    key_size: usize,
    value_size: usize,
}

// SAFETY: all mutation goes through atomics or through a WriteGuard
unsafe impl Send for Layout {}
unsafe impl Sync for Layout {}

impl Layout {
    fn write_cursors_offset() -> usize {
        align(std::mem::size_of::<StoreHeader>())
    }

    fn cursor_array_size(shards: u32) -> Option<usize> {
        (shards as usize)
            .checked_mul(std::mem::size_of::<AtomicU32>())?
            .checked_add(CACHE_LINE_SIZE - 1)
            .map(|size| size & !(CACHE_LINE_SIZE - 1))
    }

    fn read_cursors_offset(shards: u32) -> Option<usize> {
        Self::write_cursors_offset().checked_add(Self::cursor_array_size(shards)?)
    }

    fn fill_offset(shards: u32) -> Option<usize> {
        Self::read_cursors_offset(shards)?.checked_add(Self::cursor_array_size(shards)?)
    }

    /// Offset of the first slot for a store with `shards` shards
    pub fn slots_offset(shards: u32) -> Option<usize> {
        Self::fill_offset(shards)?.checked_add(Self::cursor_array_size(shards)?)
    }

    /// View a mapped region through `config`'s geometry
    ///
    /// # Safety
    /// `base` must point to a mapping of at least `config.region_size()`
    /// bytes, aligned to a page, that outlives the returned layout.
    pub unsafe fn from_raw(base: NonNull<u8>, config: &StoreConfig) -> Result<Self> {
        let offsets = Self::read_cursors_offset(config.shards)
            .zip(Self::fill_offset(config.shards))
            .zip(Self::slots_offset(config.shards));
        let ((read_cursors, fill_counts), slots) = offsets.ok_or_else(|| KvError::InvalidConfig {
            reason: format!("{} shards do not fit in memory", config.shards),
        })?;

        Ok(Self {
            base,
            read_cursors,
            fill_counts,
            slots,
            shards: config.shards as usize,
            capacity: config.capacity as usize,
            key_size: config.key_size as usize,
            value_size: config.value_size as usize,
        })
    }

    #[inline]
    fn header(&self) -> &StoreHeader {
        // SAFETY: the region starts with a StoreHeader and is page aligned
        unsafe { &*(self.base.as_ptr() as *const StoreHeader) }
    }

    #[inline]
    fn cursor_array(&self, offset: usize) -> &[AtomicU32] {
        // SAFETY: the array lies within the region and is cache-line aligned
        unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(offset) as *const AtomicU32,
                self.shards,
            )
        }
    }

    /// Pointer to the shared reader count
    pub fn reader_count(&self) -> NonNull<AtomicU32> {
        NonNull::from(&self.header().reader_count)
    }

    /// Next slot to write in `shard`
    #[inline]
    pub fn write_cursor(&self, shard: usize) -> &AtomicU32 {
        &self.cursor_array(Self::write_cursors_offset())[shard]
    }

    /// Persistent scan position of `shard`
    #[inline]
    pub fn read_cursor(&self, shard: usize) -> &AtomicU32 {
        &self.cursor_array(self.read_cursors)[shard]
    }

    /// Number of slots of `shard` that hold an entry
    #[inline]
    pub fn fill(&self, shard: usize) -> &AtomicU32 {
        &self.cursor_array(self.fill_counts)[shard]
    }

    #[inline]
    fn slot_ptr(&self, shard: usize, index: usize) -> *mut u8 {
        assert!(shard < self.shards && index < self.capacity);
        let offset = self.slots
            + (shard * self.capacity + index) * (self.key_size + self.value_size);
        // SAFETY: offset is within region_size() for in-range shard and index
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Key field of a slot
    pub fn key<'a, G: Held>(&'a self, _held: &'a G, shard: usize, index: usize) -> &'a [u8] {
        // SAFETY: writers are excluded while `_held` lives
        unsafe { std::slice::from_raw_parts(self.slot_ptr(shard, index), self.key_size) }
    }

    /// Value field of a slot
    pub fn value<'a, G: Held>(&'a self, _held: &'a G, shard: usize, index: usize) -> &'a [u8] {
        // SAFETY: writers are excluded while `_held` lives
        unsafe {
            std::slice::from_raw_parts(
                self.slot_ptr(shard, index).add(self.key_size),
                self.value_size,
            )
        }
    }

    /// Overwrite a slot with fixed-width key and value fields
    pub fn write_slot(
        &self,
        _guard: &WriteGuard<'_>,
        shard: usize,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) {
        assert_eq!(key.len(), self.key_size);
        assert_eq!(value.len(), self.value_size);

        let slot = self.slot_ptr(shard, index);
        // SAFETY: the write guard grants exclusive access to slot memory
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), slot, self.key_size);
            std::ptr::copy_nonoverlapping(value.as_ptr(), slot.add(self.key_size), self.value_size);
        }
    }

    /// Whether bookkeeping has run on this region
    pub fn is_initialized(&self) -> bool {
        self.header().initialized.load(Ordering::Acquire) != 0
    }

    /// One-time bookkeeping: record geometry and zero every cursor
    pub fn initialize(&self, _guard: &WriteGuard<'_>) {
        let header = self.header();
        header.magic.store(STORE_MAGIC, Ordering::Relaxed);
        header.version.store(STORE_VERSION, Ordering::Relaxed);
        header.reader_count.store(0, Ordering::Relaxed);
        header.shards.store(self.shards as u32, Ordering::Relaxed);
        header.capacity.store(self.capacity as u32, Ordering::Relaxed);
        header.key_size.store(self.key_size as u32, Ordering::Relaxed);
        header.value_size.store(self.value_size as u32, Ordering::Relaxed);

        for shard in 0..self.shards {
            self.write_cursor(shard).store(0, Ordering::Relaxed);
            self.read_cursor(shard).store(0, Ordering::Relaxed);
            self.fill(shard).store(0, Ordering::Relaxed);
        }

        header.initialized.store(1, Ordering::Release);
    }

    /// Check an initialized region against this layout's geometry
    pub fn validate(&self) -> Result<()> {
        let header = self.header();
        let checks = [
            ("magic", STORE_MAGIC, &header.magic),
            ("version", STORE_VERSION, &header.version),
            ("shards", self.shards as u32, &header.shards),
            ("capacity", self.capacity as u32, &header.capacity),
            ("key_size", self.key_size as u32, &header.key_size),
            ("value_size", self.value_size as u32, &header.value_size),
        ];

        for (field, expected, found) in checks {
            let found = found.load(Ordering::Relaxed);
            if found != expected {
                return Err(KvError::LayoutMismatch {
                    field,
                    expected: expected as u64,
                    found: found as u64,
                });
            }
        }

        Ok(())
    }
}
