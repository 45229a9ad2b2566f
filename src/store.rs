//! The sharded key-value store
//!
//! Every attached process maps the same segment and opens the same pair of
//! named semaphores. Writes append into the key's shard ring under the
//! resource lock; reads scan the shard inside the reader group.
//!
//! Reads scan round-robin: each shard keeps one persistent read cursor shared
//! by all readers, and a scan starts wherever the previous scan of that shard
//! stopped. Two lookups for different keys therefore interleave their start
//! points; a lookup still examines every slot of the ring before giving up.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::layout::Layout;
use crate::monitor::{Monitor, ReadGuard};
use crate::router::{fixed_width, shard_of, until_nul};
use crate::semaphore::NamedSemaphore;
use crate::shm::{object_name, SharedSegment};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};

const MUTEX_SUFFIX: &str = ".mutex";
const RESOURCE_SUFFIX: &str = ".resource";

/// Snapshot of one shard's bookkeeping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardStats {
    /// Shard index
    pub shard: u32,
    /// Slots holding an entry
    pub fill: u32,
    /// Next slot to be written
    pub write_cursor: u32,
    /// Where the next scan starts
    pub read_cursor: u32,
}

/// Handle to an attached store
///
/// Holds the mapping and both semaphore handles of one process. Dropping the
/// handle detaches without removing anything from the system namespace.
pub struct KvStore {
    layout: Layout,
    monitor: Monitor,
    segment: SharedSegment,
    config: StoreConfig,
}

impl KvStore {
    /// Attach to store `name`, creating it if absent
    ///
    /// Bookkeeping is initialized exactly once, by whichever process first
    /// takes the resource lock on a fresh segment. Later attaches check that
    /// `config` matches the geometry recorded in the segment.
    pub fn attach(name: &str, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let mutex_name = object_name(name, MUTEX_SUFFIX)?;
        let resource_name = object_name(name, RESOURCE_SUFFIX)?;

        let segment = SharedSegment::open_or_create(name, config.region_size())?;
        let mutex = NamedSemaphore::open(&mutex_name, 1)?;
        let resource = NamedSemaphore::open(&resource_name, 1)?;

        // SAFETY: the segment maps region_size() bytes and is stored next to
        // the layout and monitor, so it outlives both
        let layout = unsafe { Layout::from_raw(segment.base(), &config)? };
        let monitor = unsafe { Monitor::from_raw(mutex, resource, layout.reader_count()) };

        {
            let guard = monitor.write()?;
            if layout.is_initialized() {
                layout.validate()?;
            } else {
                layout.initialize(&guard);
                tracing::debug!(
                    name = %name,
                    shards = config.shards,
                    capacity = config.capacity,
                    key_size = config.key_size,
                    value_size = config.value_size,
                    "Initialized store"
                );
            }
        }

        tracing::debug!(name = %name, size = segment.size(), "Attached store");

        Ok(Self {
            layout,
            monitor,
            segment,
            config,
        })
    }

    /// Attach with the default geometry
    pub fn attach_default(name: &str) -> Result<Self> {
        Self::attach(name, StoreConfig::default())
    }

    /// Store name
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Store geometry
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The readers-writers monitor guarding this store
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Shard a key routes to
    pub fn shard_of(&self, key: &[u8]) -> u32 {
        let (key_field, _) = fixed_width(key, self.config.key_size as usize);
        shard_of(&key_field, self.config.shards)
    }

    /// Append an entry to the key's shard, overwriting its oldest entry once
    /// the ring is full
    ///
    /// Keys and values longer than their fixed width are truncated. The same
    /// key may be written many times; each write is a separate entry.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (key_field, key_truncated) = fixed_width(key, self.config.key_size as usize);
        let (value_field, value_truncated) = fixed_width(value, self.config.value_size as usize);
        if key_truncated || value_truncated {
            tracing::warn!(
                store = %self.name(),
                key_len = key.len(),
                value_len = value.len(),
                key_size = self.config.key_size,
                value_size = self.config.value_size,
                "Truncating oversized entry"
            );
        }

        let shard = shard_of(&key_field, self.config.shards) as usize;
        let capacity = self.config.capacity;

        let guard = self.monitor.write()?;

        let cursor = self.layout.write_cursor(shard).load(Ordering::Relaxed) % capacity;
        self.layout
            .write_slot(&guard, shard, cursor as usize, &key_field, &value_field);
        self.layout
            .write_cursor(shard)
            .store((cursor + 1) % capacity, Ordering::Relaxed);

        let fill = self.layout.fill(shard);
        let filled = fill.load(Ordering::Relaxed);
        if filled < capacity {
            fill.store(filled + 1, Ordering::Relaxed);
        }

        drop(guard);
        Ok(())
    }

    /// First matching value found scanning from the shard's read cursor
    ///
    /// Examines at most one full ring. Returns the value up to its first NUL
    /// byte, or `None` when no live entry has this key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.scan(key, |value| {
            found = Some(value.to_vec());
            ControlFlow::Break(())
        })?;
        Ok(found)
    }

    /// Every matching value in one full ring traversal, in scan order
    ///
    /// No matches yields an empty vector.
    pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        self.scan(key, |value| {
            values.push(value.to_vec());
            ControlFlow::Continue(())
        })?;
        Ok(values)
    }

    /// Walk the key's shard ring inside the reader section
    ///
    /// The scan starts at the shard's read cursor and covers up to `C` slots
    /// contiguously. The shared cursor advances by the number of slots
    /// examined, matching or not.
    fn scan<F>(&self, key: &[u8], mut on_match: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let (key_field, _) = fixed_width(key, self.config.key_size as usize);
        let shard = shard_of(&key_field, self.config.shards) as usize;
        let capacity = self.config.capacity;

        let guard: ReadGuard<'_> = self.monitor.read()?;

        let cursor = self.layout.read_cursor(shard);
        let start = cursor.load(Ordering::Acquire) % capacity;
        let fill = self.layout.fill(shard).load(Ordering::Relaxed);

        let mut examined = 0;
        for step in 0..capacity {
            let index = ((start as u64 + step as u64) % capacity as u64) as u32;
            examined += 1;

            // Slots past the fill count have never been written
            if index >= fill {
                continue;
            }
            if self.layout.key(&guard, shard, index as usize) != key_field.as_slice() {
                continue;
            }

            let value = self.layout.value(&guard, shard, index as usize);
            if on_match(until_nul(value)).is_break() {
                break;
            }
        }

        advance(cursor, examined, capacity);
        drop(guard);
        Ok(())
    }

    /// Per-shard bookkeeping, read inside the reader section
    ///
    /// Does not move any read cursor.
    pub fn stats(&self) -> Result<Vec<ShardStats>> {
        let _guard = self.monitor.read()?;

        Ok((0..self.config.shards as usize)
            .map(|shard| ShardStats {
                shard: shard as u32,
                fill: self.layout.fill(shard).load(Ordering::Relaxed),
                write_cursor: self.layout.write_cursor(shard).load(Ordering::Relaxed),
                read_cursor: self.layout.read_cursor(shard).load(Ordering::Relaxed),
            })
            .collect())
    }

    /// Remove the store from the system namespace and detach
    ///
    /// Unlinks both semaphores, unmaps the region, then unlinks the segment.
    /// Every removal is attempted; the first failure is returned.
    ///
    /// Must be called by one process after every other process has detached.
    /// Processes still attached keep a mapping of a store nobody can reach by
    /// name anymore.
    pub fn destroy(self) -> Result<()> {
        let name = self.name().to_string();
        let semaphores = unlink_semaphores(&name);

        drop(self);

        let segment = SharedSegment::unlink(&name);
        tracing::debug!(name = %name, "Destroyed store");
        semaphores.and(segment)
    }
}

/// Remove store `name` from the system namespace without attaching
///
/// Fails with [`crate::KvError::Teardown`] when any of the semaphores or the segment
/// is missing, so a second call never succeeds silently.
pub fn destroy(name: &str) -> Result<()> {
    let semaphores = unlink_semaphores(name);
    let segment = SharedSegment::unlink(name);
    tracing::debug!(name = %name, "Destroyed store");
    semaphores.and(segment)
}

fn unlink_semaphores(name: &str) -> Result<()> {
    let mutex = NamedSemaphore::unlink(&object_name(name, MUTEX_SUFFIX)?);
    let resource = NamedSemaphore::unlink(&object_name(name, RESOURCE_SUFFIX)?);
    mutex.and(resource)
}

/// Move a read cursor forward by `steps` slots, modulo `capacity`
fn advance(cursor: &AtomicU32, steps: u32, capacity: u32) {
    // The closure always returns Some, so the update cannot fail
    let _ = cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(((current as u64 + steps as u64) % capacity as u64) as u32)
    });
}
