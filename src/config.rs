//! Store geometry

use crate::error::{KvError, Result};

/// Default number of shards
pub const DEFAULT_SHARDS: u32 = 256;

/// Default number of entries per shard
pub const DEFAULT_CAPACITY: u32 = 256;

/// Default key width in bytes
pub const DEFAULT_KEY_SIZE: u32 = 32;

/// Default value width in bytes
pub const DEFAULT_VALUE_SIZE: u32 = 256;

/// Store configuration
///
/// The geometry is fixed for the lifetime of a segment. Every process
/// attaching to the same store must pass the same configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of shards (S)
    pub shards: u32,
    /// Ring capacity of each shard (C)
    pub capacity: u32,
    /// Fixed key width in bytes (K)
    pub key_size: u32,
    /// Fixed value width in bytes (V)
    pub value_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            capacity: DEFAULT_CAPACITY,
            key_size: DEFAULT_KEY_SIZE,
            value_size: DEFAULT_VALUE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Check that the geometry describes a mappable region
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("shards", self.shards),
            ("capacity", self.capacity),
            ("key_size", self.key_size),
            ("value_size", self.value_size),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(KvError::InvalidConfig {
                    reason: format!("{} must be non-zero", field),
                });
            }
        }

        if self.checked_region_size().is_none() {
            return Err(KvError::InvalidConfig {
                reason: format!(
                    "{} shards x {} entries x {} bytes does not fit in memory",
                    self.shards,
                    self.capacity,
                    self.key_size as u64 + self.value_size as u64
                ),
            });
        }

        Ok(())
    }

    /// Width of one key/value slot
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.key_size as usize + self.value_size as usize
    }

    /// Total number of entries the store holds
    #[inline]
    pub fn total_entries(&self) -> usize {
        self.shards as usize * self.capacity as usize
    }

    /// Size of the whole shared region in bytes
    ///
    /// Only meaningful for a configuration that passed [`validate`](Self::validate).
    pub fn region_size(&self) -> usize {
        self.checked_region_size().unwrap_or(usize::MAX)
    }

    fn checked_region_size(&self) -> Option<usize> {
        let slots = (self.shards as usize)
            .checked_mul(self.capacity as usize)?
            .checked_mul(self.slot_size())?;
        crate::layout::Layout::slots_offset(self.shards)?.checked_add(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = StoreConfig::default();
        assert_eq!(config.shards, 256);
        assert_eq!(config.capacity, 256);
        assert_eq!(config.slot_size(), 32 + 256);
        assert_eq!(config.total_entries(), 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_fields_rejected() {
        let config = StoreConfig {
            capacity: 0,
            ..StoreConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_region_covers_all_slots() {
        let config = StoreConfig {
            shards: 4,
            capacity: 2,
            key_size: 4,
            value_size: 4,
        };
        assert!(config.region_size() >= 4 * 2 * 8);
        assert_eq!(
            config.region_size(),
            crate::layout::Layout::slots_offset(4).unwrap() + 64
        );
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let config = StoreConfig {
            shards: u32::MAX,
            capacity: u32::MAX,
            key_size: u32::MAX,
            value_size: u32::MAX,
        };
        assert!(matches!(
            config.validate(),
            Err(KvError::InvalidConfig { .. })
        ));
    }
}
