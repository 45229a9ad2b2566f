//! shmkv - Sharded key-value store in POSIX shared memory
//!
//! Independent processes attach to a named store and share a fixed-capacity
//! table of fixed-width entries. Each key hashes to one shard; each shard is a
//! ring buffer that silently overwrites its oldest entry once full.
//!
//! # Architecture
//!
//! - **Segment**: one named shared memory object holding a header, per-shard
//!   cursors, and `S * C` key/value slots
//! - **Monitor**: two named semaphores implementing the first-reader/last-reader
//!   readers-writers protocol; many concurrent readers, one exclusive writer
//! - **Handle**: [`KvStore`] bundles the mapping and the semaphores of one
//!   process; every operation goes through it
//!
//! The store is a bounded cache, not a database: there is no deletion, no
//! resizing, and nothing survives a reboot.
//!
//! ```no_run
//! use shmkv::{KvStore, StoreConfig};
//!
//! let store = KvStore::attach("inventory", StoreConfig::default())?;
//! store.put(b"apple", b"12")?;
//! assert_eq!(store.get(b"apple")?, Some(b"12".to_vec()));
//! store.destroy()?;
//! # Ok::<(), shmkv::KvError>(())
//! ```

pub mod bindings;
pub mod config;
pub mod error;
pub mod layout;
pub mod monitor;
pub mod router;
pub mod semaphore;
pub mod shm;
pub mod store;

pub use config::StoreConfig;
pub use error::{KvError, Result};
pub use store::{destroy, KvStore, ShardStats};
