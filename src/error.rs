//! Error types for shmkv

use std::io;
use thiserror::Error;

/// Result type for shmkv operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors that can occur in shmkv operations
///
/// A read miss is not an error: `get` returns `Ok(None)` and `get_all`
/// returns an empty vector.
#[derive(Debug, Error)]
pub enum KvError {
    /// Failed to create, open, size or map the shared segment
    #[error("Shared segment '{name}' unavailable: {source}")]
    Segment {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open or operate a named semaphore
    #[error("Semaphore '{name}' failed: {source}")]
    Sync {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to remove a semaphore or segment from the system namespace
    #[error("Failed to remove '{name}': {source}")]
    Teardown {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Store geometry is unusable
    #[error("Invalid store configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The existing segment was laid out by a different geometry or version
    #[error("Layout mismatch on {field}: expected {expected}, found {found}")]
    LayoutMismatch {
        field: &'static str,
        expected: u64,
        found: u64,
    },

    /// Store name too long for the system namespace
    #[error("Store name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Store name contains a character the namespace does not accept
    #[error("Invalid store name '{name}'")]
    InvalidName { name: String },
}

impl KvError {
    pub(crate) fn segment(name: &str, source: impl Into<io::Error>) -> Self {
        KvError::Segment {
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn sync(name: &str, source: io::Error) -> Self {
        KvError::Sync {
            name: name.to_string(),
            source,
        }
    }
}
