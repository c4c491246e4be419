//! Persistent key-value storage for shopsync
//!
//! The offline queue and the cart snapshot are persisted as string blobs
//! under fixed keys through the [`StorageBackend`] trait.

use std::path::PathBuf;
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Error types for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Trait for persistent key-value storage backends
///
/// All operations are single-key blob reads/writes and are treated as
/// effectively atomic; on restart the last successful write wins.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the value stored under a key, if any
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a value under a key, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove the value stored under a key
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove several keys in one call
    async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError>;
}

/// Configuration for file-backed storage
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Base directory for storage
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./shopsync_data"),
        }
    }
}
