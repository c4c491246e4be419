//! In-memory storage backend
//!
//! Used by tests and as a process-local fallback when no durable storage
//! is available. Sharing one instance across components simulates a
//! device's storage surviving a "restart" (constructing fresh queues over
//! the same backend).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{StorageBackend, StorageError};

/// A storage backend that keeps all values in a shared in-memory map
#[derive(Clone, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StorageError::SerializationError("storage lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::SerializationError("storage lock poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::SerializationError("storage lock poisoned".into()))?;
        values.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| StorageError::SerializationError("storage lock poisoned".into()))?;
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }
}
