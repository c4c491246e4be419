//! Local file system storage backend
//!
//! One file per key under a base directory. Keys are sanitized into file
//! names so a fixed storage key maps to a stable path across restarts.

use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;

use super::{StorageBackend, StorageConfig, StorageError};

/// A storage backend that uses the local file system
pub struct LocalStorage {
    /// Base directory for storage
    base_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let base_dir = config.base_dir;

        // Create base directory if it doesn't exist
        if !base_dir.exists() {
            tokio_fs::create_dir_all(&base_dir).await?;
        }

        Ok(Self { base_dir })
    }

    /// Get the path for a specific key
    fn get_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join(file_name)
    }

    /// Ensure the directory for a path exists
    async fn ensure_dir(&self, path: &Path) -> Result<(), StorageError> {
        let parent = path.parent().ok_or_else(|| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Invalid path",
            ))
        })?;

        if !parent.exists() {
            tokio_fs::create_dir_all(parent).await?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.get_path(key);

        if !path.exists() {
            return Ok(None);
        }

        let data = tokio_fs::read_to_string(&path).await?;
        Ok(Some(data))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.get_path(key);

        self.ensure_dir(&path).await?;

        let mut file = tokio_fs::File::create(&path).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.get_path(key);

        if path.exists() {
            tokio_fs::remove_file(&path).await?;
        }

        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}
