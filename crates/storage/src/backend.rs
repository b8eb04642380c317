//! Storage backend trait definition
//!
//! Defines the async interface that caches, remotes and external
//! locations are accessed through.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use dvx_core::Result;

/// Async trait for storage backends
///
/// Paths are `/`-separated and relative to the backend root. Implementors
/// cover the local filesystem and remote object stores.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable backend kind, used in logs
    fn kind(&self) -> &'static str;

    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist and uses atomic
    /// writes where the backend allows it.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size in bytes of the object at `path`
    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.read(path).await?.len() as u64)
    }

    /// Copy a local file into the backend
    async fn upload_file(&self, path: &str, source: &Path) -> Result<u64> {
        let data = tokio::fs::read(source).await?;
        self.write(path, Bytes::from(data)).await
    }

    /// Copy an object from the backend into a local file
    async fn download_file(&self, path: &str, dest: &Path) -> Result<u64> {
        let data = self.read(path).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }
}
