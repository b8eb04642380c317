//! Local filesystem storage backend
//!
//! Backs the local object cache, directory remotes, and external locations
//! outside the workspace. Writes go through a temp file and a rename so a
//! crash never leaves a partial object behind.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dvx_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path, rejecting anything that escapes the root
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(Error::InvalidLocation {
                location: path.to_string(),
                reason: "path escapes the storage root".to_string(),
            });
        }
        Ok(self.base_path.join(relative))
    }

    /// Unique temporary sibling for an atomic write
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }
        Ok(())
    }

    fn map_io(path: &str, op: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::StoragePathNotFound {
                path: path.to_string(),
            }
        } else {
            Error::Storage {
                message: format!("Failed to {} {}: {}", op, path, e),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Reading file");

        fs::read(&full_path)
            .await
            .map(Bytes::from)
            .map_err(|e| Self::map_io(path, "read", e))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        Self::ensure_parent(&full_path).await?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {}", e),
        })?;

        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {}", e),
        })?;

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            })?;

        debug!(?full_path, size, "File written");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Deleting file");

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Self::map_io(path, "delete", e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        Ok(fs::metadata(&full_path).await.map(|m| m.is_file()).unwrap_or(false))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix)?;
        let mut results = Vec::new();

        // A prefix may name a directory or a partial file name inside one
        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let entry_path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                if metadata.is_dir() {
                    stack.push(entry_path);
                } else if metadata.is_file() {
                    let is_temp = entry.file_name().to_string_lossy().ends_with(".tmp");
                    if is_temp {
                        continue;
                    }
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative_str = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        if relative_str.starts_with(prefix.trim_start_matches('/')) {
                            results.push(relative_str);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed files");
        Ok(results)
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        fs::metadata(&full_path)
            .await
            .map(|m| m.len())
            .map_err(|e| Self::map_io(path, "stat", e))
    }

    #[instrument(skip(self, source), fields(backend = "local"))]
    async fn upload_file(&self, path: &str, source: &Path) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        Self::ensure_parent(&full_path).await?;

        let size = fs::copy(source, &temp_path)
            .await
            .map_err(|e| Self::map_io(&source.to_string_lossy(), "copy", e))?;
        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            })?;
        Ok(size)
    }

    #[instrument(skip(self, dest), fields(backend = "local"))]
    async fn download_file(&self, path: &str, dest: &Path) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(dest);
        Self::ensure_parent(dest).await?;

        let size = fs::copy(&full_path, &temp_path)
            .await
            .map_err(|e| Self::map_io(path, "copy", e))?;
        fs::rename(&temp_path, dest).await?;
        Ok(size)
    }
}
