//! Content-addressed object cache
//!
//! Objects live at `<hh>/<rest-of-hash>` inside any storage backend, so the
//! same type serves the local cache, push/pull remotes and external caches.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use dvx_core::hash::hash_file;
use dvx_core::{hash_bytes, ContentHash, DirManifest, Error, Result};
use storage::BackendHandle;
use tracing::{debug, info, instrument, warn};

/// Result of a cache garbage collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheGcStats {
    /// Objects deleted
    pub removed: usize,

    /// Objects retained
    pub kept: usize,

    /// Bytes reclaimed
    pub bytes_freed: u64,
}

/// Content-addressed store over a storage backend
#[derive(Clone)]
pub struct ObjectCache {
    backend: BackendHandle,
}

impl ObjectCache {
    /// Create a cache over a backend
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Underlying backend
    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Check whether an object is present
    pub async fn contains(&self, hash: &ContentHash) -> Result<bool> {
        self.backend.exists(&hash.object_path()).await
    }

    /// Store a buffer, returning its hash
    ///
    /// Existing objects are never rewritten.
    pub async fn put_bytes(&self, data: Bytes) -> Result<ContentHash> {
        let hash = hash_bytes(&data);
        if !self.contains(&hash).await? {
            self.backend.write(&hash.object_path(), data).await?;
            debug!(%hash, "Stored object");
        }
        Ok(hash)
    }

    /// Hash and store a local file
    pub async fn put_file(&self, path: &Path) -> Result<ContentHash> {
        let owned = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| Error::Internal {
                message: format!("hash task failed: {}", e),
            })??;
        self.put_file_with_hash(path, &hash).await?;
        Ok(hash)
    }

    /// Store a local file whose hash is already known
    ///
    /// Returns true when the object was newly written.
    pub async fn put_file_with_hash(&self, path: &Path, hash: &ContentHash) -> Result<bool> {
        if self.contains(hash).await? {
            return Ok(false);
        }
        self.backend.upload_file(&hash.object_path(), path).await?;
        debug!(%hash, path = %path.display(), "Stored file object");
        Ok(true)
    }

    /// Store a directory manifest
    pub async fn put_dir_manifest(&self, manifest: &DirManifest) -> Result<ContentHash> {
        let hash = manifest.hash()?;
        if !self.contains(&hash).await? {
            self.backend
                .write(&hash.object_path(), Bytes::from(manifest.to_bytes()?))
                .await?;
        }
        Ok(hash)
    }

    /// Read an object and verify its content against the hash
    #[instrument(skip(self), fields(hash = %hash))]
    pub async fn get(&self, hash: &ContentHash) -> Result<Bytes> {
        let data = match self.backend.read(&hash.object_path()).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::ObjectNotFound {
                    hash: hash.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let actual = hash_bytes(&data);
        if actual.hex() != hash.hex() {
            warn!(%hash, %actual, "Cached object failed verification");
            return Err(Error::ObjectCorrupted {
                hash: hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Read a directory manifest object
    pub async fn get_dir_manifest(&self, hash: &ContentHash) -> Result<DirManifest> {
        let data = self.get(hash).await?;
        DirManifest::from_bytes(&data)
    }

    /// Write a file object to a local destination, verifying it on the way
    pub async fn checkout_file(&self, hash: &ContentHash, dest: &Path) -> Result<u64> {
        let size = match self.backend.download_file(&hash.object_path(), dest).await {
            Ok(size) => size,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::ObjectNotFound {
                    hash: hash.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let owned = dest.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| Error::Internal {
                message: format!("hash task failed: {}", e),
            })??;
        if actual.hex() != hash.hex() {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::ObjectCorrupted {
                hash: hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(size)
    }

    /// Delete an object
    pub async fn remove(&self, hash: &ContentHash) -> Result<()> {
        self.backend.delete(&hash.object_path()).await
    }

    /// Every object hash present in the cache
    pub async fn list_hashes(&self) -> Result<Vec<ContentHash>> {
        let paths = self.backend.list("").await?;
        Ok(paths
            .iter()
            .filter_map(|p| ContentHash::from_object_path(p))
            .collect())
    }

    /// Add the children of every directory hash to the set
    ///
    /// Manifests missing from this cache are skipped; their children can't
    /// be known here.
    pub async fn expand(&self, roots: &HashSet<ContentHash>) -> Result<HashSet<ContentHash>> {
        let mut expanded = roots.clone();
        for hash in roots.iter().filter(|h| h.is_dir()) {
            match self.get_dir_manifest(hash).await {
                Ok(manifest) => {
                    expanded.extend(manifest.entries.into_iter().map(|e| e.hash));
                }
                Err(Error::ObjectNotFound { .. }) => {
                    debug!(%hash, "Directory manifest not in cache, children unknown");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(expanded)
    }

    /// Remove every object not reachable from `keep`
    pub async fn gc(&self, keep: &HashSet<ContentHash>) -> Result<CacheGcStats> {
        let keep = self.expand(keep).await?;
        let mut stats = CacheGcStats::default();

        for hash in self.list_hashes().await? {
            if keep.contains(&hash) {
                stats.kept += 1;
                continue;
            }
            let size = self.backend.size(&hash.object_path()).await.unwrap_or(0);
            self.remove(&hash).await?;
            stats.removed += 1;
            stats.bytes_freed += size;
        }

        info!(
            removed = stats.removed,
            kept = stats.kept,
            bytes_freed = stats.bytes_freed,
            "Cache garbage collection complete"
        );
        Ok(stats)
    }
}

/// Convenience constructor for a cache rooted in a local directory
pub fn local_cache(path: &Path) -> ObjectCache {
    ObjectCache::new(Arc::new(storage::LocalStorage::new(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvx_core::DirEntry;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectCache) {
        let dir = TempDir::new().unwrap();
        let cache = local_cache(dir.path());
        (dir, cache)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_dir, cache) = setup();
        let hash = cache.put_bytes(Bytes::from("weights")).await.unwrap();
        assert!(cache.contains(&hash).await.unwrap());
        assert_eq!(cache.get(&hash).await.unwrap(), Bytes::from("weights"));
        assert_eq!(cache.list_hashes().await.unwrap(), vec![hash]);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (_dir, cache) = setup();
        let hash = hash_bytes(b"never stored");
        assert!(matches!(
            cache.get(&hash).await,
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let (dir, cache) = setup();
        let hash = cache.put_bytes(Bytes::from("original")).await.unwrap();
        std::fs::write(dir.path().join(hash.object_path()), b"tampered").unwrap();

        assert!(matches!(
            cache.get(&hash).await,
            Err(Error::ObjectCorrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_file_and_checkout() {
        let (dir, cache) = setup();
        let source = dir.path().join("model.pt");
        std::fs::write(&source, b"model bytes").unwrap();

        let hash = cache.put_file(&source).await.unwrap();
        assert_eq!(hash, hash_bytes(b"model bytes"));
        assert!(!cache.put_file_with_hash(&source, &hash).await.unwrap());

        let dest = dir.path().join("restored/model.pt");
        cache.checkout_file(&hash, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"model bytes");
    }

    #[tokio::test]
    async fn test_gc_keeps_directory_children() {
        let (_dir, cache) = setup();
        let child = cache.put_bytes(Bytes::from("child")).await.unwrap();
        let orphan = cache.put_bytes(Bytes::from("orphan")).await.unwrap();
        let manifest = DirManifest::new(vec![DirEntry {
            relpath: "child.txt".to_string(),
            hash: child.clone(),
            size: 5,
        }]);
        let dir_hash = cache.put_dir_manifest(&manifest).await.unwrap();

        let keep: HashSet<_> = [dir_hash.clone()].into_iter().collect();
        let stats = cache.gc(&keep).await.unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.bytes_freed, 6);
        assert!(cache.contains(&child).await.unwrap());
        assert!(cache.contains(&dir_hash).await.unwrap());
        assert!(!cache.contains(&orphan).await.unwrap());
    }
}
