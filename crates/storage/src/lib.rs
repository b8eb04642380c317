//! Storage - Pluggable storage backends for DVX caches and remotes
//!
//! Provides async storage operations with support for:
//! - Local filesystem (default feature)
//! - Amazon S3 / S3-compatible storage (with `s3` feature)
//!
//! SSH, HDFS and WebHDFS locations are parsed and recognised, but opening
//! them reports [`dvx_core::Error::StorageUnavailable`].
//!
//! # Example
//!
//! ```no_run
//! use storage::{open_backend, Location};
//! use bytes::Bytes;
//!
//! # async fn example() -> dvx_core::Result<()> {
//! let location = Location::parse("/mnt/shared/dvx-cache")?;
//! let backend = open_backend(&location, None, &Default::default()).await?;
//! backend.write("ab/cdef", Bytes::from(vec![1, 2, 3])).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod location;

#[cfg(feature = "s3")]
mod s3;

use std::sync::Arc;

use dvx_core::{Error, RemoteConfig, Result, StorageConfig};
use tracing::debug;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use location::Location;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Storage};

/// Shared handle to a storage backend
pub type BackendHandle = Arc<dyn StorageBackend>;

/// Open a backend rooted at `location`
///
/// `remote` supplies endpoint and region settings when the location comes
/// from a configured remote.
pub async fn open_backend(
    location: &Location,
    remote: Option<&RemoteConfig>,
    storage: &StorageConfig,
) -> Result<BackendHandle> {
    debug!(%location, "Opening storage backend");

    match location {
        Location::Local(path) => Ok(Arc::new(LocalStorage::new(path))),
        Location::S3 { bucket, key } => open_s3(bucket, key, remote, storage).await,
        Location::Host { scheme, .. } => Err(Error::StorageUnavailable {
            backend: scheme.to_string(),
        }),
    }
}

/// Open the backend for a configured remote
pub async fn open_remote(remote: &RemoteConfig, storage: &StorageConfig) -> Result<BackendHandle> {
    let location = Location::parse(&remote.url)?;
    open_backend(&location, Some(remote), storage).await
}

#[cfg(feature = "s3")]
async fn open_s3(
    bucket: &str,
    key: &str,
    remote: Option<&RemoteConfig>,
    storage: &StorageConfig,
) -> Result<BackendHandle> {
    let config = S3Config {
        bucket: bucket.to_string(),
        prefix: (!key.is_empty()).then(|| key.to_string()),
        endpoint_url: remote.and_then(|r| r.endpoint.clone()),
        region: remote
            .and_then(|r| r.region.clone())
            .or_else(|| Some("us-east-1".to_string())),
        force_path_style: remote.map(|r| r.force_path_style).unwrap_or(false),
        retry: storage.retry.clone(),
    };
    Ok(Arc::new(S3Storage::with_config(config).await))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(
    _bucket: &str,
    _key: &str,
    _remote: Option<&RemoteConfig>,
    _storage: &StorageConfig,
) -> Result<BackendHandle> {
    Err(Error::StorageUnavailable {
        backend: "s3 (built without the `s3` feature)".to_string(),
    })
}
