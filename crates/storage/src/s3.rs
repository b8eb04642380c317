//! S3 storage backend
//!
//! Serves `s3://bucket/prefix` remotes and S3 external caches. Objects above
//! [`MULTIPART_THRESHOLD`] go up as multipart uploads; downloads stream into
//! a temp file beside the destination. Transient failures are retried with
//! the backoff from [`RetryConfig`].

use std::fmt::Display;
use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use dvx_core::{Error, Result, RetryConfig};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::StorageBackend;

/// Objects larger than this are uploaded in parts
pub const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;

/// Part size for multipart uploads (S3 requires at least 5 MiB)
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for an S3 remote
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,

    /// Key prefix below the bucket, from the remote URL's path
    pub prefix: Option<String>,

    /// Endpoint for S3-compatible services (MinIO, LocalStack, ...)
    pub endpoint_url: Option<String>,

    pub region: Option<String>,

    /// Path-style addressing, needed by most S3-compatible services
    pub force_path_style: bool,

    pub retry: RetryConfig,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: None,
            endpoint_url: None,
            region: Some("us-east-1".to_string()),
            force_path_style: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Backend over one bucket and key prefix
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    retry: RetryConfig,
}

/// Map an SDK failure onto the shared error type
///
/// Missing keys become `StoragePathNotFound`; everything else is a
/// retryable `Storage` error.
fn sdk_error(operation: &str, path: &str, err: impl Display) -> Error {
    let text = err.to_string();
    if text.contains("NoSuchKey") || text.contains("NotFound") || text.contains("404") {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("s3 {} of '{}' failed: {}", operation, path, text),
        }
    }
}

fn join_key(prefix: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    match prefix.trim_end_matches('/') {
        "" => path.to_string(),
        prefix => format!("{}/{}", prefix, path),
    }
}

fn relative_key<'a>(prefix: &str, key: &'a str) -> &'a str {
    match prefix.trim_end_matches('/') {
        "" => key,
        prefix => key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key),
    }
}

impl S3Storage {
    /// Connect using credentials from the environment or instance profile
    pub async fn with_config(config: S3Config) -> Self {
        let region = config.region.unwrap_or_else(|| "us-east-1".to_string());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            prefix: config.prefix.unwrap_or_default(),
            retry: config.retry,
        }
    }

    fn key(&self, path: &str) -> String {
        join_key(&self.prefix, path)
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying S3 request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Content length of an object, `None` when it doesn't exist
    async fn head(&self, path: &str) -> Result<Option<u64>> {
        let key = self.key(path);
        let result = self
            .retrying("head", || async {
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| sdk_error("head", path, e))
            })
            .await;
        match result {
            Ok(head) => Ok(Some(head.content_length().unwrap_or_default().max(0) as u64)),
            Err(Error::StoragePathNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload_parts(&self, path: &str, key: &str, data: Bytes) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload", path, e))?;
        let upload_id = created.upload_id().ok_or_else(|| Error::Storage {
            message: format!("s3 returned no upload id for '{}'", path),
        })?;

        let mut parts = Vec::new();
        for (index, chunk) in data.chunks(PART_SIZE).enumerate() {
            let part_number = index as i32 + 1;
            let body = data.slice_ref(chunk);
            let uploaded = self
                .retrying("upload part", || {
                    let body = body.clone();
                    async move {
                        self.client
                            .upload_part()
                            .bucket(&self.bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(body))
                            .send()
                            .await
                            .map_err(|e| sdk_error("upload part", path, e))
                    }
                })
                .await;

            match uploaded {
                Ok(part) => parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(part.e_tag().map(String::from))
                        .build(),
                ),
                Err(e) => {
                    if let Err(abort) = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .send()
                        .await
                    {
                        warn!(path, error = %abort, "Failed to abort multipart upload");
                    }
                    return Err(e);
                }
            }
        }

        let part_count = parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("complete multipart upload", path, e))?;

        debug!(path, parts = part_count, size = data.len(), "Multipart upload complete");
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.key(path);
        self.retrying("read", || async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| sdk_error("read", path, e))?;
            let body = object
                .body
                .collect()
                .await
                .map_err(|e| sdk_error("read body", path, e))?;
            Ok(body.into_bytes())
        })
        .await
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let key = self.key(path);
        if data.len() > MULTIPART_THRESHOLD {
            return self.upload_parts(path, &key, data).await;
        }

        let size = data.len() as u64;
        self.retrying("write", || {
            let data = data.clone();
            let key = key.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| sdk_error("write", path, e))?;
                Ok(size)
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, path: &str) -> Result<()> {
        // S3 deletes of missing keys succeed silently
        if self.head(path).await?.is_none() {
            return Err(Error::StoragePathNotFound {
                path: path.to_string(),
            });
        }
        let key = self.key(path);
        self.retrying("delete", || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| sdk_error("delete", path, e))?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.head(path).await?.is_some())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let key_prefix = self.key(prefix);
        let mut paths = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| sdk_error("list", prefix, e))?;

            paths.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| relative_key(&self.prefix, key).to_string()),
            );

            match page.next_continuation_token() {
                Some(next) if page.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        paths.sort();
        debug!(prefix, count = paths.len(), "Listed S3 objects");
        Ok(paths)
    }

    async fn size(&self, path: &str) -> Result<u64> {
        self.head(path).await?.ok_or_else(|| Error::StoragePathNotFound {
            path: path.to_string(),
        })
    }

    #[instrument(skip(self, dest), fields(backend = "s3", bucket = %self.bucket))]
    async fn download_file(&self, path: &str, dest: &Path) -> Result<u64> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| sdk_error("download", path, e))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = dest.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&temp).await?;
        let mut body = object.body.into_async_read();
        let written = match tokio::io::copy(&mut body, &mut file).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(sdk_error("download body", path, e));
            }
        };
        file.flush().await?;
        tokio::fs::rename(&temp, dest).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_under_prefix() {
        assert_eq!(join_key("dvx/", "ab/cdef"), "dvx/ab/cdef");
        assert_eq!(join_key("dvx", "/ab/cdef"), "dvx/ab/cdef");
        assert_eq!(join_key("", "data/train.csv"), "data/train.csv");

        assert_eq!(relative_key("cache", "cache/ab/cdef"), "ab/cdef");
        assert_eq!(relative_key("", "ab/cdef"), "ab/cdef");
        assert_eq!(relative_key("cache", "cachette/x"), "cachette/x");
    }

    #[test]
    fn test_sdk_error_classification() {
        assert!(matches!(
            sdk_error("read", "ab/cd", "NoSuchKey: gone"),
            Error::StoragePathNotFound { .. }
        ));
        let throttled = sdk_error("write", "ab/cd", "SlowDown: reduce request rate");
        assert!(throttled.is_retryable());
    }

    #[test]
    fn test_default_config() {
        let config = S3Config::default();
        assert!(config.prefix.is_none());
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
        assert!(!config.force_path_style);
    }
}
