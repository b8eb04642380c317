//! Object transfer between caches (push, fetch)

use std::collections::HashSet;
use std::sync::Arc;

use dvx_core::{ContentHash, Error, Result, RetryConfig, StorageConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::ObjectCache;

/// Outcome of a transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Objects copied
    pub transferred: usize,

    /// Objects already present at the destination
    pub skipped: usize,

    /// Objects that could not be copied, with the reason
    pub failed: Vec<(ContentHash, String)>,

    /// Bytes copied
    pub bytes: u64,
}

impl TransferSummary {
    /// Whether every object made it across
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: TransferSummary) {
        self.transferred += other.transferred;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
        self.bytes += other.bytes;
    }
}

/// Copy `hashes` (and the children of directory hashes) from `src` to `dst`
///
/// Directory manifests go first so their children can be listed from the
/// source. Individual failures are collected in the summary; only task
/// panics abort the transfer.
pub async fn transfer(
    src: &ObjectCache,
    dst: &ObjectCache,
    hashes: &HashSet<ContentHash>,
    config: &StorageConfig,
) -> Result<TransferSummary> {
    let (dirs, files): (Vec<ContentHash>, Vec<ContentHash>) =
        hashes.iter().cloned().partition(|h| h.is_dir());

    let mut summary = transfer_batch(src, dst, dirs.clone(), config).await?;

    let failed_dirs: HashSet<&ContentHash> = summary.failed.iter().map(|(h, _)| h).collect();
    let listable: HashSet<ContentHash> = dirs
        .iter()
        .filter(|h| !failed_dirs.contains(h))
        .cloned()
        .collect();

    let mut children: HashSet<ContentHash> = src
        .expand(&listable)
        .await?
        .into_iter()
        .filter(|h| !h.is_dir())
        .collect();
    children.extend(files);

    summary.merge(transfer_batch(src, dst, children.into_iter().collect(), config).await?);

    info!(
        transferred = summary.transferred,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        bytes = summary.bytes,
        "Transfer complete"
    );
    Ok(summary)
}

async fn transfer_batch(
    src: &ObjectCache,
    dst: &ObjectCache,
    hashes: Vec<ContentHash>,
    config: &StorageConfig,
) -> Result<TransferSummary> {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops.max(1)));
    let mut tasks = JoinSet::new();

    for hash in hashes {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ChannelClosed {
                channel: "transfer semaphore".to_string(),
            })?;
        let src = src.clone();
        let dst = dst.clone();
        let retry = config.retry.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let result = copy_with_retry(&src, &dst, &hash, &retry).await;
            (hash, result)
        });
    }

    let mut summary = TransferSummary::default();
    while let Some(joined) = tasks.join_next().await {
        let (hash, result) = joined.map_err(|e| Error::Internal {
            message: format!("transfer task failed: {}", e),
        })?;
        match result {
            Ok(Some(bytes)) => {
                summary.transferred += 1;
                summary.bytes += bytes;
            }
            Ok(None) => summary.skipped += 1,
            Err(e) => {
                warn!(%hash, error = %e, "Object transfer failed");
                summary.failed.push((hash, e.to_string()));
            }
        }
    }
    Ok(summary)
}

async fn copy_with_retry(
    src: &ObjectCache,
    dst: &ObjectCache,
    hash: &ContentHash,
    retry: &RetryConfig,
) -> Result<Option<u64>> {
    let mut attempt = 0;
    loop {
        match copy_object(src, dst, hash).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                warn!(%hash, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying transfer");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Copy one object; `None` when the destination already has it
async fn copy_object(src: &ObjectCache, dst: &ObjectCache, hash: &ContentHash) -> Result<Option<u64>> {
    if dst.contains(hash).await? {
        return Ok(None);
    }
    let data = src.get(hash).await?;
    let written = dst.backend().write(&hash.object_path(), data).await?;
    debug!(%hash, bytes = written, "Copied object");
    Ok(Some(written))
}
