//! Checkpoint records
//!
//! A record is framed as:
//!
//! ```text
//! magic "DVXC" | version u32 | step u64 | body length u32 | bincode body
//! ```
//!
//! All integers are little-endian. The record id is the sha256 of the
//! parent id, step, outputs and metrics, so identical content always yields
//! the same id and a record can be checked against its own id on read.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dvx_core::{
    hash_bytes, ArtifactKind, CheckpointId, ContentHash, Error, ExperimentName, MetricRecord,
    Result, Step,
};
use serde::{Deserialize, Serialize};
use storage::BackendHandle;
use tracing::debug;
use tracking::Output;

/// Magic bytes for checkpoint records
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"DVXC";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 + 4;

/// Directory of records inside the record backend
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Snapshot of a checkpointed stage at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Content-derived identifier (hex sha256)
    pub id: CheckpointId,

    /// Previous checkpoint in the chain
    pub parent: Option<CheckpointId>,

    /// Experiment that recorded this checkpoint
    pub experiment: ExperimentName,

    pub step: Step,

    /// Checkpoint output path -> content hash
    pub outputs: BTreeMap<String, ContentHash>,

    pub metrics: MetricRecord,

    /// Parameter values rendered as text
    pub params: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Checkpoint whose state this chain was started from
    pub applied_from: Option<CheckpointId>,
}

impl Checkpoint {
    /// Build a record, deriving its id
    pub fn new(
        experiment: &str,
        parent: Option<CheckpointId>,
        step: Step,
        outputs: BTreeMap<String, ContentHash>,
        metrics: MetricRecord,
        params: BTreeMap<String, String>,
    ) -> Result<Self> {
        let id = Self::compute_id(parent.as_deref(), step, &outputs, &metrics)?;
        Ok(Self {
            id,
            parent,
            experiment: experiment.to_string(),
            step,
            outputs,
            metrics,
            params,
            created_at: Utc::now(),
            applied_from: None,
        })
    }

    /// Identifier for a content state
    pub fn compute_id(
        parent: Option<&str>,
        step: Step,
        outputs: &BTreeMap<String, ContentHash>,
        metrics: &MetricRecord,
    ) -> Result<CheckpointId> {
        let canonical = bincode::serialize(&(parent, step, outputs, metrics))?;
        Ok(hash_bytes(&canonical).hex().to_string())
    }

    /// First seven characters of the id
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(7)]
    }

    /// Whether outputs and metrics equal this record's
    pub fn same_state(&self, outputs: &BTreeMap<String, ContentHash>, metrics: &MetricRecord) -> bool {
        self.outputs == *outputs && self.metrics == *metrics
    }

    /// Outputs to restore into the workspace
    pub fn output_list(&self) -> Vec<Output> {
        self.outputs
            .iter()
            .map(|(path, hash)| {
                let mut output = Output::new(path.clone());
                output.hash = Some(hash.clone());
                output.kind = if hash.is_dir() {
                    ArtifactKind::Directory
                } else {
                    ArtifactKind::File
                };
                output.checkpoint = true;
                output.persist = true;
                output
            })
            .collect()
    }

    /// Backend path of a record
    pub fn storage_path(id: &str) -> String {
        format!("{}/{}.ckpt", CHECKPOINT_DIR, id)
    }

    /// Frame the record
    pub fn encode(&self) -> Result<Bytes> {
        let body = bincode::serialize(self)?;
        let body_len = u32::try_from(body.len()).map_err(|_| Error::CheckpointWriteFailed {
            message: format!("record body too large: {} bytes", body.len()),
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_slice(&CHECKPOINT_MAGIC);
        buf.put_u32_le(CHECKPOINT_VERSION);
        buf.put_u64_le(self.step);
        buf.put_u32_le(body_len);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse and verify a framed record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(corrupted("", "truncated header"));
        }
        if data[0..4] != CHECKPOINT_MAGIC {
            return Err(corrupted("", "invalid magic"));
        }

        let version = u32::from_le_bytes(le_array(&data[4..8]));
        if version > CHECKPOINT_VERSION {
            return Err(corrupted("", &format!("unsupported version {}", version)));
        }
        let step = u64::from_le_bytes(le_array(&data[8..16]));
        let body_len = u32::from_le_bytes(le_array(&data[16..20])) as usize;

        let body = data
            .get(HEADER_LEN..HEADER_LEN + body_len)
            .ok_or_else(|| corrupted("", "truncated body"))?;
        let checkpoint: Checkpoint =
            bincode::deserialize(body).map_err(|e| corrupted("", &e.to_string()))?;

        if checkpoint.step != step {
            return Err(corrupted(&checkpoint.id, "header step does not match body"));
        }
        let expected = Self::compute_id(
            checkpoint.parent.as_deref(),
            checkpoint.step,
            &checkpoint.outputs,
            &checkpoint.metrics,
        )?;
        if expected != checkpoint.id {
            return Err(corrupted(&checkpoint.id, "content does not match id"));
        }
        Ok(checkpoint)
    }
}

fn le_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn corrupted(checkpoint_id: &str, reason: &str) -> Error {
    Error::CheckpointCorrupted {
        checkpoint_id: checkpoint_id.to_string(),
        reason: reason.to_string(),
    }
}

/// Read access to stored records
#[derive(Clone)]
pub struct CheckpointStore {
    backend: BackendHandle,
}

impl CheckpointStore {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Load and verify a record by full id
    pub async fn load(&self, id: &str) -> Result<Checkpoint> {
        let data = match self.backend.read(&Checkpoint::storage_path(id)).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) | Err(Error::InvalidLocation { .. }) => {
                return Err(Error::CheckpointNotFound {
                    checkpoint_id: id.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        Checkpoint::decode(&data).map_err(|e| match e {
            Error::CheckpointCorrupted { reason, .. } => Error::CheckpointCorrupted {
                checkpoint_id: id.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Ids of every stored record
    pub async fn list_ids(&self) -> Result<Vec<CheckpointId>> {
        let paths = self.backend.list(CHECKPOINT_DIR).await?;
        Ok(paths
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(".ckpt"))
            .map(str::to_string)
            .collect())
    }

    /// Resolve a full id or a unique prefix
    pub async fn resolve(&self, id_or_prefix: &str) -> Result<CheckpointId> {
        let not_found = || Error::CheckpointNotFound {
            checkpoint_id: id_or_prefix.to_string(),
        };
        if id_or_prefix.is_empty() {
            return Err(not_found());
        }

        let matches: Vec<CheckpointId> = self
            .list_ids()
            .await?
            .into_iter()
            .filter(|id| id.starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Err(not_found()),
            1 => Ok(matches.into_iter().next().unwrap_or_default()),
            count if matches.iter().any(|id| id == id_or_prefix) => {
                debug!(prefix = id_or_prefix, count, "Exact id among prefix matches");
                Ok(id_or_prefix.to_string())
            }
            count => Err(Error::AmbiguousCheckpoint {
                prefix: id_or_prefix.to_string(),
                count,
            }),
        }
    }

    /// Delete a record
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(&Checkpoint::storage_path(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::LocalStorage;

    fn sample(parent: Option<CheckpointId>, step: Step) -> Checkpoint {
        let outputs: BTreeMap<_, _> = [("model.pt".to_string(), hash_bytes(b"weights"))]
            .into_iter()
            .collect();
        let metrics: MetricRecord = [("loss".to_string(), 0.5)].into_iter().collect();
        Checkpoint::new("exp-a", parent, step, outputs, metrics, BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_id_is_content_derived() {
        let a = sample(None, 1);
        let b = sample(None, 1);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);

        let later = sample(None, 2);
        assert_ne!(a.id, later.id);

        let child = sample(Some(a.id.clone()), 1);
        assert_ne!(a.id, child.id);
    }

    #[test]
    fn test_encode_decode() {
        let checkpoint = sample(None, 3);
        let encoded = checkpoint.encode().unwrap();
        assert_eq!(&encoded[0..4], b"DVXC");

        let decoded = Checkpoint::decode(&encoded).unwrap();
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn test_decode_rejects_damage() {
        let encoded = sample(None, 3).encode().unwrap().to_vec();

        let mut bad_magic = encoded.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Checkpoint::decode(&bad_magic),
            Err(Error::CheckpointCorrupted { .. })
        ));

        let truncated = &encoded[..encoded.len() - 4];
        assert!(matches!(
            Checkpoint::decode(truncated),
            Err(Error::CheckpointCorrupted { .. })
        ));

        assert!(matches!(
            Checkpoint::decode(&encoded[..10]),
            Err(Error::CheckpointCorrupted { .. })
        ));
    }

    #[test]
    fn test_decode_detects_tampered_body() {
        let mut checkpoint = sample(None, 3);
        checkpoint.metrics.insert("loss".to_string(), 0.1);
        let encoded = checkpoint.encode().unwrap();
        assert!(matches!(
            Checkpoint::decode(&encoded),
            Err(Error::CheckpointCorrupted { reason, .. }) if reason.contains("id")
        ));
    }

    #[test]
    fn test_output_list() {
        let outputs = sample(None, 1).output_list();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].checkpoint && outputs[0].persist);
        assert_eq!(outputs[0].kind, ArtifactKind::File);
    }

    #[tokio::test]
    async fn test_store_resolves_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalStorage::new(dir.path()));
        let store = CheckpointStore::new(backend.clone());

        let checkpoint = sample(None, 1);
        backend
            .write(&Checkpoint::storage_path(&checkpoint.id), checkpoint.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(store.resolve(&checkpoint.id[..6]).await.unwrap(), checkpoint.id);
        assert_eq!(store.load(&checkpoint.id).await.unwrap(), checkpoint);
        assert!(matches!(
            store.resolve("zzzz").await,
            Err(Error::CheckpointNotFound { .. })
        ));
        assert!(matches!(
            store.load("missing").await,
            Err(Error::CheckpointNotFound { .. })
        ));
    }
}
