//! Experiment references
//!
//! Refs are small JSON files under `.dvx/refs`:
//!
//! ```text
//! exps/<name>       ephemeral experiments
//! heads/<name>      promoted branches
//! HEAD_BASELINE     checkpoint the workspace was last applied from
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dvx_core::{CheckpointId, Error, ExperimentName, Result};
use serde::{Deserialize, Serialize};
use storage::BackendHandle;
use tracing::debug;

const BASELINE_REF: &str = "HEAD_BASELINE";

/// Namespace of a ref
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Experiment,
    Branch,
}

impl RefKind {
    fn dir(&self) -> &'static str {
        match self {
            RefKind::Experiment => "exps",
            RefKind::Branch => "heads",
        }
    }
}

/// A named pointer to the tip of a checkpoint chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRef {
    pub name: ExperimentName,

    /// Newest checkpoint; `None` for a fresh or reset chain
    pub tip: Option<CheckpointId>,

    /// Workspace state the experiment started from
    #[serde(default)]
    pub baseline: Option<String>,

    /// Stage the experiment runs
    #[serde(default)]
    pub stage: Option<String>,

    /// Promoted refs are never garbage collected
    #[serde(default)]
    pub promoted: bool,

    /// Checkpoint the chain was applied from
    #[serde(default)]
    pub applied_from: Option<CheckpointId>,

    pub created_at: DateTime<Utc>,
}

impl ExperimentRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tip: None,
            baseline: None,
            stage: None,
            promoted: false,
            applied_from: None,
            created_at: Utc::now(),
        }
    }
}

/// Check a ref name (`[A-Za-z0-9._-]+`, not `.` or `..`)
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRefName {
            name: name.to_string(),
        })
    }
}

/// Ref storage over a backend rooted at `.dvx/refs`
#[derive(Clone)]
pub struct RefStore {
    backend: BackendHandle,
}

impl RefStore {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    fn path(kind: RefKind, name: &str) -> String {
        format!("{}/{}", kind.dir(), name)
    }

    /// Read a ref
    pub async fn read(&self, kind: RefKind, name: &str) -> Result<ExperimentRef> {
        validate_name(name)?;
        match self.backend.read(&Self::path(kind, name)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(Error::StoragePathNotFound { .. }) => Err(Error::ExperimentNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Whether a ref exists
    pub async fn exists(&self, kind: RefKind, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.backend.exists(&Self::path(kind, name)).await
    }

    /// Create or replace a ref
    pub async fn write(&self, kind: RefKind, reference: &ExperimentRef) -> Result<()> {
        validate_name(&reference.name)?;
        let data = serde_json::to_vec_pretty(reference)?;
        self.backend
            .write(&Self::path(kind, &reference.name), Bytes::from(data))
            .await?;
        debug!(name = %reference.name, tip = ?reference.tip, "Wrote ref");
        Ok(())
    }

    /// Remove a ref
    pub async fn delete(&self, kind: RefKind, name: &str) -> Result<()> {
        validate_name(name)?;
        match self.backend.delete(&Self::path(kind, name)).await {
            Err(Error::StoragePathNotFound { .. }) => Err(Error::ExperimentNotFound {
                name: name.to_string(),
            }),
            other => other,
        }
    }

    async fn list(&self, kind: RefKind) -> Result<Vec<ExperimentRef>> {
        let prefix = format!("{}/", kind.dir());
        let mut refs = Vec::new();
        for path in self.backend.list(kind.dir()).await? {
            let Some(name) = path.strip_prefix(&prefix) else {
                continue;
            };
            if validate_name(name).is_err() {
                continue;
            }
            refs.push(self.read(kind, name).await?);
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// Every experiment ref, by name
    pub async fn list_experiments(&self) -> Result<Vec<ExperimentRef>> {
        self.list(RefKind::Experiment).await
    }

    /// Every branch ref, by name
    pub async fn list_branches(&self) -> Result<Vec<ExperimentRef>> {
        self.list(RefKind::Branch).await
    }

    /// Checkpoint the workspace was last applied from
    pub async fn read_baseline(&self) -> Result<Option<String>> {
        match self.backend.read(BASELINE_REF).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).trim().to_string())),
            Err(Error::StoragePathNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_baseline(&self, baseline: &str) -> Result<()> {
        self.backend
            .write(BASELINE_REF, Bytes::from(format!("{}\n", baseline)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::LocalStorage;

    fn store(dir: &tempfile::TempDir) -> RefStore {
        RefStore::new(Arc::new(LocalStorage::new(dir.path())))
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("exp-1a2b3c").is_ok());
        assert!(validate_name("lr_0.01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("with space").is_err());
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(&dir);

        let mut exp = ExperimentRef::new("exp-b");
        exp.tip = Some("abc".to_string());
        refs.write(RefKind::Experiment, &exp).await.unwrap();
        refs.write(RefKind::Experiment, &ExperimentRef::new("exp-a"))
            .await
            .unwrap();
        refs.write(RefKind::Branch, &ExperimentRef::new("main"))
            .await
            .unwrap();

        assert_eq!(refs.read(RefKind::Experiment, "exp-b").await.unwrap(), exp);
        let names: Vec<_> = refs
            .list_experiments()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["exp-a", "exp-b"]);
        assert_eq!(refs.list_branches().await.unwrap().len(), 1);

        refs.delete(RefKind::Experiment, "exp-a").await.unwrap();
        assert!(matches!(
            refs.read(RefKind::Experiment, "exp-a").await,
            Err(Error::ExperimentNotFound { .. })
        ));
        assert!(matches!(
            refs.delete(RefKind::Experiment, "exp-a").await,
            Err(Error::ExperimentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(&dir);
        assert_eq!(refs.read_baseline().await.unwrap(), None);
        refs.write_baseline("deadbeef").await.unwrap();
        assert_eq!(refs.read_baseline().await.unwrap(), Some("deadbeef".to_string()));
    }
}
