//! Experiment manager: checkpoint chains over lightweight refs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dvx_core::{CheckpointId, ContentHash, Error, MetricDiff, MetricRecord, Result, Step};
use parking_lot::RwLock;
use storage::{BackendHandle, LocalStorage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracking::{diff_metrics, Repo};
use uuid::Uuid;

use crate::record::{Checkpoint, CheckpointStore, CHECKPOINT_DIR};
use crate::refs::{validate_name, ExperimentRef, RefKind, RefStore};
use crate::writer::{AsyncCheckpointWriter, WriteRequest, WriterEvent};

/// Which experiments survive `gc`
#[derive(Debug, Clone)]
pub struct GcPolicy {
    /// Keep experiments started from, applied from or ending at the
    /// workspace baseline
    pub keep_workspace: bool,

    /// Keep experiments marked promoted
    pub keep_all_promoted: bool,

    /// Keep these experiments by name
    pub keep_names: Vec<String>,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            keep_workspace: true,
            keep_all_promoted: true,
            keep_names: Vec::new(),
        }
    }
}

/// Result of an experiment garbage collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpGcStats {
    pub removed_experiments: usize,
    pub kept_experiments: usize,
    pub removed_checkpoints: usize,
    pub kept_checkpoints: usize,
}

/// One row of `show`
#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub reference: ExperimentRef,

    /// True for promoted branches under `heads/`
    pub is_branch: bool,

    pub tip: Option<Checkpoint>,

    /// Length of the chain ending at the tip
    pub checkpoints: usize,
}

/// Manages experiments and their checkpoint chains
pub struct ExperimentManager {
    refs: RefStore,
    store: CheckpointStore,

    /// Records loaded or written during this session
    index: Arc<RwLock<HashMap<CheckpointId, Checkpoint>>>,

    write_tx: mpsc::Sender<WriteRequest>,
    _writer: AsyncCheckpointWriter,
}

impl ExperimentManager {
    /// Manager over explicit ref and record backends
    pub fn new(refs_backend: BackendHandle, records_backend: BackendHandle) -> Self {
        let (write_tx, writer) = AsyncCheckpointWriter::spawn(records_backend.clone(), 16, None);
        Self {
            refs: RefStore::new(refs_backend),
            store: CheckpointStore::new(records_backend),
            index: Arc::new(RwLock::new(HashMap::new())),
            write_tx,
            _writer: writer,
        }
    }

    /// Manager for a repository: refs under `.dvx/refs`, records under
    /// `.dvx/checkpoints`
    pub async fn open(repo: &Repo) -> Result<Self> {
        tokio::fs::create_dir_all(repo.refs_dir()).await?;
        tokio::fs::create_dir_all(repo.dvx_dir().join(CHECKPOINT_DIR)).await?;
        Ok(Self::new(
            Arc::new(LocalStorage::new(repo.refs_dir())),
            Arc::new(LocalStorage::new(repo.dvx_dir())),
        ))
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Load a record, consulting the session index first
    pub async fn load(&self, id: &str) -> Result<Checkpoint> {
        let cached = self.index.read().get(id).cloned();
        if let Some(checkpoint) = cached {
            return Ok(checkpoint);
        }
        let checkpoint = self.store.load(id).await?;
        self.index.write().insert(id.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Resolve a full id or unique prefix to its record
    pub async fn checkpoint(&self, id_or_prefix: &str) -> Result<Checkpoint> {
        let id = self.store.resolve(id_or_prefix).await?;
        self.load(&id).await
    }

    /// Create an empty experiment
    ///
    /// Without a name one is generated. The baseline defaults to the
    /// repository's current baseline.
    pub async fn start(
        &self,
        name: Option<&str>,
        baseline: Option<String>,
        stage: Option<&str>,
    ) -> Result<ExperimentRef> {
        let name = match name {
            Some(name) => name.to_string(),
            None => generate_name(),
        };
        validate_name(&name)?;
        if self.refs.exists(RefKind::Experiment, &name).await? {
            return Err(Error::ExperimentExists { name });
        }

        let mut reference = ExperimentRef::new(name);
        reference.baseline = match baseline {
            Some(baseline) => Some(baseline),
            None => self.refs.read_baseline().await?,
        };
        reference.stage = stage.map(str::to_string);
        self.refs.write(RefKind::Experiment, &reference).await?;

        info!(experiment = %reference.name, "Started experiment");
        Ok(reference)
    }

    /// Experiment ref by name
    pub async fn get(&self, name: &str) -> Result<ExperimentRef> {
        self.refs.read(RefKind::Experiment, name).await
    }

    /// Every experiment, by name
    pub async fn list(&self) -> Result<Vec<ExperimentRef>> {
        self.refs.list_experiments().await
    }

    /// Append a checkpoint to an experiment's chain
    ///
    /// Recording the tip's exact outputs and metrics again returns the tip
    /// unchanged. Otherwise `step` must be greater than the tip's.
    pub async fn record(
        &self,
        name: &str,
        step: Step,
        outputs: BTreeMap<String, ContentHash>,
        metrics: MetricRecord,
        params: BTreeMap<String, String>,
    ) -> Result<Checkpoint> {
        let mut reference = self.get(name).await?;

        let tip = match &reference.tip {
            Some(id) => Some(self.load(id).await?),
            None => None,
        };
        if let Some(tip) = &tip {
            if tip.same_state(&outputs, &metrics) {
                debug!(experiment = name, checkpoint_id = tip.short_id(), "State unchanged, not recording");
                return Ok(tip.clone());
            }
            if step <= tip.step {
                return Err(Error::NonMonotonicStep {
                    tip: tip.step,
                    step,
                });
            }
        }

        let mut checkpoint = Checkpoint::new(
            name,
            tip.map(|t| t.id),
            step,
            outputs,
            metrics,
            params,
        )?;
        if checkpoint.parent.is_none() {
            checkpoint.applied_from = reference.applied_from.clone();
        }

        // Records are shared by content; the first writer's record stands
        let checkpoint = match self.load(&checkpoint.id).await {
            Ok(existing) => {
                debug!(
                    experiment = name,
                    checkpoint_id = existing.short_id(),
                    owner = %existing.experiment,
                    "Record already stored"
                );
                existing
            }
            Err(Error::CheckpointNotFound { .. }) => {
                self.persist(checkpoint.clone()).await?;
                self.index
                    .write()
                    .insert(checkpoint.id.clone(), checkpoint.clone());
                checkpoint
            }
            Err(e) => return Err(e),
        };

        reference.tip = Some(checkpoint.id.clone());
        self.refs.write(RefKind::Experiment, &reference).await?;

        info!(
            experiment = name,
            checkpoint_id = checkpoint.short_id(),
            step,
            "Recorded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Hand a record to the writer and wait until it is durable
    async fn persist(&self, checkpoint: Checkpoint) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest {
                checkpoint,
                respond_to: Some(ack_tx),
            })
            .await
            .map_err(|e| Error::ChannelClosed {
                channel: format!("checkpoint write channel: {}", e),
            })?;

        match ack_rx.await {
            Ok(WriterEvent::Completed { .. }) => Ok(()),
            Ok(WriterEvent::Failed { error, .. }) => {
                Err(Error::CheckpointWriteFailed { message: error })
            }
            Err(_) => Err(Error::ChannelClosed {
                channel: "checkpoint write acknowledgement".to_string(),
            }),
        }
    }

    async fn chain_from(&self, tip: Option<&CheckpointId>) -> Result<Vec<Checkpoint>> {
        let mut chain = Vec::new();
        let mut next = tip.cloned();
        while let Some(id) = next {
            let checkpoint = self.load(&id).await?;
            next = checkpoint.parent.clone();
            chain.push(checkpoint);
        }
        Ok(chain)
    }

    /// Checkpoints of an experiment, newest first
    pub async fn chain(&self, name: &str) -> Result<Vec<Checkpoint>> {
        let reference = self.get(name).await?;
        self.chain_from(reference.tip.as_ref()).await
    }

    /// Tip to continue an experiment from
    pub async fn resume(&self, name: &str) -> Result<Option<Checkpoint>> {
        match self.get(name).await?.tip {
            Some(id) => Ok(Some(self.load(&id).await?)),
            None => Ok(None),
        }
    }

    /// Detach an experiment from its chain
    ///
    /// The next record starts a new chain; old records stay until `gc`.
    pub async fn reset(&self, name: &str) -> Result<ExperimentRef> {
        let mut reference = self.get(name).await?;
        reference.tip = None;
        reference.applied_from = None;
        self.refs.write(RefKind::Experiment, &reference).await?;
        info!(experiment = name, "Reset experiment chain");
        Ok(reference)
    }

    /// Restore a checkpoint into the workspace and start a new experiment
    /// from its state
    pub async fn apply(
        &self,
        repo: &Repo,
        id_or_prefix: &str,
        name: Option<&str>,
    ) -> Result<(ExperimentRef, Checkpoint)> {
        let checkpoint = self.checkpoint(id_or_prefix).await?;
        let restored = repo.restore_outputs(&checkpoint.output_list()).await?;

        let source = self
            .refs
            .read(RefKind::Experiment, &checkpoint.experiment)
            .await
            .ok();
        let mut reference = self
            .start(
                name,
                Some(checkpoint.id.clone()),
                source.as_ref().and_then(|r| r.stage.as_deref()),
            )
            .await?;
        reference.applied_from = Some(checkpoint.id.clone());
        self.refs.write(RefKind::Experiment, &reference).await?;
        self.refs.write_baseline(&checkpoint.id).await?;

        info!(
            checkpoint_id = checkpoint.short_id(),
            experiment = %reference.name,
            restored,
            "Applied checkpoint"
        );
        Ok((reference, checkpoint))
    }

    /// Keep an experiment as a named branch
    pub async fn promote(&self, name: &str, branch: &str) -> Result<ExperimentRef> {
        validate_name(branch)?;
        let mut reference = self.get(name).await?;
        reference.promoted = true;
        self.refs.write(RefKind::Experiment, &reference).await?;

        let mut head = reference.clone();
        head.name = branch.to_string();
        self.refs.write(RefKind::Branch, &head).await?;
        if let Some(tip) = &head.tip {
            self.refs.write_baseline(tip).await?;
        }

        info!(experiment = name, branch, "Promoted experiment");
        Ok(head)
    }

    /// Metrics of an experiment tip, branch tip or checkpoint
    pub async fn metrics_of(&self, rev: &str) -> Result<MetricRecord> {
        for kind in [RefKind::Experiment, RefKind::Branch] {
            if validate_name(rev).is_ok() && self.refs.exists(kind, rev).await? {
                let reference = self.refs.read(kind, rev).await?;
                return match reference.tip {
                    Some(id) => Ok(self.load(&id).await?.metrics),
                    None => Ok(MetricRecord::new()),
                };
            }
        }
        Ok(self.checkpoint(rev).await?.metrics)
    }

    /// Compare the metrics of two revisions
    pub async fn diff(&self, a: &str, b: &str) -> Result<Vec<MetricDiff>> {
        let old = self.metrics_of(a).await?;
        let new = self.metrics_of(b).await?;
        Ok(diff_metrics(&old, &new))
    }

    /// Every experiment and branch with its tip
    pub async fn show(&self) -> Result<Vec<ExperimentSummary>> {
        let mut rows = Vec::new();
        let experiments = self.refs.list_experiments().await?;
        let branches = self.refs.list_branches().await?;

        for (reference, is_branch) in experiments
            .into_iter()
            .map(|r| (r, false))
            .chain(branches.into_iter().map(|r| (r, true)))
        {
            let chain = self.chain_from(reference.tip.as_ref()).await?;
            rows.push(ExperimentSummary {
                tip: chain.first().cloned(),
                checkpoints: chain.len(),
                reference,
                is_branch,
            });
        }
        Ok(rows)
    }

    async fn reachable(&self, roots: impl IntoIterator<Item = CheckpointId>) -> Result<HashSet<CheckpointId>> {
        let mut reachable = HashSet::new();
        for root in roots {
            let mut next = Some(root);
            while let Some(id) = next {
                if !reachable.insert(id.clone()) {
                    break;
                }
                next = match self.load(&id).await {
                    Ok(checkpoint) => checkpoint.parent,
                    Err(Error::CheckpointNotFound { .. }) => {
                        warn!(checkpoint_id = %id, "Referenced checkpoint is missing");
                        None
                    }
                    Err(e) => return Err(e),
                };
            }
        }
        Ok(reachable)
    }

    async fn output_hashes(&self, ids: &HashSet<CheckpointId>) -> Result<HashSet<ContentHash>> {
        let mut hashes = HashSet::new();
        for id in ids {
            if let Ok(checkpoint) = self.load(id).await {
                hashes.extend(checkpoint.outputs.into_values());
            }
        }
        Ok(hashes)
    }

    /// Output hashes referenced by branches, and by experiments too when
    /// `include_experiments` is set
    pub async fn referenced_hashes(&self, include_experiments: bool) -> Result<HashSet<ContentHash>> {
        let mut refs = self.refs.list_branches().await?;
        if include_experiments {
            refs.extend(self.refs.list_experiments().await?);
        }
        let roots: Vec<CheckpointId> = refs.into_iter().filter_map(|r| r.tip).collect();
        let reachable = self.reachable(roots).await?;
        self.output_hashes(&reachable).await
    }

    /// Delete experiments outside `policy` and the records only they reach
    ///
    /// Branches are always kept. Returns the output hashes still referenced
    /// by surviving records so the object cache can keep them.
    pub async fn gc(&self, policy: &GcPolicy) -> Result<(ExpGcStats, HashSet<ContentHash>)> {
        let mut stats = ExpGcStats::default();
        let baseline = self.refs.read_baseline().await?;
        let keep_names: HashSet<&str> = policy.keep_names.iter().map(String::as_str).collect();

        let mut roots: Vec<CheckpointId> = Vec::new();
        for branch in self.refs.list_branches().await? {
            roots.extend(branch.tip);
        }
        if policy.keep_workspace {
            roots.extend(baseline.clone());
        }

        for experiment in self.refs.list_experiments().await? {
            let in_workspace = policy.keep_workspace
                && baseline.is_some()
                && (experiment.tip == baseline
                    || experiment.applied_from == baseline
                    || experiment.baseline == baseline);
            let keep = (policy.keep_all_promoted && experiment.promoted)
                || keep_names.contains(experiment.name.as_str())
                || in_workspace;

            if keep {
                stats.kept_experiments += 1;
                roots.extend(experiment.tip);
            } else {
                self.refs
                    .delete(RefKind::Experiment, &experiment.name)
                    .await?;
                stats.removed_experiments += 1;
                debug!(experiment = %experiment.name, "Removed experiment");
            }
        }

        let reachable = self.reachable(roots).await?;
        for id in self.store.list_ids().await? {
            if reachable.contains(&id) {
                stats.kept_checkpoints += 1;
                continue;
            }
            self.store.delete(&id).await?;
            self.index.write().remove(&id);
            stats.removed_checkpoints += 1;
        }

        let hashes = self.output_hashes(&reachable).await?;
        info!(
            removed_experiments = stats.removed_experiments,
            removed_checkpoints = stats.removed_checkpoints,
            kept_checkpoints = stats.kept_checkpoints,
            "Experiment garbage collection complete"
        );
        Ok((stats, hashes))
    }
}

fn generate_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("exp-{}", &id[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvx_core::hash_bytes;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ExperimentManager {
        ExperimentManager::new(
            Arc::new(LocalStorage::new(dir.path().join("refs"))),
            Arc::new(LocalStorage::new(dir.path())),
        )
    }

    fn state(weights: &str, loss: f64) -> (BTreeMap<String, ContentHash>, MetricRecord) {
        let outputs = [("model.pt".to_string(), hash_bytes(weights.as_bytes()))]
            .into_iter()
            .collect();
        let metrics = [("loss".to_string(), loss)].into_iter().collect();
        (outputs, metrics)
    }

    async fn record(m: &ExperimentManager, name: &str, step: Step, weights: &str, loss: f64) -> Checkpoint {
        let (outputs, metrics) = state(weights, loss);
        m.record(name, step, outputs, metrics, BTreeMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_generates_unique_names() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let a = m.start(None, None, None).await.unwrap();
        assert!(a.name.starts_with("exp-"));
        m.start(Some("baseline"), None, Some("train")).await.unwrap();
        assert!(matches!(
            m.start(Some("baseline"), None, None).await,
            Err(Error::ExperimentExists { .. })
        ));
        assert!(matches!(
            m.start(Some("bad name"), None, None).await,
            Err(Error::InvalidRefName { .. })
        ));
        assert_eq!(m.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_chain_is_append_only() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("e1"), None, None).await.unwrap();

        let c1 = record(&m, "e1", 1, "w1", 0.9).await;
        let c2 = record(&m, "e1", 2, "w2", 0.5).await;
        assert_eq!(c1.parent, None);
        assert_eq!(c2.parent, Some(c1.id.clone()));

        let chain = m.chain("e1").await.unwrap();
        assert_eq!(
            chain.iter().map(|c| c.step).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(m.resume("e1").await.unwrap().unwrap().id, c2.id);
    }

    #[tokio::test]
    async fn test_step_must_increase() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("e1"), None, None).await.unwrap();
        record(&m, "e1", 5, "w1", 0.9).await;

        let (outputs, metrics) = state("w2", 0.4);
        assert!(matches!(
            m.record("e1", 5, outputs, metrics, BTreeMap::new()).await,
            Err(Error::NonMonotonicStep { tip: 5, step: 5 })
        ));
    }

    #[tokio::test]
    async fn test_identical_state_is_not_recorded_twice() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("e1"), None, None).await.unwrap();
        let first = record(&m, "e1", 1, "w1", 0.9).await;
        let again = record(&m, "e1", 2, "w1", 0.9).await;
        assert_eq!(first.id, again.id);
        assert_eq!(m.chain("e1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_starts_new_chain() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("e1"), None, None).await.unwrap();
        let old = record(&m, "e1", 1, "w1", 0.9).await;

        m.reset("e1").await.unwrap();
        assert!(m.resume("e1").await.unwrap().is_none());

        let fresh = record(&m, "e1", 1, "w9", 0.7).await;
        assert_eq!(fresh.parent, None);
        assert_eq!(m.checkpoint(&old.id[..8]).await.unwrap().id, old.id);
    }

    #[tokio::test]
    async fn test_diff_between_experiments() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("a"), None, None).await.unwrap();
        m.start(Some("b"), None, None).await.unwrap();
        record(&m, "a", 1, "wa", 0.75).await;
        let cb = record(&m, "b", 1, "wb", 0.5).await;

        let diff = m.diff("a", "b").await.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].change, Some(-0.25));

        let by_id = m.diff("a", &cb.id[..10]).await.unwrap();
        assert_eq!(by_id, diff);
    }

    #[tokio::test]
    async fn test_gc_keeps_promoted_and_named() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        for name in ["keep", "drop", "promote"] {
            m.start(Some(name), None, None).await.unwrap();
        }
        let kept = record(&m, "keep", 1, "k", 0.1).await;
        let dropped = record(&m, "drop", 1, "d", 0.2).await;
        let promoted = record(&m, "promote", 1, "p", 0.3).await;
        m.promote("promote", "best").await.unwrap();

        let policy = GcPolicy {
            keep_workspace: false,
            keep_all_promoted: false,
            keep_names: vec!["keep".to_string()],
        };
        let (stats, hashes) = m.gc(&policy).await.unwrap();

        assert_eq!(stats.removed_experiments, 2);
        assert_eq!(stats.removed_checkpoints, 1);
        assert_eq!(stats.kept_checkpoints, 2);
        assert!(hashes.contains(&hash_bytes(b"k")));
        assert!(hashes.contains(&hash_bytes(b"p")));
        assert!(!hashes.contains(&hash_bytes(b"d")));

        assert!(m.checkpoint(&kept.id).await.is_ok());
        assert!(m.checkpoint(&promoted.id).await.is_ok());
        assert!(matches!(
            m.checkpoint(&dropped.id).await,
            Err(Error::CheckpointNotFound { .. })
        ));
        let shown = m.show().await.unwrap();
        assert!(shown.iter().any(|s| s.is_branch && s.reference.name == "best"));
    }

    #[tokio::test]
    async fn test_gc_workspace_keeps_experiments_from_baseline() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("a"), None, None).await.unwrap();
        record(&m, "a", 1, "a1", 0.4).await;
        m.promote("a", "best").await.unwrap();

        let baseline = m.refs().read_baseline().await.unwrap();
        let b = m.start(Some("b"), None, None).await.unwrap();
        assert_eq!(b.baseline, baseline);
        let from_baseline = record(&m, "b", 1, "b1", 0.3).await;

        m.start(Some("stray"), Some("elsewhere".to_string()), None)
            .await
            .unwrap();
        record(&m, "stray", 1, "s1", 0.9).await;

        let policy = GcPolicy {
            keep_workspace: true,
            keep_all_promoted: false,
            keep_names: Vec::new(),
        };
        let (stats, hashes) = m.gc(&policy).await.unwrap();

        assert_eq!(stats.removed_experiments, 1);
        let names: Vec<_> = m.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert!(names.contains(&"b".to_string()));
        assert!(!names.contains(&"stray".to_string()));
        assert!(m.checkpoint(&from_baseline.id).await.is_ok());
        assert!(hashes.contains(&hash_bytes(b"b1")));
        assert!(!hashes.contains(&hash_bytes(b"s1")));
    }

    #[tokio::test]
    async fn test_shared_record_keeps_first_experiment() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.start(Some("first"), None, Some("train")).await.unwrap();
        m.start(Some("second"), None, Some("tune")).await.unwrap();

        let original = record(&m, "first", 1, "same", 0.5).await;
        let shared = record(&m, "second", 1, "same", 0.5).await;
        assert_eq!(shared.id, original.id);
        assert_eq!(shared.experiment, "first");
        assert_eq!(m.get("second").await.unwrap().tip, Some(original.id.clone()));

        let reopened = manager(&dir);
        assert_eq!(reopened.load(&original.id).await.unwrap().experiment, "first");
    }
}
