//! Pipeline stage declarations (`dvx.yaml`) and the lock file (`dvx.lock`)
//!
//! ```yaml
//! stages:
//!   train:
//!     cmd: python train.py
//!     deps: [data/features.csv, train.py]
//!     params: [train.lr, {eval.yaml: [threshold]}]
//!     outs:
//!       - model.pt:
//!           checkpoint: true
//!     metrics: [metrics.json]
//!     plots: [plots/loss.json]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use dvx_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::output::{Dependency, Output};
use crate::params::{ParamRef, ParamValues};

/// Pipeline file name
pub const PIPELINE_FILE: &str = "dvx.yaml";

/// Lock file name
pub const LOCK_FILE: &str = "dvx.lock";

/// Options of an output entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutOptions {
    pub checkpoint: bool,
    pub cache: bool,
    pub persist: bool,
}

impl Default for OutOptions {
    fn default() -> Self {
        Self {
            checkpoint: false,
            cache: true,
            persist: false,
        }
    }
}

/// An entry of `outs`, `metrics` or `plots`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutSpec {
    /// Bare path with default options
    Path(String),

    /// `{path: {checkpoint: .., cache: .., persist: ..}}`
    WithOptions(BTreeMap<String, OutOptions>),
}

/// An entry of `params`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    /// Key in the default parameter file
    Key(String),

    /// `{file: [key, ..]}`
    File(BTreeMap<String, Vec<String>>),
}

/// A stage as written in `dvx.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDecl {
    pub cmd: String,

    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub params: Vec<ParamSpec>,

    #[serde(default)]
    pub outs: Vec<OutSpec>,

    #[serde(default)]
    pub metrics: Vec<OutSpec>,

    #[serde(default)]
    pub plots: Vec<OutSpec>,
}

/// Parsed `dvx.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub stages: BTreeMap<String, StageDecl>,
}

/// A resolved, validated stage
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub cmd: String,
    pub deps: Vec<String>,
    pub params: Vec<ParamRef>,
    pub outs: Vec<Output>,
    pub metrics: Vec<Output>,
    pub plots: Vec<Output>,
}

impl Stage {
    /// Every output of the stage: outs, metrics, then plots
    pub fn all_outputs(&self) -> impl Iterator<Item = &Output> {
        self.outs.iter().chain(&self.metrics).chain(&self.plots)
    }

    /// Outputs snapshotted on every checkpoint
    pub fn checkpoint_outputs(&self) -> Vec<Output> {
        self.all_outputs().filter(|o| o.checkpoint).cloned().collect()
    }

    /// Whether the stage produces checkpoints
    pub fn has_checkpoints(&self) -> bool {
        self.all_outputs().any(|o| o.checkpoint)
    }
}

fn resolve_outputs(specs: &[OutSpec]) -> Vec<Output> {
    let mut outputs = Vec::new();
    for spec in specs {
        match spec {
            OutSpec::Path(path) => outputs.push(Output::new(path.clone())),
            OutSpec::WithOptions(map) => {
                for (path, options) in map {
                    let mut output = Output::new(path.clone());
                    output.cache = options.cache;
                    output.checkpoint = options.checkpoint;
                    // A checkpoint output is resumed from, never deleted
                    output.persist = options.persist || options.checkpoint;
                    outputs.push(output);
                }
            }
        }
    }
    outputs
}

fn resolve_params(specs: &[ParamSpec]) -> Vec<ParamRef> {
    let mut params = Vec::new();
    for spec in specs {
        match spec {
            ParamSpec::Key(key) => params.push(ParamRef::new(key.clone())),
            ParamSpec::File(files) => {
                for (file, keys) in files {
                    params.extend(keys.iter().map(|key| ParamRef {
                        file: file.clone(),
                        key: key.clone(),
                    }));
                }
            }
        }
    }
    params
}

fn invalid(message: String) -> Error {
    Error::InvalidPipeline { message }
}

impl PipelineFile {
    /// Load `dvx.yaml`; a missing file is an empty pipeline
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => {
                let pipeline: PipelineFile = serde_yaml::from_slice(&data)?;
                pipeline.validate()?;
                debug!(stages = pipeline.stages.len(), "Loaded pipeline");
                Ok(pipeline)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Parse pipeline YAML text
    pub fn parse(text: &str) -> Result<Self> {
        let pipeline: PipelineFile = serde_yaml::from_str(text)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Check the declarations
    pub fn validate(&self) -> Result<()> {
        let mut seen_outputs: HashSet<String> = HashSet::new();

        for name in self.stages.keys() {
            let stage = self.resolve(name)?;
            if stage.cmd.trim().is_empty() {
                return Err(invalid(format!("stage '{}' has an empty cmd", name)));
            }

            for output in stage.all_outputs() {
                if !seen_outputs.insert(output.path.clone()) {
                    return Err(invalid(format!(
                        "output '{}' is declared more than once",
                        output.path
                    )));
                }
                if output.checkpoint && stage.deps.contains(&output.path) {
                    return Err(invalid(format!(
                        "checkpoint output '{}' of stage '{}' cannot also be a dependency",
                        output.path, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Stage> {
        let decl = self.stages.get(name).ok_or_else(|| Error::StageNotFound {
            stage: name.to_string(),
        })?;
        Ok(Stage {
            name: name.to_string(),
            cmd: decl.cmd.clone(),
            deps: decl.deps.clone(),
            params: resolve_params(&decl.params),
            outs: resolve_outputs(&decl.outs),
            metrics: resolve_outputs(&decl.metrics),
            plots: resolve_outputs(&decl.plots),
        })
    }

    /// Resolve a stage by name
    pub fn stage(&self, name: &str) -> Result<Stage> {
        self.resolve(name)
    }

    /// Every stage, in name order
    pub fn all_stages(&self) -> Result<Vec<Stage>> {
        self.stages.keys().map(|name| self.resolve(name)).collect()
    }

    /// Stages to run for `target`, upstream producers first
    ///
    /// A stage is upstream of another when it produces one of its deps.
    /// Without a target every stage is ordered.
    pub fn execution_order(&self, target: Option<&str>) -> Result<Vec<Stage>> {
        let stages = self.all_stages()?;
        let producers: BTreeMap<&str, &Stage> = stages
            .iter()
            .flat_map(|s| s.all_outputs().map(move |o| (o.path.as_str(), s)))
            .collect();

        let roots: Vec<&Stage> = match target {
            Some(name) => {
                let stage = stages.iter().find(|s| s.name == name).ok_or_else(|| {
                    Error::StageNotFound {
                        stage: name.to_string(),
                    }
                })?;
                vec![stage]
            }
            None => stages.iter().collect(),
        };

        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();
        for stage in roots {
            visit(stage, &producers, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    /// The only stage with checkpoint outputs, if exactly one exists
    pub fn checkpoint_stage(&self) -> Result<Option<Stage>> {
        let mut stages = self
            .all_stages()?
            .into_iter()
            .filter(Stage::has_checkpoints);
        match (stages.next(), stages.next()) {
            (Some(stage), None) => Ok(Some(stage)),
            _ => Ok(None),
        }
    }
}

fn visit(
    stage: &Stage,
    producers: &BTreeMap<&str, &Stage>,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<Stage>,
) -> Result<()> {
    if done.contains(&stage.name) {
        return Ok(());
    }
    if !visiting.insert(stage.name.clone()) {
        return Err(invalid(format!(
            "stage '{}' depends on its own outputs",
            stage.name
        )));
    }
    for dep in &stage.deps {
        if let Some(upstream) = producers.get(dep.as_str()) {
            visit(upstream, producers, visiting, done, order)?;
        }
    }
    visiting.remove(&stage.name);
    done.insert(stage.name.clone());
    order.push(stage.clone());
    Ok(())
}

/// Recorded state of one stage after a successful run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLock {
    pub cmd: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: ParamValues,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<Output>,
}

/// Parsed `dvx.lock`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    #[serde(default)]
    pub stages: BTreeMap<String, StageLock>,
}

impl LockFile {
    /// Load `dvx.lock`; a missing file is an empty lock
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_yaml::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write `dvx.lock`
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Every output recorded for any stage
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.stages.values().flat_map(|s| s.outs.iter())
    }
}

/// Whether a stage must run again
///
/// `current` is the stage's present state (hashes of deps and outs as they
/// are on disk now, current parameter values).
pub fn stage_changed(locked: Option<&StageLock>, current: &StageLock) -> bool {
    let Some(locked) = locked else {
        return true;
    };

    let out_hashes = |lock: &StageLock| {
        lock.outs
            .iter()
            .map(|o| (o.path.clone(), o.hash.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    let dep_hashes = |lock: &StageLock| {
        lock.deps
            .iter()
            .map(|d| (d.path.clone(), d.hash.clone()))
            .collect::<BTreeMap<_, _>>()
    };

    locked.cmd != current.cmd
        || locked.params != current.params
        || dep_hashes(locked) != dep_hashes(current)
        || out_hashes(locked) != out_hashes(current)
        || current.outs.iter().any(|o| o.hash.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvx_core::hash_bytes;

    const PIPELINE: &str = r#"
stages:
  prepare:
    cmd: python prepare.py
    deps: [data/raw.csv]
    outs: [data/features.csv]
  train:
    cmd: python train.py
    deps: [data/features.csv, train.py]
    params:
      - train.lr
      - eval.yaml: [threshold]
    outs:
      - model.pt:
          checkpoint: true
    metrics:
      - metrics.json:
          cache: false
    plots: [plots/loss.json]
"#;

    #[test]
    fn test_parse_pipeline() {
        let pipeline = PipelineFile::parse(PIPELINE).unwrap();
        assert_eq!(pipeline.stages.len(), 2);

        let train = pipeline.stage("train").unwrap();
        assert_eq!(train.cmd, "python train.py");
        assert_eq!(train.params.len(), 2);
        assert_eq!(train.params[1].file, "eval.yaml");

        let model = &train.outs[0];
        assert!(model.checkpoint);
        assert!(model.persist);
        assert!(model.cache);
        assert!(!train.metrics[0].cache);
        assert_eq!(train.checkpoint_outputs().len(), 1);
        assert_eq!(train.all_outputs().count(), 3);

        let checkpoint_stage = pipeline.checkpoint_stage().unwrap().unwrap();
        assert_eq!(checkpoint_stage.name, "train");
    }

    #[test]
    fn test_execution_order() {
        let pipeline = PipelineFile::parse(PIPELINE).unwrap();
        let order: Vec<String> = pipeline
            .execution_order(Some("train"))
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(order, vec!["prepare", "train"]);

        let only_prepare = pipeline.execution_order(Some("prepare")).unwrap();
        assert_eq!(only_prepare.len(), 1);
        assert_eq!(pipeline.execution_order(None).unwrap().len(), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let text = "stages:\n  a:\n    cmd: x\n    deps: [b.txt]\n    outs: [a.txt]\n  b:\n    cmd: y\n    deps: [a.txt]\n    outs: [b.txt]\n";
        let pipeline = PipelineFile::parse(text).unwrap();
        assert!(matches!(
            pipeline.execution_order(Some("a")),
            Err(Error::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_unknown_stage() {
        let pipeline = PipelineFile::parse(PIPELINE).unwrap();
        assert!(matches!(
            pipeline.stage("evaluate"),
            Err(Error::StageNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_cmd_rejected() {
        let result = PipelineFile::parse("stages:\n  s:\n    cmd: '  '\n");
        assert!(matches!(result, Err(Error::InvalidPipeline { .. })));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let text = "stages:\n  a:\n    cmd: x\n    outs: [o.txt]\n  b:\n    cmd: y\n    metrics: [o.txt]\n";
        assert!(matches!(
            PipelineFile::parse(text),
            Err(Error::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_checkpoint_output_cannot_be_dependency() {
        let text = "stages:\n  t:\n    cmd: x\n    deps: [model.pt]\n    outs:\n      - model.pt:\n          checkpoint: true\n";
        assert!(matches!(
            PipelineFile::parse(text),
            Err(Error::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_missing_pipeline_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineFile::load(&dir.path().join(PIPELINE_FILE)).unwrap();
        assert!(pipeline.stages.is_empty());
    }

    #[test]
    fn test_stage_changed() {
        let mut out = Output::new("model.pt");
        out.hash = Some(hash_bytes(b"v1"));
        let lock = StageLock {
            cmd: "python train.py".to_string(),
            deps: vec![Dependency {
                path: "train.py".to_string(),
                hash: Some(hash_bytes(b"code")),
            }],
            params: ParamValues::new(),
            outs: vec![out.clone()],
        };

        assert!(stage_changed(None, &lock));
        assert!(!stage_changed(Some(&lock), &lock));

        let mut edited = lock.clone();
        edited.deps[0].hash = Some(hash_bytes(b"new code"));
        assert!(stage_changed(Some(&lock), &edited));

        let mut missing_out = lock.clone();
        missing_out.outs[0].hash = None;
        assert!(stage_changed(Some(&lock), &missing_out));
    }

    #[test]
    fn test_lock_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let mut lock = LockFile::default();
        lock.stages.insert(
            "train".to_string(),
            StageLock {
                cmd: "python train.py".to_string(),
                ..Default::default()
            },
        );
        lock.save(&path).unwrap();
        assert_eq!(LockFile::load(&path).unwrap(), lock);
    }
}
