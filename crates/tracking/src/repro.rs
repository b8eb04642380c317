//! Running pipeline stages

use std::path::Path;

use dvx_core::{Error, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::output::Output;
use crate::params::read_params;
use crate::pipeline::{stage_changed, LockFile, PipelineFile, Stage, StageLock, LOCK_FILE, PIPELINE_FILE};
use crate::repo::Repo;

/// What happened to one stage during `reproduce`
#[derive(Debug, Clone)]
pub struct ReproOutcome {
    pub stage: String,

    /// False when the stage was up to date
    pub ran: bool,

    pub lock: StageLock,
}

/// `sh -c <cmd>` in the workspace root
pub fn shell_command(cmd: &str, root: &Path) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).current_dir(root).kill_on_drop(true);
    command
}

/// Run a shell command to completion
pub async fn run_command(cmd: &str, root: &Path, envs: &[(&str, String)]) -> Result<()> {
    let mut command = shell_command(cmd, root);
    for (key, value) in envs {
        command.env(key, value);
    }
    debug!(cmd, "Running command");
    let status = command.status().await?;
    if !status.success() {
        return Err(Error::CommandFailed {
            cmd: cmd.to_string(),
            code: status.code(),
        });
    }
    Ok(())
}

impl Repo {
    /// The workspace's `dvx.yaml`
    pub fn pipeline(&self) -> Result<PipelineFile> {
        PipelineFile::load(&self.root().join(PIPELINE_FILE))
    }

    /// The workspace's `dvx.lock`
    pub fn lock_file(&self) -> Result<LockFile> {
        LockFile::load(&self.root().join(LOCK_FILE))
    }

    pub fn save_lock(&self, lock: &LockFile) -> Result<()> {
        lock.save(&self.root().join(LOCK_FILE))
    }

    async fn dependency_states(&self, stage: &Stage) -> Result<Vec<crate::output::Dependency>> {
        let mut deps = Vec::with_capacity(stage.deps.len());
        for path in &stage.deps {
            deps.push(self.dependency_state(path).await?);
        }
        Ok(deps)
    }

    /// Present state of a stage: dependency hashes, parameter values and
    /// output hashes as they are on disk
    pub async fn stage_state(&self, stage: &Stage) -> Result<StageLock> {
        let outputs: Vec<Output> = stage.all_outputs().cloned().collect();
        Ok(StageLock {
            cmd: stage.cmd.clone(),
            deps: self.dependency_states(stage).await?,
            params: read_params(self.root(), &stage.params)?,
            outs: self.current_outputs(&outputs).await?,
        })
    }

    /// Whether a stage differs from its lock entry
    pub async fn stage_changed(&self, stage: &Stage) -> Result<bool> {
        let lock = self.lock_file()?;
        let current = self.stage_state(stage).await?;
        Ok(stage_changed(lock.stages.get(&stage.name), &current))
    }

    /// Delete a stage's non-persistent workspace outputs before it runs
    pub async fn remove_outputs(&self, stage: &Stage) -> Result<()> {
        for output in stage.all_outputs() {
            if output.persist || output.is_external(self.root()) {
                continue;
            }
            let full = output.workspace_path(self.root());
            if full.is_dir() {
                tokio::fs::remove_dir_all(&full).await?;
            } else if full.exists() {
                tokio::fs::remove_file(&full).await?;
            }
        }
        Ok(())
    }

    /// Write a lock entry for a stage whose outputs were just committed
    pub async fn record_stage(&self, stage: &Stage, outs: Vec<Output>) -> Result<StageLock> {
        let entry = StageLock {
            cmd: stage.cmd.clone(),
            deps: self.dependency_states(stage).await?,
            params: read_params(self.root(), &stage.params)?,
            outs,
        };
        let mut lock = self.lock_file()?;
        lock.stages.insert(stage.name.clone(), entry.clone());
        self.save_lock(&lock)?;
        debug!(stage = %stage.name, "Updated lock file");
        Ok(entry)
    }

    /// Fail when a workspace dependency of `stage` is missing
    pub fn check_dependencies(&self, stage: &Stage) -> Result<()> {
        for dep in &stage.deps {
            if Output::new(dep.clone()).is_external(self.root()) {
                continue;
            }
            if !self.root().join(dep).exists() {
                return Err(Error::InvalidPipeline {
                    message: format!("dependency '{}' of stage '{}' does not exist", dep, stage.name),
                });
            }
        }
        Ok(())
    }

    /// Run one stage unconditionally and record it
    pub async fn run_stage(&self, stage: &Stage) -> Result<StageLock> {
        self.check_dependencies(stage)?;
        self.remove_outputs(stage).await?;

        info!(stage = %stage.name, cmd = %stage.cmd, "Running stage");
        run_command(&stage.cmd, self.root(), &[]).await?;

        let outputs: Vec<Output> = stage.all_outputs().cloned().collect();
        let committed = self.commit_outputs(&outputs).await?;
        let entry = self.record_stage(stage, committed).await?;
        self.save_state()?;
        Ok(entry)
    }

    /// Bring a stage and everything upstream of it up to date
    ///
    /// `force` reruns the target stage even when nothing changed.
    #[instrument(skip(self))]
    pub async fn reproduce(&self, target: &str, force: bool) -> Result<Vec<ReproOutcome>> {
        let pipeline = self.pipeline()?;
        let mut outcomes = Vec::new();

        for stage in pipeline.execution_order(Some(target))? {
            let forced = force && stage.name == target;
            if !forced && !self.stage_changed(&stage).await? {
                info!(stage = %stage.name, "Stage is up to date");
                let lock = self.lock_file()?.stages.remove(&stage.name).unwrap_or_default();
                outcomes.push(ReproOutcome {
                    stage: stage.name.clone(),
                    ran: false,
                    lock,
                });
                continue;
            }

            let lock = self.run_stage(&stage).await?;
            outcomes.push(ReproOutcome {
                stage: stage.name.clone(),
                ran: true,
                lock,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::OutputStatus;
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
stages:
  prepare:
    cmd: tr a-z A-Z < raw.txt > upper.txt
    deps: [raw.txt]
    outs: [upper.txt]
  count:
    cmd: wc -c < upper.txt > count.txt
    deps: [upper.txt]
    params: [threshold]
    metrics:
      - count.txt:
          cache: false
"#;

    fn setup() -> (TempDir, Repo) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dvx.yaml"), PIPELINE).unwrap();
        std::fs::write(dir.path().join("raw.txt"), "hello\n").unwrap();
        std::fs::write(dir.path().join("params.yaml"), "threshold: 3\n").unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_reproduce_runs_upstream_then_skips() {
        let (dir, repo) = setup();

        let outcomes = repo.reproduce("count", false).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.ran));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("upper.txt")).unwrap(),
            "HELLO\n"
        );

        let lock = repo.lock_file().unwrap();
        assert!(lock.stages["prepare"].outs[0].hash.is_some());
        assert_eq!(lock.stages["count"].params["params.yaml"].len(), 1);

        let again = repo.reproduce("count", false).await.unwrap();
        assert!(again.iter().all(|o| !o.ran));

        let status = repo.status().await.unwrap();
        assert!(status.iter().all(|s| s.status == OutputStatus::Unchanged));
    }

    #[tokio::test]
    async fn test_param_change_invalidates_stage() {
        let (dir, repo) = setup();
        repo.reproduce("count", false).await.unwrap();

        std::fs::write(dir.path().join("params.yaml"), "threshold: 4\n").unwrap();
        let outcomes = repo.reproduce("count", false).await.unwrap();
        assert!(!outcomes[0].ran);
        assert!(outcomes[1].ran);
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("dvx.yaml"),
            "stages:\n  broken:\n    cmd: exit 3\n",
        )
        .unwrap();
        let repo = Repo::init(dir.path()).unwrap();

        let result = repo.reproduce("broken", false).await;
        assert!(matches!(
            result,
            Err(Error::CommandFailed { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_dependency() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("dvx.yaml"),
            "stages:\n  s:\n    cmd: cat in.txt\n    deps: [in.txt]\n",
        )
        .unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        assert!(matches!(
            repo.reproduce("s", false).await,
            Err(Error::InvalidPipeline { .. })
        ));
    }
}
