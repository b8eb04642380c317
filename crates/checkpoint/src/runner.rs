//! Running checkpointed stages as experiments
//!
//! The stage command runs as a child process. It asks for a checkpoint by
//! creating the file named in `DVX_CHECKPOINT_SIGNAL`; the runner commits
//! the checkpoint outputs, records a checkpoint and deletes the file as the
//! acknowledgement.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dvx_core::{ContentHash, Error, MetricRecord, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracking::params::{read_params, render_param_values};
use tracking::{load_metrics, shell_command, Output, Repo, Stage};

use crate::manager::ExperimentManager;
use crate::record::Checkpoint;

pub const ENV_EXP_NAME: &str = "DVX_EXP_NAME";
pub const ENV_CHECKPOINT_SIGNAL: &str = "DVX_CHECKPOINT_SIGNAL";
pub const ENV_ROOT: &str = "DVX_ROOT";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Experiment to run or continue; generated when absent
    pub name: Option<String>,

    /// Start a new chain instead of resuming from the tip
    pub reset: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub experiment: String,

    /// Checkpoints recorded during this run, oldest first
    pub checkpoints: Vec<Checkpoint>,

    /// True when the run was stopped with ctrl-c
    pub interrupted: bool,
}

/// Runs a checkpoint stage under an experiment
pub struct ExperimentRunner<'a> {
    repo: &'a Repo,
    manager: &'a ExperimentManager,
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(repo: &'a Repo, manager: &'a ExperimentManager) -> Self {
        Self { repo, manager }
    }

    fn signal_path(&self, experiment: &str) -> PathBuf {
        self.repo
            .tmp_dir()
            .join(format!("{}.checkpoint", experiment))
    }

    async fn prepare(&self, stage: &Stage, options: &RunOptions) -> Result<String> {
        let existing = match &options.name {
            Some(name) => match self.manager.get(name).await {
                Ok(reference) => Some(reference),
                Err(Error::ExperimentNotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let Some(reference) = existing else {
            let reference = self
                .manager
                .start(options.name.as_deref(), None, Some(&stage.name))
                .await?;
            return Ok(reference.name);
        };

        if options.reset {
            self.manager.reset(&reference.name).await?;
            for output in stage.checkpoint_outputs() {
                remove_path(&output.workspace_path(self.repo.root())).await?;
            }
        } else if let Some(tip) = self.manager.resume(&reference.name).await? {
            let restored = self.repo.restore_outputs(&tip.output_list()).await?;
            info!(
                experiment = %reference.name,
                checkpoint_id = tip.short_id(),
                step = tip.step,
                restored,
                "Resuming from checkpoint"
            );
        }
        Ok(reference.name)
    }

    /// Run `stage` until its command exits or ctrl-c
    pub async fn run(&self, stage: &Stage, options: RunOptions) -> Result<RunOutcome> {
        if !stage.has_checkpoints() {
            return Err(Error::InvalidPipeline {
                message: format!("stage '{}' has no checkpoint outputs", stage.name),
            });
        }

        let experiment = self.prepare(stage, &options).await?;
        self.repo.check_dependencies(stage)?;
        self.repo.remove_outputs(stage).await?;

        let signal = self.signal_path(&experiment);
        tokio::fs::create_dir_all(self.repo.tmp_dir()).await?;
        remove_path(&signal).await?;

        let mut command = shell_command(&stage.cmd, self.repo.root());
        command
            .env(ENV_EXP_NAME, &experiment)
            .env(ENV_CHECKPOINT_SIGNAL, &signal)
            .env(ENV_ROOT, self.repo.root());

        info!(experiment = %experiment, stage = %stage.name, cmd = %stage.cmd, "Running experiment");
        let mut child = command.spawn()?;

        let mut ticker = tokio::time::interval(self.repo.config().experiments.signal_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut checkpoints = Vec::new();
        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = ticker.tick() => {
                    if signal.exists() {
                        checkpoints.extend(self.take_checkpoint(stage, &experiment).await?);
                        remove_path(&signal).await?;
                    }
                }
                _ = &mut ctrl_c => {
                    warn!(experiment = %experiment, "Interrupted, stopping command");
                    child.kill().await?;
                    break None;
                }
            }
        };

        if signal.exists() {
            checkpoints.extend(self.take_checkpoint(stage, &experiment).await?);
            remove_path(&signal).await?;
        }

        let Some(status) = status else {
            self.repo.save_state()?;
            return Ok(RunOutcome {
                experiment,
                checkpoints,
                interrupted: true,
            });
        };

        if !status.success() {
            self.repo.save_state()?;
            return Err(Error::CommandFailed {
                cmd: stage.cmd.clone(),
                code: status.code(),
            });
        }

        checkpoints.extend(self.take_checkpoint(stage, &experiment).await?);
        let outputs: Vec<Output> = stage.all_outputs().cloned().collect();
        let committed = self.repo.commit_outputs(&outputs).await?;
        self.repo.record_stage(stage, committed).await?;
        self.repo.save_state()?;

        info!(
            experiment = %experiment,
            checkpoints = checkpoints.len(),
            "Experiment finished"
        );
        Ok(RunOutcome {
            experiment,
            checkpoints,
            interrupted: false,
        })
    }

    fn read_metrics(&self, stage: &Stage) -> Result<MetricRecord> {
        let present: Vec<&Output> = stage
            .metrics
            .iter()
            .filter(|m| m.workspace_path(self.repo.root()).is_file())
            .collect();

        let mut metrics = MetricRecord::new();
        for output in &present {
            let record = load_metrics(&output.workspace_path(self.repo.root()))?;
            for (key, value) in record {
                let key = if present.len() > 1 {
                    format!("{}:{}", output.path, key)
                } else {
                    key
                };
                metrics.insert(key, value);
            }
        }
        Ok(metrics)
    }

    /// Record the stage's current checkpoint outputs
    ///
    /// Returns `None` when nothing new was recorded.
    async fn take_checkpoint(&self, stage: &Stage, experiment: &str) -> Result<Option<Checkpoint>> {
        let present: Vec<Output> = stage
            .checkpoint_outputs()
            .into_iter()
            .filter(|o| o.workspace_path(self.repo.root()).exists())
            .collect();
        if present.is_empty() {
            warn!(experiment, "Checkpoint requested before any output exists");
            return Ok(None);
        }

        let outputs: BTreeMap<String, ContentHash> = self
            .repo
            .commit_outputs(&present)
            .await?
            .into_iter()
            .filter_map(|o| o.hash.map(|hash| (o.path, hash)))
            .collect();
        let metrics = self.read_metrics(stage)?;
        let params = render_param_values(&read_params(self.repo.root(), &stage.params)?);

        let tip = self.manager.resume(experiment).await?;
        let step = tip.as_ref().map_or(1, |t| t.step + 1);
        let checkpoint = self
            .manager
            .record(experiment, step, outputs, metrics, params)
            .await?;

        if tip.is_some_and(|t| t.id == checkpoint.id) {
            debug!(experiment, "No change since last checkpoint");
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }
}

async fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else if path.exists() {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Ask the runner for a checkpoint from inside a running stage
///
/// Creates the signal file and waits until the runner removes it.
pub async fn signal_checkpoint(signal: &Path, poll: Duration, timeout: Duration) -> Result<()> {
    tokio::fs::write(signal, b"").await?;
    let start = Instant::now();
    while signal.exists() {
        if start.elapsed() >= timeout {
            return Err(Error::Timeout {
                operation: format!("checkpoint signal {}", signal.display()),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(poll).await;
    }
    Ok(())
}
