//! Experiment commands

use anyhow::{bail, Result};
use checkpoint::{ExperimentRunner, GcPolicy, RunOptions};
use owo_colors::OwoColorize;
use tracing::{debug, info};
use tracking::changed_only;

use crate::util;

/// Run a checkpoint stage as an experiment
pub async fn run_run(stage: Option<String>, name: Option<String>, reset: bool) -> Result<()> {
    let (repo, manager) = util::open_experiments().await?;
    let pipeline = repo.pipeline()?;

    let stage = match stage.or_else(|| repo.config().experiments.default_stage.clone()) {
        Some(stage) => pipeline.stage(&stage)?,
        None => match pipeline.checkpoint_stage()? {
            Some(stage) => stage,
            None => bail!("No stage with checkpoint outputs in the pipeline; name one explicitly"),
        },
    };

    info!(stage = %stage.name, reset, "Running experiment");
    let outcome = ExperimentRunner::new(&repo, &manager)
        .run(&stage, RunOptions { name, reset })
        .await?;

    for checkpoint in &outcome.checkpoints {
        let metrics: Vec<String> = checkpoint
            .metrics
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "  {} step {:<4} {}",
            checkpoint.short_id().yellow(),
            checkpoint.step,
            metrics.join(" ").dimmed()
        );
    }
    if outcome.interrupted {
        println!(
            "{} {} after {} checkpoints",
            "Interrupted".yellow(),
            outcome.experiment.cyan(),
            outcome.checkpoints.len()
        );
    } else {
        println!(
            "{} {} with {} new checkpoints",
            "Finished".green(),
            outcome.experiment.cyan(),
            outcome.checkpoints.len()
        );
    }
    Ok(())
}

/// Show experiments and branches with their tips
pub async fn run_show() -> Result<()> {
    let (_repo, manager) = util::open_experiments().await?;
    let rows = manager.show().await?;
    if rows.is_empty() {
        println!("{}", "No experiments yet".dimmed());
        return Ok(());
    }

    for row in rows {
        let name = if row.is_branch {
            format!("{} (branch)", row.reference.name).bold().to_string()
        } else {
            row.reference.name.cyan().to_string()
        };
        match &row.tip {
            Some(tip) => {
                println!(
                    "{} {} step {} ({} checkpoints)",
                    name,
                    tip.short_id().yellow(),
                    tip.step,
                    row.checkpoints
                );
                for (key, value) in &tip.metrics {
                    println!("    {:<24} {}", key, value);
                }
                for (key, value) in &tip.params {
                    println!("    {:<24} {}", key.dimmed(), value);
                }
            }
            None => println!("{} {}", name, "no checkpoints".dimmed()),
        }
    }
    Ok(())
}

/// List experiment names
pub async fn run_list() -> Result<()> {
    let (_repo, manager) = util::open_experiments().await?;
    for reference in manager.list().await? {
        let promoted = if reference.promoted {
            " (promoted)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("{}{}", reference.name, promoted);
    }
    Ok(())
}

/// Compare the metrics of two revisions
pub async fn run_diff(a: &str, b: &str, changed: bool) -> Result<()> {
    let (_repo, manager) = util::open_experiments().await?;
    let mut diffs = manager.diff(a, b).await?;
    let total = diffs.len();
    if changed {
        diffs = changed_only(diffs);
        debug!(total, changed = diffs.len(), "Filtered unchanged metrics");
    }
    if diffs.is_empty() {
        println!("{}", "No metrics to compare".dimmed());
        return Ok(());
    }

    println!("{:<28} {:>12} {:>12} {:>12}", "Metric".bold(), a, b, "Change");
    for diff in diffs {
        let change = match diff.change {
            Some(c) if c > 0.0 => format!("+{}", c).green().to_string(),
            Some(c) if c < 0.0 => c.to_string().red().to_string(),
            other => util::format_metric(other),
        };
        println!(
            "{:<28} {:>12} {:>12} {:>12}",
            diff.key,
            util::format_metric(diff.old),
            util::format_metric(diff.new),
            change
        );
    }
    Ok(())
}

/// Restore a checkpoint into the workspace
pub async fn run_apply(checkpoint: &str, name: Option<&str>) -> Result<()> {
    let (repo, manager) = util::open_experiments().await?;
    let (reference, applied) = manager.apply(&repo, checkpoint, name).await?;
    println!(
        "{} {} (step {}) as experiment {}",
        "Applied".green(),
        applied.short_id().yellow(),
        applied.step,
        reference.name.cyan()
    );
    Ok(())
}

/// Promote an experiment to a branch
pub async fn run_branch(experiment: &str, branch: &str) -> Result<()> {
    let (_repo, manager) = util::open_experiments().await?;
    let head = manager.promote(experiment, branch).await?;
    println!(
        "{} {} to branch {}",
        "Promoted".green(),
        experiment.cyan(),
        head.name.bold()
    );
    Ok(())
}

/// Remove experiments outside the keep set
pub async fn run_gc(workspace: bool, all: bool, keep: Vec<String>) -> Result<()> {
    if !workspace && !all && keep.is_empty() {
        bail!("Specify --workspace, --all or --keep <name>");
    }
    let (_repo, manager) = util::open_experiments().await?;

    let policy = GcPolicy {
        keep_workspace: !all,
        keep_all_promoted: !all,
        keep_names: keep,
    };
    let (stats, _) = manager.gc(&policy).await?;

    println!(
        "{} {} experiments and {} checkpoints ({} experiments kept)",
        "Removed".green(),
        stats.removed_experiments,
        stats.removed_checkpoints,
        stats.kept_experiments
    );
    println!("  Run {} to free cached objects", "dvx gc".bold());
    Ok(())
}
