//! Shared helpers for commands

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use checkpoint::ExperimentManager;
use owo_colors::OwoColorize;
use tracing::debug;
use tracking::{Repo, TransferSummary};

/// Open the repository containing the current directory
pub fn open_repo() -> Result<Repo> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let repo = Repo::open(&cwd).context("Not inside a DVX repository (run 'dvx init')")?;
    debug!(root = %repo.root().display(), "Opened repository");
    Ok(repo)
}

/// Open the repository and its experiment manager
pub async fn open_experiments() -> Result<(Repo, ExperimentManager)> {
    let repo = open_repo()?;
    let manager = ExperimentManager::open(&repo).await?;
    Ok((repo, manager))
}

/// Resolve a command-line path against the current directory
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Format bytes in human-readable form
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format an optional metric value
pub fn format_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => "-".to_string(),
    }
}

pub fn print_transfer(verb: &str, summary: &TransferSummary) {
    println!(
        "{} {} objects ({}), {} already present",
        verb,
        summary.transferred.to_string().green(),
        format_size(summary.bytes),
        summary.skipped
    );
    for (hash, reason) in &summary.failed {
        println!("  {} {}: {}", "failed".red(), hash.short(), reason.dimmed());
    }
}
