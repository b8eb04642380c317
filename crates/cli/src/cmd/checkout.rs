//! Restore tracked outputs from the cache

use std::path::PathBuf;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::util;

pub async fn run(target: Option<PathBuf>) -> Result<()> {
    let repo = util::open_repo()?;
    let target = target.map(|t| util::absolute(&t)).transpose()?;
    let summary = repo.checkout(target.as_deref()).await?;

    for path in &summary.restored {
        println!("  {} {}", "restored".green(), path);
    }
    for (path, reason) in &summary.skipped {
        println!("  {} {}: {}", "skipped".yellow(), path, reason.dimmed());
    }
    println!(
        "{} restored, {} unchanged",
        summary.restored.len(),
        summary.unchanged
    );
    Ok(())
}
