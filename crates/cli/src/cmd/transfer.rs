//! Push, pull and fetch cached objects

use anyhow::{bail, Result};
use owo_colors::OwoColorize;

use crate::util;

pub async fn run_push(remote: Option<&str>) -> Result<()> {
    let repo = util::open_repo()?;
    let summary = repo.push(remote).await?;
    util::print_transfer("Pushed", &summary);
    if !summary.is_complete() {
        bail!("{} objects could not be pushed", summary.failed.len());
    }
    Ok(())
}

pub async fn run_fetch(remote: Option<&str>) -> Result<()> {
    let repo = util::open_repo()?;
    let summary = repo.fetch(remote).await?;
    util::print_transfer("Fetched", &summary);
    Ok(())
}

pub async fn run_pull(remote: Option<&str>) -> Result<()> {
    let repo = util::open_repo()?;
    let (summary, checkout) = repo.pull(remote).await?;
    util::print_transfer("Fetched", &summary);

    for path in &checkout.restored {
        println!("  {} {}", "restored".green(), path);
    }
    for (path, reason) in &checkout.skipped {
        println!("  {} {}: {}", "skipped".yellow(), path, reason.dimmed());
    }
    Ok(())
}
