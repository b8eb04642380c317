//! Remove cached objects nothing references

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::util;

pub async fn run(workspace_only: bool) -> Result<()> {
    let (repo, manager) = util::open_experiments().await?;

    let roots = manager.referenced_hashes(!workspace_only).await?;
    let stats = repo.gc(&roots).await?;

    println!(
        "{} {} objects, freed {} ({} kept)",
        "Removed".green(),
        stats.removed,
        util::format_size(stats.bytes_freed),
        stats.kept
    );
    Ok(())
}
