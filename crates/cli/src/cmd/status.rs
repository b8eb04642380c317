//! Show tracked outputs that need attention

use anyhow::Result;
use owo_colors::OwoColorize;
use tracking::OutputStatus;

use crate::util;

pub async fn run() -> Result<()> {
    let repo = util::open_repo()?;
    let entries = repo.status().await?;

    let changed: Vec<_> = entries
        .iter()
        .filter(|e| e.status != OutputStatus::Unchanged)
        .collect();
    if changed.is_empty() {
        println!("{}", "Data and pipelines are up to date.".green());
        return Ok(());
    }

    for entry in changed {
        let label = match entry.status {
            OutputStatus::Missing => entry.status.to_string().red().to_string(),
            OutputStatus::Modified => entry.status.to_string().yellow().to_string(),
            OutputStatus::NotInCache => entry.status.to_string().magenta().to_string(),
            OutputStatus::Unchanged => entry.status.to_string(),
        };
        println!("  {:<14} {}", label, entry.path);
    }
    Ok(())
}
