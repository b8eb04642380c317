//! Reproduce a pipeline stage

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::util;

pub async fn run(stage: &str, force: bool) -> Result<()> {
    let repo = util::open_repo()?;
    let outcomes = repo.reproduce(stage, force).await?;

    for outcome in &outcomes {
        if outcome.ran {
            println!("  {} {}", "ran".green(), outcome.stage);
        } else {
            println!("  {} {}", "up to date".dimmed(), outcome.stage);
        }
    }
    Ok(())
}
