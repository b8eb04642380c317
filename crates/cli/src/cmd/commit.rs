//! Record the current content of tracked outputs

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::util;

pub async fn run() -> Result<()> {
    let repo = util::open_repo()?;
    let committed = repo.commit_all().await?;

    for output in &committed {
        let hash = output.hash.as_ref().map(|h| h.short().to_string()).unwrap_or_default();
        println!("  {} {}", hash.yellow(), output.path);
    }
    println!("{} {} outputs", "Committed".green(), committed.len());
    Ok(())
}
