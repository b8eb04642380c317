//! Track a file, directory or external location

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::util;

pub async fn run(target: &str, external: bool) -> Result<()> {
    let repo = util::open_repo()?;

    let outcome = if external {
        repo.add_external(target).await?
    } else {
        repo.add(&util::absolute(Path::new(target))?).await?
    };

    let hash = outcome
        .output
        .hash
        .as_ref()
        .map(|h| h.short().to_string())
        .unwrap_or_default();
    println!(
        "{} {} {}",
        "Added".green(),
        outcome.output.path.cyan(),
        hash.yellow()
    );
    if let Some(size) = outcome.output.size {
        println!(
            "  {} stored, {} new objects",
            util::format_size(size),
            outcome.objects_written
        );
    }
    let tracking_file = outcome
        .tracking_file
        .strip_prefix(repo.root())
        .unwrap_or(&outcome.tracking_file);
    println!("  Commit {} to version this data", tracking_file.display().to_string().bold());
    Ok(())
}
