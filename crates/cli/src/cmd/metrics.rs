//! Show metrics files

use std::path::PathBuf;

use anyhow::Result;
use owo_colors::OwoColorize;
use tracking::load_metrics;

use crate::util;

pub async fn run_show(file: Option<PathBuf>) -> Result<()> {
    let repo = util::open_repo()?;

    let files: Vec<PathBuf> = match file {
        Some(file) => vec![util::absolute(&file)?],
        None => repo
            .pipeline()?
            .all_stages()?
            .iter()
            .flat_map(|stage| stage.metrics.iter())
            .map(|output| output.workspace_path(repo.root()))
            .collect(),
    };

    if files.is_empty() {
        println!("{}", "No metrics files declared".dimmed());
        return Ok(());
    }
    for path in files {
        let shown = path.strip_prefix(repo.root()).unwrap_or(&path).display().to_string();
        if !path.is_file() {
            println!("{} {}", shown.cyan(), "missing".red());
            continue;
        }
        println!("{}", shown.cyan());
        for (key, value) in load_metrics(&path)? {
            println!("    {:<28} {}", key, value);
        }
    }
    Ok(())
}
