//! Initialize a repository

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tracking::Repo;

pub async fn run() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let repo = Repo::init(&cwd)?;

    println!(
        "{} DVX repository in {}",
        "Initialized".green(),
        repo.root().display().to_string().cyan()
    );
    println!("  Track data with {}", "dvx add <path>".bold());
    Ok(())
}
