//! Remote management

use anyhow::{bail, Result};
use dvx_core::RemoteConfig;
use owo_colors::OwoColorize;

use crate::util;

/// Add a remote
pub async fn run_add(
    name: &str,
    url: &str,
    default: bool,
    endpoint: Option<String>,
    region: Option<String>,
) -> Result<()> {
    let mut repo = util::open_repo()?;
    if repo.config().remotes.contains_key(name) {
        bail!("Remote '{}' already exists", name);
    }

    let mut remote = RemoteConfig::new(url);
    remote.scheme()?;
    remote.force_path_style = endpoint.is_some();
    remote.endpoint = endpoint;
    remote.region = region;

    repo.update_config(|config| {
        config.remotes.insert(name.to_string(), remote);
        if default || config.core.default_remote.is_none() {
            config.core.default_remote = Some(name.to_string());
        }
    })?;

    println!("{} remote {} -> {}", "Added".green(), name.cyan(), url);
    Ok(())
}

/// List configured remotes
pub async fn run_list() -> Result<()> {
    let repo = util::open_repo()?;
    let config = repo.config();

    if config.remotes.is_empty() {
        println!("{}", "No remotes configured".dimmed());
        return Ok(());
    }

    println!("{}", "Remotes:".bold());
    for (name, remote) in &config.remotes {
        let marker = if config.core.default_remote.as_deref() == Some(name.as_str()) {
            " (default)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {} {}{}", name.cyan(), remote.url.bright_blue(), marker);
    }
    Ok(())
}

/// Set the default remote
pub async fn run_default(name: &str) -> Result<()> {
    let mut repo = util::open_repo()?;
    repo.config().remote(name)?;
    repo.update_config(|config| config.core.default_remote = Some(name.to_string()))?;
    println!("Default remote is now {}", name.cyan());
    Ok(())
}
