//! Cache configuration

use anyhow::Result;
use dvx_core::Scheme;
use owo_colors::OwoColorize;

use crate::util;

/// Use a remote as the external cache for outputs of one scheme
pub async fn run_external(scheme: &str, remote: &str) -> Result<()> {
    let mut repo = util::open_repo()?;
    let scheme: Scheme = scheme.parse()?;
    repo.config().remote(remote)?;

    repo.update_config(|config| {
        config.cache.external.insert(scheme, remote.to_string());
    })?;

    println!(
        "External {} outputs are cached in {}",
        scheme.to_string().bold(),
        remote.cyan()
    );
    Ok(())
}
