//! End-to-end data tracking: add, push, pull, external outputs and gc

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use dvx_core::{RemoteConfig, Scheme};
use tempfile::TempDir;
use tracking::{OutputStatus, Repo, TrackingFile};

fn init_workspace() -> Result<(TempDir, Repo)> {
    let dir = TempDir::new()?;
    let repo = Repo::init(dir.path())?;
    Ok((dir, repo))
}

#[tokio::test]
async fn test_add_push_and_pull_into_fresh_clone() -> Result<()> {
    let (dir, mut repo) = init_workspace()?;
    let remote = TempDir::new()?;
    repo.update_config(|c| {
        c.remotes.insert(
            "origin".to_string(),
            RemoteConfig::new(remote.path().display().to_string()),
        );
        c.core.default_remote = Some("origin".to_string());
    })?;

    std::fs::create_dir_all(dir.path().join("data/images"))?;
    std::fs::write(dir.path().join("data/images/a.png"), b"aaaa")?;
    std::fs::write(dir.path().join("data/images/b.png"), b"bbbbbb")?;
    std::fs::write(dir.path().join("data/labels.csv"), b"a,1\nb,2\n")?;

    let outcome = repo.add(&dir.path().join("data")).await?;
    assert!(outcome.output.hash.as_ref().is_some_and(|h| h.is_dir()));
    assert!(dir.path().join("data.dvx").exists());

    let pushed = repo.push(None).await?;
    assert!(pushed.is_complete());
    assert_eq!(pushed.transferred, 4);

    // A second workspace sharing only the tracking and config files
    let clone = TempDir::new()?;
    let mut cloned = Repo::init(clone.path())?;
    cloned.update_config(|c| *c = repo.config().clone())?;
    std::fs::copy(dir.path().join("data.dvx"), clone.path().join("data.dvx"))?;

    let status = cloned.status().await?;
    assert_eq!(status[0].status, OutputStatus::Missing);

    let (fetched, checkout) = cloned.pull(None).await?;
    assert_eq!(fetched.transferred, 4);
    assert_eq!(checkout.restored, vec!["data".to_string()]);
    assert_eq!(
        std::fs::read(clone.path().join("data/images/b.png"))?,
        b"bbbbbb"
    );

    let status = cloned.status().await?;
    assert!(status.iter().all(|s| s.status == OutputStatus::Unchanged));
    Ok(())
}

#[tokio::test]
async fn test_pull_reports_objects_missing_on_remote() -> Result<()> {
    let (dir, mut repo) = init_workspace()?;
    let remote = TempDir::new()?;
    repo.update_config(|c| {
        c.remotes.insert(
            "origin".to_string(),
            RemoteConfig::new(remote.path().display().to_string()),
        );
        c.core.default_remote = Some("origin".to_string());
    })?;

    std::fs::write(dir.path().join("pushed.txt"), b"on the remote")?;
    repo.add(Path::new("pushed.txt")).await?;
    repo.push(None).await?;

    std::fs::write(dir.path().join("local.txt"), b"only here")?;
    repo.add(Path::new("local.txt")).await?;

    repo.cache().gc(&HashSet::new()).await?;
    std::fs::remove_file(dir.path().join("pushed.txt"))?;
    std::fs::remove_file(dir.path().join("local.txt"))?;

    let (fetched, checkout) = repo.pull(None).await?;
    assert_eq!(fetched.transferred, 1);
    assert_eq!(fetched.failed.len(), 1);
    assert_eq!(checkout.restored, vec!["pushed.txt".to_string()]);
    assert_eq!(checkout.skipped.len(), 1);
    assert_eq!(checkout.skipped[0].0, "local.txt");
    Ok(())
}

#[tokio::test]
async fn test_external_output_through_external_cache() -> Result<()> {
    let (dir, mut repo) = init_workspace()?;
    let outside = TempDir::new()?;
    let ext_cache = TempDir::new()?;

    let external_file = outside.path().join("warehouse.parquet");
    std::fs::write(&external_file, b"version one")?;

    repo.update_config(|c| {
        c.remotes.insert(
            "bigcache".to_string(),
            RemoteConfig::new(ext_cache.path().display().to_string()),
        );
        c.cache.external.insert(Scheme::Local, "bigcache".to_string());
    })?;

    let url = external_file.display().to_string();
    let outcome = repo.add_external(&url).await?;
    assert_eq!(outcome.objects_written, 1);
    assert_eq!(
        outcome.tracking_file,
        repo.root().join("warehouse.parquet.dvx")
    );
    let tracked = TrackingFile::load(&outcome.tracking_file)?;
    assert_eq!(tracked.outs[0].path, url);

    // Nothing of the external content lands in the local cache
    assert!(repo.cache().list_hashes().await?.is_empty());

    std::fs::write(&external_file, b"overwritten elsewhere")?;
    let summary = repo.checkout(None).await?;
    assert_eq!(summary.restored, vec![url.clone()]);
    assert_eq!(std::fs::read(&external_file)?, b"version one");

    let status = repo.status().await?;
    assert_eq!(status[0].status, OutputStatus::Unchanged);
    assert!(!dir.path().join("warehouse.parquet").exists());

    std::fs::write(&external_file, b"changed at the source")?;
    assert_eq!(repo.status().await?[0].status, OutputStatus::Modified);

    std::fs::remove_file(&external_file)?;
    assert_eq!(repo.status().await?[0].status, OutputStatus::Missing);

    // Restoring from the external cache brings it back
    repo.checkout(None).await?;
    assert_eq!(repo.status().await?[0].status, OutputStatus::Unchanged);
    Ok(())
}

#[tokio::test]
async fn test_external_dependency_is_hashed_not_cached() -> Result<()> {
    let (_dir, repo) = init_workspace()?;
    let outside = TempDir::new()?;
    let source = outside.path().join("source.csv");
    std::fs::write(&source, b"x,y\n")?;

    let dep = repo
        .track_external_dependency(&source.display().to_string())
        .await?;
    assert_eq!(dep.hash, Some(dvx_core::hash_bytes(b"x,y\n")));
    assert!(repo.cache().list_hashes().await?.is_empty());
    Ok(())
}
