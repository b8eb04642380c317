//! End-to-end experiments: checkpoint chains, promotion, apply and gc

use std::time::Duration;

use anyhow::Result;
use checkpoint::{ExperimentManager, ExperimentRunner, GcPolicy, RunOptions};
use tempfile::TempDir;
use tracking::{changed_only, Repo};

const PIPELINE: &str = r#"
stages:
  train:
    cmd: >-
      for i in 1 2 3; do
      echo "epoch $i lr $(cat lr.txt)" > model.bin;
      echo "{\"acc\": 0.$((i + 5))}" > metrics.json;
      touch "$DVX_CHECKPOINT_SIGNAL";
      while [ -e "$DVX_CHECKPOINT_SIGNAL" ]; do sleep 0.01; done;
      done
    deps: [lr.txt]
    outs:
      - model.bin:
          checkpoint: true
    metrics:
      - metrics.json:
          cache: false
"#;

async fn setup() -> Result<(TempDir, Repo, ExperimentManager)> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("dvx.yaml"), PIPELINE)?;
    std::fs::write(dir.path().join("lr.txt"), "0.1")?;
    let mut repo = Repo::init(dir.path())?;
    repo.update_config(|c| c.experiments.signal_poll_interval = Duration::from_millis(20))?;
    let manager = ExperimentManager::open(&repo).await?;
    Ok((dir, repo, manager))
}

async fn run(repo: &Repo, manager: &ExperimentManager, name: &str) -> Result<checkpoint::RunOutcome> {
    let stage = repo
        .pipeline()?
        .checkpoint_stage()?
        .ok_or_else(|| anyhow::anyhow!("no checkpoint stage"))?;
    let outcome = ExperimentRunner::new(repo, manager)
        .run(
            &stage,
            RunOptions {
                name: Some(name.to_string()),
                reset: true,
            },
        )
        .await?;
    Ok(outcome)
}

#[tokio::test]
async fn test_checkpoint_chain_and_diff() -> Result<()> {
    let (dir, repo, manager) = setup().await?;

    let first = run(&repo, &manager, "lr-small").await?;
    assert_eq!(first.checkpoints.len(), 3);

    std::fs::write(dir.path().join("lr.txt"), "0.5")?;
    let second = run(&repo, &manager, "lr-large").await?;
    assert_eq!(second.checkpoints.len(), 3);

    let chain = manager.chain("lr-small").await?;
    assert_eq!(chain.iter().map(|c| c.step).collect::<Vec<_>>(), vec![3, 2, 1]);
    assert!(chain.windows(2).all(|w| w[0].parent.as_deref() == Some(w[1].id.as_str())));

    // Same metrics, different outputs: the models differ by learning rate
    let diff = manager.diff("lr-small", "lr-large").await?;
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].key, "acc");
    assert_eq!(diff[0].change, Some(0.0));
    assert!(changed_only(diff).is_empty());
    assert_ne!(chain[0].outputs, second.checkpoints[2].outputs);
    Ok(())
}

#[tokio::test]
async fn test_apply_restores_checkpoint_and_starts_new_chain() -> Result<()> {
    let (dir, repo, manager) = setup().await?;
    let outcome = run(&repo, &manager, "base").await?;
    let middle = &outcome.checkpoints[1];

    let (applied_exp, applied) = manager.apply(&repo, &middle.id[..12], Some("from-2")).await?;
    assert_eq!(applied.id, middle.id);
    assert_eq!(applied_exp.applied_from.as_deref(), Some(middle.id.as_str()));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("model.bin"))?,
        "epoch 2 lr 0.1\n"
    );
    assert_eq!(manager.refs().read_baseline().await?, Some(middle.id.clone()));

    let resumed = manager.resume("from-2").await?;
    assert!(resumed.is_none());
    Ok(())
}

#[tokio::test]
async fn test_exp_gc_keeps_promoted_branches_and_their_objects() -> Result<()> {
    let (dir, repo, manager) = setup().await?;

    run(&repo, &manager, "keeper").await?;
    manager.promote("keeper", "best").await?;

    std::fs::write(dir.path().join("lr.txt"), "0.9")?;
    let throwaway = run(&repo, &manager, "throwaway").await?;

    let (stats, kept_hashes) = manager
        .gc(&GcPolicy {
            keep_workspace: false,
            keep_all_promoted: false,
            keep_names: Vec::new(),
        })
        .await?;
    assert_eq!(stats.removed_experiments, 2);
    assert_eq!(stats.removed_checkpoints, 3);
    assert_eq!(stats.kept_checkpoints, 3);

    let branches = manager.refs().list_branches().await?;
    assert_eq!(branches.len(), 1);
    assert!(branches[0].promoted);
    assert!(manager.list().await?.is_empty());

    let cache_stats = repo.gc(&kept_hashes).await?;
    assert!(cache_stats.removed >= 2);
    for checkpoint in &throwaway.checkpoints[..2] {
        for hash in checkpoint.outputs.values() {
            assert!(!repo.cache().contains(hash).await?);
        }
    }
    for hash in manager.referenced_hashes(false).await? {
        assert!(repo.cache().contains(&hash).await?);
    }
    Ok(())
}
