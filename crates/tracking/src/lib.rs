//! Tracking - Content-addressed data tracking for DVX
//!
//! This crate provides:
//! - A content-addressed object cache over any storage backend
//! - Tracked outputs and `.dvx` tracking files, including external outputs
//!   stored in per-scheme external caches
//! - Pipeline stages (`dvx.yaml`), the lock file and stage execution
//! - Parameter, metrics and plots file readers
//! - Push/pull/fetch transfers with bounded concurrency
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use tracking::Repo;
//!
//! # async fn example() -> dvx_core::Result<()> {
//! let repo = Repo::open(Path::new("."))?;
//! let outcome = repo.add(Path::new("data/raw.csv")).await?;
//! println!("tracked as {}", outcome.tracking_file.display());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod metrics;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod repo;
pub mod repro;
pub mod state;
pub mod transfer;

pub use cache::{local_cache, CacheGcStats, ObjectCache};
pub use metrics::{changed_only, diff_metrics, flatten_metrics, load_metrics, load_plot_series};
pub use output::{Dependency, Output, TrackingFile, TRACKING_SUFFIX};
pub use params::{ParamRef, ParamValues, DEFAULT_PARAMS_FILE};
pub use pipeline::{LockFile, PipelineFile, Stage, StageLock, LOCK_FILE, PIPELINE_FILE};
pub use repo::{AddOutcome, CheckoutSummary, OutputStatus, Repo, StatusEntry, DVX_DIR};
pub use repro::{run_command, shell_command, ReproOutcome};
pub use state::HashState;
pub use transfer::{transfer, TransferSummary};
