//! Checkpoint tracking for DVX experiments
//!
//! Checkpoints form append-only chains addressed by lightweight refs:
//! - `record`: checkpoint records and their binary framing
//! - `writer`: background task persisting records
//! - `refs`: experiment and branch refs under `.dvx/refs`
//! - `manager`: recording, resuming, applying, promoting and collecting
//! - `runner`: running a checkpoint stage with signal-file checkpoints

pub mod manager;
pub mod record;
pub mod refs;
pub mod runner;
pub mod writer;

pub use manager::{ExpGcStats, ExperimentManager, ExperimentSummary, GcPolicy};
pub use record::{Checkpoint, CheckpointStore, CHECKPOINT_DIR};
pub use refs::{ExperimentRef, RefKind, RefStore};
pub use runner::{
    signal_checkpoint, ExperimentRunner, RunOptions, RunOutcome, ENV_CHECKPOINT_SIGNAL,
    ENV_EXP_NAME, ENV_ROOT,
};
pub use writer::{AsyncCheckpointWriter, WriteRequest, WriterEvent};
