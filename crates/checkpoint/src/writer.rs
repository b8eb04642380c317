//! Background checkpoint writer
//!
//! Records are handed to a single writer task over a channel so recording a
//! checkpoint never blocks the runner's select loop on storage I/O.

use storage::BackendHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument};

use crate::record::Checkpoint;

/// Request to persist a checkpoint record
#[derive(Debug)]
pub struct WriteRequest {
    pub checkpoint: Checkpoint,

    /// Receives the outcome of this write
    pub respond_to: Option<oneshot::Sender<WriterEvent>>,
}

/// Event reported by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    /// Record written
    Completed {
        checkpoint_id: String,
        size_bytes: u64,
    },
    /// Record could not be written
    Failed {
        checkpoint_id: String,
        error: String,
    },
}

/// Async checkpoint writer task
pub struct AsyncCheckpointWriter {
    _task: tokio::task::JoinHandle<()>,
}

impl AsyncCheckpointWriter {
    /// Spawn a writer persisting records through `backend`
    ///
    /// Every outcome is also reported on `event_tx` when given.
    pub fn spawn(
        backend: BackendHandle,
        queue_depth: usize,
        event_tx: Option<mpsc::Sender<WriterEvent>>,
    ) -> (mpsc::Sender<WriteRequest>, Self) {
        let (tx, rx) = mpsc::channel::<WriteRequest>(queue_depth.max(1));
        let task = tokio::spawn(Self::writer_loop(backend, rx, event_tx));
        (tx, Self { _task: task })
    }

    async fn writer_loop(
        backend: BackendHandle,
        mut rx: mpsc::Receiver<WriteRequest>,
        event_tx: Option<mpsc::Sender<WriterEvent>>,
    ) {
        debug!("Checkpoint writer started");

        while let Some(request) = rx.recv().await {
            let checkpoint_id = request.checkpoint.id.clone();
            let event = match Self::write_checkpoint(&backend, &request.checkpoint).await {
                Ok(size_bytes) => WriterEvent::Completed {
                    checkpoint_id,
                    size_bytes,
                },
                Err(e) => {
                    error!(
                        checkpoint_id = %checkpoint_id,
                        error = %e,
                        "Failed to write checkpoint"
                    );
                    WriterEvent::Failed {
                        checkpoint_id,
                        error: e.to_string(),
                    }
                }
            };

            if let Some(events) = &event_tx {
                let _ = events.send(event.clone()).await;
            }
            if let Some(respond_to) = request.respond_to {
                let _ = respond_to.send(event);
            }
        }

        debug!("Checkpoint writer stopped");
    }

    #[instrument(skip(backend, checkpoint), fields(checkpoint_id = %checkpoint.id, step = checkpoint.step))]
    async fn write_checkpoint(backend: &BackendHandle, checkpoint: &Checkpoint) -> dvx_core::Result<u64> {
        let start = std::time::Instant::now();
        let data = checkpoint.encode()?;
        let size = backend
            .write(&Checkpoint::storage_path(&checkpoint.id), data)
            .await?;

        info!(
            checkpoint_id = checkpoint.short_id(),
            experiment = %checkpoint.experiment,
            size_bytes = size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint record written"
        );
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CheckpointStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use storage::LocalStorage;

    #[tokio::test]
    async fn test_write_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalStorage::new(dir.path()));
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let (write_tx, _writer) = AsyncCheckpointWriter::spawn(backend.clone(), 4, Some(event_tx));

        let checkpoint =
            Checkpoint::new("exp", None, 1, BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
                .unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        write_tx
            .send(WriteRequest {
                checkpoint: checkpoint.clone(),
                respond_to: Some(ack_tx),
            })
            .await
            .unwrap();

        let ack = ack_rx.await.unwrap();
        assert!(matches!(ack, WriterEvent::Completed { ref checkpoint_id, .. } if *checkpoint_id == checkpoint.id));
        assert_eq!(event_rx.recv().await.unwrap(), ack);

        let stored = CheckpointStore::new(backend).load(&checkpoint.id).await.unwrap();
        assert_eq!(stored, checkpoint);
    }
}
