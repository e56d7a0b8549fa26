//! Ordered write-behind queue.
//!
//! The in-memory cache is updated synchronously; persistence follows on a
//! single background task. Because one task drains one queue, batches apply
//! in exactly the order they were submitted, so two writes to the same key
//! can never land out of order.

use std::sync::Arc;

use strata_core::{StorageError, StrataResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{PersistentStore, WriteOp};

struct WriteJob {
    ops: Vec<WriteOp>,
    ack: Option<oneshot::Sender<StrataResult<()>>>,
    stop: bool,
}

/// Handle to the background writer. Cheap to clone; the task stops once
/// every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl StoreWriter {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn PersistentStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = if job.ops.is_empty() {
                    Ok(())
                } else {
                    store.apply(&job.ops).await
                };

                if let Err(e) = &result {
                    tracing::warn!(
                        error = %e,
                        operations = job.ops.len(),
                        "Write-behind batch failed; memory index stays authoritative"
                    );
                }

                if let Some(ack) = job.ack {
                    let _ = ack.send(result);
                }
                if job.stop {
                    break;
                }
            }
            tracing::debug!("Store writer stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a batch without waiting for it. Failures are logged.
    pub fn submit(&self, ops: Vec<WriteOp>) {
        if ops.is_empty() {
            return;
        }
        let job = WriteJob {
            ops,
            ack: None,
            stop: false,
        };
        if self.tx.send(job).is_err() {
            tracing::warn!("Store writer closed; dropping write batch");
        }
    }

    /// Queue a batch and wait until it has been applied.
    pub async fn submit_and_wait(&self, ops: Vec<WriteOp>) -> StrataResult<()> {
        self.send_and_wait(ops, false).await
    }

    async fn send_and_wait(&self, ops: Vec<WriteOp>, stop: bool) -> StrataResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteJob {
                ops,
                ack: Some(ack),
                stop,
            })
            .map_err(|_| StorageError::WriterClosed)?;
        done.await.map_err(|_| StorageError::WriterClosed)?
    }

    /// Wait until every batch submitted before this call has been applied.
    pub async fn flush(&self) -> StrataResult<()> {
        self.submit_and_wait(Vec::new()).await
    }

    /// Drain the queue and stop the task. Later submissions are dropped.
    pub async fn shutdown(&self) -> StrataResult<()> {
        self.send_and_wait(Vec::new(), true).await
    }
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
