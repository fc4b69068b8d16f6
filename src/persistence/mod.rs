//! Persistence
//!
//! Durable storage for retained messages and non-clean sessions behind the
//! [`StorageBackend`] trait:
//! - `FjallBackend` - local LSM-tree storage
//! - `MemoryBackend` - process memory, for tests and embedding
//!
//! The broker never writes on the hot path. It hands [`PersistenceOp`]s to
//! the [`PersistenceManager`], whose background task batches and commits
//! them.

mod backend;
mod error;
mod fjall;
mod memory;
mod models;


pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredInflight, StoredProperties, StoredPublish, StoredRetainedMessage,
    StoredSession, StoredSubscription, StoredWill,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 10_000;

/// Owns a backend and the background writer feeding it
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let writer = tokio::spawn(writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));
        Self {
            backend,
            tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Queue a write without waiting. A full channel drops the operation.
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("persistence channel unavailable, dropping operation: {}", e);
        }
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Stop the writer after it commits what is queued, then flush and
    /// close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down persistence");
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("persistence writer task failed: {}", e);
            }
        }
        self.backend.flush().await?;
        self.backend.close().await
    }
}

async fn commit(backend: &dyn StorageBackend, batch: &mut Vec<PersistenceOp>, why: &str) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    match backend.batch_write(std::mem::take(batch)).await {
        Ok(()) => debug!(count, why, "committed persistence batch"),
        Err(e) => error!(count, why, "failed to commit persistence batch: {}", e),
    }
}

async fn writer_loop(
    backend: Arc<dyn StorageBackend>,
    mut rx: mpsc::Receiver<PersistenceOp>,
    mut shutdown_rx: oneshot::Receiver<()>,
    flush_interval: Duration,
    max_batch_size: usize,
) {
    let mut batch = Vec::with_capacity(max_batch_size);
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            op = rx.recv() => match op {
                Some(op) => {
                    batch.push(op);
                    if batch.len() >= max_batch_size {
                        commit(&*backend, &mut batch, "full").await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => commit(&*backend, &mut batch, "interval").await,
            _ = &mut shutdown_rx => {
                rx.close();
                while let Some(op) = rx.recv().await {
                    batch.push(op);
                }
                break;
            }
        }
    }

    commit(&*backend, &mut batch, "shutdown").await;
    debug!("persistence writer exited");
}
