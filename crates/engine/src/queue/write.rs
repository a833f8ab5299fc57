//! Write queue.
//!
//! Serialises every vector-store commit behind a single writer task.
//! Transient store errors are retried with exponential backoff and
//! jitter; a permanent failure resolves that item's future with the
//! error and the queue moves on. Back-to-back appends may coalesce into
//! one transaction, but restart-recovery writes never mix with fresh
//! ones.

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::store::{ChunkRow, StoreError, VectorStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
  #[error("Commit failed after {attempts} attempts: {message}")]
  Exhausted { attempts: u32, message: String },
  #[error("Write queue shut down")]
  Closed,
}

/// One unit of work for the writer.
#[derive(Debug, Clone)]
pub enum WriteOp {
  /// Remove every chunk for a path. Precedes the first append of a new
  /// indexing run so stale chunks never coexist with fresh ones.
  Purge { path: String },
  /// Append rows for a path. `recovery` marks rows re-emitted after an
  /// embedder restart.
  Append {
    path: String,
    rows: Vec<ChunkRow>,
    recovery: bool,
  },
}

impl WriteOp {
  fn is_recovery(&self) -> bool {
    matches!(self, WriteOp::Append { recovery: true, .. })
  }
}

/// Commit target abstraction; the engine uses the store, tests inject
/// failure scripts.
#[async_trait]
pub trait ChunkCommitter: Send + Sync {
  async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError>;
}

/// Production committer backed by the vector store.
pub struct StoreCommitter {
  store: Arc<VectorStore>,
}

impl StoreCommitter {
  pub fn new(store: Arc<VectorStore>) -> Self {
    Self { store }
  }
}

#[async_trait]
impl ChunkCommitter for StoreCommitter {
  async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
    for op in ops {
      match op {
        WriteOp::Purge { path } => self.store.delete_chunks_for_path(path).await?,
        WriteOp::Append { rows, .. } => self.store.add_chunks(rows).await?,
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct WriteQueueConfig {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub max_attempts: u32,
  /// Maximum ops coalesced into one commit.
  pub max_coalesce: usize,
}

impl Default for WriteQueueConfig {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_millis(50),
      max_delay: Duration::from_secs(2),
      max_attempts: 5,
      max_coalesce: 8,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteQueueState {
  pub writing: bool,
  pub depth: usize,
}

#[derive(Default)]
struct SharedState {
  writing: AtomicBool,
  depth: AtomicUsize,
}

type Item = (WriteOp, oneshot::Sender<Result<(), WriteError>>);

enum Command {
  Enqueue(Item),
  WaitDrain(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WriteQueueHandle {
  tx: mpsc::Sender<Command>,
  shared: Arc<SharedState>,
}

impl WriteQueueHandle {
  /// Enqueue an op; the returned future resolves once the commit lands
  /// (or permanently fails).
  pub async fn enqueue(&self, op: WriteOp) -> Result<(), WriteError> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Enqueue((op, tx)))
      .await
      .map_err(|_| WriteError::Closed)?;
    rx.await.map_err(|_| WriteError::Closed)?
  }

  /// Fire-and-forget enqueue; the commit outcome is returned through the
  /// receiver without blocking the caller on the commit itself.
  pub async fn enqueue_detached(&self, op: WriteOp) -> Result<oneshot::Receiver<Result<(), WriteError>>, WriteError> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Enqueue((op, tx)))
      .await
      .map_err(|_| WriteError::Closed)?;
    Ok(rx)
  }

  pub fn state(&self) -> WriteQueueState {
    WriteQueueState {
      writing: self.shared.writing.load(Ordering::SeqCst),
      depth: self.shared.depth.load(Ordering::SeqCst),
    }
  }

  /// Resolves once the queue is empty and the writer idle.
  pub async fn wait_drain(&self) {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::WaitDrain(tx)).await.is_err() {
      return;
    }
    let _ = rx.await;
  }
}

pub struct WriteQueue;

impl WriteQueue {
  pub fn spawn(
    config: WriteQueueConfig,
    committer: Arc<dyn ChunkCommitter>,
    cancel: CancellationToken,
  ) -> WriteQueueHandle {
    let (tx, rx) = mpsc::channel(256);
    let shared = Arc::new(SharedState::default());
    tokio::spawn(run(config, committer, rx, shared.clone(), cancel));
    WriteQueueHandle { tx, shared }
  }
}

async fn run(
  config: WriteQueueConfig,
  committer: Arc<dyn ChunkCommitter>,
  mut rx: mpsc::Receiver<Command>,
  shared: Arc<SharedState>,
  cancel: CancellationToken,
) {
  debug!(max_attempts = config.max_attempts, "Write queue started");

  let mut pending: Vec<Item> = Vec::new();
  let mut drain_waiters: Vec<oneshot::Sender<()>> = Vec::new();

  loop {
    // Commit whatever is pending before blocking on new commands; the
    // single ownership of `pending` is the serialisation guarantee.
    if !pending.is_empty() {
      let batch = take_coalesced(&mut pending, config.max_coalesce);
      shared.depth.store(pending.len(), Ordering::SeqCst);
      shared.writing.store(true, Ordering::SeqCst);
      commit_with_retry(&config, committer.as_ref(), batch).await;
      shared.writing.store(false, Ordering::SeqCst);
      continue;
    }

    for waiter in drain_waiters.drain(..) {
      let _ = waiter.send(());
    }

    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!("Write queue cancelled");
        break;
      }

      command = rx.recv() => {
        match command {
          Some(Command::Enqueue(item)) => {
            pending.push(item);
            // Opportunistically pull whatever arrived back-to-back.
            while pending.len() < config.max_coalesce {
              match rx.try_recv() {
                Ok(Command::Enqueue(item)) => pending.push(item),
                Ok(Command::WaitDrain(reply)) => drain_waiters.push(reply),
                Err(_) => break,
              }
            }
            shared.depth.store(pending.len(), Ordering::SeqCst);
          }
          Some(Command::WaitDrain(reply)) => {
            let _ = reply.send(());
          }
          None => {
            debug!("Write queue handle dropped, stopping");
            break;
          }
        }
      }
    }
  }
}

/// Take a run of items that may share one transaction: recovery and
/// fresh writes never mix.
fn take_coalesced(pending: &mut Vec<Item>, max: usize) -> Vec<Item> {
  let first_recovery = pending[0].0.is_recovery();
  let mut end = 1;
  while end < pending.len() && end < max && pending[end].0.is_recovery() == first_recovery {
    end += 1;
  }
  pending.drain(..end).collect()
}

async fn commit_with_retry(config: &WriteQueueConfig, committer: &dyn ChunkCommitter, batch: Vec<Item>) {
  let ops: Vec<WriteOp> = batch.iter().map(|(op, _)| op.clone()).collect();
  let mut attempt = 0u32;

  loop {
    attempt += 1;
    match committer.commit(&ops).await {
      Ok(()) => {
        trace!(ops = ops.len(), attempt, "Commit succeeded");
        for (_, reply) in batch {
          let _ = reply.send(Ok(()));
        }
        return;
      }
      Err(e) if attempt < config.max_attempts => {
        let delay = backoff_delay(config, attempt);
        warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Commit failed, backing off");
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        warn!(error = %e, attempts = attempt, "Commit permanently failed");
        for (_, reply) in batch {
          let _ = reply.send(Err(WriteError::Exhausted {
            attempts: attempt,
            message: e.to_string(),
          }));
        }
        return;
      }
    }
  }
}

/// Exponential backoff with a cap and ±25% jitter.
fn backoff_delay(config: &WriteQueueConfig, attempt: u32) -> Duration {
  let exp = config.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
  let capped = exp.min(config.max_delay);

  let nanos = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.subsec_nanos() as u64)
    .unwrap_or(0);
  // Map jitter into [-25%, +25%] of the capped delay.
  let quarter = capped.as_millis() as u64 / 4;
  let jitter_ms = if quarter == 0 { 0 } else { nanos % (2 * quarter + 1) };
  let base_ms = (capped.as_millis() as u64).saturating_sub(quarter);

  Duration::from_millis(base_ms + jitter_ms)
}
