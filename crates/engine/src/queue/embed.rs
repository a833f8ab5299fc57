//! Embedding queue.
//!
//! Owns per-file progress trackers and a cross-file FIFO of pending
//! chunks. Batches are drained under an item-count and character budget,
//! dispatched to embedder slots, and their vectors written through the
//! write queue, every row with its own chunk's metadata, never the
//! first chunk's. Batches checked out to a restarting slot return to the
//! head of the FIFO; a monotonic per-chunk sequence id prevents
//! duplication. A tracker survives completion until explicit cleanup so
//! progress can render 100%.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use async_trait::async_trait;
use ipc::FileProgress;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
  pool::PoolError,
  queue::write::{WriteOp, WriteQueueHandle},
  store::ChunkRow,
};

/// Slot provider for batch dispatch. The pool implements this; tests
/// supply scripted fakes.
#[async_trait]
pub trait EmbedderBackend: Send + Sync {
  /// Pick an eligible slot for the next batch.
  async fn checkout(&self) -> Result<usize, PoolError>;
  /// Run one batch on the given slot.
  async fn embed_on(&self, slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError>;
}

#[async_trait]
impl EmbedderBackend for crate::pool::EmbedderPool {
  async fn checkout(&self) -> Result<usize, PoolError> {
    // All slots may briefly be busy or restarting; poll for a while
    // before surfacing the failure, so a momentary gap does not bounce
    // the batch straight back into the FIFO.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(60);
    loop {
      match self.checkout().await {
        Ok(slot) => return Ok(slot),
        Err(_) if tokio::time::Instant::now() < deadline => {
          tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn embed_on(&self, slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError> {
    self.embed_with_id(texts, slot, false).await
  }
}

/// One chunk waiting for an embedding.
#[derive(Debug, Clone)]
pub struct PendingChunk {
  pub path: String,
  pub text: String,
  pub offset: u64,
  pub page: Option<i32>,
  pub title: Option<String>,
  pub mtime: i64,
  pub file_index: usize,
  /// Monotonic sequence id; compared on re-enqueue so restart recovery
  /// never duplicates a chunk.
  pub seq: u64,
  /// Set when the chunk was returned to the FIFO by a restart.
  pub recovery: bool,
}

#[derive(Debug, Clone)]
pub struct EmbedQueueConfig {
  /// Maximum items per batch.
  pub batch_size: usize,
  /// Character budget per batch.
  pub max_chars_per_batch: usize,
  /// Pending chunks at or above this ask upstream to pause.
  pub backpressure_threshold: usize,
  /// Batches allowed in flight at once.
  pub max_in_flight: usize,
}

impl Default for EmbedQueueConfig {
  fn default() -> Self {
    Self {
      batch_size: 16,
      max_chars_per_batch: 8_000,
      backpressure_threshold: 256,
      max_in_flight: 4,
    }
  }
}

/// Input for `add_chunks`: one chunk of one file.
#[derive(Debug, Clone)]
pub struct ChunkInput {
  pub text: String,
  pub offset: u64,
  pub page: Option<i32>,
  pub title: Option<String>,
  pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedQueueStats {
  pub pending: usize,
  pub in_flight_batches: usize,
  pub trackers: usize,
}

struct Tracker {
  total: u64,
  processed: u64,
  error: Option<String>,
  waiters: Vec<oneshot::Sender<Result<(), String>>>,
}

impl Tracker {
  fn is_complete(&self) -> bool {
    self.processed >= self.total
  }

  fn settle_waiters(&mut self) {
    if let Some(error) = &self.error {
      for waiter in self.waiters.drain(..) {
        let _ = waiter.send(Err(error.clone()));
      }
    } else if self.is_complete() {
      for waiter in self.waiters.drain(..) {
        let _ = waiter.send(Ok(()));
      }
    }
  }
}

struct CheckedOut {
  slot: Option<usize>,
  chunks: Vec<PendingChunk>,
}

enum Command {
  AddChunks {
    path: String,
    file_index: usize,
    chunks: Vec<ChunkInput>,
  },
  WaitForCompletion {
    path: String,
    reply: oneshot::Sender<Result<(), String>>,
  },
  EmbedderRestart(usize),
  Trackers(oneshot::Sender<Vec<FileProgress>>),
  CleanupTracker(String),
  CleanupCompleted,
  Clear,
  Stats(oneshot::Sender<EmbedQueueStats>),
}

enum Event {
  Started(u64, usize),
  Finished(u64, Result<Vec<Vec<f32>>, PoolError>),
  Written {
    batch_id: u64,
    per_file: Vec<(String, u64)>,
    result: Result<(), String>,
  },
}

#[derive(Clone)]
pub struct EmbedQueueHandle {
  tx: mpsc::Sender<Command>,
  pending_count: Arc<AtomicUsize>,
  backpressure_threshold: usize,
}

impl EmbedQueueHandle {
  /// Register a file's chunks and start tracking its progress.
  pub async fn add_chunks(&self, path: String, file_index: usize, chunks: Vec<ChunkInput>) {
    let _ = self.tx.send(Command::AddChunks { path, file_index, chunks }).await;
  }

  /// Future resolving once every chunk of `path` is embedded and its
  /// last write accepted.
  pub async fn wait_for_completion(&self, path: String) -> Result<(), String> {
    let (tx, rx) = oneshot::channel();
    self
      .tx
      .send(Command::WaitForCompletion { path, reply: tx })
      .await
      .map_err(|_| "embedding queue closed".to_string())?;
    rx.await.map_err(|_| "embedding queue closed".to_string())?
  }

  /// Recovery hook wired to the pool's restart callback.
  pub fn on_embedder_restart(&self, slot: usize) {
    let _ = self.tx.try_send(Command::EmbedderRestart(slot));
  }

  /// True when upstream producers should await a drain before adding
  /// more chunks.
  pub fn should_apply_backpressure(&self) -> bool {
    self.pending_count.load(Ordering::Relaxed) >= self.backpressure_threshold
  }

  pub async fn file_trackers(&self) -> Vec<FileProgress> {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::Trackers(tx)).await.is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }

  pub async fn cleanup_file_tracker(&self, path: String) {
    let _ = self.tx.send(Command::CleanupTracker(path)).await;
  }

  /// Drop trackers of files that have fully completed.
  pub async fn cleanup_completed(&self) {
    let _ = self.tx.send(Command::CleanupCompleted).await;
  }

  pub async fn clear(&self) {
    let _ = self.tx.send(Command::Clear).await;
  }

  pub async fn stats(&self) -> EmbedQueueStats {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::Stats(tx)).await.is_err() {
      return EmbedQueueStats::default();
    }
    rx.await.unwrap_or_default()
  }

  /// Resolves once the FIFO is empty and nothing is in flight.
  pub async fn wait_drain(&self) {
    loop {
      let stats = self.stats().await;
      if stats.pending == 0 && stats.in_flight_batches == 0 {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
  }
}

pub struct EmbedQueue {
  config: EmbedQueueConfig,
  backend: Arc<dyn EmbedderBackend>,
  write_queue: WriteQueueHandle,

  fifo: VecDeque<PendingChunk>,
  fifo_seqs: HashSet<u64>,
  next_seq: u64,
  next_batch_id: u64,
  trackers: HashMap<String, Tracker>,
  checked_out: HashMap<u64, CheckedOut>,
  /// Batches whose chunks were already re-enqueued; late results for
  /// these ids are dropped.
  aborted: HashSet<u64>,
  pending_count: Arc<AtomicUsize>,
}

impl EmbedQueue {
  /// Spawn the queue task. The backend (the embedder pool) is passed in
  /// here rather than held by construction to keep the pool/queue
  /// relationship acyclic.
  pub fn spawn(
    config: EmbedQueueConfig,
    backend: Arc<dyn EmbedderBackend>,
    write_queue: WriteQueueHandle,
    cancel: CancellationToken,
  ) -> EmbedQueueHandle {
    let pending_count = Arc::new(AtomicUsize::new(0));
    let handle = EmbedQueueHandle {
      tx: {
        let (tx, rx) = mpsc::channel(256);
        let queue = Self {
          config: config.clone(),
          backend,
          write_queue,
          fifo: VecDeque::new(),
          fifo_seqs: HashSet::new(),
          next_seq: 0,
          next_batch_id: 0,
          trackers: HashMap::new(),
          checked_out: HashMap::new(),
          aborted: HashSet::new(),
          pending_count: pending_count.clone(),
        };
        tokio::spawn(queue.run(rx, cancel));
        tx
      },
      pending_count,
      backpressure_threshold: config.backpressure_threshold,
    };
    handle
  }

  fn sync_pending_count(&self) {
    self.pending_count.store(self.fifo.len(), Ordering::Relaxed);
  }

  /// Drain one batch under the count and character budgets.
  fn next_batch(&mut self) -> Option<Vec<PendingChunk>> {
    if self.fifo.is_empty() {
      return None;
    }

    let mut batch = Vec::new();
    let mut chars = 0usize;
    while let Some(chunk) = self.fifo.front() {
      if !batch.is_empty() && (batch.len() >= self.config.batch_size || chars + chunk.text.len() > self.config.max_chars_per_batch) {
        break;
      }
      let chunk = self.fifo.pop_front().expect("front just checked");
      self.fifo_seqs.remove(&chunk.seq);
      chars += chunk.text.len();
      batch.push(chunk);
    }

    self.sync_pending_count();
    Some(batch)
  }

  /// Dispatch batches while slots and the in-flight budget allow.
  fn dispatch(&mut self, events: &mpsc::Sender<Event>) {
    while self.checked_out.len() < self.config.max_in_flight {
      let Some(batch) = self.next_batch() else { break };
      let batch_id = self.next_batch_id;
      self.next_batch_id += 1;

      let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
      trace!(batch_id, chunks = batch.len(), "Dispatching embedding batch");

      self.checked_out.insert(batch_id, CheckedOut { slot: None, chunks: batch });

      let backend = self.backend.clone();
      let events = events.clone();
      tokio::spawn(async move {
        let slot = match backend.checkout().await {
          Ok(slot) => slot,
          Err(e) => {
            let _ = events.send(Event::Finished(batch_id, Err(e))).await;
            return;
          }
        };
        let _ = events.send(Event::Started(batch_id, slot)).await;
        let result = backend.embed_on(slot, texts).await;
        let _ = events.send(Event::Finished(batch_id, result)).await;
      });
    }
  }

  /// Return a batch's chunks to the head of the FIFO, skipping any
  /// sequence id already pending.
  fn requeue(&mut self, chunks: Vec<PendingChunk>) {
    for mut chunk in chunks.into_iter().rev() {
      if self.fifo_seqs.contains(&chunk.seq) {
        trace!(seq = chunk.seq, "Skipping duplicate chunk on re-enqueue");
        continue;
      }
      chunk.recovery = true;
      self.fifo_seqs.insert(chunk.seq);
      self.fifo.push_front(chunk);
    }
    self.sync_pending_count();
  }

  fn fail_file(&mut self, path: &str, error: String) {
    if let Some(tracker) = self.trackers.get_mut(path) {
      tracker.error = Some(error);
      tracker.settle_waiters();
    }
  }

  /// Send a finished batch's rows to the write queue, one append per
  /// file, each row built from its own chunk's metadata.
  fn write_batch(&mut self, batch_id: u64, chunks: Vec<PendingChunk>, vectors: Vec<Vec<f32>>, events: &mpsc::Sender<Event>) {
    if vectors.len() != chunks.len() {
      warn!(
        batch_id,
        chunks = chunks.len(),
        vectors = vectors.len(),
        "Embedder returned wrong vector count, re-enqueueing batch"
      );
      self.requeue(chunks);
      return;
    }

    // Group rows per file, preserving chunk order.
    let mut per_file: Vec<(String, Vec<ChunkRow>, bool)> = Vec::new();
    for (chunk, vector) in chunks.into_iter().zip(vectors) {
      let row = ChunkRow {
        id: ChunkRow::derive_id(&chunk.path, chunk.offset),
        path: chunk.path.clone(),
        text: chunk.text,
        offset: chunk.offset,
        page: chunk.page,
        chunk_type: "text".to_string(),
        title: chunk.title,
        mtime: chunk.mtime,
        vector,
      };
      match per_file.iter_mut().find(|(path, _, _)| *path == chunk.path) {
        Some((_, rows, recovery)) => {
          rows.push(row);
          *recovery = *recovery || chunk.recovery;
        }
        None => per_file.push((chunk.path, vec![row], chunk.recovery)),
      }
    }

    let write_queue = self.write_queue.clone();
    let events = events.clone();
    tokio::spawn(async move {
      let mut accepted = Vec::new();
      let mut failures: Vec<(String, String)> = Vec::new();

      for (path, rows, recovery) in per_file {
        let count = rows.len() as u64;
        let op = WriteOp::Append {
          path: path.clone(),
          rows,
          recovery,
        };
        match write_queue.enqueue(op).await {
          Ok(()) => accepted.push((path, count)),
          Err(e) => failures.push((path, e.to_string())),
        }
      }

      // A sibling file failing its write never blocks the files whose
      // writes landed; failures are attributed per file.
      if !accepted.is_empty() {
        let _ = events
          .send(Event::Written {
            batch_id,
            per_file: accepted,
            result: Ok(()),
          })
          .await;
      }
      for (path, error) in failures {
        let _ = events
          .send(Event::Written {
            batch_id,
            per_file: vec![(path, 0)],
            result: Err(error),
          })
          .await;
      }
    });
  }

  fn handle_event(&mut self, event: Event, events: &mpsc::Sender<Event>) {
    match event {
      Event::Started(batch_id, slot) => {
        if let Some(entry) = self.checked_out.get_mut(&batch_id) {
          entry.slot = Some(slot);
        }
      }
      Event::Finished(batch_id, result) => {
        if self.aborted.remove(&batch_id) {
          trace!(batch_id, "Dropping result of aborted batch");
          return;
        }
        let Some(entry) = self.checked_out.remove(&batch_id) else {
          return;
        };
        match result {
          Ok(vectors) => self.write_batch(batch_id, entry.chunks, vectors, events),
          Err(e) => {
            debug!(batch_id, error = %e, "Embedding batch failed, re-enqueueing");
            self.requeue(entry.chunks);
          }
        }
        self.dispatch(events);
      }
      Event::Written {
        per_file, result, ..
      } => {
        match result {
          Ok(()) => {
            for (path, count) in per_file {
              if let Some(tracker) = self.trackers.get_mut(&path) {
                tracker.processed += count;
                tracker.settle_waiters();
              }
            }
          }
          Err(error) => {
            for (path, _) in per_file {
              warn!(path = %path, error = %error, "Write rejected, failing file");
              self.fail_file(&path, error.clone());
            }
          }
        }
        self.dispatch(events);
      }
    }
  }

  fn handle_command(&mut self, command: Command, events: &mpsc::Sender<Event>) {
    match command {
      Command::AddChunks { path, file_index, chunks } => {
        trace!(path = %path, chunks = chunks.len(), file_index, "Chunks added to embedding queue");
        self.trackers.insert(
          path.clone(),
          Tracker {
            total: chunks.len() as u64,
            processed: 0,
            error: None,
            waiters: Vec::new(),
          },
        );

        for input in chunks {
          let seq = self.next_seq;
          self.next_seq += 1;
          self.fifo_seqs.insert(seq);
          self.fifo.push_back(PendingChunk {
            path: path.clone(),
            text: input.text,
            offset: input.offset,
            page: input.page,
            title: input.title,
            mtime: input.mtime,
            file_index,
            seq,
            recovery: false,
          });
        }
        self.sync_pending_count();
        self.dispatch(events);
      }
      Command::WaitForCompletion { path, reply } => match self.trackers.get_mut(&path) {
        Some(tracker) => {
          tracker.waiters.push(reply);
          tracker.settle_waiters();
        }
        None => {
          let _ = reply.send(Err(format!("no tracker for {path}")));
        }
      },
      Command::EmbedderRestart(slot) => {
        let affected: Vec<u64> = self
          .checked_out
          .iter()
          .filter(|(_, entry)| entry.slot == Some(slot))
          .map(|(id, _)| *id)
          .collect();

        debug!(slot, batches = affected.len(), "Recovering batches from restarted slot");
        for batch_id in affected {
          if let Some(entry) = self.checked_out.remove(&batch_id) {
            self.aborted.insert(batch_id);
            self.requeue(entry.chunks);
          }
        }
        self.dispatch(events);
      }
      Command::Trackers(reply) => {
        let trackers = self
          .trackers
          .iter()
          .map(|(path, t)| FileProgress {
            path: path.clone(),
            total_chunks: t.total,
            processed_chunks: t.processed,
          })
          .collect();
        let _ = reply.send(trackers);
      }
      Command::CleanupTracker(path) => {
        self.trackers.remove(&path);
      }
      Command::CleanupCompleted => {
        self
          .trackers
          .retain(|_, t| !(t.is_complete() && t.error.is_none()) || !t.waiters.is_empty());
      }
      Command::Clear => {
        debug!(pending = self.fifo.len(), "Clearing embedding queue");
        for chunk in self.fifo.drain(..) {
          if let Some(tracker) = self.trackers.get_mut(&chunk.path)
            && tracker.error.is_none()
            && !tracker.is_complete()
          {
            tracker.error = Some("cleared".to_string());
            tracker.settle_waiters();
          }
        }
        self.fifo_seqs.clear();
        self.sync_pending_count();
      }
      Command::Stats(reply) => {
        let _ = reply.send(EmbedQueueStats {
          pending: self.fifo.len(),
          in_flight_batches: self.checked_out.len(),
          trackers: self.trackers.len(),
        });
      }
    }
  }

  async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
    debug!(
      batch_size = self.config.batch_size,
      max_chars = self.config.max_chars_per_batch,
      "Embedding queue started"
    );

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!("Embedding queue cancelled");
          break;
        }

        command = rx.recv() => {
          match command {
            Some(command) => self.handle_command(command, &event_tx),
            None => {
              debug!("Embedding queue handle dropped, stopping");
              break;
            }
          }
        }

        event = event_rx.recv() => {
          if let Some(event) = event {
            self.handle_event(event, &event_tx);
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::Mutex,
    time::Duration,
  };

  use tokio::sync::Notify;

  use super::*;
  use crate::queue::write::{ChunkCommitter, WriteQueue, WriteQueueConfig};
  use crate::store::StoreError;

  /// Committer recording every appended row.
  #[derive(Default)]
  struct RecordingCommitter {
    rows: Mutex<Vec<ChunkRow>>,
  }

  #[async_trait]
  impl ChunkCommitter for RecordingCommitter {
    async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
      let mut rows = self.rows.lock().unwrap();
      for op in ops {
        if let WriteOp::Append { rows: batch, .. } = op {
          rows.extend(batch.iter().cloned());
        }
      }
      Ok(())
    }
  }

  /// Backend that embeds instantly: vector = [text length].
  struct InstantBackend;

  #[async_trait]
  impl EmbedderBackend for InstantBackend {
    async fn checkout(&self) -> Result<usize, PoolError> {
      Ok(0)
    }

    async fn embed_on(&self, _slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError> {
      Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
    }
  }

  /// Backend whose first batch blocks until released, for restart tests.
  struct BlockingBackend {
    gate: Notify,
    released: std::sync::atomic::AtomicBool,
    calls: AtomicUsize,
  }

  impl BlockingBackend {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        gate: Notify::new(),
        released: std::sync::atomic::AtomicBool::new(false),
        calls: AtomicUsize::new(0),
      })
    }

    fn release(&self) {
      self.released.store(true, Ordering::SeqCst);
      self.gate.notify_waiters();
    }
  }

  #[async_trait]
  impl EmbedderBackend for BlockingBackend {
    async fn checkout(&self) -> Result<usize, PoolError> {
      Ok(0)
    }

    async fn embed_on(&self, _slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError> {
      if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
        // First batch hangs until the test releases it.
        while !self.released.load(Ordering::SeqCst) {
          self.gate.notified().await;
        }
      }
      Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
    }
  }

  fn chunk(text: &str, offset: u64) -> ChunkInput {
    ChunkInput {
      text: text.to_string(),
      offset,
      page: None,
      title: None,
      mtime: 0,
    }
  }

  fn spawn_queue(
    config: EmbedQueueConfig,
    backend: Arc<dyn EmbedderBackend>,
  ) -> (EmbedQueueHandle, Arc<RecordingCommitter>) {
    let committer = Arc::new(RecordingCommitter::default());
    let write_queue = WriteQueue::spawn(
      WriteQueueConfig::default(),
      committer.clone(),
      CancellationToken::new(),
    );
    let handle = EmbedQueue::spawn(config, backend, write_queue, CancellationToken::new());
    (handle, committer)
  }

  #[tokio::test]
  async fn test_cross_file_batch_keeps_own_metadata() {
    let (handle, committer) = spawn_queue(EmbedQueueConfig::default(), Arc::new(InstantBackend));

    handle
      .add_chunks("/j.doc".to_string(), 0, vec![chunk("jjjj", 0), chunk("jjjjjj", 100)])
      .await;
    handle
      .add_chunks("/l.doc".to_string(), 1, vec![chunk("llll", 0), chunk("llllll", 100)])
      .await;

    handle.wait_for_completion("/j.doc".to_string()).await.unwrap();
    handle.wait_for_completion("/l.doc".to_string()).await.unwrap();

    let rows = committer.rows.lock().unwrap().clone();
    assert_eq!(rows.len(), 4);

    // Every row carries its own chunk's path, never the first chunk's.
    for row in &rows {
      let expected_len = if row.path == "/j.doc" { "j" } else { "l" };
      assert!(row.text.starts_with(expected_len), "row {row:?} has foreign text");
      assert_eq!(row.id, ChunkRow::derive_id(&row.path, row.offset));
    }

    // Same offsets in different files yield distinct ids.
    let id_j = rows.iter().find(|r| r.path == "/j.doc" && r.offset == 0).unwrap();
    let id_l = rows.iter().find(|r| r.path == "/l.doc" && r.offset == 0).unwrap();
    assert_ne!(id_j.id, id_l.id);
  }

  #[tokio::test]
  async fn test_batch_respects_count_budget() {
    struct CountingBackend {
      batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbedderBackend for CountingBackend {
      async fn checkout(&self) -> Result<usize, PoolError> {
        Ok(0)
      }

      async fn embed_on(&self, _slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError> {
        self.batch_sizes.lock().unwrap().push(texts.len());
        Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
      }
    }

    let backend = Arc::new(CountingBackend {
      batch_sizes: Mutex::new(Vec::new()),
    });
    let config = EmbedQueueConfig {
      batch_size: 4,
      max_in_flight: 1,
      ..EmbedQueueConfig::default()
    };
    let (handle, _) = spawn_queue(config, backend.clone());

    let chunks: Vec<ChunkInput> = (0..10).map(|i| chunk("text", i * 100)).collect();
    handle.add_chunks("/docs/a.txt".to_string(), 0, chunks).await;
    handle.wait_for_completion("/docs/a.txt".to_string()).await.unwrap();

    let sizes = backend.batch_sizes.lock().unwrap().clone();
    assert!(sizes.iter().all(|s| *s <= 4), "batch exceeded count budget: {sizes:?}");
    assert_eq!(sizes.iter().sum::<usize>(), 10);
  }

  #[tokio::test]
  async fn test_char_budget_splits_batches() {
    struct CountingBackend {
      batch_chars: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbedderBackend for CountingBackend {
      async fn checkout(&self) -> Result<usize, PoolError> {
        Ok(0)
      }

      async fn embed_on(&self, _slot: usize, texts: Vec<String>) -> Result<Vec<Vec<f32>>, PoolError> {
        self
          .batch_chars
          .lock()
          .unwrap()
          .push(texts.iter().map(|t| t.len()).sum());
        Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
      }
    }

    let backend = Arc::new(CountingBackend {
      batch_chars: Mutex::new(Vec::new()),
    });
    let config = EmbedQueueConfig {
      batch_size: 100,
      max_chars_per_batch: 50,
      max_in_flight: 1,
      ..EmbedQueueConfig::default()
    };
    let (handle, _) = spawn_queue(config, backend.clone());

    let chunks: Vec<ChunkInput> = (0..6).map(|i| chunk(&"x".repeat(20), i * 100)).collect();
    handle.add_chunks("/docs/a.txt".to_string(), 0, chunks).await;
    handle.wait_for_completion("/docs/a.txt".to_string()).await.unwrap();

    let batches = backend.batch_chars.lock().unwrap().clone();
    assert!(batches.len() >= 3, "char budget should split batches: {batches:?}");
    assert!(batches.iter().all(|c| *c <= 50));
  }

  #[tokio::test]
  async fn test_backpressure_threshold() {
    let config = EmbedQueueConfig {
      backpressure_threshold: 5,
      // No dispatch: an empty-capacity in-flight budget keeps chunks pending.
      max_in_flight: 0,
      ..EmbedQueueConfig::default()
    };
    let (handle, _) = spawn_queue(config, Arc::new(InstantBackend));

    assert!(!handle.should_apply_backpressure());

    let chunks: Vec<ChunkInput> = (0..6).map(|i| chunk("text", i * 10)).collect();
    handle.add_chunks("/docs/a.txt".to_string(), 0, chunks).await;
    // Give the queue task a moment to register them.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(handle.should_apply_backpressure());
  }

  #[tokio::test]
  async fn test_restart_requeues_without_duplication() {
    let backend = BlockingBackend::new();
    let config = EmbedQueueConfig {
      batch_size: 4,
      max_in_flight: 1,
      ..EmbedQueueConfig::default()
    };
    let (handle, committer) = spawn_queue(config, backend.clone());

    handle
      .add_chunks(
        "/docs/a.txt".to_string(),
        0,
        vec![chunk("one", 0), chunk("two", 100), chunk("three", 200)],
      )
      .await;

    // Wait until the first batch is checked out and blocked.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.stats().await.in_flight_batches, 1);

    // Simulate the pool restarting slot 0.
    handle.on_embedder_restart(0);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Release the stuck call; its late result must be dropped.
    backend.release();

    handle.wait_for_completion("/docs/a.txt".to_string()).await.unwrap();

    let rows = committer.rows.lock().unwrap().clone();
    assert_eq!(rows.len(), 3, "each chunk written exactly once: {rows:?}");
    let mut ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "no duplicate chunk ids");
  }

  #[tokio::test]
  async fn test_tracker_retained_until_cleanup() {
    let (handle, _) = spawn_queue(EmbedQueueConfig::default(), Arc::new(InstantBackend));

    handle
      .add_chunks("/docs/a.txt".to_string(), 0, vec![chunk("only", 0)])
      .await;
    handle.wait_for_completion("/docs/a.txt".to_string()).await.unwrap();

    // Completed tracker still visible at 100%.
    let trackers = handle.file_trackers().await;
    assert_eq!(trackers.len(), 1);
    assert_eq!(trackers[0].processed_chunks, trackers[0].total_chunks);

    handle.cleanup_file_tracker("/docs/a.txt".to_string()).await;
    assert!(handle.file_trackers().await.is_empty());
  }

  #[tokio::test]
  async fn test_wait_for_unknown_path_errors() {
    let (handle, _) = spawn_queue(EmbedQueueConfig::default(), Arc::new(InstantBackend));
    let err = handle.wait_for_completion("/docs/never-added.txt".to_string()).await;
    assert!(err.is_err());
  }

  #[tokio::test]
  async fn test_clear_rejects_pending_waiters() {
    let config = EmbedQueueConfig {
      max_in_flight: 0,
      ..EmbedQueueConfig::default()
    };
    let (handle, _) = spawn_queue(config, Arc::new(InstantBackend));

    handle
      .add_chunks("/docs/a.txt".to_string(), 0, vec![chunk("pending", 0)])
      .await;

    let waiter = {
      let handle = handle.clone();
      tokio::spawn(async move { handle.wait_for_completion("/docs/a.txt".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    handle.clear().await;
    let result = waiter.await.unwrap();
    assert!(result.is_err(), "cleared file must reject its waiter");
    assert_eq!(handle.stats().await.pending, 0);
  }
}
