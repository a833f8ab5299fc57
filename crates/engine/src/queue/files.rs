//! Concurrent file-processing queue.
//!
//! FIFO dispatch with a configurable concurrency cap, pause/resume, and
//! memory-pressure throttling. The queue owns its storage; callers talk
//! to it through a cloneable handle. A handler failure is counted, never
//! fatal. A given path is never checked out to two handlers at once.

use std::{
  collections::{HashSet, VecDeque},
  future::Future,
  path::PathBuf,
  pin::Pin,
  sync::Arc,
  time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Async handler invoked for each dequeued path.
pub type FileHandler =
  Arc<dyn Fn(PathBuf) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

/// Probe returning the worker's resident set in MB.
pub type MemoryProbeFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Fired once per throttle transition with (new cap, observed MB).
pub type MemoryThrottleCallback = Arc<dyn Fn(usize, u64) + Send + Sync>;

/// Fired after every handler completion with a stats snapshot.
pub type ProgressCallback = Arc<dyn Fn(FileQueueStats) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FileQueueConfig {
  pub max_concurrent: usize,
  pub throttled_concurrent: usize,
  pub memory_threshold_mb: u64,
  /// How often the memory probe is sampled.
  pub memory_poll_interval: Duration,
}

impl Default for FileQueueConfig {
  fn default() -> Self {
    Self {
      max_concurrent: 5,
      throttled_concurrent: 2,
      memory_threshold_mb: 800,
      memory_poll_interval: Duration::from_secs(1),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileQueueStats {
  pub queued: usize,
  pub processing: usize,
  pub completed: usize,
  pub failed: usize,
}

enum Command {
  Add(Vec<PathBuf>),
  Remove(PathBuf),
  Clear,
  Pause,
  Resume,
  Stats(oneshot::Sender<FileQueueStats>),
  /// Resolved once the queue is empty with nothing in flight.
  WaitIdle(oneshot::Sender<()>),
}

/// Handle to a running file queue.
#[derive(Clone)]
pub struct FileQueueHandle {
  tx: mpsc::Sender<Command>,
}

impl FileQueueHandle {
  pub async fn add(&self, paths: Vec<PathBuf>) {
    let _ = self.tx.send(Command::Add(paths)).await;
  }

  pub async fn remove(&self, path: PathBuf) {
    let _ = self.tx.send(Command::Remove(path)).await;
  }

  pub async fn clear(&self) {
    let _ = self.tx.send(Command::Clear).await;
  }

  pub async fn pause(&self) {
    let _ = self.tx.send(Command::Pause).await;
  }

  pub async fn resume(&self) {
    let _ = self.tx.send(Command::Resume).await;
  }

  pub async fn stats(&self) -> FileQueueStats {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::Stats(tx)).await.is_err() {
      return FileQueueStats::default();
    }
    rx.await.unwrap_or_default()
  }

  /// Wait until all queued and in-flight work has finished. Used by the
  /// shutdown orchestrator's drain step, which has no timeout.
  pub async fn wait_idle(&self) {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::WaitIdle(tx)).await.is_err() {
      return;
    }
    let _ = rx.await;
  }
}

/// The queue itself; construct with [`FileQueue::spawn`].
pub struct FileQueue {
  config: FileQueueConfig,
  handler: FileHandler,
  memory_probe: Option<MemoryProbeFn>,
  on_memory_throttle: Option<MemoryThrottleCallback>,
  on_progress: Option<ProgressCallback>,

  queued: VecDeque<PathBuf>,
  in_flight: HashSet<PathBuf>,
  completed: usize,
  failed: usize,
  paused: bool,
  throttled: bool,
  idle_waiters: Vec<oneshot::Sender<()>>,
}

impl FileQueue {
  /// Spawn the queue task and return its handle.
  pub fn spawn(
    config: FileQueueConfig,
    handler: FileHandler,
    memory_probe: Option<MemoryProbeFn>,
    on_memory_throttle: Option<MemoryThrottleCallback>,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
  ) -> FileQueueHandle {
    let (tx, rx) = mpsc::channel(256);
    let queue = Self {
      config,
      handler,
      memory_probe,
      on_memory_throttle,
      on_progress,
      queued: VecDeque::new(),
      in_flight: HashSet::new(),
      completed: 0,
      failed: 0,
      paused: false,
      throttled: false,
      idle_waiters: Vec::new(),
    };
    tokio::spawn(queue.run(rx, cancel));
    FileQueueHandle { tx }
  }

  fn stats(&self) -> FileQueueStats {
    FileQueueStats {
      queued: self.queued.len(),
      processing: self.in_flight.len(),
      completed: self.completed,
      failed: self.failed,
    }
  }

  fn current_cap(&self) -> usize {
    if self.throttled {
      self.config.throttled_concurrent
    } else {
      self.config.max_concurrent
    }
  }

  /// Sample the probe and flip the throttle state on threshold crossings.
  /// The callback fires exactly once per transition.
  fn check_memory(&mut self) {
    let Some(probe) = &self.memory_probe else { return };
    let mb = probe();

    if !self.throttled && mb > self.config.memory_threshold_mb {
      self.throttled = true;
      debug!(observed_mb = mb, cap = self.config.throttled_concurrent, "Memory threshold crossed, throttling");
      if let Some(cb) = &self.on_memory_throttle {
        cb(self.config.throttled_concurrent, mb);
      }
    } else if self.throttled && mb < self.config.memory_threshold_mb {
      self.throttled = false;
      debug!(observed_mb = mb, cap = self.config.max_concurrent, "Memory recovered, restoring concurrency");
      if let Some(cb) = &self.on_memory_throttle {
        cb(self.config.max_concurrent, mb);
      }
    }
  }

  /// Dispatch as many queued paths as the cap allows. Paths already in
  /// flight are skipped at checkout so a path never runs twice at once.
  fn dispatch(&mut self, done_tx: &mpsc::Sender<(PathBuf, Result<(), String>)>) {
    if self.paused {
      return;
    }

    while self.in_flight.len() < self.current_cap() {
      let Some(index) = self.queued.iter().position(|p| !self.in_flight.contains(p)) else {
        break;
      };
      let path = self.queued.remove(index).expect("position just found");

      trace!(path = %path.display(), in_flight = self.in_flight.len() + 1, "Dispatching file");
      self.in_flight.insert(path.clone());

      let handler = self.handler.clone();
      let done_tx = done_tx.clone();
      tokio::spawn(async move {
        let result = handler(path.clone()).await;
        let _ = done_tx.send((path, result)).await;
      });
    }
  }

  fn notify_idle_if_done(&mut self) {
    if self.queued.is_empty() && self.in_flight.is_empty() {
      for waiter in self.idle_waiters.drain(..) {
        let _ = waiter.send(());
      }
    }
  }

  async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
    debug!(
      max_concurrent = self.config.max_concurrent,
      throttled_concurrent = self.config.throttled_concurrent,
      "File queue started"
    );

    let (done_tx, mut done_rx) = mpsc::channel::<(PathBuf, Result<(), String>)>(64);
    let mut memory_interval = tokio::time::interval(self.config.memory_poll_interval);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!("File queue cancelled");
          break;
        }

        command = rx.recv() => {
          match command {
            Some(Command::Add(paths)) => {
              trace!(count = paths.len(), "Paths added to file queue");
              self.queued.extend(paths);
              self.dispatch(&done_tx);
            }
            Some(Command::Remove(path)) => {
              self.queued.retain(|p| *p != path);
              self.notify_idle_if_done();
            }
            Some(Command::Clear) => {
              // Not-yet-started items are cancelled; in-flight handlers
              // run to completion.
              self.queued.clear();
              self.notify_idle_if_done();
            }
            Some(Command::Pause) => {
              debug!("File queue paused");
              self.paused = true;
            }
            Some(Command::Resume) => {
              debug!("File queue resumed");
              self.paused = false;
              self.dispatch(&done_tx);
            }
            Some(Command::Stats(reply)) => {
              let _ = reply.send(self.stats());
            }
            Some(Command::WaitIdle(reply)) => {
              if self.queued.is_empty() && self.in_flight.is_empty() {
                let _ = reply.send(());
              } else {
                self.idle_waiters.push(reply);
              }
            }
            None => {
              debug!("File queue handle dropped, stopping");
              break;
            }
          }
        }

        completion = done_rx.recv() => {
          let Some((path, result)) = completion else { break };
          self.in_flight.remove(&path);
          match result {
            Ok(()) => self.completed += 1,
            Err(e) => {
              warn!(path = %path.display(), error = %e, "File handler failed");
              self.failed += 1;
            }
          }
          if let Some(cb) = &self.on_progress {
            cb(self.stats());
          }
          self.check_memory();
          self.dispatch(&done_tx);
          self.notify_idle_if_done();
        }

        _ = memory_interval.tick() => {
          self.check_memory();
          self.dispatch(&done_tx);
        }
      }
    }
  }
}
