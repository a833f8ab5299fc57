//! File watcher.
//!
//! Bridges notify's sync callbacks into the async worker: events are
//! forwarded over a channel, debounced so rapid saves collapse into one
//! job, filtered by the same rules as the scanner, and emitted as
//! add/change/unlink jobs for the indexing pipeline.
//!
//! # Lifecycle
//!
//! The watcher runs until the `CancellationToken` fires or the notify
//! watcher is dropped. `close()` on the handle cancels the task.

use std::{
  collections::HashMap,
  path::PathBuf,
  time::{Duration, Instant},
};

use ipc::ScanOptions;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::scan::ScanFilter;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),
  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

/// Jobs the watcher emits towards the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchJob {
  /// A file appeared or changed and should be (re)indexed.
  Upsert(PathBuf),
  /// A file disappeared and its chunks should be removed.
  Unlink(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

/// A pending change being debounced.
#[derive(Debug)]
struct PendingChange {
  kind: ChangeKind,
  last_event: Instant,
}

impl PendingChange {
  fn new(kind: ChangeKind) -> Self {
    Self {
      kind,
      last_event: Instant::now(),
    }
  }

  /// Coalesce a follow-up event into this pending change.
  fn update(&mut self, kind: ChangeKind) {
    self.last_event = Instant::now();
    match (self.kind, kind) {
      // Create followed by modify is still a create.
      (ChangeKind::Created, ChangeKind::Modified) => {}
      // Delete followed by create is a modify.
      (ChangeKind::Deleted, ChangeKind::Created) => self.kind = ChangeKind::Modified,
      // Create followed by delete still emits a delete to clean up.
      _ => self.kind = kind,
    }
  }
}

/// Handle for stopping a running watcher.
pub struct WatcherHandle {
  cancel: CancellationToken,
  task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
  /// Stop watching and wait for the task to finish.
  pub async fn close(self) {
    self.cancel.cancel();
    let _ = self.task.await;
  }
}

/// Watcher over a set of roots.
pub struct WatcherTask {
  roots: Vec<PathBuf>,
  filter: ScanFilter,
  debounce: Duration,
  jobs: mpsc::Sender<WatchJob>,
  // The notify watcher must be held to keep it alive.
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl WatcherTask {
  /// Start watching `roots` and emit jobs on `jobs`.
  pub fn spawn(
    roots: Vec<PathBuf>,
    options: &ScanOptions,
    jobs: mpsc::Sender<WatchJob>,
    cancel: CancellationToken,
  ) -> Result<WatcherHandle, WatcherError> {
    let task = Self::new(roots, options, jobs)?;
    let task_cancel = cancel.clone();
    let join = tokio::spawn(task.run(task_cancel));
    Ok(WatcherHandle { cancel, task: join })
  }

  fn new(roots: Vec<PathBuf>, options: &ScanOptions, jobs: mpsc::Sender<WatchJob>) -> Result<Self, WatcherError> {
    info!(roots = roots.len(), "Initializing file watcher");

    // The sync callback runs on notify's thread; a full or closed
    // channel simply drops the event.
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
    let mut watcher = RecommendedWatcher::new(
      move |res| {
        let _ = event_tx.blocking_send(res);
      },
      Config::default(),
    )
    .map_err(WatcherError::Init)?;

    for root in &roots {
      watcher.watch(root, RecursiveMode::Recursive).map_err(WatcherError::Watch)?;
    }

    Ok(Self {
      roots,
      filter: ScanFilter::new(options),
      debounce: Duration::from_millis(500),
      jobs,
      _watcher: watcher,
      event_rx,
    })
  }

  async fn run(mut self, cancel: CancellationToken) {
    info!(roots = self.roots.len(), "Watcher started");

    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
    let mut debounce_interval = tokio::time::interval(self.debounce);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Watcher shutting down (cancelled)");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => {
              info!("Watcher shutting down (channel closed)");
              break;
            }
          }
        }

        _ = debounce_interval.tick() => {
          self.flush_settled(&mut pending).await;
        }
      }
    }

    // Flush whatever is still pending so shutdown loses no events.
    let remaining: Vec<(PathBuf, PendingChange)> = pending.drain().collect();
    for (path, change) in remaining {
      self.send_job(path, change.kind).await;
    }

    info!("Watcher stopped");
  }

  fn is_relevant(&self, path: &PathBuf) -> bool {
    if self.filter.is_excluded(path) {
      return false;
    }
    // Files inside a skipped bundle are invisible to the index.
    if path.ancestors().any(|a| self.filter.is_bundle_dir(a)) {
      return false;
    }
    true
  }

  fn process_event(&mut self, pending: &mut HashMap<PathBuf, PendingChange>, event: Event) {
    let kind = match event.kind {
      EventKind::Create(_) => ChangeKind::Created,
      EventKind::Modify(_) => ChangeKind::Modified,
      EventKind::Remove(_) => ChangeKind::Deleted,
      EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
    };

    for path in event.paths {
      if !self.is_relevant(&path) {
        trace!(path = %path.display(), "Ignoring filtered path");
        continue;
      }

      // Deletions of known extensions matter even though the file is
      // gone; everything else must currently look like a supported file.
      if kind != ChangeKind::Deleted {
        if path.is_dir() {
          continue;
        }
        if !self.filter.is_supported_file(&path) {
          trace!(path = %path.display(), "Skipping unsupported file type");
          continue;
        }
      } else if !self.filter.is_supported_file(&path) {
        continue;
      }

      debug!(path = %path.display(), kind = ?kind, "File event");
      match pending.get_mut(&path) {
        Some(existing) => existing.update(kind),
        None => {
          pending.insert(path.clone(), PendingChange::new(kind));
        }
      }
    }
  }

  /// Emit jobs for changes whose debounce window has passed.
  async fn flush_settled(&mut self, pending: &mut HashMap<PathBuf, PendingChange>) {
    let now = Instant::now();
    let settled: Vec<PathBuf> = pending
      .iter()
      .filter(|(_, change)| now.duration_since(change.last_event) >= self.debounce)
      .map(|(path, _)| path.clone())
      .collect();

    for path in settled {
      if let Some(change) = pending.remove(&path) {
        self.send_job(path, change.kind).await;
      }
    }
  }

  async fn send_job(&self, path: PathBuf, kind: ChangeKind) {
    let job = match kind {
      ChangeKind::Created | ChangeKind::Modified => WatchJob::Upsert(path),
      ChangeKind::Deleted => WatchJob::Unlink(path),
    };
    if self.jobs.send(job).await.is_err() {
      warn!("Watch job receiver dropped");
    }
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn options() -> ScanOptions {
    ScanOptions {
      exclude_bundles: true,
      bundle_patterns: vec!["**/*.app/**".to_string()],
      exclude_patterns: vec!["node_modules".to_string()],
      supported_extensions: vec!["txt".to_string(), "md".to_string()],
    }
  }

  #[test]
  fn test_pending_change_coalescing() {
    // Create + Modify = Create
    let mut pending = PendingChange::new(ChangeKind::Created);
    pending.update(ChangeKind::Modified);
    assert_eq!(pending.kind, ChangeKind::Created);

    // Delete + Create = Modified
    let mut pending = PendingChange::new(ChangeKind::Deleted);
    pending.update(ChangeKind::Created);
    assert_eq!(pending.kind, ChangeKind::Modified);

    // Create + Delete = Deleted
    let mut pending = PendingChange::new(ChangeKind::Created);
    pending.update(ChangeKind::Deleted);
    assert_eq!(pending.kind, ChangeKind::Deleted);
  }

  #[tokio::test]
  async fn test_watcher_emits_upsert_for_new_file() {
    let dir = TempDir::new().unwrap();
    let (jobs_tx, mut jobs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let mut task = WatcherTask::new(vec![dir.path().to_path_buf()], &options(), jobs_tx).unwrap();
    task.debounce = Duration::from_millis(20);
    let handle = tokio::spawn(task.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::fs::write(dir.path().join("note.txt"), "hello").await.unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), jobs_rx.recv())
      .await
      .expect("watcher should emit within timeout")
      .expect("job channel open");
    assert_eq!(job, WatchJob::Upsert(dir.path().join("note.txt")));

    cancel.cancel();
    let _ = handle.await;
  }

  #[tokio::test]
  async fn test_watcher_ignores_unsupported_and_excluded() {
    let dir = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir.path().join("node_modules")).await.unwrap();

    let (jobs_tx, mut jobs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let mut task = WatcherTask::new(vec![dir.path().to_path_buf()], &options(), jobs_tx).unwrap();
    task.debounce = Duration::from_millis(20);
    let handle = tokio::spawn(task.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::fs::write(dir.path().join("photo.jpg"), "jpg").await.unwrap();
    tokio::fs::write(dir.path().join("node_modules/readme.txt"), "dep").await.unwrap();
    // A supported file written last acts as the fence.
    tokio::fs::write(dir.path().join("real.md"), "content").await.unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), jobs_rx.recv())
      .await
      .expect("watcher should emit within timeout")
      .expect("job channel open");
    assert_eq!(job, WatchJob::Upsert(dir.path().join("real.md")));

    cancel.cancel();
    let _ = handle.await;
    // Nothing else should have been emitted.
    assert!(jobs_rx.try_recv().is_err());
  }
}
