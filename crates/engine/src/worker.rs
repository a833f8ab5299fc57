//! Worker daemon.
//!
//! The worker process owns the catalogue, the queues, the vector store
//! and the embedder pool. It serves newline-delimited JSON requests on a
//! Unix socket; startup progress is pushed as `startup:stage` frames on
//! the connection that sent `init`.
//!
//! # Lifecycle
//!
//! 1. `Worker::run` binds the socket and accepts connections
//! 2. `init {dbDir}` builds the engine, emitting stage frames
//! 3. requests are routed against the engine until `shutdown`
//! 4. the shutdown orchestrator drains queues and closes the store last

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use futures::{SinkExt, StreamExt};
use ipc::{
  InitParams, PushFrame, ReindexParams, Request, RequestData, Response, ResponseData, ScanOptions, SearchParams,
  ServerFrame, ShutdownResult, StageTracker, StartupErrorCode, StartupStage, StatsResult, WatchStartParams,
};
use semdex_core::config::ConfigStore;
use tokio::{
  net::{UnixListener, UnixStream},
  sync::{Mutex, RwLock, mpsc},
};
use tokio_util::{
  codec::{Framed, LinesCodec},
  sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use crate::{
  catalog::Catalog,
  chunker::ChunkerConfig,
  memory::MemoryMonitor,
  migrate,
  model,
  planner::{self, PlanOptions},
  pool::{EmbedderPool, PoolConfig},
  processor::FileProcessor,
  queue::{
    embed::{EmbedQueue, EmbedQueueConfig, EmbedQueueHandle},
    files::{FileQueue, FileQueueConfig, FileQueueHandle},
    write::{StoreCommitter, WriteQueue, WriteQueueConfig, WriteQueueHandle},
  },
  scan::scan_directories,
  search,
  shutdown::{ShutdownOrchestrator, steps},
  store::{DEFAULT_VECTOR_DIM, VectorStore},
  watcher::{WatchJob, WatcherHandle, WatcherTask},
};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Codec error: {0}")]
  Codec(#[from] tokio_util::codec::LinesCodecError),
}

/// Tunables for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub socket_path: PathBuf,
  pub model_name: String,
  pub vector_dim: usize,
  pub embed_drain_timeout: Duration,
  pub write_drain_timeout: Duration,
  pub health_check_interval: Duration,
}

impl WorkerOptions {
  pub fn new(socket_path: PathBuf) -> Self {
    Self {
      socket_path,
      model_name: model::DEFAULT_MODEL.to_string(),
      vector_dim: DEFAULT_VECTOR_DIM,
      embed_drain_timeout: Duration::from_secs(30),
      write_drain_timeout: Duration::from_secs(30),
      health_check_interval: Duration::from_secs(30),
    }
  }
}

/// Everything that exists only after `init`.
struct Engine {
  db_dir: PathBuf,
  store: Arc<VectorStore>,
  catalog: Arc<Catalog>,
  pool: Arc<EmbedderPool>,
  file_queue: FileQueueHandle,
  embed_queue: EmbedQueueHandle,
  write_queue: WriteQueueHandle,
  processor: Arc<FileProcessor>,
  watcher: Mutex<Option<WatcherHandle>>,
  config_store: ConfigStore,
  scan_options: RwLock<ScanOptions>,
  /// Timers torn down individually by the shutdown sequence.
  health_cancel: CancellationToken,
  memory_cancel: CancellationToken,
}

impl Engine {
  /// Scan options derived from the persisted config.
  async fn load_scan_options(config_store: &ConfigStore) -> (Vec<PathBuf>, ScanOptions) {
    let config = config_store.load().await.unwrap_or_default();
    let options = crate::scan::scan_options_from_config(&config);
    (config.active_roots(), options)
  }

  /// Run a scanner pass, plan, apply removals and enqueue the work.
  async fn scan_and_plan(&self, force: bool) -> (usize, usize) {
    let (roots, options) = Self::load_scan_options(&self.config_store).await;
    *self.scan_options.write().await = options.clone();

    let scanned = scan_directories(&roots, &options).await;
    let hashes = scanned
      .files
      .iter()
      .filter_map(|p| planner::current_file_hash(p).map(|h| (p.clone(), h)))
      .collect();

    let catalog_snapshot = self.catalog.scan().await;
    let plan = planner::plan(
      &scanned.files,
      &hashes,
      &catalog_snapshot,
      &roots,
      &PlanOptions {
        force,
        ..PlanOptions::default()
      },
      chrono::Utc::now().timestamp_millis(),
    );

    for path in &plan.to_remove {
      if let Err(e) = self.processor.remove(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove stale file");
      }
    }

    let to_index: Vec<PathBuf> = plan.to_index.iter().map(|(p, _)| p.clone()).collect();
    let queued = to_index.len();
    self.file_queue.add(to_index).await;

    info!(
      discovered = scanned.files.len(),
      queued,
      removed = plan.to_remove.len(),
      skipped_bundles = scanned.skipped_bundles.len(),
      "Scan pass complete"
    );
    (queued, plan.to_remove.len())
  }
}

struct WorkerState {
  options: WorkerOptions,
  engine: RwLock<Option<Arc<Engine>>>,
  cancel: CancellationToken,
  shutting_down: AtomicBool,
}

/// Frame pusher for one connection with monotonic stage enforcement.
struct StagePusher {
  out: mpsc::Sender<String>,
  tracker: std::sync::Mutex<StageTracker>,
}

impl StagePusher {
  fn new(out: mpsc::Sender<String>) -> Self {
    Self {
      out,
      tracker: std::sync::Mutex::new(StageTracker::new()),
    }
  }

  async fn stage(&self, stage: StartupStage, message: Option<String>) {
    let advanced = self.tracker.lock().expect("stage tracker lock").advance(stage);
    if !advanced {
      warn!(stage = stage.as_str(), "Suppressing backwards stage transition");
      return;
    }
    let frame = PushFrame::Stage {
      stage,
      message,
      progress: None,
    };
    if let Ok(json) = serde_json::to_string(&ServerFrame::Push(frame)) {
      let _ = self.out.send(json).await;
    }
  }

  async fn startup_error(&self, code: StartupErrorCode, message: String) {
    let _ = self.tracker.lock().expect("stage tracker lock").advance(StartupStage::Error);
    let frame = PushFrame::StartupError {
      code,
      message,
      details: None,
    };
    if let Ok(json) = serde_json::to_string(&ServerFrame::Push(frame)) {
      let _ = self.out.send(json).await;
    }
  }
}

pub struct Worker {
  state: Arc<WorkerState>,
}

impl Worker {
  pub fn new(options: WorkerOptions, cancel: CancellationToken) -> Self {
    Self {
      state: Arc::new(WorkerState {
        options,
        engine: RwLock::new(None),
        cancel,
        shutting_down: AtomicBool::new(false),
      }),
    }
  }

  /// Bind the socket and serve until cancelled.
  pub async fn run(&self) -> Result<(), WorkerError> {
    let socket_path = &self.state.options.socket_path;
    if socket_path.exists() {
      tokio::fs::remove_file(socket_path).await?;
    }
    if let Some(parent) = socket_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(socket = %socket_path.display(), "Worker listening");

    loop {
      tokio::select! {
        biased;

        _ = self.state.cancel.cancelled() => {
          info!("Worker shutting down (cancelled)");
          break;
        }

        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let state = self.state.clone();
              tokio::spawn(handle_connection(stream, state));
            }
            Err(e) => error!(error = %e, "Accept error"),
          }
        }
      }
    }

    if socket_path.exists() {
      tokio::fs::remove_file(socket_path).await?;
    }
    Ok(())
  }
}

/// Read newline-delimited requests, write responses and push frames.
async fn handle_connection(stream: UnixStream, state: Arc<WorkerState>) {
  debug!("Client connected");
  let framed = Framed::new(stream, LinesCodec::new());
  let (mut sink, mut stream) = framed.split();

  // One writer task per connection keeps responses and pushes from
  // interleaving mid-frame.
  let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
  let writer = tokio::spawn(async move {
    while let Some(line) = out_rx.recv().await {
      if sink.send(line).await.is_err() {
        break;
      }
    }
  });

  while let Some(result) = stream.next().await {
    let line = match result {
      Ok(line) => line,
      Err(e) => {
        warn!(error = %e, "Error reading from client");
        break;
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let request: Request = match serde_json::from_str(trimmed) {
      Ok(request) => request,
      Err(e) => {
        warn!(error = %e, "Invalid request JSON");
        let response = Response::rpc_error("unknown", -32700, format!("Parse error: {e}"));
        if let Ok(json) = serde_json::to_string(&response) {
          let _ = out_tx.send(json).await;
        }
        continue;
      }
    };

    let response = dispatch(&state, request, &out_tx).await;
    if let Ok(json) = serde_json::to_string(&response) {
      let _ = out_tx.send(json).await;
    }
  }

  drop(out_tx);
  let _ = writer.await;
  debug!("Client disconnected");
}

async fn dispatch(state: &Arc<WorkerState>, request: Request, out: &mpsc::Sender<String>) -> Response {
  let id = request.id.clone();
  debug!(id = %id, method = ?request.data.method(), "Processing request");

  match request.data {
    RequestData::Init(params) => handle_init(state, params, out, &id).await,
    RequestData::WatchStart(params) => handle_watch_start(state, params, &id).await,
    RequestData::WatchStop => handle_watch_stop(state, &id).await,
    RequestData::Enqueue { paths } => match engine(state).await {
      Ok(engine) => {
        engine.file_queue.add(paths).await;
        Response::success(id, ResponseData::Ok)
      }
      Err(response) => respond_err(response, id),
    },
    RequestData::Stats => handle_stats(state, &id).await,
    RequestData::Search(params) => handle_search(state, params, &id).await,
    RequestData::Progress => handle_progress(state, &id).await,
    RequestData::ReindexAll(params) => handle_reindex(state, params, &id).await,
    RequestData::Shutdown => handle_shutdown(state, &id).await,
  }
}

async fn engine(state: &Arc<WorkerState>) -> Result<Arc<Engine>, &'static str> {
  state.engine.read().await.clone().ok_or("worker not initialised")
}

fn respond_err(message: &str, id: String) -> Response {
  Response::rpc_error(id, -32002, message)
}

// ============================================================================
// Init
// ============================================================================

async fn handle_init(
  state: &Arc<WorkerState>,
  params: InitParams,
  out: &mpsc::Sender<String>,
  id: &str,
) -> Response {
  if state.engine.read().await.is_some() {
    debug!("Init requested but engine already running");
    return Response::success(id, ResponseData::Ok);
  }

  let pusher = StagePusher::new(out.clone());
  // Everything spawned during init hangs off this token so a failed
  // startup leaves no orphaned tasks behind for the retry.
  let init_cancel = state.cancel.child_token();
  match build_engine(state, &init_cancel, &params.db_dir, &pusher).await {
    Ok(engine) => {
      *state.engine.write().await = Some(engine);
      pusher.stage(StartupStage::Ready, None).await;
      Response::success(id, ResponseData::Ok)
    }
    Err((code, message)) => {
      error!(code = ?code, message = %message, "Engine init failed");
      init_cancel.cancel();
      pusher.startup_error(code, message.clone()).await;
      Response::rpc_error(id, -32001, message)
    }
  }
}

async fn build_engine(
  state: &Arc<WorkerState>,
  init_cancel: &CancellationToken,
  db_dir: &PathBuf,
  pusher: &StagePusher,
) -> Result<Arc<Engine>, (StartupErrorCode, String)> {
  let options = &state.options;
  // Database failures have no code of their own in the closed set; they
  // surface under the startup-timeout code.
  let db_fail = |e: String| (StartupErrorCode::StartupTimeout, e);

  // Database: migrate if the version ladder demands it, then open.
  pusher.stage(StartupStage::DbInit, None).await;
  if migrate::check_database_version(db_dir).await {
    info!("Database version behind, wiping store");
    migrate::wipe_database(db_dir)
      .await
      .map_err(|e| db_fail(format!("migration failed: {e}")))?;
  }
  let store = Arc::new(
    VectorStore::open(db_dir, options.vector_dim)
      .await
      .map_err(|e| db_fail(format!("store open failed: {e}")))?,
  );
  migrate::write_database_version(db_dir)
    .await
    .map_err(|e| db_fail(format!("version write failed: {e}")))?;

  // Catalogue.
  pusher.stage(StartupStage::DbLoad, None).await;
  let catalog = Arc::new(
    Catalog::load(store.clone())
      .await
      .map_err(|e| db_fail(format!("catalogue load failed: {e}")))?,
  );

  // Queues and processor; the file queue starts paused until the
  // embedders are up.
  let write_queue = WriteQueue::spawn(
    WriteQueueConfig::default(),
    Arc::new(StoreCommitter::new(store.clone())),
    init_cancel.child_token(),
  );

  let model_dir = model::ensure_model(&options.model_name)
    .map_err(|e| (StartupErrorCode::ModelDownloadFailed, e.to_string()))?;

  let pool_config = PoolConfig::new(model_dir, options.vector_dim)
    .map_err(|e| (StartupErrorCode::SidecarNotFound, format!("embedder binary unavailable: {e}")))?;
  let pool = Arc::new(EmbedderPool::new(pool_config));

  let embed_queue = EmbedQueue::spawn(
    EmbedQueueConfig::default(),
    pool.clone(),
    write_queue.clone(),
    init_cancel.child_token(),
  );

  // Restarting slots hand their in-flight batches back to the queue.
  let restart_hook = embed_queue.clone();
  pool.set_restart_listener(Arc::new(move |slot| restart_hook.on_embedder_restart(slot)));

  let processor = Arc::new(FileProcessor::new(
    catalog.clone(),
    embed_queue.clone(),
    write_queue.clone(),
    ChunkerConfig::default(),
  ));

  let memory_cancel = init_cancel.child_token();
  let monitor = MemoryMonitor::new(memory_cancel.clone());
  let probe = monitor.probe();
  monitor.spawn();

  let config_store = ConfigStore::new(db_dir);
  let config = config_store.load().await.unwrap_or_default();

  let handler_processor = processor.clone();
  let probe_for_queue = probe.clone();
  let file_queue = FileQueue::spawn(
    FileQueueConfig {
      max_concurrent: config.settings.cpu_throttle.max_concurrent(),
      ..FileQueueConfig::default()
    },
    Arc::new(move |path| {
      let processor = handler_processor.clone();
      Box::pin(async move { processor.process(&path).await })
    }),
    Some(Arc::new(move || probe_for_queue.current_mb())),
    Some(Arc::new(|cap, mb| {
      info!(cap, observed_mb = mb, "File queue concurrency adjusted for memory pressure");
    })),
    None,
    init_cancel.child_token(),
  );
  file_queue.pause().await;

  let engine = Arc::new(Engine {
    db_dir: db_dir.clone(),
    store,
    catalog,
    pool: pool.clone(),
    file_queue: file_queue.clone(),
    embed_queue,
    write_queue,
    processor,
    watcher: Mutex::new(None),
    config_store,
    scan_options: RwLock::new(ScanOptions::default()),
    health_cancel: init_cancel.child_token(),
    memory_cancel,
  });

  // Plan the initial indexing pass before the embedders spin up; the
  // queue is paused so nothing races the model load.
  pusher.stage(StartupStage::FolderScan, None).await;
  let (queued, _) = engine.scan_and_plan(false).await;
  pusher
    .stage(StartupStage::FolderScan, Some(format!("{queued} files queued")))
    .await;

  // Embedder sidecar processes.
  pusher.stage(StartupStage::SidecarStart, None).await;
  pool
    .initialize()
    .await
    .map_err(|e| (StartupErrorCode::SidecarStartFailed, e.to_string()))?;
  pusher.stage(StartupStage::SidecarReady, None).await;

  // Warm the pipeline with one embedding round-trip.
  pusher.stage(StartupStage::EmbedderInit, None).await;
  pool
    .embed(vec!["warmup".to_string()], true)
    .await
    .map_err(|e| (StartupErrorCode::EmbedderInitFailed, e.to_string()))?;

  spawn_health_check(engine.clone(), state.options.health_check_interval);
  file_queue.resume().await;

  Ok(engine)
}

/// Periodic slot health sweep; catches memory creep on idle slots.
fn spawn_health_check(engine: Arc<Engine>, interval: Duration) {
  let cancel = engine.health_cancel.clone();
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!("Health check timer cleared");
          break;
        }

        _ = ticker.tick() => {
          engine.pool.health_sweep().await;
        }
      }
    }
  });
}

// ============================================================================
// Watching
// ============================================================================

async fn handle_watch_start(state: &Arc<WorkerState>, params: WatchStartParams, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  let mut guard = engine.watcher.lock().await;
  if let Some(existing) = guard.take() {
    existing.close().await;
  }

  let (jobs_tx, mut jobs_rx) = mpsc::channel::<WatchJob>(256);
  let handle = match WatcherTask::spawn(
    params.roots.clone(),
    &params.options,
    jobs_tx,
    state.cancel.child_token(),
  ) {
    Ok(handle) => handle,
    Err(e) => return Response::rpc_error(id, -32003, e.to_string()),
  };

  // Convert watch jobs into pipeline work.
  let job_engine = engine.clone();
  tokio::spawn(async move {
    while let Some(job) = jobs_rx.recv().await {
      match job {
        WatchJob::Upsert(path) => job_engine.file_queue.add(vec![path]).await,
        WatchJob::Unlink(path) => {
          if let Err(e) = job_engine.processor.remove(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to unindex deleted file");
          }
        }
      }
    }
  });

  *guard = Some(handle);
  *engine.scan_options.write().await = params.options;
  info!(roots = params.roots.len(), "Watching started");
  Response::success(id, ResponseData::Ok)
}

async fn handle_watch_stop(state: &Arc<WorkerState>, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  if let Some(handle) = engine.watcher.lock().await.take() {
    handle.close().await;
    info!("Watching stopped");
  }
  Response::success(id, ResponseData::Ok)
}

// ============================================================================
// Queries
// ============================================================================

async fn handle_stats(state: &Arc<WorkerState>, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  let total_chunks = engine.store.count_chunks().await.unwrap_or(0) as u64;
  let indexed_files = engine.catalog.count_indexed().await;

  let catalog_snapshot = engine.catalog.scan().await;
  let config = engine.config_store.load().await.unwrap_or_default();
  let folder_stats = config
    .watched_folders
    .iter()
    .map(|folder| {
      let prefix = folder.path.to_string_lossy().into_owned();
      let entries: Vec<_> = catalog_snapshot
        .values()
        .filter(|r| PathBuf::from(&r.path).starts_with(&folder.path))
        .collect();
      ipc::FolderStats {
        folder: prefix,
        total_files: entries.len() as u64,
        indexed_files: entries
          .iter()
          .filter(|r| r.status == semdex_core::FileStatus::Indexed)
          .count() as u64,
      }
    })
    .collect();

  Response::success(
    id,
    ResponseData::Stats(StatsResult {
      total_chunks,
      indexed_files,
      folder_stats,
    }),
  )
}

async fn handle_search(state: &Arc<WorkerState>, params: SearchParams, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  match search::search(&engine.store, &engine.pool, &params.q, params.k).await {
    Ok(hits) => Response::success(id, ResponseData::Search(hits)),
    Err(e) => Response::rpc_error(id, -32004, e.to_string()),
  }
}

async fn handle_progress(state: &Arc<WorkerState>, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  let queue_stats = engine.file_queue.stats().await;
  let files = engine.embed_queue.file_trackers().await;

  Response::success(
    id,
    ResponseData::Progress(ipc::ProgressResult {
      queued: queue_stats.queued as u64,
      processing: queue_stats.processing as u64,
      errors: queue_stats.failed as u64,
      files,
    }),
  )
}

async fn handle_reindex(state: &Arc<WorkerState>, params: ReindexParams, id: &str) -> Response {
  let engine = match engine(state).await {
    Ok(engine) => engine,
    Err(e) => return respond_err(e, id.to_string()),
  };

  let (queued, removed) = engine.scan_and_plan(params.force).await;
  debug!(queued, removed, force = params.force, "Reindex pass planned");
  Response::success(id, ResponseData::Ok)
}

// ============================================================================
// Shutdown
// ============================================================================

async fn handle_shutdown(state: &Arc<WorkerState>, id: &str) -> Response {
  if state.shutting_down.swap(true, Ordering::SeqCst) {
    return Response::rpc_error(id, -32005, "shutdown already in progress");
  }

  let result = match engine(state).await {
    Ok(engine) => run_shutdown(state, engine).await,
    Err(_) => ShutdownResult {
      success: true,
      steps: Vec::new(),
    },
  };

  *state.engine.write().await = None;

  // Cancel the accept loop once the reply has a chance to flush.
  let cancel = state.cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
  });

  Response::success(id, ResponseData::Shutdown(result))
}

async fn run_shutdown(state: &Arc<WorkerState>, engine: Arc<Engine>) -> ShutdownResult {
  let options = &state.options;

  let watcher_engine = engine.clone();
  let file_queue = engine.file_queue.clone();
  let embed_queue = engine.embed_queue.clone();
  let write_queue = engine.write_queue.clone();
  let health_cancel = engine.health_cancel.clone();
  let memory_cancel = engine.memory_cancel.clone();
  let pool = engine.pool.clone();
  let store = engine.store.clone();
  let db_dir = engine.db_dir.clone();

  ShutdownOrchestrator::new()
    .step(steps::CLOSE_WATCHER, Some(Duration::from_secs(5)), async move {
      if let Some(handle) = watcher_engine.watcher.lock().await.take() {
        handle.close().await;
      }
      Ok(())
    })
    // The file queue is the authoritative checkpoint: no timeout.
    .step(steps::FILE_QUEUE_DRAIN, None, async move {
      file_queue.pause().await;
      file_queue.clear().await;
      file_queue.wait_idle().await;
      Ok(())
    })
    .step(steps::EMBEDDING_QUEUE_DRAIN, Some(options.embed_drain_timeout), async move {
      embed_queue.wait_drain().await;
      Ok(())
    })
    .step(steps::WRITE_QUEUE_DRAIN, Some(options.write_drain_timeout), async move {
      write_queue.wait_drain().await;
      Ok(())
    })
    .step(steps::CLEAR_HEALTH_CHECK, Some(Duration::from_secs(1)), async move {
      health_cancel.cancel();
      Ok(())
    })
    .step(steps::CLEAR_MEMORY_MONITOR, Some(Duration::from_secs(1)), async move {
      memory_cancel.cancel();
      Ok(())
    })
    .step(steps::EMBEDDER_POOL_SHUTDOWN, Some(Duration::from_secs(15)), async move {
      pool.dispose().await;
      Ok(())
    })
    .step(steps::SIDECAR_STOP, Some(Duration::from_secs(5)), async move {
      // The embedder children are the only sidecar processes; their
      // disposal above leaves nothing else running.
      Ok(())
    })
    .step(steps::DATABASE_CLOSE, Some(Duration::from_secs(10)), async move {
      info!(db_dir = %db_dir.display(), "Closing store");
      drop(store);
      Ok(())
    })
    .non_critical_step(steps::PROFILING_REPORT, Some(Duration::from_secs(1)), async move {
      debug!("No profiler attached");
      Ok(())
    })
    .run()
    .await
}
