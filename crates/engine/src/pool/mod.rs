//! Embedder pool.
//!
//! N isolated embedder children, round-robin dispatch over ready slots,
//! per-slot health stats and policy-driven restarts. Restarts are
//! announced through a typed callback so the embedding queue can recover
//! checked-out batches without holding a reference back to the pool.

pub mod child;

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use self::child::{ChildConfig, ChildError, ChildState, EmbedderChild};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
  #[error("No embedder slot became ready")]
  NoReadySlot,
  #[error("Embedder child error: {0}")]
  Child(#[from] ChildError),
  #[error("Embedding failed after {attempts} attempts")]
  Exhausted { attempts: u32 },
  #[error("Pool is disposed")]
  Disposed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub pool_size: usize,
  pub max_files_before_restart: u64,
  pub max_memory_mb: u64,
  /// Consecutive errors tolerated before a slot restart.
  pub error_budget: u32,
  /// Retries (on other slots) for a failed pool-level embed.
  pub max_retries: u32,
  pub child: ChildConfig,
}

impl PoolConfig {
  pub fn new(model_dir: PathBuf, dim: usize) -> std::io::Result<Self> {
    Ok(Self {
      pool_size: (num_cpus::get() / 4).clamp(1, 4),
      max_files_before_restart: 500,
      max_memory_mb: 1500,
      error_budget: 3,
      max_retries: 2,
      child: ChildConfig::new(model_dir, dim)?,
    })
  }
}

/// Health counters for one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotStats {
  pub state: ChildState,
  pub pid: Option<u32>,
  pub files_since_spawn: u64,
  pub memory_bytes: u64,
  pub consecutive_errors: u32,
  pub restart_count: u32,
}

impl Default for SlotStats {
  fn default() -> Self {
    Self {
      state: ChildState::Spawning,
      pid: None,
      files_since_spawn: 0,
      memory_bytes: 0,
      consecutive_errors: 0,
      restart_count: 0,
    }
  }
}

/// Decide whether a slot's health demands a restart.
///
/// Startup protection: a slot that has not completed at least one file
/// never restarts, whatever its memory reading says.
pub fn needs_restart(stats: &SlotStats, config: &PoolConfig) -> bool {
  if stats.files_since_spawn < 1 {
    return false;
  }
  stats.files_since_spawn > config.max_files_before_restart
    || stats.memory_bytes > config.max_memory_mb * 1024 * 1024
    || stats.consecutive_errors >= config.error_budget
}

struct Slot {
  child: Option<EmbedderChild>,
  stats: SlotStats,
}

/// Callback invoked with the slot id whenever that slot restarts.
pub type RestartCallback = Arc<dyn Fn(usize) + Send + Sync>;

pub struct EmbedderPool {
  config: PoolConfig,
  slots: Vec<Arc<Mutex<Slot>>>,
  round_robin: AtomicUsize,
  on_restart: std::sync::Mutex<Option<RestartCallback>>,
}

impl EmbedderPool {
  pub fn new(config: PoolConfig) -> Self {
    let slots = (0..config.pool_size)
      .map(|_| {
        Arc::new(Mutex::new(Slot {
          child: None,
          stats: SlotStats::default(),
        }))
      })
      .collect();

    Self {
      config,
      slots,
      round_robin: AtomicUsize::new(0),
      on_restart: std::sync::Mutex::new(None),
    }
  }

  /// Register the restart listener (the embedding queue's recovery
  /// hook). Passed in after construction to avoid a cyclic reference.
  pub fn set_restart_listener(&self, callback: RestartCallback) {
    *self.on_restart.lock().expect("restart listener lock") = Some(callback);
  }

  pub fn pool_size(&self) -> usize {
    self.slots.len()
  }

  /// Spawn all children. Fails if no slot comes up at all.
  pub async fn initialize(&self) -> Result<(), PoolError> {
    let mut ready = 0usize;
    for (i, slot) in self.slots.iter().enumerate() {
      let mut guard = slot.lock().await;
      match EmbedderChild::spawn(&self.config.child).await {
        Ok(child) => {
          guard.stats.pid = child.pid();
          guard.stats.state = ChildState::Ready;
          guard.child = Some(child);
          ready += 1;
          debug!(slot = i, pid = ?guard.stats.pid, "Embedder slot ready");
        }
        Err(e) => {
          warn!(slot = i, error = %e, "Embedder slot failed to spawn");
          guard.stats.state = ChildState::Dead;
        }
      }
    }

    if ready == 0 {
      return Err(PoolError::NoReadySlot);
    }
    info!(ready, total = self.slots.len(), "Embedder pool initialised");
    Ok(())
  }

  /// Pick the next eligible slot, round-robin over ready slots. Busy
  /// and restarting slots are skipped rather than waited on.
  pub async fn checkout(&self) -> Result<usize, PoolError> {
    for _ in 0..self.slots.len() {
      let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.slots.len();
      if let Ok(guard) = self.slots[index].try_lock()
        && guard.stats.state == ChildState::Ready
        && guard.child.is_some()
      {
        return Ok(index);
      }
    }
    Err(PoolError::NoReadySlot)
  }

  /// Run one batch on a specific slot, applying the health policy after
  /// completion.
  pub async fn embed_with_id(&self, texts: Vec<String>, slot_id: usize, is_query: bool) -> Result<Vec<Vec<f32>>, PoolError> {
    let slot = self.slots.get(slot_id).ok_or(PoolError::NoReadySlot)?.clone();
    let mut guard = slot.lock().await;

    if guard.child.is_none() {
      return Err(PoolError::NoReadySlot);
    }

    guard.stats.state = ChildState::Busy;
    let result = match guard.child.as_mut() {
      Some(child) => child.embed(texts, is_query).await,
      None => return Err(PoolError::NoReadySlot),
    };

    match result {
      Ok(vectors) => {
        guard.stats.state = ChildState::Ready;
        guard.stats.files_since_spawn += 1;
        guard.stats.consecutive_errors = 0;
        guard.stats.memory_bytes = guard.child.as_ref().map(|c| c.rss_bytes).unwrap_or(0);

        if needs_restart(&guard.stats, &self.config) {
          debug!(slot = slot_id, stats = ?guard.stats, "Health policy restart");
          drop(guard);
          self.restart_embedder(slot_id).await;
        }
        Ok(vectors)
      }
      Err(e) => {
        guard.stats.consecutive_errors += 1;
        guard.stats.state = ChildState::Ready;
        let exhausted = guard.stats.files_since_spawn >= 1 && guard.stats.consecutive_errors >= self.config.error_budget;
        let hard_failure = matches!(e, ChildError::Timeout { .. } | ChildError::Exited);
        drop(guard);

        // A timeout or a dead process always restarts the slot; softer
        // errors restart only once the budget is spent.
        if hard_failure || exhausted {
          self.restart_embedder(slot_id).await;
        }
        Err(e.into())
      }
    }
  }

  /// Embed with pool-level retry: a failed request is re-attempted on
  /// the next eligible slot.
  pub async fn embed(&self, texts: Vec<String>, is_query: bool) -> Result<Vec<Vec<f32>>, PoolError> {
    let attempts = self.config.max_retries + 1;
    let mut last_error = PoolError::NoReadySlot;

    for _ in 0..attempts {
      let slot_id = match self.checkout().await {
        Ok(slot_id) => slot_id,
        Err(e) => {
          last_error = e;
          tokio::time::sleep(Duration::from_millis(200)).await;
          continue;
        }
      };
      match self.embed_with_id(texts.clone(), slot_id, is_query).await {
        Ok(vectors) => return Ok(vectors),
        Err(e) => last_error = e,
      }
    }

    warn!(attempts, error = %last_error, "Pool embed exhausted retries");
    Err(PoolError::Exhausted { attempts })
  }

  /// Tear down and respawn one slot, announcing the restart.
  pub async fn restart_embedder(&self, slot_id: usize) {
    let Some(slot) = self.slots.get(slot_id) else { return };

    {
      let mut guard = slot.lock().await;
      guard.stats.state = ChildState::Restarting;
      if let Some(child) = guard.child.take() {
        child.shutdown().await;
      }
    }

    // Recovery first: the queue re-enqueues batches checked out to this
    // slot before a fresh child accepts work.
    let callback = self.on_restart.lock().expect("restart listener lock").clone();
    if let Some(callback) = callback {
      callback(slot_id);
    }

    let mut guard = slot.lock().await;
    let restart_count = guard.stats.restart_count + 1;
    match EmbedderChild::spawn(&self.config.child).await {
      Ok(child) => {
        guard.stats = SlotStats {
          state: ChildState::Ready,
          pid: child.pid(),
          restart_count,
          ..SlotStats::default()
        };
        guard.child = Some(child);
        info!(slot = slot_id, restart_count, "Embedder slot restarted");
      }
      Err(e) => {
        warn!(slot = slot_id, error = %e, "Embedder slot failed to respawn");
        guard.stats = SlotStats {
          state: ChildState::Dead,
          restart_count,
          ..SlotStats::default()
        };
      }
    }
  }

  /// Apply the health policy to every slot, restarting offenders. Run
  /// periodically so memory creep on idle slots is still caught.
  pub async fn health_sweep(&self) {
    for (slot_id, slot) in self.slots.iter().enumerate() {
      let stats = slot.lock().await.stats;
      if needs_restart(&stats, &self.config) {
        info!(slot = slot_id, "Health sweep restarting embedder slot");
        self.restart_embedder(slot_id).await;
      }
    }
  }

  pub async fn restart_all(&self) {
    for slot_id in 0..self.slots.len() {
      self.restart_embedder(slot_id).await;
    }
  }

  pub async fn get_stats(&self) -> Vec<SlotStats> {
    let mut stats = Vec::with_capacity(self.slots.len());
    for slot in &self.slots {
      stats.push(slot.lock().await.stats);
    }
    stats
  }

  /// Shut every child down.
  pub async fn dispose(&self) {
    for (i, slot) in self.slots.iter().enumerate() {
      let mut guard = slot.lock().await;
      if let Some(child) = guard.child.take() {
        debug!(slot = i, "Disposing embedder slot");
        child.shutdown().await;
      }
      guard.stats.state = ChildState::Dead;
    }
  }
}
