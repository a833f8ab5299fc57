//! Worker memory monitor.
//!
//! Samples the resident set every few seconds and exposes the latest
//! reading through a cheap shared probe. The file queue downshifts its
//! concurrency cap when the reading crosses the configured threshold.

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Sampling interval for the resident set.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Read the current resident set size of this process in bytes.
///
/// Linux reads `/proc/self/statm`; other platforms report 0, which
/// disables memory throttling rather than guessing.
pub fn current_rss_bytes() -> u64 {
  #[cfg(target_os = "linux")]
  {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
      return 0;
    };
    let resident_pages: u64 = statm
      .split_whitespace()
      .nth(1)
      .and_then(|v| v.parse().ok())
      .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    resident_pages * page_size
  }
  #[cfg(not(target_os = "linux"))]
  {
    0
  }
}

/// Cheap clone-able handle to the latest sample.
#[derive(Debug, Clone)]
pub struct MemoryProbe {
  latest_bytes: Arc<AtomicU64>,
}

impl MemoryProbe {
  pub fn current_mb(&self) -> u64 {
    self.latest_bytes.load(Ordering::Relaxed) / (1024 * 1024)
  }

  pub fn current_bytes(&self) -> u64 {
    self.latest_bytes.load(Ordering::Relaxed)
  }

  /// A probe with a fixed reading, for tests and disabled monitoring.
  pub fn fixed(bytes: u64) -> Self {
    Self {
      latest_bytes: Arc::new(AtomicU64::new(bytes)),
    }
  }

  pub fn set_bytes(&self, bytes: u64) {
    self.latest_bytes.store(bytes, Ordering::Relaxed);
  }
}

/// Periodic RSS sampler.
pub struct MemoryMonitor {
  probe: MemoryProbe,
  interval: Duration,
  cancel: CancellationToken,
}

impl MemoryMonitor {
  pub fn new(cancel: CancellationToken) -> Self {
    Self {
      probe: MemoryProbe::fixed(current_rss_bytes()),
      interval: SAMPLE_INTERVAL,
      cancel,
    }
  }

  pub fn probe(&self) -> MemoryProbe {
    self.probe.clone()
  }

  /// Spawn the sampling loop; returns the join handle.
  pub fn spawn(self) -> tokio::task::JoinHandle<()> {
    tokio::spawn(self.run())
  }

  async fn run(self) {
    debug!(interval_secs = self.interval.as_secs(), "Memory monitor started");
    let mut interval = tokio::time::interval(self.interval);

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          debug!("Memory monitor stopped");
          break;
        }

        _ = interval.tick() => {
          let rss = current_rss_bytes();
          self.probe.set_bytes(rss);
          trace!(rss_mb = rss / (1024 * 1024), "Sampled resident set");
        }
      }
    }
  }
}
