//! Shutdown orchestrator.
//!
//! Runs an ordered sequence of shutdown steps, each with its own timeout
//! policy. A step failing or timing out never aborts the sequence: the
//! timers must always be cleared and the store always closed, whatever
//! happened earlier. The overall result is successful only when every
//! critical step succeeded.

use std::{future::Future, pin::Pin, time::Duration};

use ipc::{ShutdownResult, StepReport};
use tracing::{debug, info, warn};

type StepFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Canonical step names, in execution order.
pub mod steps {
  pub const CLOSE_WATCHER: &str = "close_watcher";
  pub const FILE_QUEUE_DRAIN: &str = "file_queue_drain";
  pub const EMBEDDING_QUEUE_DRAIN: &str = "embedding_queue_drain";
  pub const WRITE_QUEUE_DRAIN: &str = "write_queue_drain";
  pub const CLEAR_HEALTH_CHECK: &str = "clear_health_check";
  pub const CLEAR_MEMORY_MONITOR: &str = "clear_memory_monitor";
  pub const EMBEDDER_POOL_SHUTDOWN: &str = "embedder_pool_shutdown";
  pub const SIDECAR_STOP: &str = "sidecar_stop";
  pub const DATABASE_CLOSE: &str = "database_close";
  pub const PROFILING_REPORT: &str = "profiling_report";
}

struct Step {
  name: &'static str,
  /// `None` waits indefinitely (the file queue is the authoritative
  /// checkpoint and must drain completely).
  timeout: Option<Duration>,
  critical: bool,
  action: StepFuture,
}

/// Ordered shutdown runner. Steps execute in registration order.
#[derive(Default)]
pub struct ShutdownOrchestrator {
  steps: Vec<Step>,
}

impl ShutdownOrchestrator {
  pub fn new() -> Self {
    Self { steps: Vec::new() }
  }

  /// Register a critical step.
  pub fn step<F>(self, name: &'static str, timeout: Option<Duration>, action: F) -> Self
  where
    F: Future<Output = Result<(), String>> + Send + 'static,
  {
    self.push(name, timeout, true, Box::pin(action))
  }

  /// Register a step whose failure does not fail the overall shutdown.
  pub fn non_critical_step<F>(self, name: &'static str, timeout: Option<Duration>, action: F) -> Self
  where
    F: Future<Output = Result<(), String>> + Send + 'static,
  {
    self.push(name, timeout, false, Box::pin(action))
  }

  fn push(mut self, name: &'static str, timeout: Option<Duration>, critical: bool, action: StepFuture) -> Self {
    self.steps.push(Step {
      name,
      timeout,
      critical,
      action,
    });
    self
  }

  /// Run every step in order, never aborting early.
  pub async fn run(self) -> ShutdownResult {
    info!(steps = self.steps.len(), "Shutdown starting");
    let mut reports = Vec::with_capacity(self.steps.len());
    let mut success = true;

    for step in self.steps {
      let report = run_step(step.name, step.timeout, step.action).await;
      if step.critical && !report.success {
        success = false;
      }
      reports.push(report);
    }

    info!(success, "Shutdown complete");
    ShutdownResult {
      success,
      steps: reports,
    }
  }
}

async fn run_step(name: &'static str, timeout: Option<Duration>, action: StepFuture) -> StepReport {
  debug!(step = name, "Shutdown step starting");

  let outcome = match timeout {
    Some(limit) => match tokio::time::timeout(limit, action).await {
      Ok(result) => result.map_err(|e| (e, false)),
      Err(_) => Err((format!("timed out after {}ms", limit.as_millis()), true)),
    },
    None => action.await.map_err(|e| (e, false)),
  };

  match outcome {
    Ok(()) => {
      debug!(step = name, "Shutdown step succeeded");
      StepReport {
        step: name.to_string(),
        success: true,
        timed_out: false,
        error: None,
      }
    }
    Err((error, timed_out)) => {
      warn!(step = name, error = %error, timed_out, "Shutdown step failed, continuing");
      StepReport {
        step: name.to_string(),
        success: false,
        timed_out,
        error: Some(error),
      }
    }
  }
}
