//! Startup coordinator.
//!
//! Drives the user-visible boot sequence against injected sensors and
//! actions: show the UI immediately, wait for the worker under its
//! timeout, wait for the model and the initial file load in parallel,
//! fetch stats, then announce readiness. Any failure produces exactly
//! one typed `notify_error` call. Dropping the returned future cancels
//! every outstanding timer.

use std::{future::Future, pin::Pin, time::Duration};

use tracing::{debug, info};

type SensorFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Typed startup failure, mirrored to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupFailure {
  Timeout,
  ModelFailed,
  FilesFailed,
}

impl StartupFailure {
  pub fn as_str(&self) -> &'static str {
    match self {
      StartupFailure::Timeout => "timeout",
      StartupFailure::ModelFailed => "model-failed",
      StartupFailure::FilesFailed => "files-failed",
    }
  }
}

#[derive(Debug, thiserror::Error)]
#[error("Startup failed: {}", failure.as_str())]
pub struct StartupError {
  pub failure: StartupFailure,
}

/// One-shot readiness signals, consumed by `coordinate`.
pub struct Sensors {
  pub wait_for_worker: SensorFuture,
  pub wait_for_model: SensorFuture,
  pub wait_for_files: SensorFuture,
  pub wait_for_stats: SensorFuture,
}

/// UI side effects. `notify_error` receives the typed failure.
pub struct Actions {
  pub show_window: Box<dyn FnOnce() + Send>,
  pub notify_files_loaded: Box<dyn FnOnce() + Send>,
  pub notify_ready: Box<dyn FnOnce() + Send>,
  pub notify_error: Box<dyn FnOnce(StartupFailure) + Send>,
}

#[derive(Debug, Clone, Copy)]
pub struct StartupOptions {
  pub worker_timeout: Duration,
  pub model_timeout: Duration,
}

impl Default for StartupOptions {
  fn default() -> Self {
    Self {
      worker_timeout: Duration::from_secs(10),
      model_timeout: Duration::from_secs(120),
    }
  }
}

/// Run the startup protocol to completion or first failure.
pub async fn coordinate(sensors: Sensors, actions: Actions, options: StartupOptions) -> Result<(), StartupError> {
  // The window shows before anything else so the user sees progress.
  (actions.show_window)();

  let result = run_stages(sensors, options).await;
  match result {
    Ok(()) => {
      (actions.notify_files_loaded)();
      (actions.notify_ready)();
      info!("Startup complete");
      Ok(())
    }
    Err(failure) => {
      (actions.notify_error)(failure);
      Err(StartupError { failure })
    }
  }
}

async fn run_stages(sensors: Sensors, options: StartupOptions) -> Result<(), StartupFailure> {
  debug!(worker_timeout_ms = options.worker_timeout.as_millis() as u64, "Waiting for worker");
  tokio::time::timeout(options.worker_timeout, sensors.wait_for_worker)
    .await
    .map_err(|_| StartupFailure::Timeout)?
    .map_err(|_| StartupFailure::Timeout)?;

  // Model readiness and the initial file load proceed in parallel; the
  // first failure wins.
  debug!("Waiting for model and files");
  let model = async {
    tokio::time::timeout(options.model_timeout, sensors.wait_for_model)
      .await
      .map_err(|_| StartupFailure::ModelFailed)?
      .map_err(|_| StartupFailure::ModelFailed)
  };
  let files = async { sensors.wait_for_files.await.map_err(|_| StartupFailure::FilesFailed) };
  tokio::try_join!(model, files)?;

  debug!("Waiting for stats");
  sensors.wait_for_stats.await.map_err(|_| StartupFailure::FilesFailed)?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;

  fn ready() -> SensorFuture {
    Box::pin(async { Ok(()) })
  }

  fn never() -> SensorFuture {
    Box::pin(std::future::pending())
  }

  fn failing(message: &str) -> SensorFuture {
    let message = message.to_string();
    Box::pin(async move { Err(message) })
  }

  struct Recorded {
    window_shown: Arc<AtomicUsize>,
    files_loaded: Arc<AtomicUsize>,
    ready: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<StartupFailure>>>,
  }

  fn actions() -> (Actions, Recorded) {
    let window_shown = Arc::new(AtomicUsize::new(0));
    let files_loaded = Arc::new(AtomicUsize::new(0));
    let ready = Arc::new(AtomicUsize::new(0));
    let errors: Arc<Mutex<Vec<StartupFailure>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = Recorded {
      window_shown: window_shown.clone(),
      files_loaded: files_loaded.clone(),
      ready: ready.clone(),
      errors: errors.clone(),
    };

    let actions = Actions {
      show_window: Box::new(move || {
        window_shown.fetch_add(1, Ordering::SeqCst);
      }),
      notify_files_loaded: Box::new(move || {
        files_loaded.fetch_add(1, Ordering::SeqCst);
      }),
      notify_ready: Box::new(move || {
        ready.fetch_add(1, Ordering::SeqCst);
      }),
      notify_error: Box::new(move |failure| {
        errors.lock().unwrap().push(failure);
      }),
    };
    (actions, recorded)
  }

  fn options(worker_ms: u64) -> StartupOptions {
    StartupOptions {
      worker_timeout: Duration::from_millis(worker_ms),
      model_timeout: Duration::from_millis(500),
    }
  }

  #[tokio::test]
  async fn test_happy_path_fires_ready_once() {
    let (actions, recorded) = actions();
    let sensors = Sensors {
      wait_for_worker: ready(),
      wait_for_model: ready(),
      wait_for_files: ready(),
      wait_for_stats: ready(),
    };

    coordinate(sensors, actions, options(100)).await.unwrap();

    assert_eq!(recorded.window_shown.load(Ordering::SeqCst), 1);
    assert_eq!(recorded.files_loaded.load(Ordering::SeqCst), 1);
    assert_eq!(recorded.ready.load(Ordering::SeqCst), 1);
    assert!(recorded.errors.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_worker_never_ready_times_out() {
    let (actions, recorded) = actions();
    let sensors = Sensors {
      wait_for_worker: never(),
      wait_for_model: ready(),
      wait_for_files: ready(),
      wait_for_stats: ready(),
    };

    let err = coordinate(sensors, actions, options(50)).await.unwrap_err();
    assert_eq!(err.failure, StartupFailure::Timeout);
    assert_eq!(err.to_string(), "Startup failed: timeout");

    // notify_error fired exactly once with the typed failure; the
    // window was still shown first.
    assert_eq!(*recorded.errors.lock().unwrap(), vec![StartupFailure::Timeout]);
    assert_eq!(recorded.window_shown.load(Ordering::SeqCst), 1);
    assert_eq!(recorded.ready.load(Ordering::SeqCst), 0);
    assert_eq!(recorded.files_loaded.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_model_failure_is_typed() {
    let (actions, recorded) = actions();
    let sensors = Sensors {
      wait_for_worker: ready(),
      wait_for_model: failing("model exploded"),
      wait_for_files: ready(),
      wait_for_stats: ready(),
    };

    let err = coordinate(sensors, actions, options(100)).await.unwrap_err();
    assert_eq!(err.failure, StartupFailure::ModelFailed);
    assert_eq!(*recorded.errors.lock().unwrap(), vec![StartupFailure::ModelFailed]);
  }

  #[tokio::test]
  async fn test_model_timeout_is_model_failed() {
    let (actions, _recorded) = actions();
    let sensors = Sensors {
      wait_for_worker: ready(),
      wait_for_model: never(),
      wait_for_files: ready(),
      wait_for_stats: ready(),
    };

    let err = coordinate(sensors, actions, options(100)).await.unwrap_err();
    assert_eq!(err.failure, StartupFailure::ModelFailed);
  }

  #[tokio::test]
  async fn test_files_failure_is_typed() {
    let (actions, recorded) = actions();
    let sensors = Sensors {
      wait_for_worker: ready(),
      wait_for_model: ready(),
      wait_for_files: failing("scan blew up"),
      wait_for_stats: ready(),
    };

    let err = coordinate(sensors, actions, options(100)).await.unwrap_err();
    assert_eq!(err.failure, StartupFailure::FilesFailed);
    assert_eq!(recorded.ready.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_model_and_files_wait_in_parallel() {
    // Both sensors sleep 40ms; sequential would take 80ms+.
    let (actions, _) = actions();
    let slow = |ms: u64| -> SensorFuture {
      Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
      })
    };
    let sensors = Sensors {
      wait_for_worker: ready(),
      wait_for_model: slow(40),
      wait_for_files: slow(40),
      wait_for_stats: ready(),
    };

    let start = std::time::Instant::now();
    coordinate(sensors, actions, options(100)).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(75), "stages must overlap");
  }
}
