//! Supervisor loop.
//!
//! Owns the user-facing channel: spawns the worker, drives the startup
//! coordinator against it, starts watching, then babysits the session.
//! A crashed worker is respawned; repeated startup failures give up
//! instead of crash-looping forever.

use std::time::Duration;

use anyhow::Result;
use ipc::{
  PushFrame, ReindexParams, RequestData, ScanOptions, StartupErrorCode, StartupStage, WatchStartParams,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
  client::{self, Client},
  startup::{Actions, Sensors, StartupFailure, StartupOptions, coordinate},
};

/// Consecutive failed startups tolerated before the supervisor gives up.
const MAX_STARTUP_FAILURES: u32 = 5;

/// Interval between worker liveness probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct StageState {
  latest: Option<StartupStage>,
  error: Option<StartupErrorCode>,
  done: bool,
}

/// Run the supervisor until ctrl-c.
pub async fn run_daemon() -> Result<()> {
  let mut failures = 0u32;

  loop {
    match run_session().await {
      SessionEnd::Shutdown => {
        info!("Supervisor exiting");
        return Ok(());
      }
      SessionEnd::WorkerDied => {
        failures = 0;
        warn!("Worker died, respawning");
        tokio::time::sleep(Duration::from_secs(1)).await;
      }
      SessionEnd::StartupFailed(failure) => {
        failures += 1;
        error!(failure = failure.as_str(), attempt = failures, "Startup failed");
        if failures >= MAX_STARTUP_FAILURES {
          anyhow::bail!("startup failed {MAX_STARTUP_FAILURES} times in a row ({})", failure.as_str());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
      }
    }
  }
}

enum SessionEnd {
  /// User asked to stop; worker shut down cleanly.
  Shutdown,
  /// The worker stopped answering; respawn it.
  WorkerDied,
  StartupFailed(StartupFailure),
}

async fn run_session() -> SessionEnd {
  let db_dir = client::default_db_dir();
  info!(db_dir = %db_dir.display(), "Starting worker session");

  // Stage updates flow from the init driver to the model/files sensors.
  let (stage_tx, stage_rx) = watch::channel(StageState::default());

  let sensors = build_sensors(stage_tx, stage_rx.clone(), db_dir.clone());
  let actions = Actions {
    show_window: Box::new(|| info!("Status channel ready")),
    notify_files_loaded: Box::new(|| info!("Initial file load complete")),
    notify_ready: Box::new(|| info!("Worker ready")),
    notify_error: Box::new(|failure| error!(failure = failure.as_str(), "Startup error")),
  };

  if let Err(e) = coordinate(sensors, actions, StartupOptions::default()).await {
    return SessionEnd::StartupFailed(e.failure);
  }

  // Start watching the configured roots on a fresh connection.
  if let Err(e) = start_watching(&db_dir).await {
    warn!(error = %e, "Failed to start watching");
  }

  babysit().await
}

fn build_sensors(
  stage_tx: watch::Sender<StageState>,
  stage_rx: watch::Receiver<StageState>,
  db_dir: std::path::PathBuf,
) -> Sensors {
  // Worker sensor: connect (spawning if needed), then drive `init` in
  // the background, publishing stage frames.
  let wait_for_worker = Box::pin(async move {
    let mut client = client::connect_or_start().await.map_err(|e| e.to_string())?;

    tokio::spawn(async move {
      let tx = stage_tx;
      let result = client
        .request_streaming(
          RequestData::Init(ipc::InitParams { db_dir }),
          |push| match push {
            PushFrame::Stage { stage, message, .. } => {
              debug!(stage = stage.as_str(), message = message.as_deref().unwrap_or(""), "Startup stage");
              tx.send_modify(|state| state.latest = Some(stage));
            }
            PushFrame::StartupError { code, message, .. } => {
              error!(code = ?code, message = %message, "Worker startup error");
              tx.send_modify(|state| state.error = Some(code));
            }
            PushFrame::DownloadProgress { file, progress, .. } => {
              info!(file = %file, progress, "Model download");
            }
          },
        )
        .await;

      tx.send_modify(|state| {
        state.done = true;
        if result.is_err() && state.error.is_none() {
          state.error = Some(StartupErrorCode::StartupTimeout);
        }
      });
    });

    Ok(())
  });

  // Model sensor: sidecar (and its model) is up.
  let model_rx = stage_rx.clone();
  let wait_for_model = Box::pin(wait_for_stage(model_rx, StartupStage::SidecarReady, true));

  // Files sensor: the folder scan finished planning.
  let files_rx = stage_rx.clone();
  let wait_for_files = Box::pin(wait_for_stage(files_rx, StartupStage::FolderScan, false));

  // Stats sensor: one round-trip against the ready worker.
  let wait_for_stats = Box::pin(async {
    let mut client = Client::connect().await.map_err(|e| e.to_string())?;
    let stats = client.request(RequestData::Stats).await.map_err(|e| e.to_string())?;
    debug!(?stats, "Initial stats");
    Ok(())
  });

  Sensors {
    wait_for_worker,
    wait_for_model,
    wait_for_files,
    wait_for_stats,
  }
}

/// Resolve when the published stage reaches `target` (strictly past it
/// when `exclusive` is false means at-or-past). Model-flavoured errors
/// fail the model sensor; everything else fails whichever sensor is
/// still waiting.
async fn wait_for_stage(
  mut rx: watch::Receiver<StageState>,
  target: StartupStage,
  model_sensor: bool,
) -> Result<(), String> {
  loop {
    {
      let state = rx.borrow();
      if let Some(code) = state.error {
        let model_error = matches!(
          code,
          StartupErrorCode::SidecarNotFound
            | StartupErrorCode::SidecarStartFailed
            | StartupErrorCode::ModelDownloadFailed
            | StartupErrorCode::EmbedderInitFailed
        );
        if model_error == model_sensor {
          return Err(format!("startup error: {code:?}"));
        }
        // The other sensor reports this failure; this one just stalls
        // until the coordinator tears everything down.
      }
      if let Some(latest) = state.latest
        && latest >= target
        && latest != StartupStage::Error
      {
        return Ok(());
      }
      if state.done && state.error.is_none() {
        // Init finished successfully; all stages implicitly passed.
        return Ok(());
      }
    }
    if rx.changed().await.is_err() {
      return Err("stage channel closed".to_string());
    }
  }
}

async fn start_watching(db_dir: &std::path::Path) -> Result<(), String> {
  let store = semdex_core::ConfigStore::new(db_dir);
  let config = store.load().await.map_err(|e| e.to_string())?;
  let roots = config.active_roots();
  if roots.is_empty() {
    debug!("No watched folders configured, skipping watch start");
    return Ok(());
  }

  let options: ScanOptions = semdex::scan::scan_options_from_config(&config);
  let mut client = Client::connect().await.map_err(|e| e.to_string())?;
  client
    .request(RequestData::WatchStart(WatchStartParams { roots, options }))
    .await
    .map_err(|e| e.to_string())?;
  Ok(())
}

/// Probe the worker until it dies or the user interrupts.
async fn babysit() -> SessionEnd {
  let mut probe_interval = tokio::time::interval(PROBE_INTERVAL);
  probe_interval.tick().await;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("Interrupt received, shutting worker down");
        return shutdown_worker().await;
      }

      _ = probe_interval.tick() => {
        let alive = match Client::connect().await {
          Ok(mut client) => client.request(RequestData::Progress).await.is_ok(),
          Err(_) => false,
        };
        if !alive {
          return SessionEnd::WorkerDied;
        }
      }
    }
  }
}

async fn shutdown_worker() -> SessionEnd {
  match Client::connect().await {
    Ok(mut client) => match client.request(RequestData::Shutdown).await {
      Ok(ipc::ResponseData::Shutdown(result)) => {
        for step in &result.steps {
          let status = if step.success {
            "ok"
          } else if step.timed_out {
            "timed out"
          } else {
            "failed"
          };
          info!(step = %step.step, status, "Shutdown step");
        }
        if !result.success {
          warn!("Shutdown completed with failed steps");
        }
        SessionEnd::Shutdown
      }
      Ok(_) | Err(_) => {
        warn!("Worker did not acknowledge shutdown");
        SessionEnd::Shutdown
      }
    },
    Err(_) => SessionEnd::Shutdown,
  }
}

/// Kick off a reindex on the running worker.
pub async fn trigger_reindex(force: bool) -> Result<()> {
  let mut client = client::connect_or_start().await?;
  client
    .request(RequestData::ReindexAll(ReindexParams { force }))
    .await?;
  Ok(())
}
