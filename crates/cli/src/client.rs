//! IPC client for talking to the worker, with auto-start support.

use std::{
  path::{Path, PathBuf},
  process::{Command, Stdio},
  time::Duration,
};

use futures::{SinkExt, StreamExt};
use ipc::{IpcError, PushFrame, Request, RequestData, ResponseData, ServerFrame};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

/// Timeout for waiting for the worker to start.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between connection attempts during startup.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One connection to the worker. Requests are serial: a new request is
/// only sent after the previous response arrived.
pub struct Client {
  framed: Framed<UnixStream, LinesCodec>,
}

impl Client {
  pub async fn connect() -> Result<Self, IpcError> {
    Self::connect_to(&semdex_core::dirs::default_socket_path()).await
  }

  pub async fn connect_to(socket_path: &Path) -> Result<Self, IpcError> {
    let stream = UnixStream::connect(socket_path)
      .await
      .map_err(|e| IpcError::Connection(format!("connect to {}: {e}", socket_path.display())))?;
    debug!(socket = %socket_path.display(), "Connected to worker");
    Ok(Self {
      framed: Framed::new(stream, LinesCodec::new()),
    })
  }

  /// Send one request and wait for its response, ignoring push frames.
  pub async fn request(&mut self, data: RequestData) -> Result<ResponseData, IpcError> {
    self.request_streaming(data, |_push| {}).await
  }

  /// Send one request, forwarding push frames to `on_push` until the
  /// correlated response arrives.
  pub async fn request_streaming(
    &mut self,
    data: RequestData,
    mut on_push: impl FnMut(PushFrame),
  ) -> Result<ResponseData, IpcError> {
    let id = uuid::Uuid::new_v4().to_string();
    let request = Request { id: id.clone(), data };

    let json = serde_json::to_string(&request)?;
    self
      .framed
      .send(json)
      .await
      .map_err(|e| IpcError::Io(e.to_string()))?;

    while let Some(line) = self.framed.next().await {
      let line = line.map_err(|e| IpcError::Io(e.to_string()))?;
      match serde_json::from_str::<ServerFrame>(&line) {
        Ok(ServerFrame::Push(push)) => {
          trace!(?push, "Push frame");
          on_push(push);
        }
        Ok(ServerFrame::Response(response)) => {
          if response.id != id {
            warn!(got = %response.id, expected = %id, "Dropping response with foreign correlation id");
            continue;
          }
          return response.into_result();
        }
        Err(e) => warn!(error = %e, "Unparseable frame from worker"),
      }
    }

    Err(IpcError::CorrelationLost(id))
  }
}

/// Connect to the worker, starting one if necessary.
///
/// 1. Try to connect to an existing worker
/// 2. If that fails, spawn `semdex worker` detached
/// 3. Poll for the socket to become available
pub async fn connect_or_start() -> Result<Client, IpcError> {
  let socket_path = semdex_core::dirs::default_socket_path();
  connect_or_start_at(&socket_path).await
}

pub async fn connect_or_start_at(socket_path: &Path) -> Result<Client, IpcError> {
  match Client::connect_to(socket_path).await {
    Ok(client) => {
      debug!("Connected to existing worker");
      return Ok(client);
    }
    Err(e) => {
      debug!("Worker not running ({e}), starting...");
    }
  }

  spawn_worker_detached()?;

  let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
  loop {
    if tokio::time::Instant::now() >= deadline {
      return Err(IpcError::Connection("worker failed to start within timeout".into()));
    }

    if socket_path.exists()
      && let Ok(client) = Client::connect_to(socket_path).await
    {
      debug!("Connected to newly started worker");
      return Ok(client);
    }

    tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
  }
}

/// Spawn the worker as a detached background process running the
/// current executable's hidden `worker` subcommand.
pub fn spawn_worker_detached() -> Result<u32, IpcError> {
  let exe = std::env::current_exe().map_err(|e| IpcError::Connection(format!("executable path: {e}")))?;

  let child = Command::new(&exe)
    .arg("worker")
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()
    .map_err(|e| IpcError::Connection(format!("spawn worker: {e}")))?;

  let pid = child.id();
  debug!(pid, "Spawned worker process");
  Ok(pid)
}

/// Check whether a worker is reachable at the default socket path.
pub fn is_worker_running() -> bool {
  semdex_core::dirs::is_worker_running()
}

/// Resolve the database directory the worker should be initialised with.
pub fn default_db_dir() -> PathBuf {
  semdex_core::dirs::default_data_dir()
}
