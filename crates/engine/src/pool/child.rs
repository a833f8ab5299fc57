//! Isolated embedder child supervisor.
//!
//! Each child is a separate OS process hosting the neural model, spoken
//! to over newline-delimited JSON frames on stdin/stdout with numeric
//! correlation ids. The child executes requests serially; the host
//! enforces a per-request timeout and treats expiry as a hard failure
//! that marks the slot for restart.

use std::{
  collections::HashMap,
  path::PathBuf,
  process::Stdio,
  sync::Arc,
  time::Duration,
};

use futures::SinkExt;
use ipc::{ChildRequest, ChildResponse};
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, ChildStdin},
  sync::{Mutex, oneshot},
};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
  #[error("Failed to spawn embedder child: {0}")]
  Spawn(#[source] std::io::Error),
  #[error("Child IPC error: {0}")]
  Ipc(String),
  #[error("Request {id} timed out after {timeout_ms}ms")]
  Timeout { id: u64, timeout_ms: u64 },
  #[error("Child reported error: {0}")]
  Remote(String),
  #[error("Child exited")]
  Exited,
}

/// Lifecycle of one embedder child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
  Spawning,
  Ready,
  Busy,
  Restarting,
  Dead,
}

#[derive(Debug, Clone)]
pub struct ChildConfig {
  /// Executable hosting the `embed-worker` entry point.
  pub exe: PathBuf,
  /// Arguments selecting the embedder entry point.
  pub args: Vec<String>,
  pub model_dir: PathBuf,
  pub dim: usize,
  pub request_timeout: Duration,
  pub init_timeout: Duration,
}

impl ChildConfig {
  pub fn new(model_dir: PathBuf, dim: usize) -> std::io::Result<Self> {
    Ok(Self {
      exe: std::env::current_exe()?,
      args: vec!["embed-worker".to_string()],
      model_dir,
      dim,
      request_timeout: Duration::from_secs(60),
      init_timeout: Duration::from_secs(120),
    })
  }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ChildResponse>>>>;

/// Host-side handle to one running embedder child.
pub struct EmbedderChild {
  child: Child,
  writer: FramedWrite<ChildStdin, LinesCodec>,
  pending: PendingMap,
  next_id: u64,
  request_timeout: Duration,
  /// Latest resident set the child reported about itself.
  pub rss_bytes: u64,
}

impl EmbedderChild {
  /// Spawn the child process and wait for the model to come up.
  pub async fn spawn(config: &ChildConfig) -> Result<Self, ChildError> {
    debug!(exe = %config.exe.display(), model_dir = %config.model_dir.display(), "Spawning embedder child");

    let mut child = tokio::process::Command::new(&config.exe)
      .args(&config.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(ChildError::Spawn)?;

    let stdin = child.stdin.take().ok_or_else(|| ChildError::Ipc("no stdin".into()))?;
    let stdout = child.stdout.take().ok_or_else(|| ChildError::Ipc("no stdout".into()))?;

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let reader_pending = pending.clone();

    // Route responses to their waiting requests by correlation id. The
    // task ends when the child closes stdout; outstanding waiters are
    // dropped, which their callers observe as `Exited`.
    tokio::spawn(async move {
      let mut lines = BufReader::new(stdout).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<ChildResponse>(&line) {
          Ok(response) => {
            let waiter = reader_pending.lock().await.remove(&response.id);
            match waiter {
              Some(tx) => {
                let _ = tx.send(response);
              }
              None => trace!(id = response.id, "Dropping response with no waiter"),
            }
          }
          Err(e) => warn!(error = %e, "Unparseable frame from embedder child"),
        }
      }
      debug!("Embedder child stdout closed");
      reader_pending.lock().await.clear();
    });

    let mut this = Self {
      child,
      writer: FramedWrite::new(stdin, LinesCodec::new()),
      pending,
      next_id: 0,
      request_timeout: config.request_timeout,
      rss_bytes: 0,
    };

    // Initialise the model under the init timeout.
    let response = this
      .request(
        |id| ChildRequest::Init {
          id,
          model_dir: config.model_dir.clone(),
          dim: config.dim,
        },
        config.init_timeout,
      )
      .await?;

    if response.ready != Some(true) {
      let message = response.error.unwrap_or_else(|| "init did not report ready".into());
      return Err(ChildError::Remote(message));
    }
    this.rss_bytes = response.rss_bytes.unwrap_or(0);

    debug!(pid = ?this.child.id(), "Embedder child ready");
    Ok(this)
  }

  pub fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  /// Run one embed request. Requests are serialised by the caller (the
  /// pool holds one lock per slot); the child also serialises
  /// internally, so overlap would merely queue.
  pub async fn embed(&mut self, texts: Vec<String>, is_query: bool) -> Result<Vec<Vec<f32>>, ChildError> {
    let response = self
      .request(|id| ChildRequest::Embed { id, texts, is_query }, self.request_timeout)
      .await?;

    if let Some(error) = response.error {
      return Err(ChildError::Remote(error));
    }
    if let Some(rss) = response.rss_bytes {
      self.rss_bytes = rss;
    }
    response.vectors.ok_or_else(|| ChildError::Ipc("embed response without vectors".into()))
  }

  async fn request(
    &mut self,
    build: impl FnOnce(u64) -> ChildRequest,
    timeout: Duration,
  ) -> Result<ChildResponse, ChildError> {
    let id = self.next_id;
    self.next_id += 1;

    let (tx, rx) = oneshot::channel();
    self.pending.lock().await.insert(id, tx);

    let frame = serde_json::to_string(&build(id)).map_err(|e| ChildError::Ipc(e.to_string()))?;
    self
      .writer
      .send(frame)
      .await
      .map_err(|e| ChildError::Ipc(e.to_string()))?;

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(_)) => Err(ChildError::Exited),
      Err(_) => {
        // Abandon the correlation; a late response is dropped by the
        // reader task.
        self.pending.lock().await.remove(&id);
        Err(ChildError::Timeout {
          id,
          timeout_ms: timeout.as_millis() as u64,
        })
      }
    }
  }

  /// Ask the child to exit, escalating to kill after a grace period.
  pub async fn shutdown(mut self) {
    let frame = match serde_json::to_string(&ChildRequest::Shutdown) {
      Ok(frame) => frame,
      Err(_) => return,
    };
    let _ = self.writer.send(frame).await;

    match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
      Ok(Ok(status)) => debug!(?status, "Embedder child exited"),
      _ => {
        warn!("Embedder child did not exit, killing");
        let _ = self.child.kill().await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Spawning a real child needs the built binary; these tests cover the
  // host-side plumbing against a scripted fake child process instead.

  fn fake_child_config(script: &str) -> ChildConfig {
    ChildConfig {
      exe: PathBuf::from("/bin/sh"),
      args: vec!["-c".to_string(), script.to_string()],
      model_dir: PathBuf::from("/nonexistent"),
      dim: 4,
      request_timeout: Duration::from_millis(500),
      init_timeout: Duration::from_millis(500),
    }
  }

  /// A shell one-liner that answers init with ready and every embed with
  /// fixed vectors, mimicking the real frame protocol.
  fn echo_server_script() -> &'static str {
    r#"while IFS= read -r line; do
      id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
      case "$line" in
        *'"op":"init"'*) printf '{"id":%s,"ready":true,"rss_bytes":1048576}\n' "$id" ;;
        *'"op":"embed"'*) printf '{"id":%s,"vectors":[[0.1,0.2,0.3,0.4]],"rss_bytes":2097152}\n' "$id" ;;
        *'"op":"shutdown"'*) exit 0 ;;
      esac
    done"#
  }

  #[tokio::test]
  async fn test_spawn_init_embed_shutdown() {
    let config = fake_child_config(echo_server_script());
    let mut child = EmbedderChild::spawn(&config).await.unwrap();
    assert_eq!(child.rss_bytes, 1048576);

    let vectors = child.embed(vec!["hello".to_string()], false).await.unwrap();
    assert_eq!(vectors, vec![vec![0.1, 0.2, 0.3, 0.4]]);
    assert_eq!(child.rss_bytes, 2097152);

    child.shutdown().await;
  }

  #[tokio::test]
  async fn test_unresponsive_child_times_out() {
    // Reads but never answers.
    let config = fake_child_config("while IFS= read -r line; do :; done");
    let err = EmbedderChild::spawn(&config).await.unwrap_err();
    assert!(matches!(err, ChildError::Timeout { .. }));
  }

  #[tokio::test]
  async fn test_child_exit_is_detected() {
    // Depending on timing the failure shows up as a closed pipe, a
    // dropped waiter or a timeout; it must never hang or succeed.
    let config = fake_child_config("exit 0");
    let err = EmbedderChild::spawn(&config).await.unwrap_err();
    assert!(matches!(
      err,
      ChildError::Exited | ChildError::Timeout { .. } | ChildError::Ipc(_)
    ));
  }

  #[tokio::test]
  async fn test_child_error_response_propagates() {
    let script = r#"while IFS= read -r line; do
      id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
      case "$line" in
        *'"op":"init"'*) printf '{"id":%s,"ready":true}\n' "$id" ;;
        *'"op":"embed"'*) printf '{"id":%s,"error":"model blew up"}\n' "$id" ;;
      esac
    done"#;
    let config = fake_child_config(script);
    let mut child = EmbedderChild::spawn(&config).await.unwrap();

    let err = child.embed(vec!["text".to_string()], false).await.unwrap_err();
    assert!(matches!(err, ChildError::Remote(m) if m == "model blew up"));
  }
}
