//! Logging setup for CLI commands and the background processes.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Console logging for one-shot CLI commands.
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .without_time()
    .init();
}

/// Console logging for the foreground supervisor.
pub fn init_daemon_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy(),
    )
    .with_target(true)
    .init();
}

/// File logging for the detached worker process.
///
/// Returns the guard that must be kept alive for the duration of the
/// process.
pub fn init_worker_logging() -> Option<WorkerGuard> {
  let log_dir = semdex_core::dirs::default_log_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    init_daemon_logging();
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(&log_dir, "semdex-worker.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Some(guard)
}

/// Logging for the embedder child: stderr only, stdout carries frames.
pub fn init_embedder_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_writer(std::io::stderr)
    .with_ansi(false)
    .init();
}
