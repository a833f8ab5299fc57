/// Get the default socket path for supervisor/worker IPC.
pub fn default_socket_path() -> std::path::PathBuf {
  // Try XDG_RUNTIME_DIR first, fallback to /tmp
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    std::path::PathBuf::from(runtime_dir).join("semdex.sock")
  } else {
    let uid = unsafe { libc::getuid() };
    std::path::PathBuf::from(format!("/tmp/semdex-{}.sock", uid))
  }
}

/// Check if the worker is reachable at the default socket path.
pub fn is_worker_running() -> bool {
  let socket_path = default_socket_path();
  std::os::unix::net::UnixStream::connect(socket_path).is_ok()
}

/// Get the default base path for semdex data (the database directory).
///
/// Respects the following environment variables (in order of precedence):
/// 1. SEMDEX_DATA_DIR - explicit data directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_data_dir() -> std::path::PathBuf {
  if let Ok(dir) = std::env::var("SEMDEX_DATA_DIR") {
    return std::path::PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return std::path::PathBuf::from(xdg_data).join("semdex");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| std::path::PathBuf::from("."))
    .join("semdex")
}

/// Get the directory holding model files.
///
/// `TRANSFORMERS_CACHE` wins when set; otherwise models live under the
/// data directory.
pub fn model_cache_dir() -> std::path::PathBuf {
  if let Ok(dir) = std::env::var("TRANSFORMERS_CACHE") {
    return std::path::PathBuf::from(dir);
  }

  default_data_dir().join("models")
}

/// Get the default log directory for the worker process.
pub fn default_log_dir() -> std::path::PathBuf {
  default_data_dir().join("logs")
}
