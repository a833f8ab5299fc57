use serde::{Deserialize, Serialize};

/// Startup stages, in protocol order. Transitions are monotonic forward,
/// except that any stage may jump to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStage {
  WorkerSpawn,
  DbInit,
  DbLoad,
  FolderScan,
  SidecarStart,
  Downloading,
  SidecarReady,
  EmbedderInit,
  Ready,
  Error,
}

/// All non-error stages in order.
pub const STARTUP_STAGES: &[StartupStage] = &[
  StartupStage::WorkerSpawn,
  StartupStage::DbInit,
  StartupStage::DbLoad,
  StartupStage::FolderScan,
  StartupStage::SidecarStart,
  StartupStage::Downloading,
  StartupStage::SidecarReady,
  StartupStage::EmbedderInit,
  StartupStage::Ready,
];

impl StartupStage {
  pub fn as_str(&self) -> &'static str {
    match self {
      StartupStage::WorkerSpawn => "worker_spawn",
      StartupStage::DbInit => "db_init",
      StartupStage::DbLoad => "db_load",
      StartupStage::FolderScan => "folder_scan",
      StartupStage::SidecarStart => "sidecar_start",
      StartupStage::Downloading => "downloading",
      StartupStage::SidecarReady => "sidecar_ready",
      StartupStage::EmbedderInit => "embedder_init",
      StartupStage::Ready => "ready",
      StartupStage::Error => "error",
    }
  }
}

/// Typed startup failure codes pushed on the `startup:error` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupErrorCode {
  SidecarNotFound,
  SidecarStartFailed,
  ModelDownloadFailed,
  EmbedderInitFailed,
  StartupTimeout,
}

/// Enforces forward-only stage progression.
///
/// Skipping stages is allowed (a warm start may skip `downloading`) and
/// a stage may repeat to carry progress updates; moving backwards is
/// not allowed. `Error` is reachable from anywhere and terminal.
#[derive(Debug, Default)]
pub struct StageTracker {
  current: Option<StartupStage>,
}

impl StageTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn current(&self) -> Option<StartupStage> {
    self.current
  }

  /// Record a transition. Returns false (and keeps the current stage) if
  /// the transition would move backwards.
  pub fn advance(&mut self, stage: StartupStage) -> bool {
    match self.current {
      Some(StartupStage::Error) => false,
      Some(current) if stage != StartupStage::Error && stage < current => false,
      _ => {
        self.current = Some(stage);
        true
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stage_serialisation_is_snake_case() {
    let json = serde_json::to_string(&StartupStage::SidecarReady).unwrap();
    assert_eq!(json, "\"sidecar_ready\"");
    let json = serde_json::to_string(&StartupStage::WorkerSpawn).unwrap();
    assert_eq!(json, "\"worker_spawn\"");
  }

  #[test]
  fn test_error_code_serialisation() {
    let json = serde_json::to_string(&StartupErrorCode::ModelDownloadFailed).unwrap();
    assert_eq!(json, "\"MODEL_DOWNLOAD_FAILED\"");
  }

  #[test]
  fn test_tracker_accepts_forward_sequence() {
    let mut tracker = StageTracker::new();
    for stage in STARTUP_STAGES {
      assert!(tracker.advance(*stage), "stage {:?} should advance", stage);
    }
    assert_eq!(tracker.current(), Some(StartupStage::Ready));
  }

  #[test]
  fn test_tracker_allows_skipping_stages() {
    let mut tracker = StageTracker::new();
    assert!(tracker.advance(StartupStage::DbInit));
    assert!(tracker.advance(StartupStage::SidecarReady));
    assert!(tracker.advance(StartupStage::Ready));
  }

  #[test]
  fn test_tracker_rejects_backwards_moves() {
    let mut tracker = StageTracker::new();
    assert!(tracker.advance(StartupStage::FolderScan));
    assert!(!tracker.advance(StartupStage::DbInit));
    assert_eq!(tracker.current(), Some(StartupStage::FolderScan));
  }

  #[test]
  fn test_tracker_allows_same_stage_updates() {
    // A stage may repeat to carry a progress message.
    let mut tracker = StageTracker::new();
    assert!(tracker.advance(StartupStage::Downloading));
    assert!(tracker.advance(StartupStage::Downloading));
    assert_eq!(tracker.current(), Some(StartupStage::Downloading));
  }

  #[test]
  fn test_error_reachable_from_anywhere_and_terminal() {
    let mut tracker = StageTracker::new();
    assert!(tracker.advance(StartupStage::EmbedderInit));
    assert!(tracker.advance(StartupStage::Error));
    assert!(!tracker.advance(StartupStage::Ready));
    assert_eq!(tracker.current(), Some(StartupStage::Error));
  }
}
