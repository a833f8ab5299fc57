use serde::{Deserialize, Serialize};

/// Per-folder indexing summary included in `stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderStats {
  pub folder: String,
  pub total_files: u64,
  pub indexed_files: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
  pub total_chunks: u64,
  pub indexed_files: u64,
  pub folder_stats: Vec<FolderStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
  pub path: String,
  pub text: String,
  pub score: f32,
  pub offset: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<i32>,
}

/// Embedding progress for one file, mirrored from its tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
  pub path: String,
  pub total_chunks: u64,
  pub processed_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResult {
  pub queued: u64,
  pub processing: u64,
  pub errors: u64,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub files: Vec<FileProgress>,
}

/// Outcome of one shutdown step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
  pub step: String,
  pub success: bool,
  #[serde(default)]
  pub timed_out: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResult {
  pub success: bool,
  pub steps: Vec<StepReport>,
}

/// Typed response payloads, tagged by method on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "data")]
pub enum ResponseData {
  Ok,
  Stats(StatsResult),
  Search(Vec<SearchHit>),
  Progress(ProgressResult),
  Shutdown(ShutdownResult),
}
