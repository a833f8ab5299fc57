use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Filtering rules shared by the directory scanner and the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanOptions {
  /// Skip bundle directories (e.g. macOS `.app` packages) as a unit.
  pub exclude_bundles: bool,
  /// Globs of the form `**/*.ext/**`; the `ext` marks a bundle directory.
  pub bundle_patterns: Vec<String>,
  /// Path-component tokens that prune a subtree when matched exactly.
  pub exclude_patterns: Vec<String>,
  /// Extensions to index, lowercase, without the leading dot.
  pub supported_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
  pub db_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStartParams {
  pub roots: Vec<PathBuf>,
  pub options: ScanOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
  pub q: String,
  pub k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReindexParams {
  #[serde(default)]
  pub force: bool,
}

/// Typed request payloads, tagged by method on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method", content = "params")]
pub enum RequestData {
  Init(InitParams),
  WatchStart(WatchStartParams),
  WatchStop,
  Enqueue { paths: Vec<PathBuf> },
  Stats,
  Search(SearchParams),
  Progress,
  ReindexAll(ReindexParams),
  Shutdown,
}

impl RequestData {
  pub fn method(&self) -> crate::Method {
    match self {
      RequestData::Init(_) => crate::Method::Init,
      RequestData::WatchStart(_) => crate::Method::WatchStart,
      RequestData::WatchStop => crate::Method::WatchStop,
      RequestData::Enqueue { .. } => crate::Method::Enqueue,
      RequestData::Stats => crate::Method::Stats,
      RequestData::Search(_) => crate::Method::Search,
      RequestData::Progress => crate::Method::Progress,
      RequestData::ReindexAll(_) => crate::Method::ReindexAll,
      RequestData::Shutdown => crate::Method::Shutdown,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_tag_matches_wire_tag() {
    // The serde tag and the Method enum must agree on names.
    for data in [
      RequestData::WatchStop,
      RequestData::Stats,
      RequestData::Progress,
      RequestData::Shutdown,
    ] {
      let wire = serde_json::to_value(&data).unwrap();
      let method = serde_json::to_value(data.method()).unwrap();
      assert_eq!(wire["method"], method);
    }
  }
}
