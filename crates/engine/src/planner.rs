//! Reindex planner.
//!
//! Pure function over a scanner pass and the catalogue cache: decides
//! which discovered files need (re)indexing and which catalogue entries
//! should be removed.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use semdex_core::{FileRecord, FileStatus};
use tracing::debug;

/// Why a file was selected for indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexReason {
  NewFile,
  ForceReindex,
  Modified,
  ParserUpgraded,
  Outdated,
  RetryFailed,
}

impl IndexReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      IndexReason::NewFile => "new-file",
      IndexReason::ForceReindex => "force-reindex",
      IndexReason::Modified => "modified",
      IndexReason::ParserUpgraded => "parser-upgraded",
      IndexReason::Outdated => "outdated",
      IndexReason::RetryFailed => "retry-failed",
    }
  }
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
  pub force: bool,
  pub check_modified: bool,
  pub check_parser_version: bool,
  pub current_parser_version: i32,
  pub retry_failed: bool,
  pub retry_interval_hours: i64,
}

impl Default for PlanOptions {
  fn default() -> Self {
    Self {
      force: false,
      check_modified: true,
      check_parser_version: true,
      current_parser_version: crate::parse::PARSER_VERSION,
      retry_failed: true,
      retry_interval_hours: 24,
    }
  }
}

/// The planner's verdict for one scanner pass.
#[derive(Debug, Default)]
pub struct Plan {
  pub to_index: Vec<(PathBuf, IndexReason)>,
  /// Catalogue paths gone from disk or outside every watched root.
  pub to_remove: Vec<PathBuf>,
  pub skipped: Vec<PathBuf>,
}

/// Compute the current metadata digest for a discovered file, `None` when
/// the file cannot be stat'ed (it will then be treated as unmodified).
pub fn current_file_hash(path: &Path) -> Option<String> {
  let metadata = std::fs::metadata(path).ok()?;
  let mtime_ns = metadata
    .modified()
    .ok()
    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
    .map(|d| d.as_nanos() as i64)?;
  Some(semdex_core::metadata_digest(metadata.len(), mtime_ns))
}

/// Decide the fate of every discovered file per the decision table, plus
/// the removal set.
///
/// `file_hashes` carries the freshly computed digest per discovered path;
/// `now_ms` is injected so retry-window decisions are testable.
pub fn plan(
  discovered: &[PathBuf],
  file_hashes: &HashMap<PathBuf, String>,
  catalog: &HashMap<String, FileRecord>,
  roots: &[PathBuf],
  options: &PlanOptions,
  now_ms: i64,
) -> Plan {
  let mut plan = Plan::default();

  for path in discovered {
    let key = path.to_string_lossy();
    let decision = match catalog.get(key.as_ref()) {
      None => Some(IndexReason::NewFile),
      Some(record) => decide_known(record, path, file_hashes, options, now_ms),
    };

    match decision {
      Some(reason) => plan.to_index.push((path.clone(), reason)),
      None => plan.skipped.push(path.clone()),
    }
  }

  let on_disk: std::collections::HashSet<&Path> = discovered.iter().map(|p| p.as_path()).collect();
  for record in catalog.values() {
    let path = PathBuf::from(&record.path);
    let inside_roots = roots.iter().any(|root| path.starts_with(root));
    let should_remove = if inside_roots {
      // Discovered files are known present; otherwise stat once, since a
      // file may legitimately exist yet be excluded from this pass.
      !on_disk.contains(path.as_path()) && !path.exists()
    } else {
      true
    };
    if should_remove {
      plan.to_remove.push(path);
    }
  }

  debug!(
    to_index = plan.to_index.len(),
    to_remove = plan.to_remove.len(),
    skipped = plan.skipped.len(),
    "Reindex plan computed"
  );
  plan
}

fn decide_known(
  record: &FileRecord,
  path: &Path,
  file_hashes: &HashMap<PathBuf, String>,
  options: &PlanOptions,
  now_ms: i64,
) -> Option<IndexReason> {
  match record.status {
    FileStatus::Outdated => Some(IndexReason::Outdated),
    FileStatus::Indexed => {
      if options.force {
        return Some(IndexReason::ForceReindex);
      }
      if options.check_modified
        && let Some(current) = file_hashes.get(path)
        && *current != record.file_hash
      {
        return Some(IndexReason::Modified);
      }
      if options.check_parser_version && record.parser_version < options.current_parser_version {
        return Some(IndexReason::ParserUpgraded);
      }
      None
    }
    FileStatus::Failed => {
      if options.force {
        return Some(IndexReason::ForceReindex);
      }
      if options.retry_failed {
        let last_retry = record.last_retry.unwrap_or(0);
        let elapsed_hours = (now_ms - last_retry) / 3_600_000;
        if elapsed_hours >= options.retry_interval_hours {
          return Some(IndexReason::RetryFailed);
        }
      }
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const HOUR_MS: i64 = 3_600_000;

  fn record(path: &str, status: FileStatus) -> FileRecord {
    FileRecord {
      path: path.to_string(),
      status,
      file_hash: "hash-v1".to_string(),
      parser_version: 2,
      chunk_count: 4,
      last_modified: 0,
      indexed_at: 0,
      last_retry: None,
      error_message: None,
    }
  }

  fn catalog_of(records: Vec<FileRecord>) -> HashMap<String, FileRecord> {
    records.into_iter().map(|r| (r.path.clone(), r)).collect()
  }

  fn options() -> PlanOptions {
    PlanOptions {
      force: false,
      check_modified: true,
      check_parser_version: true,
      current_parser_version: 2,
      retry_failed: true,
      retry_interval_hours: 24,
    }
  }

  #[test]
  fn test_new_file_is_indexed() {
    let discovered = vec![PathBuf::from("/docs/new.txt")];
    let plan = plan(&discovered, &HashMap::new(), &HashMap::new(), &[], &options(), 0);
    assert_eq!(plan.to_index, vec![(PathBuf::from("/docs/new.txt"), IndexReason::NewFile)]);
  }

  #[test]
  fn test_force_reindexes_everything() {
    let now = 100 * HOUR_MS;
    let mut failed = record("/docs/b.pdf", FileStatus::Failed);
    failed.last_retry = Some(now); // retried just now; force overrides the window
    let catalog = catalog_of(vec![record("/docs/a.txt", FileStatus::Indexed), failed]);

    let discovered = vec![
      PathBuf::from("/docs/a.txt"),
      PathBuf::from("/docs/b.pdf"),
      PathBuf::from("/docs/c.md"),
    ];
    let mut opts = options();
    opts.force = true;

    let result = plan(&discovered, &HashMap::new(), &catalog, &[], &opts, now);
    assert_eq!(result.to_index.len(), 3);
    assert!(
      result
        .to_index
        .iter()
        .take(2)
        .all(|(_, reason)| *reason == IndexReason::ForceReindex)
    );
    assert_eq!(result.to_index[2].1, IndexReason::NewFile);
  }

  #[test]
  fn test_unmodified_indexed_file_is_skipped() {
    let catalog = catalog_of(vec![record("/docs/a.txt", FileStatus::Indexed)]);
    let discovered = vec![PathBuf::from("/docs/a.txt")];
    let hashes = HashMap::from([(PathBuf::from("/docs/a.txt"), "hash-v1".to_string())]);

    let result = plan(&discovered, &hashes, &catalog, &[], &options(), 0);
    assert!(result.to_index.is_empty());
    assert_eq!(result.skipped, discovered);
  }

  #[test]
  fn test_hash_change_means_modified() {
    let catalog = catalog_of(vec![record("/docs/a.txt", FileStatus::Indexed)]);
    let discovered = vec![PathBuf::from("/docs/a.txt")];
    let hashes = HashMap::from([(PathBuf::from("/docs/a.txt"), "hash-v2".to_string())]);

    let result = plan(&discovered, &hashes, &catalog, &[], &options(), 0);
    assert_eq!(result.to_index[0].1, IndexReason::Modified);
  }

  #[test]
  fn test_parser_upgrade_triggers_reindex() {
    let mut old = record("/docs/a.txt", FileStatus::Indexed);
    old.parser_version = 1;
    let catalog = catalog_of(vec![old]);
    let discovered = vec![PathBuf::from("/docs/a.txt")];
    let hashes = HashMap::from([(PathBuf::from("/docs/a.txt"), "hash-v1".to_string())]);

    let result = plan(&discovered, &hashes, &catalog, &[], &options(), 0);
    assert_eq!(result.to_index[0].1, IndexReason::ParserUpgraded);
  }

  #[test]
  fn test_outdated_always_reindexed() {
    let catalog = catalog_of(vec![record("/docs/a.txt", FileStatus::Outdated)]);
    let discovered = vec![PathBuf::from("/docs/a.txt")];

    let result = plan(&discovered, &HashMap::new(), &catalog, &[], &options(), 0);
    assert_eq!(result.to_index[0].1, IndexReason::Outdated);
  }

  #[test]
  fn test_failed_respects_retry_window() {
    let mut failed = record("/docs/b.pdf", FileStatus::Failed);
    failed.last_retry = Some(0);
    let catalog = catalog_of(vec![failed]);
    let discovered = vec![PathBuf::from("/docs/b.pdf")];

    // 23 hours later: still inside the window.
    let result = plan(&discovered, &HashMap::new(), &catalog, &[], &options(), 23 * HOUR_MS);
    assert!(result.to_index.is_empty());

    // 24 hours later: retry.
    let result = plan(&discovered, &HashMap::new(), &catalog, &[], &options(), 24 * HOUR_MS);
    assert_eq!(result.to_index[0].1, IndexReason::RetryFailed);
  }

  #[test]
  fn test_removal_of_paths_outside_roots() {
    let catalog = catalog_of(vec![record("/elsewhere/old.txt", FileStatus::Indexed)]);
    let roots = vec![PathBuf::from("/docs")];

    let result = plan(&[], &HashMap::new(), &catalog, &roots, &options(), 0);
    assert_eq!(result.to_remove, vec![PathBuf::from("/elsewhere/old.txt")]);
  }

  #[test]
  fn test_removal_of_deleted_files_inside_roots() {
    // Inside a watched root but not on disk and not discovered.
    let catalog = catalog_of(vec![record("/docs/gone.txt", FileStatus::Indexed)]);
    let roots = vec![PathBuf::from("/docs")];

    let result = plan(&[], &HashMap::new(), &catalog, &roots, &options(), 0);
    assert_eq!(result.to_remove, vec![PathBuf::from("/docs/gone.txt")]);
  }
}
