//! Directory scanner.
//!
//! Breadth-first walk over the watched roots honouring bundle patterns,
//! exclusion tokens and the supported-extension list. Unreadable
//! directories are logged and skipped; the walk always completes.

use std::{
  collections::VecDeque,
  path::{Path, PathBuf},
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ipc::ScanOptions;
use tracing::{debug, warn};

/// Result of one scanner pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanResult {
  /// Supported files discovered, in BFS order.
  pub files: Vec<PathBuf>,
  /// Bundle directories that were skipped as a unit.
  pub skipped_bundles: Vec<PathBuf>,
}

/// Per-options matcher, shared by the scanner and the watcher.
#[derive(Debug, Clone)]
pub struct ScanFilter {
  exclude_bundles: bool,
  bundle_extensions: Vec<String>,
  exclude_globs: GlobSet,
  supported_extensions: Vec<String>,
}

impl ScanFilter {
  pub fn new(options: &ScanOptions) -> Self {
    // Exclusion tokens are matched per path component; plain tokens
    // behave as exact names, wildcards work as expected.
    let mut builder = GlobSetBuilder::new();
    for pattern in &options.exclude_patterns {
      match Glob::new(pattern) {
        Ok(glob) => {
          builder.add(glob);
        }
        Err(e) => warn!(pattern = %pattern, error = %e, "Invalid exclude pattern, ignoring"),
      }
    }
    let exclude_globs = builder.build().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to build exclude globs, excluding nothing");
      GlobSet::empty()
    });

    Self {
      exclude_bundles: options.exclude_bundles,
      bundle_extensions: options
        .bundle_patterns
        .iter()
        .filter_map(|p| bundle_extension(p))
        .collect(),
      exclude_globs,
      supported_extensions: options
        .supported_extensions
        .iter()
        .map(|e| e.to_ascii_lowercase())
        .collect(),
    }
  }

  /// A directory is a bundle when its basename ends with one of the
  /// configured bundle extensions.
  pub fn is_bundle_dir(&self, path: &Path) -> bool {
    if !self.exclude_bundles {
      return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      return false;
    };
    self
      .bundle_extensions
      .iter()
      .any(|ext| name.len() > ext.len() + 1 && name.ends_with(&format!(".{ext}")))
  }

  /// Any path component matching an exclusion token prunes the entry.
  pub fn is_excluded(&self, path: &Path) -> bool {
    path
      .components()
      .any(|c| self.exclude_globs.is_match(Path::new(c.as_os_str())))
  }

  /// Extension filter, case-insensitive, sans dot.
  pub fn is_supported_file(&self, path: &Path) -> bool {
    path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .is_some_and(|e| self.supported_extensions.contains(&e))
  }
}

/// Build scan options from the persisted config document.
pub fn scan_options_from_config(config: &semdex_core::Config) -> ScanOptions {
  ScanOptions {
    exclude_bundles: config.settings.exclude_bundles,
    bundle_patterns: config.settings.bundle_patterns.clone(),
    exclude_patterns: config.settings.exclude_patterns.clone(),
    supported_extensions: config.settings.file_types.enabled_extensions(),
  }
}

/// Extract `ext` from a `**/*.ext/**` bundle pattern.
fn bundle_extension(pattern: &str) -> Option<String> {
  let trimmed = pattern.strip_suffix("/**").unwrap_or(pattern);
  let basename = trimmed.rsplit('/').next()?;
  let ext = basename.strip_prefix("*.")?;
  if ext.is_empty() { None } else { Some(ext.to_string()) }
}

/// Walk `roots` breadth-first and collect supported files.
pub async fn scan_directories(roots: &[PathBuf], options: &ScanOptions) -> ScanResult {
  let filter = ScanFilter::new(options);
  let mut result = ScanResult::default();
  let mut queue: VecDeque<PathBuf> = roots.iter().cloned().collect();

  while let Some(dir) = queue.pop_front() {
    let mut entries = match tokio::fs::read_dir(&dir).await {
      Ok(entries) => entries,
      Err(e) => {
        // Permission denied, ENOENT and friends: log and keep walking.
        warn!(dir = %dir.display(), error = %e, "Failed to read directory, skipping");
        continue;
      }
    };

    loop {
      let entry = match entries.next_entry().await {
        Ok(Some(entry)) => entry,
        Ok(None) => break,
        Err(e) => {
          warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
          break;
        }
      };

      let path = entry.path();
      if filter.is_excluded(&path) {
        continue;
      }

      // symlink_metadata: never follow links, so cycles cannot occur.
      let file_type = match entry.file_type().await {
        Ok(ft) => ft,
        Err(e) => {
          warn!(path = %path.display(), error = %e, "Failed to stat entry");
          continue;
        }
      };

      if file_type.is_dir() {
        if filter.is_bundle_dir(&path) {
          debug!(path = %path.display(), "Skipping bundle");
          result.skipped_bundles.push(path);
        } else {
          queue.push_back(path);
        }
      } else if file_type.is_file() && filter.is_supported_file(&path) {
        result.files.push(path);
      }
    }
  }

  debug!(
    files = result.files.len(),
    skipped_bundles = result.skipped_bundles.len(),
    "Scan complete"
  );
  result
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn options() -> ScanOptions {
    ScanOptions {
      exclude_bundles: true,
      bundle_patterns: vec!["**/*.app/**".to_string()],
      exclude_patterns: vec!["node_modules".to_string()],
      supported_extensions: vec!["pdf".to_string(), "txt".to_string()],
    }
  }

  async fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, content).await.unwrap();
  }

  #[test]
  fn test_bundle_extension_extraction() {
    assert_eq!(bundle_extension("**/*.app/**"), Some("app".to_string()));
    assert_eq!(bundle_extension("**/*.photoslibrary/**"), Some("photoslibrary".to_string()));
    assert_eq!(bundle_extension("**/raw/**"), None);
  }

  #[tokio::test]
  async fn test_bundle_skip() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("readme.pdf"), "pdf").await;
    write(&root.join("App.app/Contents/x.txt"), "inside bundle").await;

    let result = scan_directories(&[root.to_path_buf()], &options()).await;

    assert_eq!(result.files, vec![root.join("readme.pdf")]);
    assert_eq!(result.skipped_bundles, vec![root.join("App.app")]);
  }

  #[tokio::test]
  async fn test_exclude_pattern_prunes_subtree() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("keep.txt"), "keep").await;
    write(&root.join("node_modules/dep/readme.txt"), "skip").await;

    let result = scan_directories(&[root.to_path_buf()], &options()).await;
    assert_eq!(result.files, vec![root.join("keep.txt")]);
  }

  #[tokio::test]
  async fn test_extension_filter_case_insensitive() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("upper.PDF"), "pdf").await;
    write(&root.join("photo.jpg"), "jpg").await;

    let result = scan_directories(&[root.to_path_buf()], &options()).await;
    assert_eq!(result.files, vec![root.join("upper.PDF")]);
  }

  #[tokio::test]
  async fn test_missing_root_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("a.txt"), "a").await;

    let roots = vec![PathBuf::from("/definitely/not/here"), root.to_path_buf()];
    let result = scan_directories(&roots, &options()).await;
    assert_eq!(result.files, vec![root.join("a.txt")]);
  }

  #[tokio::test]
  async fn test_bundles_not_skipped_when_disabled() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("App.app/Contents/x.txt"), "inside bundle").await;

    let mut opts = options();
    opts.exclude_bundles = false;
    let result = scan_directories(&[root.to_path_buf()], &opts).await;

    assert_eq!(result.files, vec![root.join("App.app/Contents/x.txt")]);
    assert!(result.skipped_bundles.is_empty());
  }
}
