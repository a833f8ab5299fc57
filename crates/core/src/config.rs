//! Persistent configuration document.
//!
//! A single JSON file under the database directory holds the watched
//! roots, exclusion rules, file-type toggles and concurrency hints. The
//! supervisor is the only writer; the worker reloads on change
//! notification. Mutations rewrite the file atomically (temp + rename).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::DocumentKind;

/// Current config document version.
pub const CONFIG_VERSION: u32 = 1;

/// Directory basename tokens that are never descended into.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
  ".git",
  ".svn",
  ".Trash",
  "node_modules",
  "__pycache__",
  ".cache",
];

/// Bundle globs whose matched directories are skipped as a unit.
pub const DEFAULT_BUNDLE_PATTERNS: &[&str] = &[
  "**/*.app/**",
  "**/*.bundle/**",
  "**/*.framework/**",
  "**/*.photoslibrary/**",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed config: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("Watched path must be absolute: {0}")]
  NotAbsolute(PathBuf),
  #[error("Watched path {child} is nested inside {parent}")]
  NestedRoot { parent: PathBuf, child: PathBuf },
  #[error("Folder is not watched: {0}")]
  UnknownFolder(PathBuf),
}

/// One user-nominated root directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedFolder {
  pub path: PathBuf,
  pub active: bool,
}

/// Per-extension indexing toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTypeToggles {
  pub pdf: bool,
  pub txt: bool,
  pub md: bool,
  pub docx: bool,
  pub rtf: bool,
  pub doc: bool,
}

impl Default for FileTypeToggles {
  fn default() -> Self {
    Self {
      pdf: true,
      txt: true,
      md: true,
      docx: true,
      rtf: true,
      doc: true,
    }
  }
}

impl FileTypeToggles {
  pub fn is_enabled(&self, kind: DocumentKind) -> bool {
    match kind {
      DocumentKind::Pdf => self.pdf,
      DocumentKind::Txt => self.txt,
      DocumentKind::Md => self.md,
      DocumentKind::Docx => self.docx,
      DocumentKind::Rtf => self.rtf,
      DocumentKind::Doc => self.doc,
    }
  }

  /// The extensions currently enabled, sans dot, lowercase.
  pub fn enabled_extensions(&self) -> Vec<String> {
    [
      DocumentKind::Pdf,
      DocumentKind::Txt,
      DocumentKind::Md,
      DocumentKind::Docx,
      DocumentKind::Rtf,
      DocumentKind::Doc,
    ]
    .iter()
    .filter(|k| self.is_enabled(**k))
    .map(|k| k.extension().to_string())
    .collect()
  }
}

/// Concurrency hint for the file queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CpuThrottle {
  Low,
  #[default]
  Medium,
  High,
}

impl CpuThrottle {
  /// Maximum concurrent file handlers for this throttle level.
  pub fn max_concurrent(&self) -> usize {
    match self {
      CpuThrottle::Low => 2,
      CpuThrottle::Medium => 5,
      CpuThrottle::High => 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
  pub exclude_bundles: bool,
  pub bundle_patterns: Vec<String>,
  pub exclude_patterns: Vec<String>,
  pub cpu_throttle: CpuThrottle,
  pub file_types: FileTypeToggles,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      exclude_bundles: true,
      bundle_patterns: DEFAULT_BUNDLE_PATTERNS.iter().map(|s| s.to_string()).collect(),
      exclude_patterns: DEFAULT_EXCLUDE_PATTERNS.iter().map(|s| s.to_string()).collect(),
      cpu_throttle: CpuThrottle::default(),
      file_types: FileTypeToggles::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
  pub version: u32,
  pub watched_folders: Vec<WatchedFolder>,
  pub settings: Settings,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: CONFIG_VERSION,
      watched_folders: Vec::new(),
      settings: Settings::default(),
    }
  }
}

impl Config {
  /// Active watched roots.
  pub fn active_roots(&self) -> Vec<PathBuf> {
    self
      .watched_folders
      .iter()
      .filter(|f| f.active)
      .map(|f| f.path.clone())
      .collect()
  }

  /// Validate a candidate root against the invariants: absolute, and no
  /// root may be a strict prefix of another.
  pub fn validate_new_root(&self, path: &Path) -> Result<(), ConfigError> {
    if !path.is_absolute() {
      return Err(ConfigError::NotAbsolute(path.to_path_buf()));
    }
    for folder in &self.watched_folders {
      if path.starts_with(&folder.path) && path != folder.path {
        return Err(ConfigError::NestedRoot {
          parent: folder.path.clone(),
          child: path.to_path_buf(),
        });
      }
      if folder.path.starts_with(path) && path != folder.path {
        return Err(ConfigError::NestedRoot {
          parent: path.to_path_buf(),
          child: folder.path.clone(),
        });
      }
    }
    Ok(())
  }
}

/// Load/store for the config document.
pub struct ConfigStore {
  path: PathBuf,
}

impl ConfigStore {
  pub fn new(db_dir: &Path) -> Self {
    Self {
      path: db_dir.join("config.json"),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Load the config, falling back to defaults when the file is absent.
  pub async fn load(&self) -> Result<Config, ConfigError> {
    match tokio::fs::read(&self.path).await {
      Ok(bytes) => {
        let config: Config = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), folders = config.watched_folders.len(), "Loaded config");
        Ok(config)
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %self.path.display(), "No config file, using defaults");
        Ok(Config::default())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Persist the config atomically: write a temp file, then rename over
  /// the target so readers never observe a torn document.
  pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(config)?;
    let tmp = self.path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, &self.path).await?;

    debug!(path = %self.path.display(), "Config saved");
    Ok(())
  }

  /// Add a watched folder, validating and persisting.
  pub async fn add_folder(&self, path: &Path) -> Result<Config, ConfigError> {
    let mut config = self.load().await?;
    config.validate_new_root(path)?;

    if let Some(existing) = config.watched_folders.iter_mut().find(|f| f.path == path) {
      existing.active = true;
    } else {
      config.watched_folders.push(WatchedFolder {
        path: path.to_path_buf(),
        active: true,
      });
      info!(path = %path.display(), "Watched folder added");
    }

    self.save(&config).await?;
    Ok(config)
  }

  /// Remove a watched folder and persist.
  pub async fn remove_folder(&self, path: &Path) -> Result<Config, ConfigError> {
    let mut config = self.load().await?;
    let before = config.watched_folders.len();
    config.watched_folders.retain(|f| f.path != path);

    if config.watched_folders.len() == before {
      return Err(ConfigError::UnknownFolder(path.to_path_buf()));
    }

    info!(path = %path.display(), "Watched folder removed");
    self.save(&config).await?;
    Ok(config)
  }
}
