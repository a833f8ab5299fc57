//! Model provider.
//!
//! Resolves the on-disk location of the embedding model. Downloading is
//! an external collaborator; this side of the contract only locates
//! model files and reports what is missing. Progress events for an
//! in-flight download travel on the `model:download:progress` channel.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Default embedding model. E5-style: queries and passages are embedded
/// with distinct prefixes.
pub const DEFAULT_MODEL: &str = "multilingual-e5-base";

/// Files a usable model directory must contain.
const REQUIRED_FILES: &[&str] = &["model.onnx", "tokenizer.json"];

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
  #[error("Model '{name}' not found under {dir} (missing {missing})")]
  NotFound {
    name: String,
    dir: PathBuf,
    missing: String,
  },
}

/// Resolve the directory holding `name`'s files.
///
/// `TRANSFORMERS_CACHE` (handled by [`semdex_core::dirs::model_cache_dir`])
/// wins over the user-data default. The directory must already contain
/// the model; fetching it is the downloader collaborator's job.
pub fn ensure_model(name: &str) -> Result<PathBuf, ModelError> {
  let dir = semdex_core::dirs::model_cache_dir().join(name);
  ensure_model_at(name, &dir)
}

/// Same as [`ensure_model`] with an explicit base directory.
pub fn ensure_model_at(name: &str, dir: &Path) -> Result<PathBuf, ModelError> {
  for required in REQUIRED_FILES {
    let candidate = dir.join(required);
    if !candidate.is_file() {
      return Err(ModelError::NotFound {
        name: name.to_string(),
        dir: dir.to_path_buf(),
        missing: (*required).to_string(),
      });
    }
  }

  debug!(model = name, dir = %dir.display(), "Model resolved");
  Ok(dir.to_path_buf())
}
