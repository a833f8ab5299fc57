//! Shared domain types for the indexing pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Indexing state of a file as recorded in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
  Indexed,
  Failed,
  Outdated,
}

impl FileStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      FileStatus::Indexed => "indexed",
      FileStatus::Failed => "failed",
      FileStatus::Outdated => "outdated",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "indexed" => Some(FileStatus::Indexed),
      "failed" => Some(FileStatus::Failed),
      "outdated" => Some(FileStatus::Outdated),
      _ => None,
    }
  }
}

/// One row of the file-status catalogue.
///
/// `file_hash` is a digest of size + mtime, never content: the point is
/// cheap change detection, not integrity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
  /// Absolute path of the file.
  pub path: String,
  pub status: FileStatus,
  pub file_hash: String,
  /// Parser registry version at the time of indexing.
  pub parser_version: i32,
  pub chunk_count: u32,
  /// File mtime (Unix ms) observed at index time.
  pub last_modified: i64,
  /// When indexing last completed (Unix ms).
  pub indexed_at: i64,
  /// Last failed-retry attempt (Unix ms), if any.
  pub last_retry: Option<i64>,
  pub error_message: Option<String>,
}

/// Document formats the parser registry understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
  Pdf,
  Txt,
  Md,
  Docx,
  Rtf,
  Doc,
}

impl DocumentKind {
  /// Resolve a kind from a file extension (case-insensitive, sans dot).
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_ascii_lowercase().as_str() {
      "pdf" => Some(DocumentKind::Pdf),
      "txt" | "text" => Some(DocumentKind::Txt),
      "md" | "markdown" => Some(DocumentKind::Md),
      "docx" => Some(DocumentKind::Docx),
      "rtf" => Some(DocumentKind::Rtf),
      "doc" => Some(DocumentKind::Doc),
      _ => None,
    }
  }

  pub fn from_path(path: &Path) -> Option<Self> {
    path.extension().and_then(|e| e.to_str()).and_then(Self::from_extension)
  }

  pub fn extension(&self) -> &'static str {
    match self {
      DocumentKind::Pdf => "pdf",
      DocumentKind::Txt => "txt",
      DocumentKind::Md => "md",
      DocumentKind::Docx => "docx",
      DocumentKind::Rtf => "rtf",
      DocumentKind::Doc => "doc",
    }
  }
}

/// Deterministic chunk id mixing path and offset.
///
/// Two files chunked at the same offset must produce distinct ids, so the
/// path is part of the digest input.
pub fn chunk_id(path: &str, offset: u64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(path.as_bytes());
  hasher.update(b":");
  hasher.update(offset.to_string().as_bytes());
  hex::encode(&hasher.finalize()[..16])
}

/// Short digest of file metadata (size + mtime in nanoseconds).
pub fn metadata_digest(size: u64, mtime_ns: i64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(size.to_string().as_bytes());
  hasher.update(b":");
  hasher.update(mtime_ns.to_string().as_bytes());
  hex::encode(&hasher.finalize()[..8])
}
