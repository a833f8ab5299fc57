//! Document parsers.
//!
//! A registry keyed by extension dispatches to one parser per format and
//! normalises everything to UTF-8 text. Parse failures propagate as
//! `ParseError`; the file processor records the file as failed and moves
//! on.

mod docx;
mod legacy;
mod pdf;
mod text;

use std::path::Path;

use semdex_core::DocumentKind;
use tracing::debug;

pub use text::decode_bytes;

/// Version of the parser registry. Bumped whenever extraction output can
/// change; the planner re-indexes files written by an older version.
pub const PARSER_VERSION: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Unsupported file type: {0}")]
  Unsupported(String),
  #[error("Malformed {kind}: {message}")]
  Malformed { kind: &'static str, message: String },
}

/// A parsed document, normalised to UTF-8.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
  pub text: String,
  /// Byte offsets where pages start, for formats with page structure.
  /// Empty when the format has no page concept.
  pub page_breaks: Vec<u64>,
}

impl ParsedDocument {
  pub fn flat(text: String) -> Self {
    Self {
      text,
      page_breaks: Vec::new(),
    }
  }

  /// Page number (1-based) containing the given byte offset, when the
  /// document has pages.
  pub fn page_at(&self, offset: u64) -> Option<i32> {
    if self.page_breaks.is_empty() {
      return None;
    }
    let page = match self.page_breaks.binary_search(&offset) {
      Ok(i) => i + 1,
      Err(i) => i,
    };
    Some(page.max(1) as i32)
  }
}

/// Parse a document by its extension.
pub async fn parse_document(path: &Path) -> Result<ParsedDocument, ParseError> {
  let kind = DocumentKind::from_path(path)
    .ok_or_else(|| ParseError::Unsupported(path.to_string_lossy().into_owned()))?;
  parse_as(path, kind).await
}

/// Parse a document as a specific kind.
pub async fn parse_as(path: &Path, kind: DocumentKind) -> Result<ParsedDocument, ParseError> {
  debug!(path = %path.display(), kind = ?kind, "Parsing document");

  let bytes = tokio::fs::read(path).await?;
  // All extraction is CPU-bound; keep it off the worker's reactor.
  let parsed = tokio::task::spawn_blocking(move || match kind {
    DocumentKind::Txt | DocumentKind::Md => Ok(ParsedDocument::flat(text::decode_bytes(&bytes))),
    DocumentKind::Pdf => pdf::parse(&bytes),
    DocumentKind::Docx => docx::parse(&bytes),
    DocumentKind::Rtf => legacy::parse_rtf(&bytes),
    DocumentKind::Doc => legacy::parse_doc(&bytes),
  })
  .await
  .map_err(|e| ParseError::Malformed {
    kind: "document",
    message: format!("parser task failed: {e}"),
  })??;

  Ok(parsed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_unknown_extension_is_unsupported() {
    let err = parse_document(Path::new("/tmp/archive.tar.gz")).await.unwrap_err();
    assert!(matches!(err, ParseError::Unsupported(_)));
  }

  #[tokio::test]
  async fn test_missing_file_is_io_error() {
    let err = parse_document(Path::new("/definitely/missing.txt")).await.unwrap_err();
    assert!(matches!(err, ParseError::Io(_)));
  }

  #[test]
  fn test_page_at_maps_offsets_to_pages() {
    let doc = ParsedDocument {
      text: String::new(),
      page_breaks: vec![0, 100, 250],
    };
    assert_eq!(doc.page_at(0), Some(1));
    assert_eq!(doc.page_at(50), Some(1));
    assert_eq!(doc.page_at(100), Some(2));
    assert_eq!(doc.page_at(249), Some(2));
    assert_eq!(doc.page_at(900), Some(3));
  }

  #[test]
  fn test_page_at_none_without_pages() {
    let doc = ParsedDocument::flat("no pages".to_string());
    assert_eq!(doc.page_at(3), None);
  }
}
