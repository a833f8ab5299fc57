//! PDF text extraction.

use super::{ParseError, ParsedDocument};

/// Extract text from a PDF buffer.
///
/// `pdf_extract` separates pages with form feeds; those become the
/// document's page breaks and are dropped from the text itself.
pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let raw = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Malformed {
    kind: "pdf",
    message: e.to_string(),
  })?;

  Ok(split_pages(&raw))
}

/// Turn form-feed separated text into flat text plus page-break offsets.
fn split_pages(raw: &str) -> ParsedDocument {
  if !raw.contains('\u{c}') {
    return ParsedDocument::flat(raw.to_string());
  }

  let mut text = String::with_capacity(raw.len());
  let mut page_breaks = vec![0u64];

  for (i, page) in raw.split('\u{c}').enumerate() {
    if i > 0 {
      text.push('\n');
      page_breaks.push(text.len() as u64);
    }
    text.push_str(page);
  }

  ParsedDocument { text, page_breaks }
}
