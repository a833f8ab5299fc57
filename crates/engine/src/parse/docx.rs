//! DOCX text extraction.
//!
//! A .docx file is a zip archive; the body text lives in
//! `word/document.xml` as `<w:t>` runs grouped into `<w:p>` paragraphs.

use std::io::{Cursor, Read};

use quick_xml::{Reader, events::Event};

use super::{ParseError, ParsedDocument};

pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParseError::Malformed {
    kind: "docx",
    message: e.to_string(),
  })?;

  let mut document_xml = String::new();
  archive
    .by_name("word/document.xml")
    .map_err(|e| ParseError::Malformed {
      kind: "docx",
      message: format!("missing word/document.xml: {e}"),
    })?
    .read_to_string(&mut document_xml)
    .map_err(|e| ParseError::Malformed {
      kind: "docx",
      message: e.to_string(),
    })?;

  extract_runs(&document_xml)
}

/// Pull the text runs out of document.xml, inserting newlines at
/// paragraph ends and explicit breaks.
fn extract_runs(xml: &str) -> Result<ParsedDocument, ParseError> {
  let mut reader = Reader::from_str(xml);
  reader.config_mut().trim_text(false);

  let mut text = String::new();
  let mut in_text_run = false;
  let mut buf = Vec::new();

  loop {
    match reader.read_event_into(&mut buf) {
      Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text_run = true,
      Ok(Event::End(e)) => match e.local_name().as_ref() {
        b"t" => in_text_run = false,
        b"p" => {
          if !text.ends_with('\n') {
            text.push('\n');
          }
        }
        _ => {}
      },
      Ok(Event::Empty(e)) if matches!(e.local_name().as_ref(), b"br" | b"cr") => text.push('\n'),
      Ok(Event::Text(t)) if in_text_run => {
        let run = t.unescape().map_err(|e| ParseError::Malformed {
          kind: "docx",
          message: e.to_string(),
        })?;
        text.push_str(&run);
      }
      Ok(Event::Eof) => break,
      Ok(_) => {}
      Err(e) => {
        return Err(ParseError::Malformed {
          kind: "docx",
          message: e.to_string(),
        });
      }
    }
    buf.clear();
  }

  Ok(ParsedDocument::flat(text.trim_end().to_string()))
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  const DOCUMENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph with runs.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Line</w:t><w:br/><w:t>break</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

  fn build_docx(document_xml: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
      let mut writer = zip::ZipWriter::new(&mut cursor);
      let options = zip::write::SimpleFileOptions::default();
      writer.start_file("word/document.xml", options).unwrap();
      writer.write_all(document_xml.as_bytes()).unwrap();
      writer.finish().unwrap();
    }
    cursor.into_inner()
  }

  #[test]
  fn test_extracts_paragraphs_and_runs() {
    let doc = parse(&build_docx(DOCUMENT_XML)).unwrap();
    assert!(doc.text.contains("First paragraph.\n"));
    assert!(doc.text.contains("Second paragraph with runs."));
    assert!(doc.text.contains("Line\nbreak"));
  }

  #[test]
  fn test_not_a_zip_is_malformed() {
    let err = parse(b"plain bytes").unwrap_err();
    assert!(matches!(err, ParseError::Malformed { kind: "docx", .. }));
  }

  #[test]
  fn test_zip_without_document_xml_is_malformed() {
    let mut cursor = Cursor::new(Vec::new());
    {
      let mut writer = zip::ZipWriter::new(&mut cursor);
      let options = zip::write::SimpleFileOptions::default();
      writer.start_file("other.txt", options).unwrap();
      writer.write_all(b"hello").unwrap();
      writer.finish().unwrap();
    }
    let err = parse(&cursor.into_inner()).unwrap_err();
    assert!(matches!(err, ParseError::Malformed { kind: "docx", .. }));
  }
}
