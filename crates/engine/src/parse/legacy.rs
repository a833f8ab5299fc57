//! RTF and legacy `.doc` extraction.
//!
//! No maintained crate covers either format, so both get conservative
//! hand extractors: RTF via a control-word stripper, `.doc` via a
//! printable-run scan of the container bytes. Output quality is
//! best-effort; a failed extraction still indexes whatever text survives.

use encoding_rs::WINDOWS_1252;

use super::{ParseError, ParsedDocument};

/// RTF destination groups whose content is metadata, not body text.
const SKIP_DESTINATIONS: &[&str] = &[
  "fonttbl",
  "colortbl",
  "stylesheet",
  "info",
  "pict",
  "header",
  "footer",
  "generator",
];

/// Strip RTF control words and groups, keeping body text.
pub fn parse_rtf(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  let source = String::from_utf8_lossy(bytes);
  if !source.trim_start().starts_with("{\\rtf") {
    return Err(ParseError::Malformed {
      kind: "rtf",
      message: "missing {\\rtf header".to_string(),
    });
  }

  let mut text = String::new();
  let mut chars = source.chars().peekable();
  // Nesting depth below which we are inside a skipped destination group.
  let mut depth: i32 = 0;
  let mut skip_until_depth: Option<i32> = None;

  while let Some(c) = chars.next() {
    match c {
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if let Some(skip_depth) = skip_until_depth
          && depth < skip_depth
        {
          skip_until_depth = None;
        }
      }
      '\\' => {
        let Some(&next) = chars.peek() else { break };
        if next == '\\' || next == '{' || next == '}' {
          chars.next();
          if skip_until_depth.is_none() {
            text.push(next);
          }
          continue;
        }
        if next == '\'' {
          chars.next();
          let hi = chars.next();
          let lo = chars.next();
          if skip_until_depth.is_none()
            && let (Some(hi), Some(lo)) = (hi, lo)
            && let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16)
          {
            let (decoded, _, _) = WINDOWS_1252.decode(&[byte]);
            text.push_str(&decoded);
          }
          continue;
        }
        if next == '*' {
          // \* marks an optional destination; skip the whole group.
          chars.next();
          skip_until_depth = skip_until_depth.or(Some(depth));
          continue;
        }

        // Consume the control word and its numeric argument.
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
          if c.is_ascii_alphabetic() {
            word.push(c);
            chars.next();
          } else {
            break;
          }
        }
        while let Some(&c) = chars.peek() {
          if c.is_ascii_digit() || c == '-' {
            chars.next();
          } else {
            break;
          }
        }
        // A single space after a control word is part of the word.
        if chars.peek() == Some(&' ') {
          chars.next();
        }

        if SKIP_DESTINATIONS.contains(&word.as_str()) {
          skip_until_depth = skip_until_depth.or(Some(depth));
        } else if skip_until_depth.is_none() {
          match word.as_str() {
            "par" | "line" | "sect" | "page" => text.push('\n'),
            "tab" | "cell" => text.push('\t'),
            _ => {}
          }
        }
      }
      '\r' | '\n' => {}
      _ if skip_until_depth.is_none() => text.push(c),
      _ => {}
    }
  }

  Ok(ParsedDocument::flat(text.trim().to_string()))
}

/// Best-effort extraction from legacy binary `.doc` files: keep runs of
/// printable Windows-1252 text long enough to plausibly be prose.
pub fn parse_doc(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
  const MIN_RUN: usize = 8;

  let (decoded, _, _) = WINDOWS_1252.decode(bytes);
  let mut text = String::new();
  let mut run = String::new();

  for c in decoded.chars() {
    let printable = !c.is_control() || c == '\t';
    if printable {
      run.push(c);
    } else {
      if run.trim().chars().count() >= MIN_RUN && looks_like_prose(&run) {
        if !text.is_empty() {
          text.push('\n');
        }
        text.push_str(run.trim());
      }
      run.clear();
    }
  }
  if run.trim().chars().count() >= MIN_RUN && looks_like_prose(&run) {
    if !text.is_empty() {
      text.push('\n');
    }
    text.push_str(run.trim());
  }

  Ok(ParsedDocument::flat(text))
}

/// Binary containers produce runs of symbol soup; require a majority of
/// word-ish characters before keeping a run.
fn looks_like_prose(run: &str) -> bool {
  let total = run.chars().count();
  if total == 0 {
    return false;
  }
  let wordish = run.chars().filter(|c| c.is_alphanumeric() || *c == ' ').count();
  wordish * 10 >= total * 7
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rtf_basic_body() {
    let rtf = br"{\rtf1\ansi{\fonttbl{\f0 Helvetica;}}\f0\fs24 Hello, plain body.\par Second line.}";
    let doc = parse_rtf(rtf).unwrap();
    assert_eq!(doc.text, "Hello, plain body.\nSecond line.");
  }

  #[test]
  fn test_rtf_skips_font_table_and_info() {
    let rtf = br"{\rtf1{\fonttbl{\f0 Times New Roman;}}{\info{\author Secret Author}}Visible.}";
    let doc = parse_rtf(rtf).unwrap();
    assert_eq!(doc.text, "Visible.");
    assert!(!doc.text.contains("Times"));
    assert!(!doc.text.contains("Secret"));
  }

  #[test]
  fn test_rtf_hex_escape() {
    let rtf = br"{\rtf1 caf\'e9 au lait}";
    let doc = parse_rtf(rtf).unwrap();
    assert_eq!(doc.text, "café au lait");
  }

  #[test]
  fn test_rtf_escaped_braces() {
    let rtf = br"{\rtf1 literal \{braces\} and \\backslash}";
    let doc = parse_rtf(rtf).unwrap();
    assert_eq!(doc.text, "literal {braces} and \\backslash");
  }

  #[test]
  fn test_rtf_without_header_is_malformed() {
    let err = parse_rtf(b"just some text").unwrap_err();
    assert!(matches!(err, ParseError::Malformed { kind: "rtf", .. }));
  }

  #[test]
  fn test_doc_keeps_prose_runs() {
    let mut bytes = vec![0u8; 32];
    bytes.extend_from_slice(b"This is a readable sentence from the body.");
    bytes.extend_from_slice(&[0, 1, 2, 3]);
    bytes.extend_from_slice(b"\x05\x06#@!$%^&*()#@!$%^&*()");
    bytes.extend_from_slice(&[0; 16]);
    bytes.extend_from_slice(b"Another paragraph of content here.");

    let doc = parse_doc(&bytes).unwrap();
    assert!(doc.text.contains("This is a readable sentence from the body."));
    assert!(doc.text.contains("Another paragraph of content here."));
    assert!(!doc.text.contains("#@!$%^"));
  }
}
