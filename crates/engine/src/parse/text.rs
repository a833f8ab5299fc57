//! Encoding detection and decoding for plain-text formats.

use chardetng::EncodingDetector;
use tracing::trace;

/// Decode a byte buffer to UTF-8, sniffing the source encoding.
///
/// Undecodable bytes are replaced rather than failing; a BOM wins over
/// detection.
pub fn decode_bytes(bytes: &[u8]) -> String {
  if bytes.is_empty() {
    return String::new();
  }

  let mut detector = EncodingDetector::new();
  detector.feed(bytes, true);
  let encoding = detector.guess(None, true);

  let (text, actual, replaced) = encoding.decode(bytes);
  trace!(
    detected = encoding.name(),
    used = actual.name(),
    replaced = replaced,
    "Decoded text buffer"
  );

  text.into_owned()
}
