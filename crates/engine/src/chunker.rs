//! Overlapping text chunker.
//!
//! Pure function from a parsed document to an ordered sequence of chunks
//! with byte offsets. Word boundaries are deliberately not preserved;
//! correctness follows offsets, not semantics.

/// One chunk of a parsed document, identified by its byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
  pub text: String,
  /// Byte offset of the chunk start within the source text.
  pub offset: u64,
}

/// Configuration for the chunker.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
  /// Chunk size in characters.
  pub size: usize,
  /// Overlap between consecutive chunks in characters. Must be < size.
  pub overlap: usize,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      size: 1000,
      overlap: 200,
    }
  }
}

impl ChunkerConfig {
  /// Characters advanced between chunk starts.
  fn step(&self) -> usize {
    debug_assert!(self.overlap < self.size);
    (self.size - self.overlap).max(1)
  }
}

/// Split `text` into overlapping chunks.
///
/// Empty input yields an empty sequence; input shorter than the chunk
/// size yields a single chunk. Offsets are strictly increasing.
pub fn chunk_text(text: &str, config: ChunkerConfig) -> Vec<TextChunk> {
  if text.is_empty() {
    return Vec::new();
  }

  // (byte offset, char) pairs keep slicing on char boundaries.
  let char_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
  let total_chars = char_offsets.len();

  if total_chars <= config.size {
    return vec![TextChunk {
      text: text.to_string(),
      offset: 0,
    }];
  }

  let step = config.step();
  let mut chunks = Vec::with_capacity(total_chars / step + 1);
  let mut start_char = 0usize;

  while start_char < total_chars {
    let end_char = (start_char + config.size).min(total_chars);
    let start_byte = char_offsets[start_char];
    let end_byte = if end_char == total_chars {
      text.len()
    } else {
      char_offsets[end_char]
    };

    chunks.push(TextChunk {
      text: text[start_byte..end_byte].to_string(),
      offset: start_byte as u64,
    });

    if end_char == total_chars {
      break;
    }
    start_char += step;
  }

  chunks
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(size: usize, overlap: usize) -> ChunkerConfig {
    ChunkerConfig { size, overlap }
  }

  #[test]
  fn test_empty_input_yields_no_chunks() {
    assert!(chunk_text("", ChunkerConfig::default()).is_empty());
  }

  #[test]
  fn test_short_input_yields_single_chunk() {
    let chunks = chunk_text("hello world", config(100, 20));
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "hello world");
    assert_eq!(chunks[0].offset, 0);
  }

  #[test]
  fn test_exact_size_yields_single_chunk() {
    let text = "a".repeat(100);
    let chunks = chunk_text(&text, config(100, 20));
    assert_eq!(chunks.len(), 1);
  }

  #[test]
  fn test_offsets_strictly_increasing() {
    let text = "abcdefghij".repeat(50);
    let chunks = chunk_text(&text, config(100, 30));
    assert!(chunks.len() > 1);
    for pair in chunks.windows(2) {
      assert!(pair[1].offset > pair[0].offset);
    }
  }

  #[test]
  fn test_overlap_repeats_tail_of_previous_chunk() {
    let text: String = ('a'..='z').cycle().take(250).collect();
    let chunks = chunk_text(&text, config(100, 25));

    for pair in chunks.windows(2) {
      let prev_tail: String = pair[0].text.chars().skip(75).collect();
      let next_head: String = pair[1].text.chars().take(25).collect();
      assert_eq!(prev_tail, next_head, "overlap region must match");
    }
  }

  #[test]
  fn test_chunks_cover_entire_input() {
    let text = "0123456789".repeat(33);
    let chunks = chunk_text(&text, config(100, 40));

    let last = chunks.last().unwrap();
    assert_eq!(last.offset as usize + last.text.len(), text.len());

    // Reconstruct from steps: every byte position must be inside a chunk.
    for chunk in &chunks {
      let start = chunk.offset as usize;
      assert_eq!(&text[start..start + chunk.text.len()], chunk.text);
    }
  }

  #[test]
  fn test_multibyte_chars_stay_on_boundaries() {
    let text = "héllo wörld ünïcödé ".repeat(30);
    let chunks = chunk_text(&text, config(50, 10));
    // Slicing off a char boundary would have panicked inside chunk_text;
    // verify offsets land on boundaries too.
    for chunk in &chunks {
      assert!(text.is_char_boundary(chunk.offset as usize));
    }
  }

  #[test]
  fn test_reindex_is_deterministic() {
    let text = "determinism matters for idempotent reindexing".repeat(20);
    let first = chunk_text(&text, config(120, 30));
    let second = chunk_text(&text, config(120, 30));
    assert_eq!(first, second);
  }
}
