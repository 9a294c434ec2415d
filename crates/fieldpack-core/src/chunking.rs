//! Overlapping fixed-width text windows.
//!
//! Windows start every `chunk_chars - overlap_chars` characters while the
//! start is inside the text, and each runs for `chunk_chars` characters or to
//! the end. A trailing window shorter than `min_chunk_chars` is folded into
//! its predecessor. Offsets are Unicode scalar positions, so boundaries do not
//! depend on platform or encoding.

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  canonical::{Hash256, digest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
  pub chunk_chars:     usize,
  pub overlap_chars:   usize,
  pub min_chunk_chars: usize,
}

impl Default for ChunkConfig {
  fn default() -> Self {
    Self { chunk_chars: 1200, overlap_chars: 150, min_chunk_chars: 200 }
  }
}

impl ChunkConfig {
  pub fn validate(&self) -> Result<()> {
    if self.chunk_chars == 0 {
      return Err(Error::ChunkConfig("chunk_chars must be positive".into()));
    }
    if self.overlap_chars >= self.chunk_chars {
      return Err(Error::ChunkConfig(format!(
        "overlap_chars ({}) must be smaller than chunk_chars ({})",
        self.overlap_chars, self.chunk_chars
      )));
    }
    if self.min_chunk_chars == 0 {
      return Err(Error::ChunkConfig("min_chunk_chars must be at least 1".into()));
    }
    Ok(())
  }

  fn step(&self) -> usize { self.chunk_chars - self.overlap_chars }
}

/// A window over a text, in character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
  pub start: usize,
  pub end:   usize,
}

/// A window together with its text and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
  pub index:  usize,
  pub start:  usize,
  pub end:    usize,
  pub text:   String,
  pub sha256: Hash256,
}

/// Window boundaries for a text of `len` characters.
pub fn spans(len: usize, config: &ChunkConfig) -> Result<Vec<Span>> {
  config.validate()?;

  let mut out: Vec<Span> = Vec::new();
  let mut start = 0;
  while start < len {
    out.push(Span { start, end: (start + config.chunk_chars).min(len) });
    start += config.step();
  }

  if out.len() > 1
    && let Some(last) = out.last().copied()
    && last.end - last.start < config.min_chunk_chars
  {
    out.pop();
    if let Some(prev) = out.last_mut() {
      prev.end = prev.end.max(last.end);
    }
  }
  Ok(out)
}

/// Split `text` into hashed chunks.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Result<Vec<TextChunk>> {
  // Byte offset of every character boundary, plus the end of the string.
  let bounds: Vec<usize> = text
    .char_indices()
    .map(|(i, _)| i)
    .chain(std::iter::once(text.len()))
    .collect();
  let len = bounds.len() - 1;

  Ok(
    spans(len, config)?
      .into_iter()
      .enumerate()
      .map(|(index, span)| {
        let slice = &text[bounds[span.start]..bounds[span.end]];
        TextChunk {
          index,
          start: span.start,
          end: span.end,
          text: slice.to_owned(),
          sha256: digest(slice.as_bytes()),
        }
      })
      .collect(),
  )
}
