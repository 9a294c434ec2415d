//! Ingested documents, their chunks and the CAS blobs behind them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::Hash256;

/// What a blob holds. Part of its storage identity alongside the digest.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
  /// Bytes exactly as ingested.
  Raw,
  /// UTF-8 text extracted from a raw blob.
  Extract,
  /// Tool output, prompts and responses.
  Aux,
}

impl BlobKind {
  pub fn as_str(self) -> &'static str {
    match self {
      BlobKind::Raw => "raw",
      BlobKind::Extract => "extract",
      BlobKind::Aux => "aux",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "raw" => Some(BlobKind::Raw),
      "extract" => Some(BlobKind::Extract),
      "aux" => Some(BlobKind::Aux),
      _ => None,
    }
  }
}

impl fmt::Display for BlobKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Catalog entry for a CAS blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
  pub sha256:      Hash256,
  pub kind:        BlobKind,
  pub size:        u64,
  pub created_utc: String,
  pub source_path: Option<String>,
}

/// Metadata for one ingested file. Re-ingesting the same path produces a new
/// document; rows are never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
  pub doc_id:           Uuid,
  pub path:             String,
  pub mime:             String,
  pub size:             u64,
  pub raw_sha256:       Hash256,
  pub extract_sha256:   Option<Hash256>,
  pub extract_strategy: String,
  pub created_utc:      String,
}

/// A contiguous slice of a document's extracted text. Offsets count Unicode
/// scalar values, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
  pub doc_id: Uuid,
  pub index:  usize,
  pub start:  usize,
  pub end:    usize,
  pub text:   String,
  pub sha256: Hash256,
}
