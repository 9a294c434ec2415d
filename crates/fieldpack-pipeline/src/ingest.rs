//! Document ingestion: CAS, extraction, chunking and one `INGEST` event.

use std::{fs, path::Path};

use fieldpack_core::{
  LedgerEvent,
  chunking::{TextChunk, chunk_text},
  document::{BlobKind, Chunk, Document},
  ledger::now_utc,
  records::{ChunkRef, IngestRecord},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
  Error, Pipeline, Result,
  extract::{Extraction, detect_mime, extract},
};

#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
  pub document: Document,
  pub chunks:   usize,
  pub event:    LedgerEvent<IngestRecord>,
}

impl Pipeline {
  /// Ingest the file at `path`.
  ///
  /// The document row, its chunks and the `INGEST` event commit together.
  /// Blobs may already be in the CAS if a later step fails; they are
  /// content-addressed, so that is harmless.
  pub fn ingest(&self, path: &Path) -> Result<Ingested> {
    let limit = self.config.ingest.max_bytes;
    let size = fs::metadata(path)?.len();
    if size > limit {
      return Err(Error::TooLarge { path: path.to_path_buf(), size, limit });
    }
    let bytes = fs::read(path)?;
    // The file may have grown since the metadata call.
    if bytes.len() as u64 > limit {
      return Err(Error::TooLarge { path: path.to_path_buf(), size: bytes.len() as u64, limit });
    }

    let source = path.to_string_lossy().into_owned();
    let mime = detect_mime(path);
    let raw = self.cas.put(&bytes, BlobKind::Raw, Some(&source))?;

    let extraction = if self.config.ingest.extract_text {
      extract(path, mime, &bytes)
    } else {
      Extraction::none()
    };
    let extract_sha256 = match &extraction.text {
      Some(text) => Some(self.cas.put(text.as_bytes(), BlobKind::Extract, Some(&source))?.sha256),
      None => None,
    };

    let chunk_source = extraction.text.as_deref().or_else(|| std::str::from_utf8(&bytes).ok());
    let chunks: Vec<TextChunk> = match chunk_source {
      Some(text) => chunk_text(text, &self.config.ingest.chunking())?,
      None => Vec::new(),
    };

    let document = Document {
      doc_id: Uuid::new_v4(),
      path: source,
      mime: mime.to_owned(),
      size: bytes.len() as u64,
      raw_sha256: raw.sha256,
      extract_sha256,
      extract_strategy: extraction.strategy.to_owned(),
      created_utc: now_utc(),
    };
    let record = IngestRecord {
      doc_id:           document.doc_id,
      path:             document.path.clone(),
      mime:             document.mime.clone(),
      size:             document.size,
      raw_sha256:       document.raw_sha256,
      extract_sha256:   document.extract_sha256,
      extract_strategy: document.extract_strategy.clone(),
      toolchain_id:     self.config.toolchain_id.clone(),
      chunks:           chunks
        .iter()
        .map(|c| ChunkRef { index: c.index, start: c.start, end: c.end, sha256: c.sha256 })
        .collect(),
    };

    let event = self.store.ingest_ledger().append_with(|tx| -> Result<IngestRecord> {
      tx.insert_document(&document)?;
      for c in &chunks {
        tx.insert_chunk(&Chunk {
          doc_id: document.doc_id,
          index:  c.index,
          start:  c.start,
          end:    c.end,
          text:   c.text.clone(),
          sha256: c.sha256,
        })?;
      }
      Ok(record)
    })?;

    tracing::info!(
      path = %document.path,
      sha256 = %document.raw_sha256.short(),
      strategy = %document.extract_strategy,
      chunks = chunks.len(),
      seq = event.seq,
      "ingested document"
    );
    Ok(Ingested { document, chunks: chunks.len(), event })
  }
}
