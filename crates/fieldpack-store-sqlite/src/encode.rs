//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Digests are stored as lowercase hex, UUIDs hyphenated, enums by their wire
//! names and structured values as canonical JSON.

use std::collections::BTreeMap;

use fieldpack_core::{
  Hash256, LedgerEvent, SliceRange,
  canonical::canonicalize,
  document::{BlobKind, BlobRecord, Chunk, Document},
  kg::{Attrs, Edge, Node},
  ledger::LedgerKind,
  policy::AcceptanceMode,
  staging::{StageStatus, StagedBundle},
};
use rusqlite::Row;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{Error, Result, catalog::SealCheckpoint};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn decode_hash(s: &str) -> Result<Hash256> { Ok(s.parse()?) }

pub fn decode_opt_hash(s: Option<&str>) -> Result<Option<Hash256>> {
  s.map(decode_hash).transpose()
}

/// Canonical JSON text. Canonical output is always valid UTF-8.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  String::from_utf8(canonicalize(value)?).map_err(|e| Error::Decode(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(s: &str) -> Result<T> { Ok(serde_json::from_str(s)?) }

pub fn decode_status(s: &str) -> Result<StageStatus> {
  StageStatus::parse(s).ok_or_else(|| Error::Decode(format!("unknown stage status: {s:?}")))
}

pub fn decode_mode(s: &str) -> Result<AcceptanceMode> {
  AcceptanceMode::parse(s).ok_or_else(|| Error::Decode(format!("unknown policy mode: {s:?}")))
}

pub fn decode_blob_kind(s: &str) -> Result<BlobKind> {
  BlobKind::parse(s).ok_or_else(|| Error::Decode(format!("unknown blob kind: {s:?}")))
}

// ─── Ledger rows ─────────────────────────────────────────────────────────────

pub const EVENT_COLUMNS: &str = "seq, ts_utc, event_type, payload_json, prev_hash, event_hash";

/// A ledger row exactly as stored.
pub struct RawEvent {
  pub seq:          i64,
  pub ts_utc:       String,
  pub event_type:   String,
  pub payload_json: String,
  pub prev_hash:    Option<String>,
  pub event_hash:   String,
}

impl RawEvent {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:          row.get(0)?,
      ts_utc:       row.get(1)?,
      event_type:   row.get(2)?,
      payload_json: row.get(3)?,
      prev_hash:    row.get(4)?,
      event_hash:   row.get(5)?,
    })
  }

  /// Decode into an event. Any failure is reported against this row's seq.
  pub fn decode<T: DeserializeOwned>(self) -> Result<LedgerEvent<T>> {
    let seq = self.seq;
    let malformed = |detail: String| Error::MalformedRow { seq, detail };

    let payload = serde_json::from_str(&self.payload_json).map_err(|e| malformed(e.to_string()))?;
    let prev_hash =
      decode_opt_hash(self.prev_hash.as_deref()).map_err(|e| malformed(e.to_string()))?;
    let event_hash = decode_hash(&self.event_hash).map_err(|e| malformed(e.to_string()))?;

    Ok(LedgerEvent {
      seq,
      ts_utc: self.ts_utc,
      event_type: self.event_type,
      payload,
      prev_hash,
      event_hash,
    })
  }
}

// ─── Catalog rows ────────────────────────────────────────────────────────────

pub const BLOB_COLUMNS: &str = "sha256, kind, size, created_utc, source_path";

pub struct RawBlob {
  pub sha256:      String,
  pub kind:        String,
  pub size:        i64,
  pub created_utc: String,
  pub source_path: Option<String>,
}

impl RawBlob {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sha256:      row.get(0)?,
      kind:        row.get(1)?,
      size:        row.get(2)?,
      created_utc: row.get(3)?,
      source_path: row.get(4)?,
    })
  }

  pub fn into_record(self) -> Result<BlobRecord> {
    Ok(BlobRecord {
      sha256:      decode_hash(&self.sha256)?,
      kind:        decode_blob_kind(&self.kind)?,
      size:        self.size as u64,
      created_utc: self.created_utc,
      source_path: self.source_path,
    })
  }
}

pub const DOCUMENT_COLUMNS: &str =
  "doc_id, path, mime, size, raw_sha256, extract_sha256, extract_strategy, created_utc";

pub struct RawDocument {
  pub doc_id:           String,
  pub path:             String,
  pub mime:             String,
  pub size:             i64,
  pub raw_sha256:       String,
  pub extract_sha256:   Option<String>,
  pub extract_strategy: String,
  pub created_utc:      String,
}

impl RawDocument {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      doc_id:           row.get(0)?,
      path:             row.get(1)?,
      mime:             row.get(2)?,
      size:             row.get(3)?,
      raw_sha256:       row.get(4)?,
      extract_sha256:   row.get(5)?,
      extract_strategy: row.get(6)?,
      created_utc:      row.get(7)?,
    })
  }

  pub fn into_document(self) -> Result<Document> {
    Ok(Document {
      doc_id:           decode_uuid(&self.doc_id)?,
      path:             self.path,
      mime:             self.mime,
      size:             self.size as u64,
      raw_sha256:       decode_hash(&self.raw_sha256)?,
      extract_sha256:   decode_opt_hash(self.extract_sha256.as_deref())?,
      extract_strategy: self.extract_strategy,
      created_utc:      self.created_utc,
    })
  }
}

pub const CHUNK_COLUMNS: &str = "doc_id, idx, start_char, end_char, text, sha256";

pub struct RawChunk {
  pub doc_id:     String,
  pub idx:        i64,
  pub start_char: i64,
  pub end_char:   i64,
  pub text:       String,
  pub sha256:     String,
}

impl RawChunk {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      doc_id:     row.get(0)?,
      idx:        row.get(1)?,
      start_char: row.get(2)?,
      end_char:   row.get(3)?,
      text:       row.get(4)?,
      sha256:     row.get(5)?,
    })
  }

  pub fn into_chunk(self) -> Result<Chunk> {
    Ok(Chunk {
      doc_id: decode_uuid(&self.doc_id)?,
      index:  self.idx as usize,
      start:  self.start_char as usize,
      end:    self.end_char as usize,
      text:   self.text,
      sha256: decode_hash(&self.sha256)?,
    })
  }
}

// ─── Graph rows ──────────────────────────────────────────────────────────────

pub struct RawNode {
  pub id:         String,
  pub node_type:  String,
  pub attrs_json: String,
}

impl RawNode {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self { id: row.get(0)?, node_type: row.get(1)?, attrs_json: row.get(2)? })
  }

  pub fn into_node(self) -> Result<Node> {
    let attrs: Attrs = decode_json(&self.attrs_json)?;
    Ok(Node { id: self.id, node_type: self.node_type, attrs })
  }
}

pub struct RawEdge {
  pub edge_key:   String,
  pub src:        String,
  pub dst:        String,
  pub edge_type:  String,
  pub attrs_json: String,
}

impl RawEdge {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      edge_key:   row.get(0)?,
      src:        row.get(1)?,
      dst:        row.get(2)?,
      edge_type:  row.get(3)?,
      attrs_json: row.get(4)?,
    })
  }

  pub fn into_edge(self) -> Result<Edge> {
    Ok(Edge {
      edge_key:  decode_hash(&self.edge_key)?,
      src:       self.src,
      dst:       self.dst,
      edge_type: self.edge_type,
      attrs:     decode_json(&self.attrs_json)?,
    })
  }
}

// ─── Acceptance rows ─────────────────────────────────────────────────────────

pub const STAGED_COLUMNS: &str = "staged_id, bundle_sha256, bundle_path, status, policy_mode, \
   verification_json, validation_json, created_utc, submitted_by, notes, decision_json, last_error";

pub struct RawStaged {
  pub staged_id:         String,
  pub bundle_sha256:     String,
  pub bundle_path:       String,
  pub status:            String,
  pub policy_mode:       String,
  pub verification_json: String,
  pub validation_json:   String,
  pub created_utc:       String,
  pub submitted_by:      String,
  pub notes:             String,
  pub decision_json:     Option<String>,
  pub last_error:        Option<String>,
}

impl RawStaged {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      staged_id:         row.get(0)?,
      bundle_sha256:     row.get(1)?,
      bundle_path:       row.get(2)?,
      status:            row.get(3)?,
      policy_mode:       row.get(4)?,
      verification_json: row.get(5)?,
      validation_json:   row.get(6)?,
      created_utc:       row.get(7)?,
      submitted_by:      row.get(8)?,
      notes:             row.get(9)?,
      decision_json:     row.get(10)?,
      last_error:        row.get(11)?,
    })
  }

  pub fn into_staged(self) -> Result<StagedBundle> {
    Ok(StagedBundle {
      id:            decode_uuid(&self.staged_id)?,
      bundle_sha256: decode_hash(&self.bundle_sha256)?,
      bundle_path:   self.bundle_path,
      status:        decode_status(&self.status)?,
      policy_mode:   decode_mode(&self.policy_mode)?,
      verification:  decode_json(&self.verification_json)?,
      validation:    decode_json(&self.validation_json)?,
      created_utc:   self.created_utc,
      submitted_by:  self.submitted_by,
      notes:         self.notes,
      decision:      self.decision_json.as_deref().map(decode_json).transpose()?,
      last_error:    self.last_error,
    })
  }
}

pub const CHECKPOINT_COLUMNS: &str =
  "id, label, bundle_sha256, bundle_path, sealed_utc, ranges_json";

pub struct RawCheckpoint {
  pub id:            i64,
  pub label:         String,
  pub bundle_sha256: String,
  pub bundle_path:   String,
  pub sealed_utc:    String,
  pub ranges_json:   String,
}

impl RawCheckpoint {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:            row.get(0)?,
      label:         row.get(1)?,
      bundle_sha256: row.get(2)?,
      bundle_path:   row.get(3)?,
      sealed_utc:    row.get(4)?,
      ranges_json:   row.get(5)?,
    })
  }

  pub fn into_checkpoint(self) -> Result<SealCheckpoint> {
    let ranges: BTreeMap<LedgerKind, SliceRange> = decode_json(&self.ranges_json)?;
    Ok(SealCheckpoint {
      id: self.id,
      label: self.label,
      bundle_sha256: decode_hash(&self.bundle_sha256)?,
      bundle_path: self.bundle_path,
      sealed_utc: self.sealed_utc,
      ranges,
    })
  }
}
