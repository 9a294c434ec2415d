//! [`Store`]: the database handle, plus the document/blob catalog and seal
//! checkpoints.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use fieldpack_core::{
  Hash256, LedgerKind, SliceRange,
  document::{BlobKind, BlobRecord, Chunk, Document},
  ledger::now_utc,
  records::{IngestRecord, KgDeltaApplied, LlmCallRecord, ToolRunRecord},
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension as _, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
  Result,
  encode::{
    BLOB_COLUMNS, CHECKPOINT_COLUMNS, CHUNK_COLUMNS, DOCUMENT_COLUMNS, RawBlob, RawCheckpoint,
    RawChunk, RawDocument, encode_json, encode_uuid,
  },
  ledger::{EventLedger, EventRange, LedgerTx},
  schema::{CONNECTION_PRAGMAS, SCHEMA},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn connect(path: &Path) -> Result<Connection> {
  let conn = Connection::open(path)?;
  conn.busy_timeout(BUSY_TIMEOUT)?;
  conn.execute_batch(CONNECTION_PRAGMAS)?;
  Ok(conn)
}

/// A completed seal: which event ranges went into which bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealCheckpoint {
  pub id:            i64,
  pub label:         String,
  pub bundle_sha256: Hash256,
  pub bundle_path:   String,
  pub sealed_utc:    String,
  pub ranges:        BTreeMap<LedgerKind, SliceRange>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// The fieldpack database.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct Store {
  path:      PathBuf,
  conn:      Mutex<Connection>,
  ingest:    EventLedger<IngestRecord>,
  tool_runs: EventLedger<ToolRunRecord>,
  llm_calls: EventLedger<LlmCallRecord>,
  kg_deltas: EventLedger<KgDeltaApplied>,
}

impl Store {
  /// Open (or create) the database at `path` and initialise the schema.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let conn = connect(path)?;
    conn.execute_batch(SCHEMA)?;
    tracing::debug!(path = %path.display(), "opened store");

    Ok(Self {
      path:      path.to_path_buf(),
      conn:      Mutex::new(conn),
      ingest:    EventLedger::open(path)?,
      tool_runs: EventLedger::open(path)?,
      llm_calls: EventLedger::open(path)?,
      kg_deltas: EventLedger::open(path)?,
    })
  }

  pub fn path(&self) -> &Path { &self.path }

  pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> { self.conn.lock() }

  // ── Ledgers ───────────────────────────────────────────────────────────

  pub fn ingest_ledger(&self) -> &EventLedger<IngestRecord> { &self.ingest }

  pub fn tool_run_ledger(&self) -> &EventLedger<ToolRunRecord> { &self.tool_runs }

  pub fn llm_call_ledger(&self) -> &EventLedger<LlmCallRecord> { &self.llm_calls }

  pub fn kg_delta_ledger(&self) -> &EventLedger<KgDeltaApplied> { &self.kg_deltas }

  /// Newest sequence id per ledger (0 when empty).
  pub fn ledger_tail_seq(&self, kind: LedgerKind) -> Result<i64> {
    let tail = match kind {
      LedgerKind::Ingest => self.ingest.tail()?,
      LedgerKind::ToolRun => self.tool_runs.tail()?,
      LedgerKind::LlmCall => self.llm_calls.tail()?,
      LedgerKind::KgDelta => self.kg_deltas.tail()?,
    };
    Ok(tail.map_or(0, |(seq, _)| seq))
  }

  /// Hash of the event at `seq` in ledger `kind`.
  pub fn ledger_hash_at(&self, kind: LedgerKind, seq: i64) -> Result<Option<Hash256>> {
    match kind {
      LedgerKind::Ingest => self.ingest.hash_at(seq),
      LedgerKind::ToolRun => self.tool_runs.hash_at(seq),
      LedgerKind::LlmCall => self.llm_calls.hash_at(seq),
      LedgerKind::KgDelta => self.kg_deltas.hash_at(seq),
    }
  }

  /// Untyped events of ledger `kind` with `from <= seq <= to`.
  pub fn export_ledger(&self, kind: LedgerKind, from: i64, to: i64) -> Result<EventRange<Value>> {
    match kind {
      LedgerKind::Ingest => self.ingest.export_raw(from, to),
      LedgerKind::ToolRun => self.tool_runs.export_raw(from, to),
      LedgerKind::LlmCall => self.llm_calls.export_raw(from, to),
      LedgerKind::KgDelta => self.kg_deltas.export_raw(from, to),
    }
  }

  /// Verify every ledger from genesis, stopping at the first break.
  pub fn verify_ledgers(&self) -> Result<BTreeMap<LedgerKind, u64>> {
    Ok(BTreeMap::from([
      (LedgerKind::Ingest, self.ingest.verify()?),
      (LedgerKind::ToolRun, self.tool_runs.verify()?),
      (LedgerKind::LlmCall, self.llm_calls.verify()?),
      (LedgerKind::KgDelta, self.kg_deltas.verify()?),
    ]))
  }

  // ── Blobs ─────────────────────────────────────────────────────────────

  /// Record blob metadata. Returns `false` when the `(sha256, kind)` pair was
  /// already known.
  pub fn record_blob(&self, blob: &BlobRecord) -> Result<bool> {
    let inserted = self.conn().execute(
      &format!("INSERT OR IGNORE INTO blobs ({BLOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
      params![
        blob.sha256.to_hex(),
        blob.kind.as_str(),
        blob.size as i64,
        blob.created_utc,
        blob.source_path,
      ],
    )?;
    Ok(inserted > 0)
  }

  pub fn blob(&self, sha256: &Hash256, kind: BlobKind) -> Result<Option<BlobRecord>> {
    let raw = self
      .conn()
      .query_row(
        &format!("SELECT {BLOB_COLUMNS} FROM blobs WHERE sha256 = ?1 AND kind = ?2"),
        params![sha256.to_hex(), kind.as_str()],
        RawBlob::from_row,
      )
      .optional()?;
    raw.map(RawBlob::into_record).transpose()
  }

  // ── Documents ─────────────────────────────────────────────────────────

  pub fn document(&self, doc_id: Uuid) -> Result<Option<Document>> {
    let raw = self
      .conn()
      .query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE doc_id = ?1"),
        [encode_uuid(doc_id)],
        RawDocument::from_row,
      )
      .optional()?;
    raw.map(RawDocument::into_document).transpose()
  }

  pub fn documents(&self) -> Result<Vec<Document>> {
    let conn = self.conn();
    let mut stmt = conn.prepare(&format!(
      "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_utc ASC, doc_id ASC"
    ))?;
    let rows = stmt.query_map([], RawDocument::from_row)?;
    rows.map(|r| r?.into_document()).collect()
  }

  pub fn chunks(&self, doc_id: Uuid) -> Result<Vec<Chunk>> {
    let conn = self.conn();
    let mut stmt = conn
      .prepare(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE doc_id = ?1 ORDER BY idx ASC"))?;
    let rows = stmt.query_map([encode_uuid(doc_id)], RawChunk::from_row)?;
    rows.map(|r| r?.into_chunk()).collect()
  }

  // ── Seal checkpoints ──────────────────────────────────────────────────

  pub fn last_checkpoint(&self) -> Result<Option<SealCheckpoint>> {
    let raw = self
      .conn()
      .query_row(
        &format!("SELECT {CHECKPOINT_COLUMNS} FROM seal_checkpoints ORDER BY id DESC LIMIT 1"),
        [],
        RawCheckpoint::from_row,
      )
      .optional()?;
    raw.map(RawCheckpoint::into_checkpoint).transpose()
  }

  pub fn record_checkpoint(
    &self,
    label: &str,
    bundle_sha256: &Hash256,
    bundle_path: &str,
    ranges: &BTreeMap<LedgerKind, SliceRange>,
  ) -> Result<SealCheckpoint> {
    let sealed_utc = now_utc();
    let conn = self.conn();
    conn.execute(
      "INSERT INTO seal_checkpoints (label, bundle_sha256, bundle_path, sealed_utc, ranges_json)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![label, bundle_sha256.to_hex(), bundle_path, sealed_utc, encode_json(ranges)?],
    )?;
    Ok(SealCheckpoint {
      id: conn.last_insert_rowid(),
      label: label.to_owned(),
      bundle_sha256: *bundle_sha256,
      bundle_path: bundle_path.to_owned(),
      sealed_utc,
      ranges: ranges.clone(),
    })
  }
}

// ─── Transactional catalog writes ────────────────────────────────────────────

impl LedgerTx<'_> {
  pub fn insert_document(&self, doc: &Document) -> Result<()> {
    self.conn.execute(
      &format!(
        "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
      ),
      params![
        encode_uuid(doc.doc_id),
        doc.path,
        doc.mime,
        doc.size as i64,
        doc.raw_sha256.to_hex(),
        doc.extract_sha256.map(|h| h.to_hex()),
        doc.extract_strategy,
        doc.created_utc,
      ],
    )?;
    Ok(())
  }

  pub fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
    self.conn.execute(
      &format!("INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
      params![
        encode_uuid(chunk.doc_id),
        chunk.index as i64,
        chunk.start as i64,
        chunk.end as i64,
        chunk.text,
        chunk.sha256.to_hex(),
      ],
    )?;
    Ok(())
  }
}
