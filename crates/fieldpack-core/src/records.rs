//! Payload schemas for the four ledgers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
  canonical::Hash256,
  kg::KgOp,
  ledger::{LedgerKind, LedgerPayload},
};

/// Where a chunk sits inside a document's extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
  pub index:  usize,
  pub start:  usize,
  pub end:    usize,
  pub sha256: Hash256,
}

/// Payload of an `INGEST` event: one per ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
  pub doc_id:           Uuid,
  pub path:             String,
  pub mime:             String,
  pub size:             u64,
  pub raw_sha256:       Hash256,
  pub extract_sha256:   Option<Hash256>,
  pub extract_strategy: String,
  pub toolchain_id:     String,
  pub chunks:           Vec<ChunkRef>,
}

impl LedgerPayload for IngestRecord {
  const EVENT_TYPE: &'static str = "INGEST";
  const LEDGER: LedgerKind = LedgerKind::Ingest;
}

/// Payload of a `TOOL_RUN` event. Output streams live in the CAS as `aux`
/// blobs and are referenced by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRunRecord {
  pub tool_id:       String,
  pub argv:          Vec<String>,
  pub cwd:           Option<String>,
  pub exit_code:     i32,
  pub stdout_sha256: Hash256,
  pub stderr_sha256: Hash256,
  pub duration_ms:   u64,
  pub toolchain_id:  String,
}

impl LedgerPayload for ToolRunRecord {
  const EVENT_TYPE: &'static str = "TOOL_RUN";
  const LEDGER: LedgerKind = LedgerKind::ToolRun;
}

/// Payload of an `LLM_CALL` event. Model calls are the only exogenous input;
/// prompt and response are cached in the CAS so replay never repeats them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallRecord {
  pub provider:        String,
  pub model:           String,
  pub prompt_sha256:   Hash256,
  pub response_sha256: Hash256,
  #[serde(default)]
  pub params:          Value,
  pub toolchain_id:    String,
}

impl LedgerPayload for LlmCallRecord {
  const EVENT_TYPE: &'static str = "LLM_CALL";
  const LEDGER: LedgerKind = LedgerKind::LlmCall;
}

/// Who decided a merge, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
  /// `AUTO_MERGE` or `REVIEW_APPROVE`.
  pub kind:      String,
  pub actor:     String,
  pub notes:     String,
  pub ts_utc:    String,
  pub staged_id: Option<Uuid>,
}

/// Payload of a `KG_DELTA_APPLIED` event: one per merged bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgDeltaApplied {
  pub bundle_sha256: Hash256,
  pub delta_hash:    Hash256,
  pub ops:           usize,
  pub ops_payload:   Vec<KgOp>,
  pub decision:      DecisionRecord,
}

impl LedgerPayload for KgDeltaApplied {
  const EVENT_TYPE: &'static str = "KG_DELTA_APPLIED";
  const LEDGER: LedgerKind = LedgerKind::KgDelta;
}
