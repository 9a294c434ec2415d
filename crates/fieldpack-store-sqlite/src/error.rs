//! Error type for `fieldpack-store-sqlite`.

use fieldpack_core::{
  CanonicalizationError, ChainBreak, Hash256, LedgerKind, staging::StageStatus,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] fieldpack_core::Error),

  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Canonicalization(#[from] CanonicalizationError),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  /// A stored ledger no longer verifies.
  #[error("{ledger} ledger: {source}")]
  ChainBreak {
    ledger: LedgerKind,
    #[source]
    source: ChainBreak,
  },

  /// A ledger row could not be decoded into an event.
  #[error("malformed row at seq {seq}: {detail}")]
  MalformedRow { seq: i64, detail: String },

  #[error("decode error: {0}")]
  Decode(String),

  #[error("bundle {} is already merged", .0.short())]
  AlreadyMerged(Hash256),

  #[error("staged bundle not found: {0}")]
  StagedNotFound(Uuid),

  #[error("staged bundle {id} is {status} and can no longer be decided")]
  StagedClosed { id: Uuid, status: StageStatus },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
