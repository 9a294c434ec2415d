//! Error type for `fieldpack-pipeline`.
//!
//! Only programming, I/O and integrity failures are errors. Policy refusals
//! and validation failures are returned as values
//! ([`VerificationResult`](fieldpack_core::result::VerificationResult),
//! [`Decision`](fieldpack_core::staging::Decision)).

use std::path::PathBuf;

use fieldpack_core::{
  CanonicalizationError, Hash256, document::BlobKind, kg::ValidationReport,
  staging::StageStatus,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] fieldpack_core::Error),

  #[error("store error: {0}")]
  Store(#[from] fieldpack_store_sqlite::Error),

  #[error("archive error: {0}")]
  Archive(#[from] fieldpack_archive::Error),

  #[error(transparent)]
  Canonicalization(#[from] CanonicalizationError),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("toml error: {0}")]
  Toml(#[from] toml::de::Error),

  // ── Content store ──
  #[error("blob {} ({kind}) not found", .sha256.short())]
  BlobNotFound { sha256: Hash256, kind: BlobKind },

  #[error("blob {} failed integrity check: content hashes to {}", .sha256.short(), .actual.short())]
  Integrity { sha256: Hash256, actual: Hash256 },

  // ── Ingest and tools ──
  #[error("{path:?} is {size} bytes, limit is {limit}")]
  TooLarge { path: PathBuf, size: u64, limit: u64 },

  #[error("tool {0:?} is not allowlisted")]
  ToolNotAllowed(String),

  #[error("empty command line")]
  EmptyCommand,

  // ── Sealing ──
  #[error("signing key unavailable: {0}")]
  Signing(String),

  #[error("invalid bundle label {0:?}")]
  InvalidLabel(String),

  // ── Acceptance ──
  #[error("delta failed validation: {}", .0.summary().unwrap_or_default())]
  InvalidDelta(ValidationReport),

  #[error("a review decision needs an actor")]
  ActorRequired,

  #[error("staged bundle not found: {0}")]
  StagedNotFound(Uuid),

  #[error("staged bundle {id} is {status}; only PENDING or QUARANTINED can be decided")]
  IllegalTransition { id: Uuid, status: StageStatus },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
