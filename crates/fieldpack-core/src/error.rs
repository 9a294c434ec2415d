//! Error types for `fieldpack-core`.

use thiserror::Error;

use crate::{canonical::CanonicalizationError, ledger::ChainBreak};

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Canonicalization(#[from] CanonicalizationError),

  #[error(transparent)]
  ChainBreak(#[from] ChainBreak),

  #[error("invalid digest: {0:?}")]
  InvalidDigest(String),

  #[error("invalid chunking configuration: {0}")]
  ChunkConfig(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
