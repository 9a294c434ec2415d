//! Error type for `fieldpack-archive`.

use fieldpack_core::CanonicalizationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("zip error: {0}")]
  Zip(#[from] zip::result::ZipError),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Canonicalization(#[from] CanonicalizationError),

  #[error("base64 error: {0}")]
  Base64(#[from] base64::DecodeError),

  #[error("signature error: {0}")]
  Signature(#[from] ed25519_dalek::SignatureError),

  // ── Container ──
  #[error("unsafe entry name: {0:?}")]
  UnsafeName(String),

  #[error("duplicate entry: {0}")]
  DuplicateEntry(String),

  #[error("archive has {count} entries, limit is {limit}")]
  TooManyEntries { count: usize, limit: usize },

  #[error("archive content exceeds {limit} bytes")]
  TooLarge { limit: u64 },

  #[error("missing entry: {0}")]
  MissingEntry(String),

  // ── Documents ──
  #[error("envelope carries no signatures")]
  NoSignatures,

  #[error("no signature by key {0}")]
  UnknownKey(String),

  #[error("invalid public key: {0}")]
  InvalidKey(String),

  #[error("invalid inventory: {0}")]
  InvalidSbom(String),
}

impl Error {
  /// Whether this error is a resource limit rather than malformed content.
  pub fn is_limit(&self) -> bool {
    matches!(self, Error::TooManyEntries { .. } | Error::TooLarge { .. })
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
