//! Content-addressed blob store.
//!
//! Blobs live at `<root>/sha256/<first two hex>/<hex>` and are written once.
//! Every read re-hashes the content, so a corrupted file is reported instead
//! of served.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use fieldpack_core::{
  Hash256,
  canonical::digest,
  document::{BlobKind, BlobRecord},
  ledger::now_utc,
};
use fieldpack_store_sqlite::Store;

use crate::{Error, Result, atomic::write_atomic};

#[derive(Clone)]
pub struct ContentStore {
  root:  PathBuf,
  store: Arc<Store>,
}

impl ContentStore {
  pub fn new(root: impl Into<PathBuf>, store: Arc<Store>) -> Self {
    Self { root: root.into(), store }
  }

  pub fn root(&self) -> &Path { &self.root }

  pub fn path_for(&self, sha256: &Hash256) -> PathBuf {
    let hex = sha256.to_hex();
    self.root.join("sha256").join(&hex[..2]).join(hex)
  }

  /// Store `bytes` as a `kind` blob. Storing the same content again is a
  /// no-op that returns the original catalog entry.
  pub fn put(&self, bytes: &[u8], kind: BlobKind, source_path: Option<&str>) -> Result<BlobRecord> {
    let sha256 = digest(bytes);
    let path = self.path_for(&sha256);
    if !path.exists() {
      write_atomic(&path, bytes)?;
      tracing::debug!(sha256 = %sha256.short(), %kind, size = bytes.len(), "stored blob");
    }

    let record = BlobRecord {
      sha256,
      kind,
      size: bytes.len() as u64,
      created_utc: now_utc(),
      source_path: source_path.map(str::to_owned),
    };
    if self.store.record_blob(&record)? {
      return Ok(record);
    }
    Ok(self.store.blob(&sha256, kind)?.unwrap_or(record))
  }

  /// Read a blob, checking its content against its address.
  pub fn get(&self, sha256: &Hash256, kind: BlobKind) -> Result<Vec<u8>> {
    let bytes = match std::fs::read(self.path_for(sha256)) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Err(Error::BlobNotFound { sha256: *sha256, kind });
      }
      Err(e) => return Err(e.into()),
    };
    let actual = digest(&bytes);
    if actual != *sha256 {
      tracing::warn!(
        sha256 = %sha256.short(),
        actual = %actual.short(),
        "blob failed integrity check"
      );
      return Err(Error::Integrity { sha256: *sha256, actual });
    }
    Ok(bytes)
  }

  pub fn contains(&self, sha256: &Hash256) -> bool { self.path_for(sha256).is_file() }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cas() -> (tempfile::TempDir, ContentStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("fieldpack.db")).unwrap());
    let cas = ContentStore::new(dir.path().join("cas"), store);
    (dir, cas)
  }

  #[test]
  fn put_is_idempotent() {
    let (_dir, cas) = cas();
    let first = cas.put(b"evidence", BlobKind::Raw, Some("a.txt")).unwrap();
    let second = cas.put(b"evidence", BlobKind::Raw, Some("b.txt")).unwrap();
    assert_eq!(first, second);
    assert_eq!(cas.get(&first.sha256, BlobKind::Raw).unwrap(), b"evidence");

    let hex = first.sha256.to_hex();
    assert!(cas.path_for(&first.sha256).ends_with(format!("sha256/{}/{hex}", &hex[..2])));
  }

  #[test]
  fn corrupted_blobs_are_detected() {
    let (_dir, cas) = cas();
    let rec = cas.put(b"evidence", BlobKind::Extract, None).unwrap();
    std::fs::write(cas.path_for(&rec.sha256), b"evidencE").unwrap();
    assert!(matches!(cas.get(&rec.sha256, BlobKind::Extract), Err(Error::Integrity { .. })));
  }

  #[test]
  fn missing_blobs_are_reported() {
    let (_dir, cas) = cas();
    let sha = digest(b"never stored");
    assert!(!cas.contains(&sha));
    assert!(matches!(cas.get(&sha, BlobKind::Aux), Err(Error::BlobNotFound { .. })));
  }
}
