//! `manifest.json`: the signed table of contents of a bundle.
//!
//! The manifest lists every content entry with its digest and size. The
//! manifest itself, the attestations and the inventory are described
//! separately so that each can be checked (and reported) on its own.

use std::collections::BTreeMap;

use fieldpack_core::{
  Hash256, LedgerKind,
  canonical::{canonical_line, digest, digest_canonical},
};
use serde::{Deserialize, Serialize};

use crate::{
  Result,
  container::{ATTESTATION_PATH, MANIFEST_PATH, SBOM_ATTESTATION_PATH, SBOM_PATH},
};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
  Provenance,
  KgDelta,
  Blob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
  pub path:   String,
  pub sha256: Hash256,
  pub size:   u64,
  pub role:   FileRole,
}

impl FileEntry {
  pub fn new(path: impl Into<String>, bytes: &[u8], role: FileRole) -> Self {
    Self { path: path.into(), sha256: digest(bytes), size: bytes.len() as u64, role }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomRef {
  pub path:         String,
  pub sha256:       Hash256,
  pub spec_version: String,
}

/// One exported ledger slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceSlice {
  pub ledger:   LedgerKind,
  pub path:     String,
  pub from_seq: i64,
  pub to_seq:   i64,
  /// Hash the first event of the slice must follow; `None` at genesis.
  pub anchor:   Option<Hash256>,
  /// Hash of the last event in the slice, or the anchor when it is empty.
  pub tail:     Option<Hash256>,
  pub events:   u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KgDeltaRef {
  pub path:   String,
  pub sha256: Hash256,
  pub ops:    usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub manifest_version: u32,
  pub label:            String,
  pub toolchain_id:     String,
  /// Timestamp of the newest sealed event. Absent for an empty seal.
  pub created_utc:      Option<String>,
  /// Content entries, sorted by path.
  pub files:            Vec<FileEntry>,
  pub bundle_map_hash:  Hash256,
  pub sbom:             Option<SbomRef>,
  pub provenance:       Vec<ProvenanceSlice>,
  pub kg_delta:         KgDeltaRef,
  pub expected_root:    Hash256,
  pub policy_hash:      Option<Hash256>,
  pub allowlist_hash:   Option<Hash256>,
}

/// Digest of the `path -> sha256` map over `files`.
pub fn bundle_map_hash(files: &[FileEntry]) -> Result<Hash256> {
  let map: BTreeMap<&str, &Hash256> = files.iter().map(|f| (f.path.as_str(), &f.sha256)).collect();
  Ok(digest_canonical(&map)?)
}

/// Whether `path` is one of the entries that describe the bundle rather than
/// being listed in it.
pub fn is_envelope_entry(path: &str) -> bool {
  matches!(path, MANIFEST_PATH | ATTESTATION_PATH | SBOM_PATH | SBOM_ATTESTATION_PATH)
}

impl Manifest {
  /// Canonical encoding, newline-terminated. This is what gets signed.
  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(canonical_line(self)?) }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> { Ok(serde_json::from_slice(bytes)?) }

  pub fn file(&self, path: &str) -> Option<&FileEntry> {
    self.files.iter().find(|f| f.path == path)
  }

  pub fn slice(&self, ledger: LedgerKind) -> Option<&ProvenanceSlice> {
    self.provenance.iter().find(|s| s.ledger == ledger)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Manifest {
    let files = vec![
      FileEntry::new("kg_delta.jsonl", b"", FileRole::KgDelta),
      FileEntry::new("provenance/ingest.jsonl", b"{}\n", FileRole::Provenance),
    ];
    Manifest {
      manifest_version: MANIFEST_VERSION,
      label:            "demo".into(),
      toolchain_id:     "fieldpack-test".into(),
      created_utc:      None,
      bundle_map_hash:  bundle_map_hash(&files).unwrap(),
      files,
      sbom:             None,
      provenance:       vec![ProvenanceSlice {
        ledger:   LedgerKind::Ingest,
        path:     "provenance/ingest.jsonl".into(),
        from_seq: 1,
        to_seq:   0,
        anchor:   None,
        tail:     None,
        events:   0,
      }],
      kg_delta:         KgDeltaRef {
        path:   "kg_delta.jsonl".into(),
        sha256: digest(b""),
        ops:    0,
      },
      expected_root:    digest(b"root"),
      policy_hash:      None,
      allowlist_hash:   None,
    }
  }

  #[test]
  fn bytes_are_canonical_and_stable() {
    let bytes = sample().to_bytes().unwrap();
    assert!(bytes.ends_with(b"\n"));
    assert!(bytes.starts_with(b"{\"allowlist_hash\":null,"));
    assert_eq!(Manifest::from_bytes(&bytes).unwrap().to_bytes().unwrap(), bytes);
  }

  #[test]
  fn map_hash_follows_digests() {
    let mut m = sample();
    let before = bundle_map_hash(&m.files).unwrap();
    m.files[0].sha256 = digest(b"other");
    assert_ne!(bundle_map_hash(&m.files).unwrap(), before);
  }

  #[test]
  fn envelope_entries_are_recognised() {
    assert!(is_envelope_entry("manifest.json"));
    assert!(is_envelope_entry("sbom/bom.dsse.json"));
    assert!(!is_envelope_entry("kg_delta.jsonl"));
  }
}
