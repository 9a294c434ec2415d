//! Deterministic ZIP container.
//!
//! [`ArchiveWriter`] collects entries in a sorted map and emits them with
//! fixed metadata, so equal entries always produce equal bytes.
//! [`Archive::read`] refuses unsafe or duplicate member names and stops at
//! the configured limits before inflating more than it has to.

use std::{
  collections::BTreeMap,
  io::{Cursor, Read, Write},
};

use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{Error, Result};

pub const MANIFEST_PATH: &str = "manifest.json";
pub const ATTESTATION_PATH: &str = "attestation.dsse.json";
pub const SBOM_PATH: &str = "sbom/bom.cdx.json";
pub const SBOM_ATTESTATION_PATH: &str = "sbom/bom.dsse.json";
pub const KG_DELTA_PATH: &str = "kg_delta.jsonl";

/// Archive path of a CAS blob.
pub fn blob_path(kind: &str, sha256: &str) -> String { format!("blobs/{kind}/{sha256}") }

/// Whether `name` is a relative, normalised member name.
///
/// Rejects absolute paths, drive prefixes, backslashes, `.`/`..` segments,
/// empty segments and control characters.
pub fn is_safe_name(name: &str) -> bool {
  if name.is_empty() || name.starts_with('/') || name.contains('\\') {
    return false;
  }
  if name.chars().any(char::is_control) {
    return false;
  }
  let bytes = name.as_bytes();
  if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
    return false;
  }
  name.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

// ─── Writing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ArchiveWriter {
  entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveWriter {
  pub fn new() -> Self { Self::default() }

  /// Add (or replace) an entry.
  pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<()> {
    let name = name.into();
    if !is_safe_name(&name) {
      return Err(Error::UnsafeName(name));
    }
    self.entries.insert(name, bytes.into());
    Ok(())
  }

  pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> { self.entries.remove(name) }

  pub fn contains(&self, name: &str) -> bool { self.entries.contains_key(name) }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// Encode the archive.
  pub fn finish(self) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
      .compression_method(CompressionMethod::Deflated)
      .last_modified_time(DateTime::default())
      .unix_permissions(0o644);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in &self.entries {
      zip.start_file(name.as_str(), options)?;
      zip.write_all(bytes)?;
    }
    Ok(zip.finish()?.into_inner())
  }
}

impl From<Archive> for ArchiveWriter {
  fn from(archive: Archive) -> Self { Self { entries: archive.entries } }
}

// ─── Reading ─────────────────────────────────────────────────────────────────

/// Bounds enforced while reading untrusted archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
  pub max_entries:     usize,
  /// Total inflated size across every entry.
  pub max_total_bytes: u64,
}

impl Default for ReadLimits {
  fn default() -> Self { Self { max_entries: 100_000, max_total_bytes: 512 * 1024 * 1024 } }
}

/// A fully read archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
  entries: BTreeMap<String, Vec<u8>>,
}

impl Archive {
  pub fn read(bytes: &[u8], limits: ReadLimits) -> Result<Self> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;
    if zip.len() > limits.max_entries {
      return Err(Error::TooManyEntries { count: zip.len(), limit: limits.max_entries });
    }

    let mut entries = BTreeMap::new();
    let mut remaining = limits.max_total_bytes;
    for index in 0..zip.len() {
      let mut file = zip.by_index(index)?;
      let name = file.name().to_owned();
      if file.is_dir() || !is_safe_name(&name) {
        return Err(Error::UnsafeName(name));
      }
      if entries.contains_key(&name) {
        return Err(Error::DuplicateEntry(name));
      }
      if file.size() > remaining {
        return Err(Error::TooLarge { limit: limits.max_total_bytes });
      }

      // The declared size is untrusted; cap the actual read as well.
      let mut content = Vec::with_capacity(file.size() as usize);
      (&mut file).take(remaining + 1).read_to_end(&mut content)?;
      let read = content.len() as u64;
      if read > remaining {
        return Err(Error::TooLarge { limit: limits.max_total_bytes });
      }
      remaining -= read;
      entries.insert(name, content);
    }
    Ok(Self { entries })
  }

  pub fn get(&self, name: &str) -> Option<&[u8]> { self.entries.get(name).map(Vec::as_slice) }

  pub fn require(&self, name: &str) -> Result<&[u8]> {
    self.get(name).ok_or_else(|| Error::MissingEntry(name.to_owned()))
  }

  pub fn contains(&self, name: &str) -> bool { self.entries.contains_key(name) }

  pub fn names(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> ArchiveWriter {
    let mut w = ArchiveWriter::new();
    w.insert("b.txt", b"second".to_vec()).unwrap();
    w.insert("a/one.txt", b"first".to_vec()).unwrap();
    w
  }

  #[test]
  fn output_is_deterministic() {
    assert_eq!(sample().finish().unwrap(), sample().finish().unwrap());
  }

  #[test]
  fn insertion_order_does_not_matter() {
    let mut w = ArchiveWriter::new();
    w.insert("a/one.txt", b"first".to_vec()).unwrap();
    w.insert("b.txt", b"second".to_vec()).unwrap();
    assert_eq!(w.finish().unwrap(), sample().finish().unwrap());
  }

  #[test]
  fn read_returns_every_entry() {
    let bytes = sample().finish().unwrap();
    let archive = Archive::read(&bytes, ReadLimits::default()).unwrap();
    assert_eq!(archive.names().collect::<Vec<_>>(), vec!["a/one.txt", "b.txt"]);
    assert_eq!(archive.get("b.txt"), Some(&b"second"[..]));
    assert!(matches!(archive.require("c.txt"), Err(Error::MissingEntry(_))));
  }

  #[test]
  fn limits_are_enforced() {
    let bytes = sample().finish().unwrap();

    let few = ReadLimits { max_entries: 1, ..ReadLimits::default() };
    assert!(matches!(Archive::read(&bytes, few), Err(Error::TooManyEntries { count: 2, .. })));

    let small = ReadLimits { max_total_bytes: 8, ..ReadLimits::default() };
    assert!(matches!(Archive::read(&bytes, small), Err(Error::TooLarge { .. })));
  }

  #[test]
  fn unsafe_names_are_rejected() {
    for name in ["/etc/passwd", "../x", "a/../b", "a\\b", "C:x", "a//b", "./a", ""] {
      assert!(!is_safe_name(name), "{name:?} should be unsafe");
    }
    assert!(is_safe_name("blobs/raw/abc"));
    assert!(ArchiveWriter::new().insert("../x", Vec::new()).is_err());
  }

  #[test]
  fn garbage_is_not_an_archive() {
    assert!(matches!(Archive::read(b"not a zip", ReadLimits::default()), Err(Error::Zip(_))));
  }
}
