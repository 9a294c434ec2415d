//! Runtime configuration.
//!
//! [`FieldpackConfig`] is layered from an optional TOML file and
//! `FIELDPACK_*` environment variables (`FIELDPACK_INGEST__MAX_BYTES=...`).
//! Policy and allowlist documents are separate files, read as-is so their
//! keys keep their case.

use std::path::{Path, PathBuf};

use fieldpack_core::{
  chunking::ChunkConfig,
  policy::{Allowlist, Policy},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::Result;

pub const ENV_PREFIX: &str = "FIELDPACK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
  /// Files larger than this are refused before anything is stored.
  pub max_bytes:       u64,
  pub extract_text:    bool,
  pub chunk_chars:     usize,
  pub overlap_chars:   usize,
  pub min_chunk_chars: usize,
}

impl Default for IngestConfig {
  fn default() -> Self {
    let chunking = ChunkConfig::default();
    Self {
      max_bytes:       50 * 1024 * 1024,
      extract_text:    true,
      chunk_chars:     chunking.chunk_chars,
      overlap_chars:   chunking.overlap_chars,
      min_chunk_chars: chunking.min_chunk_chars,
    }
  }
}

impl IngestConfig {
  pub fn chunking(&self) -> ChunkConfig {
    ChunkConfig {
      chunk_chars:     self.chunk_chars,
      overlap_chars:   self.overlap_chars,
      min_chunk_chars: self.min_chunk_chars,
    }
  }
}

/// Which CAS blobs travel inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
  pub include_raw:     bool,
  pub include_extract: bool,
  pub include_aux:     bool,
}

impl Default for SealConfig {
  fn default() -> Self { Self { include_raw: true, include_extract: true, include_aux: true } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldpackConfig {
  /// Base directory for every relative path below.
  pub runtime_root:     PathBuf,
  pub db_path:          PathBuf,
  pub cas_root:         PathBuf,
  pub bundles_dir:      PathBuf,
  pub signing_key_path: PathBuf,
  pub toolchain_id:     String,
  pub policy_path:      Option<PathBuf>,
  pub allowlist_path:   Option<PathBuf>,
  pub ingest:           IngestConfig,
  pub seal:             SealConfig,
}

impl Default for FieldpackConfig {
  fn default() -> Self {
    Self {
      runtime_root:     PathBuf::from(".fieldpack"),
      db_path:          PathBuf::from("fieldpack.db"),
      cas_root:         PathBuf::from("cas"),
      bundles_dir:      PathBuf::from("bundles"),
      signing_key_path: PathBuf::from("keys/signing.key"),
      toolchain_id:     format!("fieldpack-{}", env!("CARGO_PKG_VERSION")),
      policy_path:      None,
      allowlist_path:   None,
      ingest:           IngestConfig::default(),
      seal:             SealConfig::default(),
    }
  }
}

impl FieldpackConfig {
  /// Layer defaults, the file at `path` (if it exists) and the environment.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
      builder = builder.add_source(config::File::from(path).required(false));
    }
    let cfg: Self = builder
      .add_source(
        config::Environment::with_prefix(ENV_PREFIX)
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()?
      .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
  }

  /// A configuration rooted at `root`, otherwise default.
  pub fn rooted(root: impl Into<PathBuf>) -> Self {
    Self { runtime_root: root.into(), ..Self::default() }
  }

  pub fn validate(&self) -> Result<()> {
    self.ingest.chunking().validate()?;
    Ok(())
  }

  /// Copy with `~` expanded and relative paths joined onto the runtime root.
  pub fn resolved(&self) -> Self {
    let root = expand_tilde(&self.runtime_root);
    let under_root = |p: &Path| {
      let p = expand_tilde(p);
      if p.is_absolute() { p } else { root.join(p) }
    };
    Self {
      db_path: under_root(&self.db_path),
      cas_root: under_root(&self.cas_root),
      bundles_dir: under_root(&self.bundles_dir),
      signing_key_path: under_root(&self.signing_key_path),
      policy_path: self.policy_path.as_deref().map(expand_tilde),
      allowlist_path: self.allowlist_path.as_deref().map(expand_tilde),
      runtime_root: root,
      ..self.clone()
    }
  }

  /// The configured policy, or the default one.
  pub fn load_policy(&self) -> Result<Policy> {
    self.policy_path.as_deref().map_or_else(|| Ok(Policy::default()), read_document)
  }

  /// The configured allowlist, or an empty one.
  pub fn load_allowlist(&self) -> Result<Allowlist> {
    self.allowlist_path.as_deref().map_or_else(|| Ok(Allowlist::default()), read_document)
  }
}

/// Read a TOML or JSON document, chosen by extension (TOML otherwise).
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
  let raw = std::fs::read_to_string(path)?;
  match path.extension().and_then(|e| e.to_str()) {
    Some("json") => Ok(serde_json::from_str(&raw)?),
    _ => Ok(toml::from_str(&raw)?),
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use fieldpack_core::policy::AcceptanceMode;

  use super::*;

  #[test]
  fn relative_paths_land_under_the_root() {
    let cfg = FieldpackConfig::rooted("/srv/fp").resolved();
    assert_eq!(cfg.db_path, PathBuf::from("/srv/fp/fieldpack.db"));
    assert_eq!(cfg.cas_root, PathBuf::from("/srv/fp/cas"));
    assert_eq!(cfg.signing_key_path, PathBuf::from("/srv/fp/keys/signing.key"));

    let cfg = FieldpackConfig { db_path: "/var/db.sqlite".into(), ..FieldpackConfig::rooted("/x") };
    assert_eq!(cfg.resolved().db_path, PathBuf::from("/var/db.sqlite"));
  }

  #[test]
  fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldpack.toml");
    std::fs::write(
      &path,
      "toolchain_id = \"lab-7\"\n[ingest]\nchunk_chars = 400\noverlap_chars = 40\n",
    )
    .unwrap();

    let cfg = FieldpackConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.toolchain_id, "lab-7");
    assert_eq!(cfg.ingest.chunk_chars, 400);
    assert_eq!(cfg.ingest.min_chunk_chars, IngestConfig::default().min_chunk_chars);
    assert!(cfg.seal.include_raw);
  }

  #[test]
  fn invalid_chunking_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldpack.toml");
    std::fs::write(&path, "[ingest]\nchunk_chars = 100\noverlap_chars = 100\n").unwrap();
    assert!(FieldpackConfig::load(Some(&path)).is_err());
  }

  #[test]
  fn policy_documents_keep_key_case() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.toml");
    std::fs::write(
      &path,
      concat!(
        "mode = \"AUTO_MERGE\"\n",
        "[sources]\n\"Lab-A\" = \"QUARANTINE\"\n",
        "[kg]\nnode_types = [\"Document\"]\n",
      ),
    )
    .unwrap();
    let cfg = FieldpackConfig { policy_path: Some(path), ..FieldpackConfig::default() };
    let policy = cfg.load_policy().unwrap();
    assert_eq!(policy.mode_for("Lab-A"), AcceptanceMode::Quarantine);
    assert!(policy.kg.node_types.contains("Document"));

    let json = dir.path().join("allow.json");
    std::fs::write(&json, r#"{"tools": ["pdftotext"]}"#).unwrap();
    let cfg = FieldpackConfig { allowlist_path: Some(json), ..FieldpackConfig::default() };
    assert!(cfg.load_allowlist().unwrap().allows_tool("pdftotext"));
  }
}
