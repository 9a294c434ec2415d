//! Declarative acceptance policy and tool allowlist.
//!
//! Both documents are read-only inputs to verification and acceptance. Each
//! has a canonical hash so a bundle can record which policy it was sealed
//! under.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  canonical::{CanonicalizationError, Hash256, digest_canonical},
  kg::{DeltaLimits, KgSchema},
};

/// How a verified bundle's KG delta is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptanceMode {
  /// Merge immediately when verification and validation pass.
  AutoMerge,
  /// Stage as `PENDING` for a reviewer.
  ReviewOnly,
  /// Stage as `QUARANTINED`; only an explicit approval can merge it.
  Quarantine,
  /// Refuse outright. Nothing is recorded.
  Kill,
}

impl AcceptanceMode {
  pub fn as_str(self) -> &'static str {
    match self {
      AcceptanceMode::AutoMerge => "AUTO_MERGE",
      AcceptanceMode::ReviewOnly => "REVIEW_ONLY",
      AcceptanceMode::Quarantine => "QUARANTINE",
      AcceptanceMode::Kill => "KILL",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().replace('-', "_").as_str() {
      "AUTO_MERGE" => Some(AcceptanceMode::AutoMerge),
      "REVIEW_ONLY" => Some(AcceptanceMode::ReviewOnly),
      "QUARANTINE" => Some(AcceptanceMode::Quarantine),
      "KILL" => Some(AcceptanceMode::Kill),
      _ => None,
    }
  }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
  pub policy_id:                    String,
  pub version:                      u32,
  /// Mode for sources without an entry in `sources`.
  pub mode:                         AcceptanceMode,
  /// Per-toolchain overrides.
  pub sources:                      BTreeMap<String, AcceptanceMode>,
  /// Forces every import to `KILL`.
  pub kill_switch:                  bool,
  /// Makes every check below mandatory.
  pub strict:                       bool,
  pub require_signed_attestation:   bool,
  pub require_inventory:            bool,
  pub enforce_allowlist:            bool,
  pub require_policy_hash_match:    bool,
  /// Refuse bundles sealed against a different allowlist.
  pub require_allowlist_hash_match: bool,
  pub max_bundle_bytes:             u64,
  pub max_entries:                  usize,
  pub limits:                       DeltaLimits,
  pub kg:                           KgSchema,
}

impl Default for Policy {
  fn default() -> Self {
    Self {
      policy_id:                    "default".into(),
      version:                      1,
      mode:                         AcceptanceMode::ReviewOnly,
      sources:                      BTreeMap::new(),
      kill_switch:                  false,
      strict:                       false,
      require_signed_attestation:   false,
      require_inventory:            false,
      enforce_allowlist:            true,
      require_policy_hash_match:    false,
      require_allowlist_hash_match: false,
      max_bundle_bytes:             512 * 1024 * 1024,
      max_entries:                  100_000,
      limits:                       DeltaLimits::default(),
      kg:                           KgSchema::default(),
    }
  }
}

impl Policy {
  /// Every check mandatory, auto-merging by default.
  pub fn strict() -> Self {
    Self {
      policy_id: "strict".into(),
      mode: AcceptanceMode::AutoMerge,
      strict: true,
      require_signed_attestation: true,
      require_inventory: true,
      enforce_allowlist: true,
      ..Self::default()
    }
  }

  /// Mode for bundles sealed by `toolchain_id`.
  pub fn mode_for(&self, toolchain_id: &str) -> AcceptanceMode {
    if self.kill_switch {
      return AcceptanceMode::Kill;
    }
    self.sources.get(toolchain_id).copied().unwrap_or(self.mode)
  }

  pub fn requires_attestation(&self) -> bool { self.strict || self.require_signed_attestation }

  pub fn requires_inventory(&self) -> bool { self.strict || self.require_inventory }

  pub fn enforces_allowlist(&self) -> bool { self.strict || self.enforce_allowlist }

  pub fn hash(&self) -> Result<Hash256, CanonicalizationError> { digest_canonical(self) }
}

// ─── Allowlist ───────────────────────────────────────────────────────────────

/// A trusted attestation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
  /// SHA-256 hex of the raw public key.
  pub key_id:     String,
  /// Raw Ed25519 public key, hex.
  pub public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allowlist {
  pub toolchains: BTreeSet<String>,
  pub tools:      BTreeSet<String>,
  pub signers:    Vec<Signer>,
}

impl Allowlist {
  pub fn allows_toolchain(&self, id: &str) -> bool { self.toolchains.contains(id) }

  pub fn allows_tool(&self, id: &str) -> bool { self.tools.contains(id) }

  pub fn signer(&self, key_id: &str) -> Option<&Signer> {
    self.signers.iter().find(|s| s.key_id == key_id)
  }

  pub fn hash(&self) -> Result<Hash256, CanonicalizationError> { digest_canonical(self) }
}
