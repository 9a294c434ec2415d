//! Structured outcomes of verification and replay.
//!
//! Policy failures are values, not errors: callers render them directly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::Hash256;

/// Machine-readable refusal reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
  Ok,
  TamperedContent,
  InvalidSignature,
  MissingAttestation,
  MissingSbom,
  DisallowedTool,
  PolicyMismatch,
  BundleTooLarge,
  ReplayMismatch,
}

impl ReasonCode {
  pub fn as_str(self) -> &'static str {
    match self {
      ReasonCode::Ok => "OK",
      ReasonCode::TamperedContent => "TAMPERED_CONTENT",
      ReasonCode::InvalidSignature => "INVALID_SIGNATURE",
      ReasonCode::MissingAttestation => "MISSING_ATTESTATION",
      ReasonCode::MissingSbom => "MISSING_SBOM",
      ReasonCode::DisallowedTool => "DISALLOWED_TOOL",
      ReasonCode::PolicyMismatch => "POLICY_MISMATCH",
      ReasonCode::BundleTooLarge => "BUNDLE_TOO_LARGE",
      ReasonCode::ReplayMismatch => "REPLAY_MISMATCH",
    }
  }
}

impl fmt::Display for ReasonCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
  pub ok:              bool,
  pub reason:          ReasonCode,
  /// Context for audit: digest prefix, entry name, key id.
  pub detail:          Option<String>,
  /// Checks that failed but were downgraded by a lenient policy.
  pub warnings:        Vec<String>,
  pub bundle_sha256:   Hash256,
  pub manifest_sha256: Option<Hash256>,
  pub toolchain_id:    Option<String>,
}

impl VerificationResult {
  pub fn refused(bundle_sha256: Hash256, reason: ReasonCode, detail: impl Into<String>) -> Self {
    Self {
      ok: false,
      reason,
      detail: Some(detail.into()),
      warnings: Vec::new(),
      bundle_sha256,
      manifest_sha256: None,
      toolchain_id: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
  pub ok:           bool,
  pub reason:       ReasonCode,
  pub detail:       Option<String>,
  /// Provenance events re-walked across every sealed ledger.
  pub events:       u64,
  pub kg_ops:       u64,
  pub root_hash:    Option<Hash256>,
  pub verification: VerificationResult,
}
