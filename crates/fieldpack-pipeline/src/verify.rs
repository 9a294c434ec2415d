//! Bundle verification.
//!
//! Checks run in a fixed order and stop at the first refusal:
//!
//! 1. size and entry limits, member names (`BUNDLE_TOO_LARGE`, `TAMPERED_CONTENT`)
//! 2. manifest, digests, unlisted members, slice and delta counts (`TAMPERED_CONTENT`)
//! 3. bundle attestation (`INVALID_SIGNATURE`, `MISSING_ATTESTATION`)
//! 4. inventory and its attestation (`MISSING_SBOM`, `TAMPERED_CONTENT`, `INVALID_SIGNATURE`)
//! 5. allowlist (`DISALLOWED_TOOL`)
//! 6. policy binding (`POLICY_MISMATCH`)
//!
//! Checks a lenient policy does not require are reported as warnings.

use std::{
  collections::{BTreeMap, BTreeSet, HashSet},
  path::Path,
};

use fieldpack_archive::{
  Archive, Manifest, ReadLimits,
  container::{ATTESTATION_PATH, MANIFEST_PATH, SBOM_ATTESTATION_PATH, SBOM_PATH},
  dsse::{Envelope, INTOTO_PAYLOAD_TYPE, verifying_key_from_hex},
  manifest::{MANIFEST_VERSION, bundle_map_hash, is_envelope_entry},
  sbom::Bom,
};
use fieldpack_core::{
  Hash256, LedgerEvent, LedgerKind,
  canonical::digest,
  kg::KgOp,
  policy::{Allowlist, Policy},
  result::{ReasonCode, VerificationResult},
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Pipeline, Result};

/// A bundle that passed every check, decoded.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
  pub bundle_sha256:   Hash256,
  pub manifest_sha256: Hash256,
  pub manifest:        Manifest,
  pub slices:          BTreeMap<LedgerKind, Vec<LedgerEvent>>,
  pub ops:             Vec<KgOp>,
  pub archive:         Archive,
}

struct Refusal {
  reason: ReasonCode,
  detail: String,
}

impl Refusal {
  fn new(reason: ReasonCode, detail: impl Into<String>) -> Self {
    Self { reason, detail: detail.into() }
  }
}

fn tampered(detail: impl Into<String>) -> Refusal {
  Refusal::new(ReasonCode::TamperedContent, detail)
}

/// What was learned before the first refusal.
#[derive(Default)]
struct Findings {
  warnings:        Vec<String>,
  manifest_sha256: Option<Hash256>,
  toolchain_id:    Option<String>,
}

impl Findings {
  /// Refuse with `reason` when `required`, otherwise record a warning.
  fn require(&mut self, required: bool, reason: ReasonCode, detail: String) -> Result<(), Refusal> {
    if required {
      return Err(Refusal::new(reason, detail));
    }
    self.warnings.push(detail);
    Ok(())
  }
}

// ─── Entry points ────────────────────────────────────────────────────────────

/// Verify `bytes` and, when they pass, return the decoded bundle too.
pub fn inspect(
  bytes: &[u8],
  policy: &Policy,
  allowlist: &Allowlist,
) -> (VerificationResult, Option<VerifiedBundle>) {
  let bundle_sha256 = digest(bytes);
  let mut found = Findings::default();
  let outcome = check(bytes, bundle_sha256, policy, allowlist, &mut found);

  let (ok, reason, detail, bundle) = match outcome {
    Ok(bundle) => (true, ReasonCode::Ok, None, Some(bundle)),
    Err(refusal) => {
      tracing::warn!(
        bundle = %bundle_sha256.short(),
        reason = %refusal.reason,
        detail = %refusal.detail,
        "bundle refused"
      );
      (false, refusal.reason, Some(refusal.detail), None)
    }
  };
  if ok {
    tracing::info!(
      bundle = %bundle_sha256.short(),
      warnings = found.warnings.len(),
      "bundle verified"
    );
  }

  let result = VerificationResult {
    ok,
    reason,
    detail,
    warnings: found.warnings,
    bundle_sha256,
    manifest_sha256: found.manifest_sha256,
    toolchain_id: found.toolchain_id,
  };
  (result, bundle)
}

pub fn verify_bundle(bytes: &[u8], policy: &Policy, allowlist: &Allowlist) -> VerificationResult {
  inspect(bytes, policy, allowlist).0
}

impl Pipeline {
  pub fn verify_bytes(&self, bytes: &[u8]) -> VerificationResult {
    verify_bundle(bytes, &self.policy, &self.allowlist)
  }

  /// Verify the bundle at `path` under the loaded policy. Only an unreadable
  /// file is an error.
  pub fn verify_path(&self, path: &Path) -> Result<VerificationResult> {
    Ok(self.verify_bytes(&std::fs::read(path)?))
  }
}

// ─── Stages ──────────────────────────────────────────────────────────────────

fn check(
  bytes: &[u8],
  bundle_sha256: Hash256,
  policy: &Policy,
  allowlist: &Allowlist,
  found: &mut Findings,
) -> Result<VerifiedBundle, Refusal> {
  if bytes.len() as u64 > policy.max_bundle_bytes {
    return Err(Refusal::new(
      ReasonCode::BundleTooLarge,
      format!("bundle is {} bytes, limit is {}", bytes.len(), policy.max_bundle_bytes),
    ));
  }
  let limits =
    ReadLimits { max_entries: policy.max_entries, max_total_bytes: policy.max_bundle_bytes };
  let archive = Archive::read(bytes, limits).map_err(|e| {
    if e.is_limit() {
      Refusal::new(ReasonCode::BundleTooLarge, e.to_string())
    } else {
      tampered(e.to_string())
    }
  })?;

  let manifest_bytes =
    archive.get(MANIFEST_PATH).ok_or_else(|| tampered(format!("{MANIFEST_PATH} is missing")))?;
  let manifest_sha256 = digest(manifest_bytes);
  found.manifest_sha256 = Some(manifest_sha256);
  let manifest = Manifest::from_bytes(manifest_bytes)
    .map_err(|e| tampered(format!("{MANIFEST_PATH} is unreadable: {e}")))?;
  if manifest.manifest_version != MANIFEST_VERSION {
    return Err(tampered(format!("unsupported manifest_version {}", manifest.manifest_version)));
  }
  found.toolchain_id = Some(manifest.toolchain_id.clone());

  check_contents(&archive, &manifest)?;
  let slices = read_slices(&archive, &manifest)?;
  let ops = read_ops(&archive, &manifest)?;

  check_attestation(&archive, &manifest_sha256, policy, allowlist, found)?;
  check_inventory(&archive, &manifest, policy, allowlist, found)?;
  check_allowlist(&manifest, &slices, policy, allowlist, found)?;
  check_policy_binding(&manifest, policy, allowlist)?;

  Ok(VerifiedBundle { bundle_sha256, manifest_sha256, manifest, slices, ops, archive })
}

fn check_contents(archive: &Archive, manifest: &Manifest) -> Result<(), Refusal> {
  let mut listed = HashSet::new();
  for entry in &manifest.files {
    if !listed.insert(entry.path.as_str()) {
      return Err(tampered(format!("{} is listed twice", entry.path)));
    }
    if is_envelope_entry(&entry.path) {
      return Err(tampered(format!("{} cannot be a listed file", entry.path)));
    }
    let content =
      archive.get(&entry.path).ok_or_else(|| tampered(format!("{} is missing", entry.path)))?;
    let actual = digest(content);
    if actual != entry.sha256 || content.len() as u64 != entry.size {
      return Err(tampered(format!(
        "{} hashes to {}, manifest lists {}",
        entry.path,
        actual.short(),
        entry.sha256.short()
      )));
    }
  }

  if let Some(extra) = archive.names().find(|n| !is_envelope_entry(n) && !listed.contains(n)) {
    return Err(tampered(format!("{extra} is not listed in the manifest")));
  }
  let map_hash = bundle_map_hash(&manifest.files).map_err(|e| tampered(e.to_string()))?;
  if map_hash != manifest.bundle_map_hash {
    return Err(tampered("bundle_map_hash does not match the file list"));
  }
  Ok(())
}

/// Parse a listed JSONL entry.
fn read_lines<T: DeserializeOwned>(
  archive: &Archive,
  manifest: &Manifest,
  path: &str,
) -> Result<Vec<T>, Refusal> {
  if manifest.file(path).is_none() {
    return Err(tampered(format!("{path} is not listed in the manifest")));
  }
  let bytes = archive.get(path).ok_or_else(|| tampered(format!("{path} is missing")))?;
  bytes
    .split(|b| *b == b'\n')
    .filter(|line| !line.is_empty())
    .enumerate()
    .map(|(n, line)| {
      serde_json::from_slice(line).map_err(|e| tampered(format!("{path} line {}: {e}", n + 1)))
    })
    .collect()
}

fn read_slices(
  archive: &Archive,
  manifest: &Manifest,
) -> Result<BTreeMap<LedgerKind, Vec<LedgerEvent>>, Refusal> {
  let mut slices = BTreeMap::new();
  for slice in &manifest.provenance {
    if slice.path != slice.ledger.export_path() {
      return Err(tampered(format!("{} slice is stored at {}", slice.ledger, slice.path)));
    }
    let events: Vec<LedgerEvent> = read_lines(archive, manifest, &slice.path)?;
    if events.len() as u64 != slice.events {
      return Err(tampered(format!(
        "{} holds {} events, manifest lists {}",
        slice.path,
        events.len(),
        slice.events
      )));
    }
    if slices.insert(slice.ledger, events).is_some() {
      return Err(tampered(format!("{} slice is listed twice", slice.ledger)));
    }
  }
  Ok(slices)
}

fn read_ops(archive: &Archive, manifest: &Manifest) -> Result<Vec<KgOp>, Refusal> {
  let delta = &manifest.kg_delta;
  match manifest.file(&delta.path) {
    Some(entry) if entry.sha256 == delta.sha256 => {}
    _ => return Err(tampered(format!("{} does not match the kg_delta reference", delta.path))),
  }
  let ops: Vec<KgOp> = read_lines(archive, manifest, &delta.path)?;
  if ops.len() != delta.ops {
    return Err(tampered(format!(
      "{} holds {} ops, manifest lists {}",
      delta.path,
      ops.len(),
      delta.ops
    )));
  }
  Ok(ops)
}

/// Check a DSSE envelope signed by an allowlisted key over `subject`.
fn check_envelope(
  bytes: &[u8],
  subject: &str,
  expected: &Hash256,
  allowlist: &Allowlist,
) -> Result<(), String> {
  let envelope = Envelope::from_bytes(bytes).map_err(|e| format!("unreadable envelope: {e}"))?;
  if envelope.payload_type != INTOTO_PAYLOAD_TYPE {
    return Err(format!("unexpected payload type {:?}", envelope.payload_type));
  }
  let signer = envelope
    .key_ids()
    .find_map(|id| allowlist.signer(id))
    .ok_or_else(|| {
      let ids: Vec<String> =
        envelope.key_ids().map(|id| id.chars().take(12).collect()).collect();
      format!("no trusted signer among key ids {ids:?}")
    })?;
  let key = verifying_key_from_hex(&signer.public_key)
    .map_err(|e| format!("allowlisted key {} is unusable: {e}", signer.key_id))?;
  let statement =
    envelope.verify_statement(&key).map_err(|e| format!("signature check failed: {e}"))?;

  match statement.subject_digest(subject) {
    Some(claimed) if claimed == *expected => Ok(()),
    Some(claimed) => Err(format!(
      "{subject} hashes to {}, statement claims {}",
      expected.short(),
      claimed.short()
    )),
    None => Err(format!("statement does not cover {subject}")),
  }
}

fn check_attestation(
  archive: &Archive,
  manifest_sha256: &Hash256,
  policy: &Policy,
  allowlist: &Allowlist,
  found: &mut Findings,
) -> Result<(), Refusal> {
  match archive.get(ATTESTATION_PATH) {
    Some(bytes) => check_envelope(bytes, MANIFEST_PATH, manifest_sha256, allowlist)
      .map_err(|detail| Refusal::new(ReasonCode::InvalidSignature, detail)),
    None => found.require(
      policy.requires_attestation(),
      ReasonCode::MissingAttestation,
      format!("{ATTESTATION_PATH} is missing"),
    ),
  }
}

fn check_inventory(
  archive: &Archive,
  manifest: &Manifest,
  policy: &Policy,
  allowlist: &Allowlist,
  found: &mut Findings,
) -> Result<(), Refusal> {
  let required = policy.requires_inventory();
  let Some(bytes) = archive.get(SBOM_PATH) else {
    return found.require(required, ReasonCode::MissingSbom, format!("{SBOM_PATH} is missing"));
  };
  if let Err(e) = Bom::parse(bytes) {
    return found.require(required, ReasonCode::MissingSbom, e.to_string());
  }

  let actual = digest(bytes);
  match &manifest.sbom {
    Some(sbom) if sbom.path == SBOM_PATH && sbom.sha256 == actual => {}
    Some(sbom) => {
      return Err(tampered(format!(
        "{SBOM_PATH} hashes to {}, manifest lists {}",
        actual.short(),
        sbom.sha256.short()
      )));
    }
    None => return Err(tampered(format!("{SBOM_PATH} is not referenced by the manifest"))),
  }

  match archive.get(SBOM_ATTESTATION_PATH) {
    Some(envelope) => check_envelope(envelope, SBOM_PATH, &actual, allowlist)
      .map_err(|detail| Refusal::new(ReasonCode::InvalidSignature, format!("inventory: {detail}"))),
    None => found.require(
      required,
      ReasonCode::MissingSbom,
      format!("{SBOM_ATTESTATION_PATH} is missing"),
    ),
  }
}

fn check_allowlist(
  manifest: &Manifest,
  slices: &BTreeMap<LedgerKind, Vec<LedgerEvent>>,
  policy: &Policy,
  allowlist: &Allowlist,
  found: &mut Findings,
) -> Result<(), Refusal> {
  let mut toolchains = BTreeSet::new();
  let mut tools = BTreeSet::new();

  toolchains.insert(manifest.toolchain_id.as_str());
  for event in slices.values().flatten() {
    if let Some(id) = event.payload.get("toolchain_id").and_then(Value::as_str) {
      toolchains.insert(id);
    }
  }
  for event in slices.get(&LedgerKind::ToolRun).into_iter().flatten() {
    if let Some(id) = event.payload.get("tool_id").and_then(Value::as_str) {
      tools.insert(id);
    }
  }

  let mut unknown: Vec<String> = toolchains
    .into_iter()
    .filter(|id| !allowlist.allows_toolchain(id))
    .map(|id| format!("toolchain {id:?}"))
    .collect();
  unknown.extend(
    tools
      .into_iter()
      .filter(|id| !allowlist.allows_tool(id))
      .map(|id| format!("tool {id:?}")),
  );
  if unknown.is_empty() {
    return Ok(());
  }
  found.require(
    policy.enforces_allowlist(),
    ReasonCode::DisallowedTool,
    format!("not allowlisted: {}", unknown.join(", ")),
  )
}

fn check_policy_binding(
  manifest: &Manifest,
  policy: &Policy,
  allowlist: &Allowlist,
) -> Result<(), Refusal> {
  let mismatch = |detail: String| Refusal::new(ReasonCode::PolicyMismatch, detail);
  let bound = |what: &str, sealed: Option<Hash256>, local: Hash256| match sealed {
    Some(sealed) if sealed == local => Ok(()),
    Some(sealed) => Err(mismatch(format!(
      "bundle was sealed under {what} {}, local {what} is {}",
      sealed.short(),
      local.short()
    ))),
    None => Err(mismatch(format!("bundle does not record a {what} hash"))),
  };

  if policy.require_policy_hash_match {
    let local = policy.hash().map_err(|e| mismatch(e.to_string()))?;
    bound("policy", manifest.policy_hash, local)?;
  }
  if policy.require_allowlist_hash_match {
    let local = allowlist.hash().map_err(|e| mismatch(e.to_string()))?;
    bound("allowlist", manifest.allowlist_hash, local)?;
  }
  Ok(())
}
