//! End-to-end scenarios: ingest, seal, verify, replay and accept against a
//! runtime in a temporary directory.

use std::{collections::BTreeSet, fs, path::PathBuf, time::Duration};

use ed25519_dalek::SigningKey;
use fieldpack_archive::{
  Archive, ArchiveWriter, Manifest, ReadLimits,
  container::{ATTESTATION_PATH, KG_DELTA_PATH, MANIFEST_PATH, SBOM_ATTESTATION_PATH, SBOM_PATH},
  dsse::{BUNDLE_PREDICATE_TYPE, Envelope, Statement, Subject},
  manifest::{FileEntry, FileRole, KgDeltaRef, bundle_map_hash},
  sbom::{Bom, Component},
};
use fieldpack_core::{
  LedgerKind,
  canonical::digest,
  policy::{AcceptanceMode, Allowlist, Policy},
  result::{ReasonCode, VerificationResult},
  staging::{Decision, StageStatus},
};
use serde_json::json;
use tempfile::TempDir;

use crate::{
  Error, FieldpackConfig, Pipeline,
  ingest::Ingested,
  keys::{generate_key, load_key, signer_entry},
  replay::replay_bundle,
  seal::SealOutcome,
  tools::CompletedRun,
  verify::verify_bundle,
};

const TOOLCHAIN: &str = "fieldpack-test";

/// Document node, raw and extract blobs with edges, four chunks with edges.
const DEMO_OPS: usize = 1 + 4 + 8;

struct Fixture {
  dir:      TempDir,
  pipeline: Pipeline,
}

fn fixture_with(policy: Policy, tweak: impl FnOnce(&mut FieldpackConfig)) -> Fixture {
  let dir = tempfile::tempdir().unwrap();
  let mut config = FieldpackConfig::rooted(dir.path());
  config.toolchain_id = TOOLCHAIN.into();
  config.ingest.chunk_chars = 200;
  config.ingest.overlap_chars = 50;
  config.ingest.min_chunk_chars = 20;
  tweak(&mut config);

  let pipeline = Pipeline::open(&config).unwrap();
  let public = generate_key(&pipeline.config().signing_key_path).unwrap();
  let allowlist = Allowlist {
    toolchains: BTreeSet::from([TOOLCHAIN.to_owned()]),
    tools:      BTreeSet::from(["pdftotext".to_owned()]),
    signers:    vec![signer_entry(&public)],
  };
  Fixture { dir, pipeline: pipeline.with_policy(policy, allowlist) }
}

fn fixture(policy: Policy) -> Fixture { fixture_with(policy, |_| {}) }

/// `len` ASCII characters, varied by `seed`.
fn sample_text(len: usize, seed: u8) -> String {
  (0..len).map(|i| char::from(b'a' + ((i + seed as usize) % 26) as u8)).collect()
}

impl Fixture {
  fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
    let path = self.dir.path().join(name);
    fs::write(&path, bytes).unwrap();
    path
  }

  fn ingest_text(&self, name: &str, seed: u8) -> Ingested {
    let path = self.write(name, sample_text(500, seed).as_bytes());
    self.pipeline.ingest(&path).unwrap()
  }

  fn seal(&self, label: &str) -> (SealOutcome, Vec<u8>) {
    let outcome = self.pipeline.seal(label).unwrap();
    let bytes = fs::read(&outcome.path).unwrap();
    (outcome, bytes)
  }

  fn verify(&self, bytes: &[u8], policy: &Policy) -> VerificationResult {
    verify_bundle(bytes, policy, self.pipeline.allowlist())
  }

  fn demo_bundle(&self) -> Vec<u8> {
    self.ingest_text("notes.txt", 0);
    self.seal("demo").1
  }
}

fn rewrite(bytes: &[u8], edit: impl FnOnce(&mut ArchiveWriter)) -> Vec<u8> {
  let mut writer = ArchiveWriter::from(Archive::read(bytes, ReadLimits::default()).unwrap());
  edit(&mut writer);
  writer.finish().unwrap()
}

fn entry(bytes: &[u8], name: &str) -> Vec<u8> {
  Archive::read(bytes, ReadLimits::default()).unwrap().get(name).unwrap().to_vec()
}

/// Edit the manifest and re-sign it with the fixture's own key, producing a
/// bundle that verifies but may not replay.
fn resign(
  f: &Fixture,
  bytes: &[u8],
  edit: impl FnOnce(&mut Manifest, &mut ArchiveWriter),
) -> Vec<u8> {
  let mut manifest = Manifest::from_bytes(&entry(bytes, MANIFEST_PATH)).unwrap();
  let mut writer = ArchiveWriter::from(Archive::read(bytes, ReadLimits::default()).unwrap());
  edit(&mut manifest, &mut writer);
  manifest.bundle_map_hash = bundle_map_hash(&manifest.files).unwrap();

  let manifest_bytes = manifest.to_bytes().unwrap();
  let key = load_key(&f.pipeline.config().signing_key_path).unwrap();
  let statement = Statement::new(
    vec![Subject::sha256(MANIFEST_PATH, &digest(&manifest_bytes))],
    BUNDLE_PREDICATE_TYPE,
    json!({ "label": manifest.label }),
  );
  let envelope = Envelope::sign_statement(&statement, &key).unwrap();
  writer.insert(ATTESTATION_PATH, envelope.to_bytes().unwrap()).unwrap();
  writer.insert(MANIFEST_PATH, manifest_bytes).unwrap();
  writer.finish().unwrap()
}

// ─── Ingest ──────────────────────────────────────────────────────────────────

#[test]
fn ingest_chunks_and_records_one_event() {
  let f = fixture(Policy::default());
  let ingested = f.ingest_text("notes.txt", 0);

  // ceil(500 / (200 - 50))
  assert_eq!(ingested.chunks, 4);
  assert_eq!(ingested.event.seq, 1);
  assert_eq!(ingested.event.payload.chunks.len(), 4);
  assert_eq!(ingested.document.extract_strategy, "utf8");
  assert_eq!(ingested.document.mime, "text/plain");

  let store = f.pipeline.store();
  assert_eq!(store.documents().unwrap(), vec![ingested.document.clone()]);
  let chunks = store.chunks(ingested.document.doc_id).unwrap();
  assert_eq!(chunks.len(), 4);
  assert_eq!((chunks[3].start, chunks[3].end), (450, 500));
  assert_eq!(store.ingest_ledger().len().unwrap(), 1);
  assert!(f.pipeline.cas().contains(&ingested.document.raw_sha256));
}

#[test]
fn chunk_boundaries_do_not_depend_on_the_run() {
  let a = fixture(Policy::default()).ingest_text("a.txt", 3).event.payload.chunks;
  let b = fixture(Policy::default()).ingest_text("a.txt", 3).event.payload.chunks;
  assert_eq!(a, b);
}

#[test]
fn oversized_files_are_refused_before_anything_is_stored() {
  let f = fixture_with(Policy::default(), |c| c.ingest.max_bytes = 100);
  let path = f.write("big.txt", sample_text(101, 0).as_bytes());
  assert!(matches!(f.pipeline.ingest(&path), Err(Error::TooLarge { size: 101, limit: 100, .. })));
  assert!(f.pipeline.store().ingest_ledger().is_empty().unwrap());
  assert!(!f.pipeline.cas().contains(&digest(sample_text(101, 0).as_bytes())));
}

#[test]
fn binary_files_are_ingested_without_chunks() {
  let f = fixture(Policy::default());
  let path = f.write("scan.png", &[0x89, b'P', b'N', b'G', 0xff, 0xfe]);
  let ingested = f.pipeline.ingest(&path).unwrap();
  assert_eq!(ingested.document.extract_strategy, "none");
  assert_eq!(ingested.document.extract_sha256, None);
  assert_eq!(ingested.chunks, 0);
}

// ─── Seal ────────────────────────────────────────────────────────────────────

#[test]
fn seal_exports_the_unsealed_slice() {
  let f = fixture(Policy::strict());
  f.ingest_text("notes.txt", 0);
  let (outcome, bytes) = f.seal("demo");

  assert_eq!(outcome.events, 1);
  assert_eq!(outcome.kg_ops, DEMO_OPS);
  assert!(!outcome.resealed);
  assert!(outcome.path.file_name().unwrap().to_string_lossy().starts_with("demo-"));

  let manifest = Manifest::from_bytes(&entry(&bytes, MANIFEST_PATH)).unwrap();
  let slice = manifest.slice(LedgerKind::Ingest).unwrap();
  assert_eq!((slice.from_seq, slice.to_seq, slice.events), (1, 1, 1));
  assert_eq!(slice.anchor, None);
  assert_eq!(manifest.kg_delta.ops, DEMO_OPS);
  assert_eq!(manifest.toolchain_id, TOOLCHAIN);
  assert!(manifest.file("provenance/ingest.jsonl").is_some());
  assert_eq!(manifest.files.iter().filter(|e| e.role == FileRole::Blob).count(), 2);

  let checkpoint = f.pipeline.store().last_checkpoint().unwrap().unwrap();
  assert_eq!(checkpoint.bundle_sha256, outcome.bundle_sha256);
}

#[test]
fn resealing_without_new_events_is_byte_identical() {
  let f = fixture(Policy::strict());
  f.ingest_text("notes.txt", 0);
  let (first, first_bytes) = f.seal("demo");
  let (second, second_bytes) = f.seal("demo");

  assert!(second.resealed);
  assert_eq!(first.bundle_sha256, second.bundle_sha256);
  assert_eq!(first_bytes, second_bytes);
  assert_eq!(first.ranges, second.ranges);
}

#[test]
fn later_seals_continue_from_the_checkpoint() {
  let f = fixture(Policy::strict());
  let first = f.ingest_text("a.txt", 0);
  f.seal("one");
  f.ingest_text("b.txt", 1);
  let (outcome, bytes) = f.seal("two");

  assert_eq!(outcome.events, 1);
  let manifest = Manifest::from_bytes(&entry(&bytes, MANIFEST_PATH)).unwrap();
  let slice = manifest.slice(LedgerKind::Ingest).unwrap();
  assert_eq!((slice.from_seq, slice.to_seq), (2, 2));
  assert_eq!(slice.anchor, Some(first.event.event_hash));

  let replay = replay_bundle(&bytes, f.pipeline.policy(), f.pipeline.allowlist());
  assert!(replay.ok, "{replay:?}");
}

#[test]
fn sealing_without_a_key_writes_nothing() {
  let f = fixture(Policy::default());
  fs::remove_file(&f.pipeline.config().signing_key_path).unwrap();
  f.ingest_text("notes.txt", 0);

  assert!(matches!(f.pipeline.seal("demo"), Err(Error::Signing(_))));
  assert_eq!(fs::read_dir(f.pipeline.bundles_dir()).unwrap().count(), 0);
  assert!(f.pipeline.store().last_checkpoint().unwrap().is_none());
}

#[test]
fn labels_are_checked_before_sealing() {
  let f = fixture(Policy::default());
  assert!(matches!(f.pipeline.seal("../escape"), Err(Error::InvalidLabel(_))));
}

// ─── Verify ──────────────────────────────────────────────────────────────────

#[test]
fn strict_verification_accepts_an_untouched_bundle() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let result = f.verify(&bytes, &Policy::strict());

  assert!(result.ok, "{result:?}");
  assert_eq!(result.reason, ReasonCode::Ok);
  assert!(result.warnings.is_empty());
  assert_eq!(result.bundle_sha256, digest(&bytes));
  assert_eq!(result.toolchain_id.as_deref(), Some(TOOLCHAIN));
}

#[test]
fn one_flipped_byte_in_the_delta_is_tampering() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let mut delta = entry(&bytes, KG_DELTA_PATH);
  delta[10] ^= 0x01;
  let tampered = rewrite(&bytes, |w| w.insert(KG_DELTA_PATH, delta).unwrap());

  let result = f.verify(&tampered, &Policy::strict());
  assert!(!result.ok);
  assert_eq!(result.reason, ReasonCode::TamperedContent);
  assert!(result.detail.unwrap().contains(KG_DELTA_PATH));
}

#[test]
fn unlisted_members_are_tampering() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let padded = rewrite(&bytes, |w| w.insert("blobs/raw/extra", b"x".to_vec()).unwrap());
  assert_eq!(f.verify(&padded, &Policy::strict()).reason, ReasonCode::TamperedContent);
}

#[test]
fn forged_signatures_are_rejected_in_every_mode() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let original = Envelope::from_bytes(&entry(&bytes, ATTESTATION_PATH)).unwrap();
  let mut forged = Envelope::sign(
    &original.payload_type,
    &original.payload_bytes().unwrap(),
    &SigningKey::from_bytes(&[7; 32]),
  );
  forged.signatures[0].keyid = original.signatures[0].keyid.clone();
  let forged = rewrite(&bytes, |w| w.insert(ATTESTATION_PATH, forged.to_bytes().unwrap()).unwrap());

  for policy in [Policy::strict(), Policy::default()] {
    let result = f.verify(&forged, &policy);
    assert_eq!(result.reason, ReasonCode::InvalidSignature, "{result:?}");
  }
}

#[test]
fn unknown_signers_are_invalid_signatures() {
  let f = fixture(Policy::default());
  let bytes = f.demo_bundle();
  let stranger = Allowlist { signers: Vec::new(), ..f.pipeline.allowlist().clone() };
  let result = verify_bundle(&bytes, &Policy::default(), &stranger);
  assert_eq!(result.reason, ReasonCode::InvalidSignature);
}

#[test]
fn non_ascii_key_ids_are_invalid_signatures() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let envelope = json!({
    "payloadType": "application/vnd.in-toto+json",
    "payload": "",
    "signatures": [{ "keyid": "aéééééééé", "sig": "" }]
  });
  let envelope = serde_json::to_vec(&envelope).unwrap();
  let forged = rewrite(&bytes, |w| w.insert(ATTESTATION_PATH, envelope).unwrap());

  for policy in [Policy::strict(), Policy::default()] {
    let result = f.verify(&forged, &policy);
    assert_eq!(result.reason, ReasonCode::InvalidSignature, "{result:?}");
  }
}

#[test]
fn missing_attestation_depends_on_policy() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let unsigned = rewrite(&bytes, |w| {
    w.remove(ATTESTATION_PATH);
  });

  assert_eq!(f.verify(&unsigned, &Policy::strict()).reason, ReasonCode::MissingAttestation);
  let lenient = f.verify(&unsigned, &Policy::default());
  assert!(lenient.ok);
  assert_eq!(lenient.warnings.len(), 1);
}

#[test]
fn removing_the_inventory_is_missing_sbom() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let stripped = rewrite(&bytes, |w| {
    w.remove(SBOM_PATH);
    w.remove(SBOM_ATTESTATION_PATH);
  });

  assert_eq!(f.verify(&stripped, &Policy::strict()).reason, ReasonCode::MissingSbom);
  let lenient = f.verify(&stripped, &Policy::default());
  assert!(lenient.ok, "{lenient:?}");
  assert!(!lenient.warnings.is_empty());
}

#[test]
fn a_swapped_inventory_is_tampering() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let mut bom = Bom::parse(&entry(&bytes, SBOM_PATH)).unwrap();
  bom.components.push(Component::application("ocr"));
  let swapped = rewrite(&bytes, |w| w.insert(SBOM_PATH, bom.to_bytes().unwrap()).unwrap());
  assert_eq!(f.verify(&swapped, &Policy::strict()).reason, ReasonCode::TamperedContent);
}

#[test]
fn unknown_toolchains_are_disallowed() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let allowlist = Allowlist { toolchains: BTreeSet::new(), ..f.pipeline.allowlist().clone() };

  let result = verify_bundle(&bytes, &Policy::strict(), &allowlist);
  assert_eq!(result.reason, ReasonCode::DisallowedTool);

  let lenient = Policy { enforce_allowlist: false, ..Policy::default() };
  let result = verify_bundle(&bytes, &lenient, &allowlist);
  assert!(result.ok);
  assert!(result.warnings[0].contains(TOOLCHAIN));
}

#[test]
fn oversized_bundles_are_refused_before_reading() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let tight = Policy { max_bundle_bytes: 100, ..Policy::strict() };
  assert_eq!(f.verify(&bytes, &tight).reason, ReasonCode::BundleTooLarge);

  let few = Policy { max_entries: 2, ..Policy::strict() };
  assert_eq!(f.verify(&bytes, &few).reason, ReasonCode::BundleTooLarge);
}

#[test]
fn policy_binding_is_checked_on_request() {
  let bound = Policy { require_policy_hash_match: true, ..Policy::strict() };
  let f = fixture(bound.clone());
  let bytes = f.demo_bundle();
  assert!(f.verify(&bytes, &bound).ok);

  let drifted = Policy { max_entries: 50, ..bound };
  assert_eq!(f.verify(&bytes, &drifted).reason, ReasonCode::PolicyMismatch);
}

#[test]
fn allowlist_binding_is_checked_on_request() {
  let bound = Policy { require_allowlist_hash_match: true, ..Policy::strict() };
  let f = fixture(bound.clone());
  let bytes = f.demo_bundle();
  assert!(f.verify(&bytes, &bound).ok);

  let mut widened = f.pipeline.allowlist().clone();
  widened.tools.insert("tesseract".into());
  let result = verify_bundle(&bytes, &bound, &widened);
  assert_eq!(result.reason, ReasonCode::PolicyMismatch, "{result:?}");
  assert!(verify_bundle(&bytes, &Policy::strict(), &widened).ok);
}

#[test]
fn garbage_is_tampered_content() {
  let f = fixture(Policy::strict());
  assert_eq!(f.verify(b"not a zip", &Policy::strict()).reason, ReasonCode::TamperedContent);
}

// ─── Tools and model calls ───────────────────────────────────────────────────

#[test]
fn tool_runs_and_model_calls_travel_with_the_bundle() {
  let f = fixture(Policy::strict());
  f.ingest_text("notes.txt", 0);
  f.pipeline
    .record_tool_run(&CompletedRun {
      tool_id:   "pdftotext".into(),
      argv:      vec!["pdftotext".into(), "scan.pdf".into()],
      cwd:       None,
      exit_code: 0,
      stdout:    b"extracted".to_vec(),
      stderr:    Vec::new(),
      duration:  Duration::from_millis(12),
    })
    .unwrap();
  f.pipeline
    .record_llm_call("local", "tiny-1", "summarise", "a summary", json!({"temperature": 0}))
    .unwrap();

  let (outcome, bytes) = f.seal("tools");
  assert_eq!(outcome.events, 3);
  assert!(f.verify(&bytes, &Policy::strict()).ok);

  let bom = Bom::parse(&entry(&bytes, SBOM_PATH)).unwrap();
  assert!(bom.components.iter().any(|c| c.name == "pdftotext" && c.kind == "application"));
  let manifest = Manifest::from_bytes(&entry(&bytes, MANIFEST_PATH)).unwrap();
  assert!(manifest.file(&format!("blobs/aux/{}", digest(b"a summary"))).is_some());
  assert_eq!(manifest.slice(LedgerKind::LlmCall).unwrap().events, 1);
}

#[test]
fn unlisted_tools_are_disallowed() {
  let f = fixture(Policy::strict());
  f.pipeline
    .record_tool_run(&CompletedRun {
      tool_id:   "curl".into(),
      argv:      vec!["curl".into()],
      cwd:       None,
      exit_code: 7,
      stdout:    Vec::new(),
      stderr:    b"no network".to_vec(),
      duration:  Duration::ZERO,
    })
    .unwrap();
  let (_, bytes) = f.seal("net");
  let result = f.verify(&bytes, &Policy::strict());
  assert_eq!(result.reason, ReasonCode::DisallowedTool);
  assert!(result.detail.unwrap().contains("curl"));

  assert!(matches!(f.pipeline.run_tool("curl", &[], None), Err(Error::ToolNotAllowed(_))));
}

// ─── Replay ──────────────────────────────────────────────────────────────────

#[test]
fn replay_reproduces_the_expected_root() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let result = replay_bundle(&bytes, &Policy::strict(), f.pipeline.allowlist());

  assert!(result.ok, "{result:?}");
  assert_eq!(result.events, 1);
  assert_eq!(result.kg_ops, DEMO_OPS as u64);
  let manifest = Manifest::from_bytes(&entry(&bytes, MANIFEST_PATH)).unwrap();
  assert_eq!(result.root_hash, Some(manifest.expected_root));
}

#[test]
fn replay_of_an_unverifiable_bundle_reports_the_verification_reason() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let stripped = rewrite(&bytes, |w| {
    w.remove(SBOM_PATH);
  });
  let result = replay_bundle(&stripped, &Policy::strict(), f.pipeline.allowlist());
  assert!(!result.ok);
  assert_eq!(result.reason, ReasonCode::MissingSbom);
  assert_eq!((result.events, result.kg_ops), (0, 0));
}

#[test]
fn a_delta_that_disagrees_with_provenance_does_not_replay() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let delta = entry(&bytes, KG_DELTA_PATH);
  let lines: Vec<&[u8]> = delta.split_inclusive(|b| *b == b'\n').collect();
  let shorter = lines[..lines.len() - 1].concat();

  let forged = resign(&f, &bytes, |manifest, writer| {
    let file = FileEntry::new(KG_DELTA_PATH, &shorter, FileRole::KgDelta);
    let ops = manifest.kg_delta.ops - 1;
    manifest.kg_delta = KgDeltaRef { path: KG_DELTA_PATH.into(), sha256: file.sha256, ops };
    if let Some(listed) = manifest.files.iter_mut().find(|e| e.path == KG_DELTA_PATH) {
      *listed = file;
    }
    writer.insert(KG_DELTA_PATH, shorter.clone()).unwrap();
  });

  assert!(f.verify(&forged, &Policy::strict()).ok);
  let result = replay_bundle(&forged, &Policy::strict(), f.pipeline.allowlist());
  assert!(!result.ok);
  assert_eq!(result.reason, ReasonCode::ReplayMismatch);
}

#[test]
fn a_wrong_expected_root_does_not_replay() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let forged = resign(&f, &bytes, |manifest, _| manifest.expected_root = digest(b"elsewhere"));

  let result = replay_bundle(&forged, &Policy::strict(), f.pipeline.allowlist());
  assert_eq!(result.reason, ReasonCode::ReplayMismatch);
  assert_eq!(result.events, 1);
  assert!(result.root_hash.is_some());
}

// ─── Accept ──────────────────────────────────────────────────────────────────

#[test]
fn auto_merge_is_idempotent() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();

  let first = f.pipeline.import_bytes(&bytes, None, "", "").unwrap();
  assert!(matches!(first, Decision::Merged { ops: DEMO_OPS, event_seq: 1, .. }), "{first:?}");
  let again = f.pipeline.import_bytes(&bytes, None, "", "").unwrap();
  assert_eq!(again, Decision::AlreadyMerged { bundle_sha256: digest(&bytes) });

  let store = f.pipeline.store();
  assert_eq!(store.kg_delta_ledger().len().unwrap(), 1);
  assert_eq!(store.node_count().unwrap(), 7);
  assert_eq!(store.edge_count().unwrap(), 6);

  let local = f.pipeline.replay_local_graph().unwrap();
  assert!(local.ok, "{local:?}");
  assert_eq!((local.deltas, local.kg_ops), (1, DEMO_OPS as u64));
}

#[test]
fn quarantined_bundles_merge_only_on_approval() {
  let f = fixture(Policy { mode: AcceptanceMode::Quarantine, ..Policy::strict() });
  let bytes = f.demo_bundle();

  let Decision::Staged { staged_id, status, .. } =
    f.pipeline.import_bytes(&bytes, None, "field-team", "from site 4").unwrap()
  else {
    panic!("expected a staged bundle");
  };
  assert_eq!(status, StageStatus::Quarantined);
  assert_eq!(f.pipeline.store().node_count().unwrap(), 0);
  assert_eq!(f.pipeline.list_staged(Some(StageStatus::Quarantined)).unwrap().len(), 1);
  assert!(matches!(
    f.pipeline.import_bytes(&bytes, None, "", "").unwrap(),
    Decision::AlreadyStaged { staged_id: id, .. } if id == staged_id
  ));

  assert!(matches!(f.pipeline.review_approve(staged_id, "  ", ""), Err(Error::ActorRequired)));
  let decision = f.pipeline.review_approve(staged_id, "alice", "looks right").unwrap();
  assert!(matches!(decision, Decision::Merged { ops: DEMO_OPS, .. }), "{decision:?}");

  let staged = f.pipeline.get_staged(staged_id).unwrap();
  assert_eq!(staged.status, StageStatus::Approved);
  assert_eq!(staged.decision.unwrap().actor, "alice");

  let event = f.pipeline.store().kg_delta_ledger().export_range(1, 1).unwrap().next().unwrap();
  let decision = event.unwrap().payload.decision;
  assert_eq!(decision.kind, "REVIEW_APPROVE");
  assert_eq!(decision.staged_id, Some(staged_id));

  assert!(matches!(
    f.pipeline.review_approve(staged_id, "bob", ""),
    Err(Error::IllegalTransition { status: StageStatus::Approved, .. })
  ));
}

#[test]
fn rejected_bundles_never_touch_the_graph() {
  let f = fixture(Policy { mode: AcceptanceMode::ReviewOnly, ..Policy::strict() });
  let bytes = f.demo_bundle();
  let Decision::Staged { staged_id, status: StageStatus::Pending, .. } =
    f.pipeline.import_bytes(&bytes, None, "", "").unwrap()
  else {
    panic!("expected a pending bundle");
  };

  assert!(matches!(f.pipeline.review_reject(staged_id, "", ""), Err(Error::ActorRequired)));
  let decision = f.pipeline.review_reject(staged_id, "carol", "wrong site").unwrap();
  assert_eq!(decision, Decision::Rejected { bundle_sha256: digest(&bytes), staged_id });
  assert_eq!(f.pipeline.store().node_count().unwrap(), 0);
  assert!(f.pipeline.store().kg_delta_ledger().is_empty().unwrap());
  assert!(matches!(
    f.pipeline.review_reject(staged_id, "carol", ""),
    Err(Error::IllegalTransition { .. })
  ));
}

#[test]
fn approval_re_verifies_the_staged_copy() {
  let f = fixture(Policy { mode: AcceptanceMode::Quarantine, ..Policy::strict() });
  let bytes = f.demo_bundle();
  let Decision::Staged { staged_id, .. } = f.pipeline.import_bytes(&bytes, None, "", "").unwrap()
  else {
    panic!("expected a staged bundle");
  };

  let staged = f.pipeline.get_staged(staged_id).unwrap();
  let mut delta = entry(&bytes, KG_DELTA_PATH);
  delta[0] ^= 0x20;
  fs::write(&staged.bundle_path, rewrite(&bytes, |w| w.insert(KG_DELTA_PATH, delta).unwrap()))
    .unwrap();

  let decision = f.pipeline.review_approve(staged_id, "alice", "").unwrap();
  assert!(
    matches!(decision, Decision::Refused { reason: ReasonCode::TamperedContent, .. }),
    "{decision:?}"
  );
  let staged = f.pipeline.get_staged(staged_id).unwrap();
  assert_eq!(staged.status, StageStatus::Quarantined);
  assert!(staged.last_error.is_some());
  assert_eq!(f.pipeline.store().node_count().unwrap(), 0);
}

#[test]
fn kill_switch_records_nothing() {
  let f = fixture(Policy { kill_switch: true, ..Policy::strict() });
  let bytes = f.demo_bundle();
  let decision = f.pipeline.import_bytes(&bytes, Some(AcceptanceMode::AutoMerge), "", "").unwrap();
  assert_eq!(decision, Decision::Killed { bundle_sha256: digest(&bytes) });
  assert!(f.pipeline.list_staged(None).unwrap().is_empty());
  assert!(!f.pipeline.store().is_merged(&digest(&bytes)).unwrap());
}

#[test]
fn unverifiable_imports_are_refused() {
  let f = fixture(Policy::strict());
  let bytes = f.demo_bundle();
  let unsigned = rewrite(&bytes, |w| {
    w.remove(ATTESTATION_PATH);
  });
  let decision = f.pipeline.import_bytes(&unsigned, None, "", "").unwrap();
  assert!(matches!(decision, Decision::Refused { reason: ReasonCode::MissingAttestation, .. }));
  assert!(f.pipeline.store().kg_delta_ledger().is_empty().unwrap());
}

#[test]
fn auto_merge_quarantines_deltas_outside_the_schema() {
  let mut policy = Policy::strict();
  policy.kg.node_types = BTreeSet::from(["Document".to_owned()]);
  let f = fixture(policy);
  let bytes = f.demo_bundle();

  let decision = f.pipeline.import_bytes(&bytes, None, "", "").unwrap();
  let Decision::Staged { staged_id, status: StageStatus::Quarantined, .. } = decision else {
    panic!("expected a quarantined bundle, got {decision:?}");
  };
  let staged = f.pipeline.store().staged_by_bundle(&digest(&bytes)).unwrap().unwrap();
  assert_eq!(staged.id, staged_id);
  assert!(staged.verification.ok);
  assert!(!staged.validation.is_ok());
  assert_eq!(f.pipeline.store().node_count().unwrap(), 0);
  assert!(f.pipeline.store().kg_delta_ledger().is_empty().unwrap());
  assert!(!f.pipeline.store().is_merged(&digest(&bytes)).unwrap());
}
