//! Sealing: export the unsealed ledger slices, their blobs and the implied
//! KG delta into a signed, deterministic bundle.
//!
//! ```text
//! bundle.zip
//! ├── manifest.json              signed table of contents
//! ├── attestation.dsse.json      DSSE over manifest.json
//! ├── sbom/bom.cdx.json          CycloneDX inventory
//! ├── sbom/bom.dsse.json         DSSE over the inventory
//! ├── provenance/*.jsonl         one canonical event per line
//! ├── kg_delta.jsonl             one canonical op per line
//! └── blobs/<kind>/<sha256>
//! ```

use std::{
  collections::{BTreeMap, BTreeSet},
  path::PathBuf,
};

use ed25519_dalek::SigningKey;
use fieldpack_archive::{
  ArchiveWriter, Manifest,
  container::{
    ATTESTATION_PATH, KG_DELTA_PATH, MANIFEST_PATH, SBOM_ATTESTATION_PATH, SBOM_PATH, blob_path,
  },
  dsse::{BUNDLE_PREDICATE_TYPE, Envelope, SBOM_PREDICATE_TYPE, Statement, Subject},
  manifest::{
    FileEntry, FileRole, KgDeltaRef, MANIFEST_VERSION, ProvenanceSlice, SbomRef, bundle_map_hash,
  },
  sbom::{self, Bom, Component, Property, Tool},
};
use fieldpack_core::{
  Hash256, LedgerEvent, LedgerKind, SliceRange,
  canonical::{canonical_line, digest},
  derive::ingest_ops,
  document::BlobKind,
  kg::{KgOp, KgState},
  records::{IngestRecord, LlmCallRecord, ToolRunRecord},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
  Error, Pipeline, Result, atomic::write_atomic, keys::load_key, replay::state_root,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crates whose code produced a bundle.
const COMPONENTS: [&str; 4] =
  ["fieldpack-archive", "fieldpack-core", "fieldpack-pipeline", "fieldpack-store-sqlite"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealOutcome {
  pub path:            PathBuf,
  pub bundle_sha256:   Hash256,
  pub manifest_sha256: Hash256,
  pub ranges:          BTreeMap<LedgerKind, SliceRange>,
  pub events:          u64,
  pub kg_ops:          usize,
  /// Nothing new since the last seal; the previous ranges were sealed again.
  pub resealed:        bool,
}

/// Labels become file names: ASCII letters, digits, `.`, `_` and `-`, not
/// starting with a dot.
pub fn is_valid_label(label: &str) -> bool {
  !label.is_empty()
    && !label.starts_with('.')
    && label.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Everything gathered from the ledgers before encoding.
#[derive(Default)]
struct Slices {
  files:   Vec<FileEntry>,
  entries: Vec<(String, Vec<u8>)>,
  slices:  Vec<ProvenanceSlice>,
  tails:   BTreeMap<LedgerKind, Option<Hash256>>,
  newest:  Option<String>,
  ingest:  Vec<LedgerEvent<IngestRecord>>,
  tools:   BTreeSet<String>,
  blobs:   BTreeSet<(BlobKind, Hash256)>,
  events:  u64,
}

impl Pipeline {
  /// Seal everything appended since the last checkpoint into a bundle.
  pub fn seal(&self, label: &str) -> Result<SealOutcome> {
    if !is_valid_label(label) {
      return Err(Error::InvalidLabel(label.to_owned()));
    }
    let key = load_key(&self.config.signing_key_path)?;

    let previous = self.store.last_checkpoint()?;
    let mut ranges = BTreeMap::new();
    for kind in LedgerKind::SEALED {
      let from = previous
        .as_ref()
        .and_then(|c| c.ranges.get(&kind))
        .map_or(1, |r| r.to_seq + 1);
      ranges.insert(kind, SliceRange { from_seq: from, to_seq: self.store.ledger_tail_seq(kind)? });
    }
    let resealed = match &previous {
      Some(checkpoint) if ranges.values().all(SliceRange::is_empty) => {
        ranges = checkpoint.ranges.clone();
        true
      }
      _ => false,
    };

    let gathered = self.gather(&ranges)?;
    let ops = ingest_ops(&gathered.ingest);
    let outcome = SealOutcome { resealed, ..self.encode(label, &key, ranges, gathered, ops)? };

    if !resealed {
      self.store.record_checkpoint(
        label,
        &outcome.bundle_sha256,
        &outcome.path.to_string_lossy(),
        &outcome.ranges,
      )?;
    }
    tracing::info!(
      label,
      bundle = %outcome.bundle_sha256.short(),
      events = outcome.events,
      kg_ops = outcome.kg_ops,
      resealed,
      "sealed bundle"
    );
    Ok(outcome)
  }

  fn gather(&self, ranges: &BTreeMap<LedgerKind, SliceRange>) -> Result<Slices> {
    let mut out = Slices::default();
    for (&kind, range) in ranges {
      let anchor = if range.from_seq > 1 {
        self.store.ledger_hash_at(kind, range.from_seq - 1)?
      } else {
        None
      };
      let events = self
        .store
        .export_ledger(kind, range.from_seq, range.to_seq)?
        .collect::<Result<Vec<_>, _>>()?;

      let mut bytes = Vec::new();
      for event in &events {
        bytes.extend(canonical_line(event)?);
        if out.newest.as_deref().is_none_or(|ts| event.ts_utc.as_str() > ts) {
          out.newest = Some(event.ts_utc.clone());
        }
        self.note_references(kind, event, &mut out)?;
      }

      let tail = events.last().map(|e| e.event_hash).or(anchor);
      let path = kind.export_path();
      out.files.push(FileEntry::new(path, &bytes, FileRole::Provenance));
      out.entries.push((path.to_owned(), bytes));
      out.slices.push(ProvenanceSlice {
        ledger: kind,
        path: path.to_owned(),
        from_seq: range.from_seq,
        to_seq: range.to_seq,
        anchor,
        tail,
        events: events.len() as u64,
      });
      out.tails.insert(kind, tail);
      out.events += events.len() as u64;
    }
    Ok(out)
  }

  /// Collect the blobs and tools an exported event refers to.
  fn note_references(
    &self,
    kind: LedgerKind,
    event: &LedgerEvent<Value>,
    out: &mut Slices,
  ) -> Result<()> {
    let seal = &self.config.seal;
    match kind {
      LedgerKind::Ingest => {
        let event = event.clone().decode::<IngestRecord>()?;
        if seal.include_raw {
          out.blobs.insert((BlobKind::Raw, event.payload.raw_sha256));
        }
        if seal.include_extract
          && let Some(sha) = event.payload.extract_sha256
        {
          out.blobs.insert((BlobKind::Extract, sha));
        }
        out.ingest.push(event);
      }
      LedgerKind::ToolRun => {
        let run = event.clone().decode::<ToolRunRecord>()?.payload;
        if seal.include_aux {
          out.blobs.insert((BlobKind::Aux, run.stdout_sha256));
          out.blobs.insert((BlobKind::Aux, run.stderr_sha256));
        }
        out.tools.insert(run.tool_id);
      }
      LedgerKind::LlmCall => {
        let call = event.clone().decode::<LlmCallRecord>()?.payload;
        if seal.include_aux {
          out.blobs.insert((BlobKind::Aux, call.prompt_sha256));
          out.blobs.insert((BlobKind::Aux, call.response_sha256));
        }
      }
      LedgerKind::KgDelta => {}
    }
    Ok(())
  }

  fn inventory(&self, tools: &BTreeSet<String>) -> Bom {
    let components = COMPONENTS
      .iter()
      .map(|name| Component::library(name, VERSION))
      .chain(tools.iter().map(|tool| Component::application(tool)))
      .collect();
    Bom::new(
      Tool {
        vendor:  "fieldpack".into(),
        name:    "fieldpack-pipeline".into(),
        version: VERSION.into(),
      },
      vec![Property {
        name:  "fieldpack:toolchain_id".into(),
        value: self.config.toolchain_id.clone(),
      }],
      components,
    )
  }

  fn encode(
    &self,
    label: &str,
    key: &SigningKey,
    ranges: BTreeMap<LedgerKind, SliceRange>,
    gathered: Slices,
    ops: Vec<KgOp>,
  ) -> Result<SealOutcome> {
    let Slices { mut files, entries, slices, tails, newest, tools, blobs, events, .. } = gathered;
    let mut archive = ArchiveWriter::new();
    for (path, bytes) in entries {
      archive.insert(path, bytes)?;
    }

    let mut kg_bytes = Vec::new();
    for op in &ops {
      kg_bytes.extend(canonical_line(op)?);
    }
    let kg_delta =
      KgDeltaRef { path: KG_DELTA_PATH.into(), sha256: digest(&kg_bytes), ops: ops.len() };
    files.push(FileEntry::new(KG_DELTA_PATH, &kg_bytes, FileRole::KgDelta));
    archive.insert(KG_DELTA_PATH, kg_bytes)?;

    for (kind, sha256) in &blobs {
      let bytes = self.cas.get(sha256, *kind)?;
      let path = blob_path(kind.as_str(), &sha256.to_hex());
      files.push(FileEntry::new(path.clone(), &bytes, FileRole::Blob));
      archive.insert(path, bytes)?;
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut state = KgState::new();
    state.apply_all(&ops)?;
    let expected_root = state_root(&tails, &state.snapshot())?;

    let bom = self.inventory(&tools);
    let bom_bytes = bom.to_bytes()?;
    let bom_sha256 = digest(&bom_bytes);
    let bom_statement = Statement::new(
      vec![Subject::sha256(SBOM_PATH, &bom_sha256)],
      SBOM_PREDICATE_TYPE,
      json!({ "specVersion": sbom::SPEC_VERSION, "components": bom.components.len() }),
    );
    let bom_envelope = Envelope::sign_statement(&bom_statement, key)?;

    let manifest = Manifest {
      manifest_version: MANIFEST_VERSION,
      label: label.to_owned(),
      toolchain_id: self.config.toolchain_id.clone(),
      created_utc: newest,
      bundle_map_hash: bundle_map_hash(&files)?,
      files,
      sbom: Some(SbomRef {
        path:         SBOM_PATH.into(),
        sha256:       bom_sha256,
        spec_version: sbom::SPEC_VERSION.into(),
      }),
      provenance: slices,
      kg_delta,
      expected_root,
      policy_hash: Some(self.policy.hash()?),
      allowlist_hash: Some(self.allowlist.hash()?),
    };
    let manifest_bytes = manifest.to_bytes()?;
    let manifest_sha256 = digest(&manifest_bytes);

    let statement = Statement::new(
      vec![Subject::sha256(MANIFEST_PATH, &manifest_sha256)],
      BUNDLE_PREDICATE_TYPE,
      json!({
        "label": label,
        "toolchain_id": manifest.toolchain_id,
        "expected_root": expected_root,
        "bundle_map_hash": manifest.bundle_map_hash,
        "policy_hash": manifest.policy_hash,
        "allowlist_hash": manifest.allowlist_hash,
      }),
    );
    let attestation = Envelope::sign_statement(&statement, key)?;

    archive.insert(MANIFEST_PATH, manifest_bytes)?;
    archive.insert(ATTESTATION_PATH, attestation.to_bytes()?)?;
    archive.insert(SBOM_PATH, bom_bytes)?;
    archive.insert(SBOM_ATTESTATION_PATH, bom_envelope.to_bytes()?)?;
    let bytes = archive.finish()?;

    let bundle_sha256 = digest(&bytes);
    let path = self.config.bundles_dir.join(format!("{label}-{}.zip", bundle_sha256.short()));
    write_atomic(&path, &bytes)?;

    Ok(SealOutcome {
      path,
      bundle_sha256,
      manifest_sha256,
      ranges,
      events,
      kg_ops: ops.len(),
      resealed: false,
    })
  }
}
