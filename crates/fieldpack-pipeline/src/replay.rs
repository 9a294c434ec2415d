//! Deterministic replay.
//!
//! A bundle replays when its provenance slices chain from their anchors, its
//! KG delta is exactly what its `INGEST` events imply, and applying that
//! delta to an empty graph reproduces the sealed state root. Nothing is
//! re-executed: tool output and model responses are read from the bundle.

use std::collections::BTreeMap;

use fieldpack_core::{
  CanonicalizationError, Hash256, LedgerKind,
  canonical::digest_canonical,
  derive::ingest_ops,
  kg::{KgSnapshot, KgState},
  ledger::{Anchor, ChainVerifier},
  policy::{Allowlist, Policy},
  records::IngestRecord,
  result::{ReasonCode, ReplayResult},
};
use serde::Serialize;

use crate::{
  Pipeline, Result,
  verify::{VerifiedBundle, inspect},
};

#[derive(Serialize)]
struct RootPreimage<'a> {
  ledgers: BTreeMap<&'static str, Option<Hash256>>,
  kg:      &'a KgSnapshot,
}

/// The root committed to in a manifest: ledger tails plus graph state.
pub fn state_root(
  tails: &BTreeMap<LedgerKind, Option<Hash256>>,
  snapshot: &KgSnapshot,
) -> Result<Hash256, CanonicalizationError> {
  let ledgers = tails.iter().map(|(kind, tail)| (kind.as_str(), *tail)).collect();
  digest_canonical(&RootPreimage { ledgers, kg: snapshot })
}

struct Replayed {
  events: u64,
  kg_ops: u64,
  root:   Hash256,
}

fn replay_verified(bundle: &VerifiedBundle) -> Result<Replayed, String> {
  let manifest = &bundle.manifest;
  let mut tails = BTreeMap::new();
  let mut events = 0u64;

  for slice in &manifest.provenance {
    let slice_events = bundle.slices.get(&slice.ledger).map_or(&[][..], Vec::as_slice);
    let mut verifier = ChainVerifier::new(Anchor::from_prev(slice.anchor));
    for event in slice_events {
      verifier.push(event).map_err(|b| format!("{} slice: {b}", slice.ledger))?;
    }

    if let (Some(first), Some(last)) = (slice_events.first(), slice_events.last())
      && (first.seq != slice.from_seq || last.seq != slice.to_seq)
    {
      return Err(format!(
        "{} slice covers seq {}..={}, manifest lists {}..={}",
        slice.ledger, first.seq, last.seq, slice.from_seq, slice.to_seq
      ));
    }
    let tail = verifier.tail();
    if tail != slice.tail {
      return Err(format!("{} slice does not end at the sealed tail", slice.ledger));
    }
    tails.insert(slice.ledger, tail);
    events += slice_events.len() as u64;
  }

  let ingest = bundle
    .slices
    .get(&LedgerKind::Ingest)
    .into_iter()
    .flatten()
    .map(|e| e.clone().decode::<IngestRecord>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| format!("ingest slice: {e}"))?;
  let derived = ingest_ops(&ingest);
  if derived != bundle.ops {
    let at = derived.iter().zip(&bundle.ops).position(|(a, b)| a != b);
    return Err(match at {
      Some(index) => format!("kg_delta op {index} differs from the ingest provenance"),
      None => format!(
        "kg_delta holds {} ops, the ingest provenance implies {}",
        bundle.ops.len(),
        derived.len()
      ),
    });
  }

  let mut state = KgState::new();
  state.apply_all(&bundle.ops).map_err(|e| e.to_string())?;
  let root = state_root(&tails, &state.snapshot()).map_err(|e| e.to_string())?;
  Ok(Replayed { events, kg_ops: bundle.ops.len() as u64, root })
}

/// Verify, then replay `bytes`.
pub fn replay_bundle(bytes: &[u8], policy: &Policy, allowlist: &Allowlist) -> ReplayResult {
  let (verification, bundle) = inspect(bytes, policy, allowlist);
  let Some(bundle) = bundle else {
    return ReplayResult {
      ok: false,
      reason: verification.reason,
      detail: verification.detail.clone(),
      events: 0,
      kg_ops: 0,
      root_hash: None,
      verification,
    };
  };

  let mismatch = |detail: String, events: u64, kg_ops: u64, root_hash: Option<Hash256>| {
    tracing::warn!(bundle = %bundle.bundle_sha256.short(), %detail, "replay mismatch");
    ReplayResult {
      ok: false,
      reason: ReasonCode::ReplayMismatch,
      detail: Some(detail),
      events,
      kg_ops,
      root_hash,
      verification: verification.clone(),
    }
  };

  match replay_verified(&bundle) {
    Err(detail) => mismatch(detail, 0, 0, None),
    Ok(r) if r.root != bundle.manifest.expected_root => mismatch(
      format!(
        "replayed root {} differs from expected root {}",
        r.root.short(),
        bundle.manifest.expected_root.short()
      ),
      r.events,
      r.kg_ops,
      Some(r.root),
    ),
    Ok(r) => {
      tracing::info!(
        bundle = %bundle.bundle_sha256.short(),
        root = %r.root.short(),
        events = r.events,
        kg_ops = r.kg_ops,
        "bundle replayed"
      );
      ReplayResult {
        ok: true,
        reason: ReasonCode::Ok,
        detail: None,
        events: r.events,
        kg_ops: r.kg_ops,
        root_hash: Some(r.root),
        verification,
      }
    }
  }
}

// ─── Local graph ─────────────────────────────────────────────────────────────

/// Result of rebuilding the live graph from the `KG_DELTA_APPLIED` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalReplay {
  pub ok:            bool,
  /// Events per ledger, when every chain verified.
  pub ledgers:       BTreeMap<LedgerKind, u64>,
  pub chain_error:   Option<String>,
  pub deltas:        u64,
  pub kg_ops:        u64,
  pub replayed_hash: Hash256,
  pub stored_hash:   Hash256,
}

impl Pipeline {
  pub fn replay_path(&self, path: &std::path::Path) -> Result<ReplayResult> {
    Ok(replay_bundle(&std::fs::read(path)?, &self.policy, &self.allowlist))
  }

  /// Rebuild the graph in memory from merged deltas and compare it with the
  /// stored graph.
  pub fn replay_local_graph(&self) -> Result<LocalReplay> {
    let (ledgers, chain_error) = match self.store.verify_ledgers() {
      Ok(counts) => (counts, None),
      Err(e @ fieldpack_store_sqlite::Error::ChainBreak { .. }) => {
        (BTreeMap::new(), Some(e.to_string()))
      }
      Err(e) => return Err(e.into()),
    };

    let mut state = KgState::new();
    let (mut deltas, mut kg_ops) = (0u64, 0u64);
    for event in self.store.kg_delta_ledger().export_range(1, i64::MAX)? {
      let event = event?;
      state.apply_all(&event.payload.ops_payload)?;
      deltas += 1;
      kg_ops += event.payload.ops_payload.len() as u64;
    }

    let replayed_hash = state.snapshot().hash()?;
    let stored_hash = self.store.graph_snapshot()?.hash()?;
    let ok = chain_error.is_none() && replayed_hash == stored_hash;
    if ok {
      tracing::info!(deltas, kg_ops, hash = %replayed_hash.short(), "local graph replayed");
    } else {
      tracing::warn!(
        deltas,
        replayed = %replayed_hash.short(),
        stored = %stored_hash.short(),
        chain_error = chain_error.as_deref().unwrap_or("none"),
        "local graph diverges"
      );
    }
    Ok(LocalReplay { ok, ledgers, chain_error, deltas, kg_ops, replayed_hash, stored_hash })
  }
}
