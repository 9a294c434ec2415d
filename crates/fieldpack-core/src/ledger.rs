//! Hash-chained ledger events and chain verification.
//!
//! An event's hash covers its event type, UTC timestamp and canonical payload,
//! followed by the hex hash of its predecessor (or the literal `GENESIS` for
//! the first event in a ledger):
//!
//! ```text
//! event_hash = sha256( canonical({event_type, payload, ts_utc}) ++ prev_marker )
//! ```
//!
//! [`ChainVerifier`] recomputes that relation event by event and reports the
//! first index at which it fails. It is shared by the SQLite backend, the
//! bundle verifier and the replayer.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{CanonicalizationError, Hash256, canonicalize, digest};

/// Marker hashed in place of a predecessor for the first event of a ledger.
pub const GENESIS_MARKER: &[u8] = b"GENESIS";

/// Current UTC time in the fixed format stored on every event.
pub fn now_utc() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true) }

// ─── Ledger identity ─────────────────────────────────────────────────────────

/// The four hash-chained ledgers.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
  Ingest,
  ToolRun,
  LlmCall,
  KgDelta,
}

impl LedgerKind {
  pub const ALL: [LedgerKind; 4] = [
    LedgerKind::Ingest,
    LedgerKind::ToolRun,
    LedgerKind::LlmCall,
    LedgerKind::KgDelta,
  ];

  /// Ledgers whose slices are exported into sealed bundles.
  pub const SEALED: [LedgerKind; 3] =
    [LedgerKind::Ingest, LedgerKind::ToolRun, LedgerKind::LlmCall];

  pub fn as_str(self) -> &'static str {
    match self {
      LedgerKind::Ingest => "ingest",
      LedgerKind::ToolRun => "tool_run",
      LedgerKind::LlmCall => "llm_call",
      LedgerKind::KgDelta => "kg_delta",
    }
  }

  /// Backing table name.
  pub fn table(self) -> &'static str {
    match self {
      LedgerKind::Ingest => "ingest_events",
      LedgerKind::ToolRun => "tool_run_events",
      LedgerKind::LlmCall => "llm_call_events",
      LedgerKind::KgDelta => "kg_delta_events",
    }
  }

  /// Archive path of this ledger's exported slice.
  pub fn export_path(self) -> &'static str {
    match self {
      LedgerKind::Ingest => "provenance/ingest.jsonl",
      LedgerKind::ToolRun => "provenance/tool_runs.jsonl",
      LedgerKind::LlmCall => "provenance/llm_calls.jsonl",
      LedgerKind::KgDelta => "provenance/kg_deltas.jsonl",
    }
  }
}

impl fmt::Display for LedgerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// An inclusive range of sequence ids. Empty when `to_seq < from_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRange {
  pub from_seq: i64,
  pub to_seq:   i64,
}

impl SliceRange {
  pub fn is_empty(&self) -> bool { self.to_seq < self.from_seq }

  pub fn len(&self) -> u64 {
    if self.is_empty() { 0 } else { self.to_seq.abs_diff(self.from_seq).saturating_add(1) }
  }
}

/// A payload schema bound to exactly one ledger and event type.
pub trait LedgerPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
  const LEDGER: LedgerKind;
  const EVENT_TYPE: &'static str;
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// One appended record. `P` defaults to an untyped JSON payload, which is the
/// form used for verification and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent<P = Value> {
  pub seq:        i64,
  pub ts_utc:     String,
  pub event_type: String,
  pub payload:    P,
  pub prev_hash:  Option<Hash256>,
  pub event_hash: Hash256,
}

#[derive(Serialize)]
struct HashedFields<'a, P: Serialize> {
  event_type: &'a str,
  payload:    &'a P,
  ts_utc:     &'a str,
}

/// Compute an event hash from its parts.
pub fn event_hash<P: Serialize>(
  event_type: &str,
  payload: &P,
  ts_utc: &str,
  prev_hash: Option<&Hash256>,
) -> Result<Hash256, CanonicalizationError> {
  let mut preimage = canonicalize(&HashedFields { event_type, payload, ts_utc })?;
  match prev_hash {
    Some(prev) => preimage.extend_from_slice(prev.to_hex().as_bytes()),
    None => preimage.extend_from_slice(GENESIS_MARKER),
  }
  Ok(digest(&preimage))
}

impl<P: Serialize> LedgerEvent<P> {
  /// Build the event that follows `prev_hash`, computing its hash.
  pub fn chained(
    seq: i64,
    ts_utc: String,
    event_type: impl Into<String>,
    payload: P,
    prev_hash: Option<Hash256>,
  ) -> Result<Self, CanonicalizationError> {
    let event_type = event_type.into();
    let event_hash = event_hash(&event_type, &payload, &ts_utc, prev_hash.as_ref())?;
    Ok(Self { seq, ts_utc, event_type, payload, prev_hash, event_hash })
  }

  pub fn recompute_hash(&self) -> Result<Hash256, CanonicalizationError> {
    event_hash(&self.event_type, &self.payload, &self.ts_utc, self.prev_hash.as_ref())
  }

  /// Convert to the untyped form.
  pub fn to_raw(&self) -> Result<LedgerEvent<Value>, serde_json::Error> {
    Ok(LedgerEvent {
      seq:        self.seq,
      ts_utc:     self.ts_utc.clone(),
      event_type: self.event_type.clone(),
      payload:    serde_json::to_value(&self.payload)?,
      prev_hash:  self.prev_hash,
      event_hash: self.event_hash,
    })
  }
}

impl LedgerEvent<Value> {
  /// Decode the payload into a typed schema.
  pub fn decode<P: DeserializeOwned>(self) -> Result<LedgerEvent<P>, serde_json::Error> {
    Ok(LedgerEvent {
      seq:        self.seq,
      ts_utc:     self.ts_utc,
      event_type: self.event_type,
      payload:    serde_json::from_value(self.payload)?,
      prev_hash:  self.prev_hash,
      event_hash: self.event_hash,
    })
  }
}

// ─── Verification ────────────────────────────────────────────────────────────

/// The first point at which a chain fails to verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain break at index {index} (seq {seq}): {kind}")]
pub struct ChainBreak {
  /// Position within the verified sequence, starting at 0.
  pub index: usize,
  pub seq:   i64,
  pub kind:  BreakKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakKind {
  #[error("prev_hash {found} does not follow {expected}")]
  PrevHashMismatch { expected: String, found: String },

  #[error("stored event_hash {stored} but recomputed {computed}")]
  HashMismatch { stored: Hash256, computed: Hash256 },

  #[error("expected seq {expected}, found {found}")]
  SequenceGap { expected: i64, found: i64 },

  #[error("event cannot be re-encoded: {0}")]
  Malformed(String),
}

/// Where a chain (or a slice of one) is expected to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
  /// The first event must have no predecessor.
  Genesis,
  /// The first event must follow this hash.
  After(Hash256),
  /// Trust whatever `prev_hash` the first event carries.
  FirstEvent,
}

impl Anchor {
  pub fn from_prev(prev_hash: Option<Hash256>) -> Self {
    match prev_hash {
      Some(hash) => Anchor::After(hash),
      None => Anchor::Genesis,
    }
  }
}

fn marker(hash: Option<&Hash256>) -> String {
  hash.map_or_else(|| "GENESIS".to_owned(), Hash256::to_hex)
}

/// Incremental chain verification, for ledgers too large to hold in memory.
#[derive(Debug, Clone)]
pub struct ChainVerifier {
  anchor:   Anchor,
  expected: Anchor,
  next_seq: Option<i64>,
  index:    usize,
  last:     Option<Hash256>,
}

impl ChainVerifier {
  pub fn new(anchor: Anchor) -> Self {
    Self { anchor, expected: anchor, next_seq: None, index: 0, last: None }
  }

  pub fn push<P: Serialize>(&mut self, event: &LedgerEvent<P>) -> Result<(), ChainBreak> {
    let fail = |kind| ChainBreak { index: self.index, seq: event.seq, kind };

    if let Some(expected) = self.next_seq
      && event.seq != expected
    {
      return Err(fail(BreakKind::SequenceGap { expected, found: event.seq }));
    }
    let next_seq = event
      .seq
      .checked_add(1)
      .ok_or_else(|| fail(BreakKind::Malformed(format!("seq {} has no successor", event.seq))))?;

    let computed = event
      .recompute_hash()
      .map_err(|e| fail(BreakKind::Malformed(e.to_string())))?;
    if computed != event.event_hash {
      return Err(fail(BreakKind::HashMismatch { stored: event.event_hash, computed }));
    }

    let linked = match self.expected {
      Anchor::Genesis => event.prev_hash.is_none(),
      Anchor::After(prev) => event.prev_hash == Some(prev),
      Anchor::FirstEvent => true,
    };
    if !linked {
      let expected = match self.expected {
        Anchor::After(prev) => marker(Some(&prev)),
        _ => marker(None),
      };
      return Err(fail(BreakKind::PrevHashMismatch {
        expected,
        found: marker(event.prev_hash.as_ref()),
      }));
    }

    self.expected = Anchor::After(event.event_hash);
    self.next_seq = Some(next_seq);
    self.last = Some(event.event_hash);
    self.index += 1;
    Ok(())
  }

  /// Number of events verified so far.
  pub fn count(&self) -> usize { self.index }

  /// Hash of the last verified event, or the anchor when nothing was pushed.
  pub fn tail(&self) -> Option<Hash256> {
    self.last.or(match self.anchor {
      Anchor::After(prev) => Some(prev),
      _ => None,
    })
  }
}

/// Verify a sequence of events, trusting the first event's `prev_hash`.
pub fn verify_chain<P: Serialize>(events: &[LedgerEvent<P>]) -> Result<(), ChainBreak> {
  verify_chain_from(Anchor::FirstEvent, events)
}

/// Verify a sequence of events that must start at `anchor`.
pub fn verify_chain_from<P: Serialize>(
  anchor: Anchor,
  events: &[LedgerEvent<P>],
) -> Result<(), ChainBreak> {
  let mut verifier = ChainVerifier::new(anchor);
  events.iter().try_for_each(|event| verifier.push(event))
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;
  use serde_json::json;

  use super::*;

  fn chain(n: usize) -> Vec<LedgerEvent> {
    let mut out: Vec<LedgerEvent> = Vec::new();
    for i in 0..n {
      let prev = out.last().map(|e| e.event_hash);
      let event = LedgerEvent::chained(
        i as i64 + 1,
        format!("2026-01-01T00:00:{i:02}.000000Z"),
        "INGEST",
        json!({"n": i, "path": format!("f{i}.txt")}),
        prev,
      )
      .unwrap();
      out.push(event);
    }
    out
  }

  #[test]
  fn intact_chain_verifies() {
    let events = chain(5);
    assert!(verify_chain(&events).is_ok());
    assert!(verify_chain_from(Anchor::Genesis, &events).is_ok());
    assert!(verify_chain::<Value>(&[]).is_ok());
  }

  #[test]
  fn payload_change_breaks_at_that_index() {
    let mut events = chain(5);
    events[2].payload = json!({"n": 2, "path": "evil.txt"});
    let err = verify_chain(&events).unwrap_err();
    assert_eq!(err.index, 2);
    assert_eq!(err.seq, 3);
    assert!(matches!(err.kind, BreakKind::HashMismatch { .. }));
  }

  #[test]
  fn event_type_and_timestamp_are_covered() {
    let mut events = chain(3);
    events[1].event_type = "TOOL_RUN".into();
    assert_eq!(verify_chain(&events).unwrap_err().index, 1);

    let mut events = chain(3);
    events[0].ts_utc = "2030-01-01T00:00:00.000000Z".into();
    assert_eq!(verify_chain(&events).unwrap_err().index, 0);
  }

  #[test]
  fn relinked_event_is_detected() {
    let mut events = chain(4);
    // Recompute event 2 against a forged predecessor so its own hash is valid.
    let forged = LedgerEvent::chained(
      3,
      events[2].ts_utc.clone(),
      "INGEST",
      events[2].payload.clone(),
      Some(digest(b"elsewhere")),
    )
    .unwrap();
    events[2] = forged;
    let err = verify_chain(&events).unwrap_err();
    assert_eq!(err.index, 2);
    assert!(matches!(err.kind, BreakKind::PrevHashMismatch { .. }));
  }

  #[test]
  fn dropped_event_is_detected() {
    let mut events = chain(4);
    events.remove(1);
    let err = verify_chain(&events).unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(err.kind, BreakKind::SequenceGap { expected: 2, found: 3 }));
  }

  #[test]
  fn slice_anchor_is_enforced() {
    let events = chain(5);
    let slice = &events[2..];
    assert!(verify_chain_from(Anchor::After(events[1].event_hash), slice).is_ok());
    assert!(verify_chain_from(Anchor::Genesis, slice).is_err());

    let mut verifier = ChainVerifier::new(Anchor::After(events[1].event_hash));
    assert_eq!(verifier.tail(), Some(events[1].event_hash));
    for event in slice {
      verifier.push(event).unwrap();
    }
    assert_eq!(verifier.count(), 3);
    assert_eq!(verifier.tail(), Some(events[4].event_hash));
  }

  #[test]
  fn extreme_sequence_ids_are_malformed() {
    let event = LedgerEvent::chained(i64::MAX, "t".into(), "INGEST", json!({}), None).unwrap();
    let err = verify_chain(&[event]).unwrap_err();
    assert_eq!((err.index, err.seq), (0, i64::MAX));
    assert!(matches!(err.kind, BreakKind::Malformed(_)));
  }

  #[test]
  fn slice_range_length_saturates() {
    assert_eq!(SliceRange { from_seq: 3, to_seq: 5 }.len(), 3);
    assert_eq!(SliceRange { from_seq: 5, to_seq: 4 }.len(), 0);
    assert_eq!(SliceRange { from_seq: i64::MIN, to_seq: i64::MAX }.len(), u64::MAX);
  }

  proptest! {
    #[test]
    fn any_payload_edit_fails_at_its_index(
      len in 1usize..12,
      pick in any::<prop::sample::Index>(),
      replacement in "[a-z0-9]{1,16}",
    ) {
      let mut events = chain(len);
      let index = pick.index(len);
      let original = events[index].payload.clone();
      events[index].payload = json!({"n": index, "path": replacement});
      prop_assume!(events[index].payload != original);

      let err = verify_chain(&events).unwrap_err();
      prop_assert_eq!(err.index, index);
    }
  }
}
