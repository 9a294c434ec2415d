//! [`EventLedger`]: one generic implementation behind all four ledgers.
//!
//! Appends are serialised twice over: by the ledger's own mutex within this
//! process, and by `BEGIN IMMEDIATE` against other connections. The tail is
//! read inside the write transaction, so `prev_hash` can never come from a
//! stale tail.

use std::{
  collections::VecDeque,
  marker::PhantomData,
  path::{Path, PathBuf},
};

use fieldpack_core::{
  Hash256, LedgerEvent, LedgerKind, LedgerPayload,
  ledger::{Anchor, BreakKind, ChainBreak, ChainVerifier, now_utc},
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
  Error, Result,
  catalog::connect,
  encode::{EVENT_COLUMNS, RawEvent, decode_hash, encode_json},
};

/// Rows fetched per page by [`EventRange`].
const PAGE_SIZE: usize = 256;

// ─── Ledger ──────────────────────────────────────────────────────────────────

/// A hash-chained, append-only log of `P` payloads.
pub struct EventLedger<P> {
  path:     PathBuf,
  writer:   Mutex<Connection>,
  _payload: PhantomData<fn() -> P>,
}

/// Write access handed to [`EventLedger::append_with`]. Everything done
/// through it commits or rolls back together with the appended event.
pub struct LedgerTx<'a> {
  pub(crate) conn: &'a Connection,
}

fn read_tail(conn: &Connection, kind: LedgerKind) -> Result<Option<(i64, Hash256)>> {
  let row: Option<(i64, String)> = conn
    .query_row(
      &format!("SELECT seq, event_hash FROM {} ORDER BY seq DESC LIMIT 1", kind.table()),
      [],
      |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()?;
  row.map(|(seq, hash)| Ok((seq, decode_hash(&hash)?))).transpose()
}

impl<P: LedgerPayload> EventLedger<P> {
  pub(crate) fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      path:     path.to_path_buf(),
      writer:   Mutex::new(connect(path)?),
      _payload: PhantomData,
    })
  }

  pub fn kind(&self) -> LedgerKind { P::LEDGER }

  /// Append one event.
  pub fn append(&self, payload: P) -> Result<LedgerEvent<P>> {
    self.append_with(|_| Ok::<_, Error>(payload))
  }

  /// Append one event whose payload is built inside the write transaction.
  ///
  /// If `build` fails, nothing it wrote is kept and no event is appended.
  /// Its error is returned as-is.
  pub fn append_with<F, E>(&self, build: F) -> Result<LedgerEvent<P>, E>
  where
    F: FnOnce(&LedgerTx<'_>) -> Result<P, E>,
    E: From<Error>,
  {
    let mut conn = self.writer.lock();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(Error::from)?;

    let tail = read_tail(&tx, P::LEDGER)?;
    let payload = build(&LedgerTx { conn: &tx })?;
    Ok(Self::commit(tx, tail, payload)?)
  }

  fn commit(
    tx: rusqlite::Transaction<'_>,
    tail: Option<(i64, Hash256)>,
    payload: P,
  ) -> Result<LedgerEvent<P>> {
    let seq = tail.map_or(1, |(seq, _)| seq + 1);
    let event =
      LedgerEvent::chained(seq, now_utc(), P::EVENT_TYPE, payload, tail.map(|(_, hash)| hash))?;

    tx.execute(
      &format!(
        "INSERT INTO {} ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        P::LEDGER.table()
      ),
      params![
        event.seq,
        event.ts_utc,
        event.event_type,
        encode_json(&event.payload)?,
        event.prev_hash.map(|h| h.to_hex()),
        event.event_hash.to_hex(),
      ],
    )?;
    tx.commit()?;

    tracing::debug!(
      ledger = %P::LEDGER,
      seq = event.seq,
      hash = %event.event_hash.short(),
      "appended ledger event"
    );
    Ok(event)
  }

  /// Sequence id and hash of the newest event.
  pub fn tail(&self) -> Result<Option<(i64, Hash256)>> {
    read_tail(&connect(&self.path)?, P::LEDGER)
  }

  pub fn len(&self) -> Result<u64> {
    let n: i64 = connect(&self.path)?.query_row(
      &format!("SELECT COUNT(*) FROM {}", P::LEDGER.table()),
      [],
      |r| r.get(0),
    )?;
    Ok(n as u64)
  }

  pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

  /// Hash of the event at `seq`.
  pub fn hash_at(&self, seq: i64) -> Result<Option<Hash256>> {
    let hash: Option<String> = connect(&self.path)?
      .query_row(
        &format!("SELECT event_hash FROM {} WHERE seq = ?1", P::LEDGER.table()),
        [seq],
        |r| r.get(0),
      )
      .optional()?;
    hash.as_deref().map(decode_hash).transpose()
  }

  /// Events with `from <= seq <= to`, ascending, decoded as `P`.
  pub fn export_range(&self, from: i64, to: i64) -> Result<EventRange<P>> {
    EventRange::open(&self.path, P::LEDGER, from, to)
  }

  /// Like [`export_range`](Self::export_range), with untyped payloads.
  pub fn export_raw(&self, from: i64, to: i64) -> Result<EventRange<Value>> {
    EventRange::open(&self.path, P::LEDGER, from, to)
  }

  /// Recompute the whole stored chain from genesis. Returns the event count.
  pub fn verify(&self) -> Result<u64> {
    let mut verifier = ChainVerifier::new(Anchor::Genesis);
    for event in self.export_raw(1, i64::MAX)? {
      let event = match event {
        Ok(event) => event,
        Err(Error::MalformedRow { seq, detail }) => {
          return Err(Error::ChainBreak {
            ledger: P::LEDGER,
            source: ChainBreak { index: verifier.count(), seq, kind: BreakKind::Malformed(detail) },
          });
        }
        Err(e) => return Err(e),
      };
      verifier
        .push(&event)
        .map_err(|source| Error::ChainBreak { ledger: P::LEDGER, source })?;
    }
    Ok(verifier.count() as u64)
  }
}

// ─── Export ──────────────────────────────────────────────────────────────────

/// A lazy, ordered read over a fixed range of a ledger.
///
/// The upper bound is fixed when the range is opened, so later appends are
/// never observed. Rows are fetched a page at a time; [`position`] gives the
/// sequence id to restart from.
///
/// [`position`]: EventRange::position
pub struct EventRange<T> {
  conn:    Connection,
  kind:    LedgerKind,
  next:    i64,
  last:    i64,
  buffer:  VecDeque<RawEvent>,
  drained: bool,
  _t:      PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EventRange<T> {
  fn open(path: &Path, kind: LedgerKind, from: i64, to: i64) -> Result<Self> {
    let conn = connect(path)?;
    let tail = read_tail(&conn, kind)?.map_or(0, |(seq, _)| seq);
    Ok(Self {
      conn,
      kind,
      next: from.max(1),
      last: to.min(tail),
      buffer: VecDeque::new(),
      drained: false,
      _t: PhantomData,
    })
  }

  /// The next sequence id this range will yield.
  pub fn position(&self) -> i64 { self.buffer.front().map_or(self.next, |raw| raw.seq) }

  fn fill(&mut self) -> Result<()> {
    if self.next > self.last {
      self.drained = true;
      return Ok(());
    }
    let mut stmt = self.conn.prepare_cached(&format!(
      "SELECT {EVENT_COLUMNS} FROM {} WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC LIMIT ?3",
      self.kind.table()
    ))?;
    let rows = stmt.query_map(params![self.next, self.last, PAGE_SIZE as i64], RawEvent::from_row)?;
    let mut fetched = 0;
    for row in rows {
      let raw = row?;
      self.next = raw.seq + 1;
      self.buffer.push_back(raw);
      fetched += 1;
    }
    if fetched < PAGE_SIZE {
      self.drained = true;
    }
    Ok(())
  }
}

impl<T: DeserializeOwned> Iterator for EventRange<T> {
  type Item = Result<LedgerEvent<T>>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.buffer.is_empty()
      && !self.drained
      && let Err(e) = self.fill()
    {
      self.drained = true;
      return Some(Err(e));
    }
    self.buffer.pop_front().map(|raw| raw.decode())
  }
}
