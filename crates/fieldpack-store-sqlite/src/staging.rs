//! Persistence for staged bundles.
//!
//! Status changes are conditional updates guarded on the row still being
//! `PENDING` or `QUARANTINED`, so two reviewers racing on one bundle cannot
//! both decide it.

use fieldpack_core::{
  Hash256,
  staging::{ReviewDecision, StageStatus, StagedBundle},
};
use rusqlite::{Connection, OptionalExtension as _, params};
use uuid::Uuid;

use crate::{
  Error, Result, Store,
  encode::{RawStaged, STAGED_COLUMNS, decode_status, encode_json, encode_uuid},
  ledger::LedgerTx,
};

fn load(conn: &Connection, id: Uuid) -> Result<Option<StagedBundle>> {
  let raw = conn
    .query_row(
      &format!("SELECT {STAGED_COLUMNS} FROM staged_bundles WHERE staged_id = ?1"),
      [encode_uuid(id)],
      RawStaged::from_row,
    )
    .optional()?;
  raw.map(RawStaged::into_staged).transpose()
}

fn decide(
  conn: &Connection,
  id: Uuid,
  status: StageStatus,
  decision: &ReviewDecision,
) -> Result<()> {
  let updated = conn.execute(
    "UPDATE staged_bundles SET status = ?2, decision_json = ?3, last_error = NULL
     WHERE staged_id = ?1 AND status IN ('PENDING', 'QUARANTINED')",
    params![encode_uuid(id), status.as_str(), encode_json(decision)?],
  )?;
  if updated == 1 {
    return Ok(());
  }

  let current: Option<String> = conn
    .query_row(
      "SELECT status FROM staged_bundles WHERE staged_id = ?1",
      [encode_uuid(id)],
      |r| r.get(0),
    )
    .optional()?;
  match current {
    Some(s) => Err(Error::StagedClosed { id, status: decode_status(&s)? }),
    None => Err(Error::StagedNotFound(id)),
  }
}

impl Store {
  pub fn insert_staged(&self, staged: &StagedBundle) -> Result<()> {
    self.conn().execute(
      &format!(
        "INSERT INTO staged_bundles ({STAGED_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
      ),
      params![
        encode_uuid(staged.id),
        staged.bundle_sha256.to_hex(),
        staged.bundle_path,
        staged.status.as_str(),
        staged.policy_mode.as_str(),
        encode_json(&staged.verification)?,
        encode_json(&staged.validation)?,
        staged.created_utc,
        staged.submitted_by,
        staged.notes,
        staged.decision.as_ref().map(encode_json).transpose()?,
        staged.last_error,
      ],
    )?;
    Ok(())
  }

  pub fn staged(&self, id: Uuid) -> Result<Option<StagedBundle>> { load(&self.conn(), id) }

  pub fn staged_by_bundle(&self, bundle_sha256: &Hash256) -> Result<Option<StagedBundle>> {
    let raw = self
      .conn()
      .query_row(
        &format!("SELECT {STAGED_COLUMNS} FROM staged_bundles WHERE bundle_sha256 = ?1"),
        [bundle_sha256.to_hex()],
        RawStaged::from_row,
      )
      .optional()?;
    raw.map(RawStaged::into_staged).transpose()
  }

  /// Staged bundles, oldest first, optionally filtered by status.
  pub fn list_staged(&self, status: Option<StageStatus>) -> Result<Vec<StagedBundle>> {
    let conn = self.conn();
    let mut stmt = conn.prepare(&format!(
      "SELECT {STAGED_COLUMNS} FROM staged_bundles
       WHERE ?1 IS NULL OR status = ?1
       ORDER BY created_utc ASC, staged_id ASC"
    ))?;
    let rows = stmt.query_map([status.map(StageStatus::as_str)], RawStaged::from_row)?;
    rows.map(|r| r?.into_staged()).collect()
  }

  /// Close a staged bundle without touching the graph.
  pub fn decide_staged(
    &self,
    id: Uuid,
    status: StageStatus,
    decision: &ReviewDecision,
  ) -> Result<()> {
    decide(&self.conn(), id, status, decision)
  }

  /// Note why an approval attempt failed. The status is left as it was.
  pub fn record_staged_failure(&self, id: Uuid, reason: &str) -> Result<()> {
    let updated = self.conn().execute(
      "UPDATE staged_bundles SET last_error = ?2 WHERE staged_id = ?1",
      params![encode_uuid(id), reason],
    )?;
    if updated == 0 {
      return Err(Error::StagedNotFound(id));
    }
    Ok(())
  }
}

impl LedgerTx<'_> {
  /// Mark a staged bundle decided as part of a merge.
  pub fn decide_staged(
    &self,
    id: Uuid,
    status: StageStatus,
    decision: &ReviewDecision,
  ) -> Result<()> {
    decide(self.conn, id, status, decision)
  }
}
