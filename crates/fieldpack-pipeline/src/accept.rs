//! KG acceptance: import verified bundles, stage them for review, and merge
//! their deltas into the live graph.
//!
//! A merge is one `KG_DELTA_APPLIED` append. The graph mutations, the
//! `merged_bundles` row and (for approvals) the staged status change all run
//! inside that append's write transaction.

use std::{fs, path::PathBuf};

use fieldpack_core::{
  Hash256,
  kg::{KgOp, delta_hash, validate_delta},
  ledger::now_utc,
  policy::AcceptanceMode,
  records::{DecisionRecord, KgDeltaApplied},
  result::{ReasonCode, VerificationResult},
  staging::{Decision, ReviewDecision, StageStatus, StagedBundle},
};
use fieldpack_store_sqlite::Error as StoreError;
use uuid::Uuid;

use crate::{Error, Pipeline, Result, atomic::write_atomic, verify::inspect};

pub const AUTO_MERGE: &str = "AUTO_MERGE";
pub const REVIEW_APPROVE: &str = "REVIEW_APPROVE";

#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
  pub path:  PathBuf,
  /// Overrides the policy's mode for this import. The kill switch still wins.
  pub mode:  Option<AcceptanceMode>,
  pub actor: String,
  pub notes: String,
}

/// Staging errors surfaced by the store, in this crate's terms.
fn staging_error(e: StoreError) -> Error {
  match e {
    StoreError::StagedClosed { id, status } => Error::IllegalTransition { id, status },
    StoreError::StagedNotFound(id) => Error::StagedNotFound(id),
    e => e.into(),
  }
}

fn required_actor(actor: &str) -> Result<&str> {
  match actor.trim() {
    "" => Err(Error::ActorRequired),
    actor => Ok(actor),
  }
}

impl Pipeline {
  pub fn import_bundle(&self, request: &ImportRequest) -> Result<Decision> {
    let bytes = fs::read(&request.path)?;
    self.import_bytes(&bytes, request.mode, &request.actor, &request.notes)
  }

  /// Verify `bytes` and admit the bundle under the effective mode.
  pub fn import_bytes(
    &self,
    bytes: &[u8],
    mode: Option<AcceptanceMode>,
    actor: &str,
    notes: &str,
  ) -> Result<Decision> {
    let (verification, bundle) = inspect(bytes, &self.policy, &self.allowlist);
    let bundle_sha256 = verification.bundle_sha256;

    let mode = if self.policy.kill_switch {
      AcceptanceMode::Kill
    } else {
      mode.unwrap_or_else(|| {
        self.policy.mode_for(verification.toolchain_id.as_deref().unwrap_or_default())
      })
    };
    if mode == AcceptanceMode::Kill {
      tracing::warn!(bundle = %bundle_sha256.short(), "import killed by policy");
      return Ok(Decision::Killed { bundle_sha256 });
    }

    let Some(bundle) = bundle else {
      return Ok(Decision::Refused {
        bundle_sha256,
        reason: verification.reason,
        detail: verification.detail,
      });
    };
    if self.store.is_merged(&bundle_sha256)? {
      return Ok(Decision::AlreadyMerged { bundle_sha256 });
    }
    if let Some(staged) = self.store.staged_by_bundle(&bundle_sha256)? {
      return Ok(Decision::AlreadyStaged {
        bundle_sha256,
        staged_id: staged.id,
        status: staged.status,
      });
    }

    match StageStatus::for_mode(mode) {
      Some(status) => self.stage(bytes, verification, &bundle.ops, mode, status, actor, notes),
      None => {
        let record = DecisionRecord {
          kind:      AUTO_MERGE.into(),
          actor:     if actor.trim().is_empty() { "auto".into() } else { actor.trim().into() },
          notes:     notes.into(),
          ts_utc:    now_utc(),
          staged_id: None,
        };
        match self.merge(bundle_sha256, &bundle.ops, record, None)? {
          Decision::Invalid { report, .. } => {
            tracing::warn!(
              bundle = %bundle_sha256.short(),
              issues = report.issues.len(),
              "auto-merge failed validation, quarantining"
            );
            let status = StageStatus::Quarantined;
            self.stage(bytes, verification, &bundle.ops, mode, status, actor, notes)
          }
          decided => Ok(decided),
        }
      }
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn stage(
    &self,
    bytes: &[u8],
    verification: VerificationResult,
    ops: &[KgOp],
    mode: AcceptanceMode,
    status: StageStatus,
    actor: &str,
    notes: &str,
  ) -> Result<Decision> {
    let bundle_sha256 = verification.bundle_sha256;
    // Staged regardless of the outcome; reviewers see the report.
    let validation =
      validate_delta(ops, self.store.as_ref(), &self.policy.kg, &self.policy.limits)?;

    let path =
      self.config.bundles_dir.join("staged").join(format!("{}.zip", bundle_sha256.to_hex()));
    write_atomic(&path, bytes)?;

    let staged = StagedBundle {
      id: Uuid::new_v4(),
      bundle_sha256,
      bundle_path: path.to_string_lossy().into_owned(),
      status,
      policy_mode: mode,
      verification,
      validation,
      created_utc: now_utc(),
      submitted_by: actor.trim().to_owned(),
      notes: notes.to_owned(),
      decision: None,
      last_error: None,
    };
    self.store.insert_staged(&staged)?;
    tracing::info!(
      bundle = %bundle_sha256.short(),
      staged_id = %staged.id,
      %status,
      mode = mode.as_str(),
      "staged bundle"
    );
    Ok(Decision::Staged { bundle_sha256, staged_id: staged.id, status })
  }

  /// Validate and apply `ops` in one ledger append.
  fn merge(
    &self,
    bundle_sha256: Hash256,
    ops: &[KgOp],
    decision: DecisionRecord,
    review: Option<(Uuid, &ReviewDecision)>,
  ) -> Result<Decision> {
    let delta_hash = delta_hash(ops)?;
    let appended = self.store.kg_delta_ledger().append_with(|tx| -> Result<KgDeltaApplied> {
      if tx.is_merged(&bundle_sha256)? {
        return Err(StoreError::AlreadyMerged(bundle_sha256).into());
      }
      let report = validate_delta(ops, tx, &self.policy.kg, &self.policy.limits)?;
      if !report.is_ok() {
        return Err(Error::InvalidDelta(report));
      }
      for op in ops {
        tx.apply_op(op)?;
      }
      tx.record_merge(&bundle_sha256, &delta_hash, ops.len(), &decision.kind, &decision.ts_utc)?;
      if let Some((id, review)) = review {
        tx.decide_staged(id, StageStatus::Approved, review)?;
      }
      Ok(KgDeltaApplied {
        bundle_sha256,
        delta_hash,
        ops: ops.len(),
        ops_payload: ops.to_vec(),
        decision,
      })
    });

    match appended {
      Ok(event) => {
        tracing::info!(
          bundle = %bundle_sha256.short(),
          ops = ops.len(),
          seq = event.seq,
          kind = %event.payload.decision.kind,
          actor = %event.payload.decision.actor,
          "merged kg delta"
        );
        Ok(Decision::Merged { bundle_sha256, ops: ops.len(), event_seq: event.seq })
      }
      Err(Error::InvalidDelta(report)) => {
        tracing::warn!(
          bundle = %bundle_sha256.short(),
          issue = %report.summary().unwrap_or_default(),
          "kg delta failed validation"
        );
        Ok(Decision::Invalid { bundle_sha256, report })
      }
      Err(Error::Store(StoreError::AlreadyMerged(_))) => {
        Ok(Decision::AlreadyMerged { bundle_sha256 })
      }
      Err(Error::Store(e)) => Err(staging_error(e)),
      Err(e) => Err(e),
    }
  }

  // ── Review ──

  /// Approve a staged bundle: re-verify its private copy, then merge.
  pub fn review_approve(&self, id: Uuid, actor: &str, notes: &str) -> Result<Decision> {
    let actor = required_actor(actor)?;
    let staged = self.get_staged(id)?;
    if !staged.status.is_open() {
      return Err(Error::IllegalTransition { id, status: staged.status });
    }

    let bytes = match fs::read(&staged.bundle_path) {
      Ok(bytes) => bytes,
      Err(e) => {
        self.store.record_staged_failure(id, &format!("staged copy unreadable: {e}"))?;
        return Err(e.into());
      }
    };
    let (verification, bundle) = inspect(&bytes, &self.policy, &self.allowlist);
    let refusal = if verification.bundle_sha256 != staged.bundle_sha256 {
      Some((
        ReasonCode::TamperedContent,
        format!(
          "staged copy hashes to {}, expected {}",
          verification.bundle_sha256.short(),
          staged.bundle_sha256.short()
        ),
      ))
    } else if !verification.ok {
      Some((verification.reason, verification.detail.clone().unwrap_or_default()))
    } else {
      None
    };
    let bundle = match (refusal, bundle) {
      (None, Some(bundle)) => bundle,
      (refusal, _) => {
        let (reason, detail) =
          refusal.unwrap_or((verification.reason, "verification failed".to_owned()));
        self.store.record_staged_failure(id, &format!("{reason}: {detail}"))?;
        tracing::warn!(staged_id = %id, %reason, %detail, "approval refused");
        return Ok(Decision::Refused {
          bundle_sha256: staged.bundle_sha256,
          reason,
          detail: Some(detail),
        });
      }
    };

    let review =
      ReviewDecision { actor: actor.to_owned(), notes: notes.to_owned(), ts_utc: now_utc() };
    let record = DecisionRecord {
      kind:      REVIEW_APPROVE.into(),
      actor:     review.actor.clone(),
      notes:     review.notes.clone(),
      ts_utc:    review.ts_utc.clone(),
      staged_id: Some(id),
    };
    let decision = self.merge(staged.bundle_sha256, &bundle.ops, record, Some((id, &review)))?;
    match &decision {
      Decision::Invalid { report, .. } => {
        let summary = report.summary().unwrap_or_else(|| "delta failed validation".into());
        self.store.record_staged_failure(id, &summary)?;
      }
      Decision::AlreadyMerged { .. } => {
        self.store.record_staged_failure(id, "bundle digest was already merged")?;
      }
      _ => tracing::info!(staged_id = %id, %actor, "approved staged bundle"),
    }
    Ok(decision)
  }

  /// Reject a staged bundle. The graph is not touched.
  pub fn review_reject(&self, id: Uuid, actor: &str, notes: &str) -> Result<Decision> {
    let actor = required_actor(actor)?;
    let staged = self.get_staged(id)?;
    let review =
      ReviewDecision { actor: actor.to_owned(), notes: notes.to_owned(), ts_utc: now_utc() };
    self.store.decide_staged(id, StageStatus::Rejected, &review).map_err(staging_error)?;
    tracing::info!(staged_id = %id, %actor, "rejected staged bundle");
    Ok(Decision::Rejected { bundle_sha256: staged.bundle_sha256, staged_id: id })
  }

  pub fn list_staged(&self, status: Option<StageStatus>) -> Result<Vec<StagedBundle>> {
    Ok(self.store.list_staged(status)?)
  }

  pub fn get_staged(&self, id: Uuid) -> Result<StagedBundle> {
    self.store.staged(id)?.ok_or(Error::StagedNotFound(id))
  }
}
