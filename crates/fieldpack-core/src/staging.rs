//! Staged bundles and the acceptance state machine.
//!
//! ```text
//! PENDING ─────┬──> APPROVED   (merges the delta)
//! QUARANTINED ─┴──> REJECTED   (never touches the graph)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  canonical::Hash256,
  kg::ValidationReport,
  policy::AcceptanceMode,
  result::{ReasonCode, VerificationResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
  Pending,
  Approved,
  Rejected,
  Quarantined,
}

impl StageStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      StageStatus::Pending => "PENDING",
      StageStatus::Approved => "APPROVED",
      StageStatus::Rejected => "REJECTED",
      StageStatus::Quarantined => "QUARANTINED",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "PENDING" => Some(StageStatus::Pending),
      "APPROVED" => Some(StageStatus::Approved),
      "REJECTED" => Some(StageStatus::Rejected),
      "QUARANTINED" => Some(StageStatus::Quarantined),
      _ => None,
    }
  }

  /// Whether a reviewer may still decide this bundle.
  pub fn is_open(self) -> bool { matches!(self, StageStatus::Pending | StageStatus::Quarantined) }

  pub fn can_transition_to(self, next: StageStatus) -> bool {
    self.is_open() && matches!(next, StageStatus::Approved | StageStatus::Rejected)
  }

  /// Status a freshly staged bundle gets under `mode`.
  pub fn for_mode(mode: AcceptanceMode) -> Option<Self> {
    match mode {
      AcceptanceMode::ReviewOnly => Some(StageStatus::Pending),
      AcceptanceMode::Quarantine => Some(StageStatus::Quarantined),
      AcceptanceMode::AutoMerge | AcceptanceMode::Kill => None,
    }
  }
}

impl fmt::Display for StageStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// The reviewer's record on a decided bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
  pub actor:  String,
  pub notes:  String,
  pub ts_utc: String,
}

/// A verified bundle awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBundle {
  pub id:            Uuid,
  pub bundle_sha256: Hash256,
  /// Private copy of the bundle bytes, re-verified on approval.
  pub bundle_path:   String,
  pub status:        StageStatus,
  pub policy_mode:   AcceptanceMode,
  pub verification:  VerificationResult,
  pub validation:    ValidationReport,
  pub created_utc:   String,
  /// Who staged it.
  pub submitted_by:  String,
  pub notes:         String,
  pub decision:      Option<ReviewDecision>,
  /// Reason the most recent approval attempt failed, if any.
  pub last_error:    Option<String>,
}

/// Outcome of an import or review action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
  Merged {
    bundle_sha256: Hash256,
    ops:           usize,
    event_seq:     i64,
  },
  /// The bundle digest was merged before; nothing was applied.
  AlreadyMerged { bundle_sha256: Hash256 },
  Staged {
    bundle_sha256: Hash256,
    staged_id:     Uuid,
    status:        StageStatus,
  },
  AlreadyStaged {
    bundle_sha256: Hash256,
    staged_id:     Uuid,
    status:        StageStatus,
  },
  Rejected {
    bundle_sha256: Hash256,
    staged_id:     Uuid,
  },
  /// Verification failed.
  Refused {
    bundle_sha256: Hash256,
    reason:        ReasonCode,
    detail:        Option<String>,
  },
  /// `KILL` mode; nothing was recorded.
  Killed { bundle_sha256: Hash256 },
  /// The delta failed validation; nothing was applied.
  Invalid {
    bundle_sha256: Hash256,
    report:        ValidationReport,
  },
}

impl Decision {
  pub fn bundle_sha256(&self) -> Hash256 {
    match self {
      Decision::Merged { bundle_sha256, .. }
      | Decision::AlreadyMerged { bundle_sha256 }
      | Decision::Staged { bundle_sha256, .. }
      | Decision::AlreadyStaged { bundle_sha256, .. }
      | Decision::Rejected { bundle_sha256, .. }
      | Decision::Refused { bundle_sha256, .. }
      | Decision::Killed { bundle_sha256 }
      | Decision::Invalid { bundle_sha256, .. } => *bundle_sha256,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_open_states_can_be_decided() {
    for open in [StageStatus::Pending, StageStatus::Quarantined] {
      assert!(open.can_transition_to(StageStatus::Approved));
      assert!(open.can_transition_to(StageStatus::Rejected));
      assert!(!open.can_transition_to(StageStatus::Pending));
    }
    for closed in [StageStatus::Approved, StageStatus::Rejected] {
      assert!(!closed.can_transition_to(StageStatus::Approved));
      assert!(!closed.can_transition_to(StageStatus::Rejected));
    }
  }

  #[test]
  fn staging_modes_map_to_initial_status() {
    assert_eq!(StageStatus::for_mode(AcceptanceMode::ReviewOnly), Some(StageStatus::Pending));
    assert_eq!(
      StageStatus::for_mode(AcceptanceMode::Quarantine),
      Some(StageStatus::Quarantined)
    );
    assert_eq!(StageStatus::for_mode(AcceptanceMode::AutoMerge), None);
  }
}
