//! Append-only audit log. The persisted state used for audit and recovery.
//!
//! Two logs: the cost ledger (one [`LedgerEntry`] per scope per settled
//! reservation) and the decision log (one [`DecisionRecord`] per decision
//! status change; the latest record for an id is its current state).
//! Persistent implementations wrap each record in a [`SealedRecord`] so
//! that edits to the stored file are detectable on read.

use crate::decision::Decision;
use crate::error::AuditError;
use crate::id::{DecisionId, ReservationId, ScopeId, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// One settled amount against one budget scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// When it settled.
    pub timestamp: DateTime<Utc>,
    /// The scope charged.
    pub scope_id: ScopeId,
    /// Amount moved to consumed.
    pub amount: Decimal,
    /// Operation label passed to the reservation.
    pub operation: String,
    /// The worker that spent it, if any.
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// The reservation it settled.
    #[serde(default)]
    pub reservation: Option<ReservationId>,
}

/// A decision as it stood at `recorded_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// When this version was written.
    pub recorded_at: DateTime<Utc>,
    /// The decision.
    pub decision: Decision,
}

/// A record together with the SHA-256 digest of its JSON encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedRecord<T> {
    /// Lowercase hex SHA-256 of `serde_json::to_vec(&record)`.
    pub digest: String,
    /// The record.
    pub record: T,
}

/// Hex SHA-256 of a value's JSON encoding.
pub fn digest<T: Serialize>(value: &T) -> Result<String, AuditError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl<T: Serialize> SealedRecord<T> {
    /// Wrap a record with its digest.
    pub fn seal(record: T) -> Result<Self, AuditError> {
        Ok(Self {
            digest: digest(&record)?,
            record,
        })
    }

    /// Recompute the digest and compare.
    pub fn verify(&self) -> bool {
        digest(&self.record).is_ok_and(|d| d == self.digest)
    }

    /// Verify and unwrap. `log` and `index` identify the record in errors.
    pub fn open(self, log: &str, index: usize) -> Result<T, AuditError> {
        if self.verify() {
            Ok(self.record)
        } else {
            Err(AuditError::Tampered {
                log: log.to_owned(),
                index,
            })
        }
    }
}

/// Reduce a decision log to the latest version of each decision, in
/// order of first appearance.
pub fn latest_decisions(records: &[DecisionRecord]) -> Vec<Decision> {
    let mut order: Vec<DecisionId> = Vec::new();
    let mut latest: HashMap<DecisionId, &Decision> = HashMap::new();
    for rec in records {
        if latest.insert(rec.decision.id.clone(), &rec.decision).is_none() {
            order.push(rec.decision.id.clone());
        }
    }
    order
        .into_iter()
        .filter_map(|id| latest.get(&id).map(|d| (*d).clone()))
        .collect()
}

/// Append-only storage for the cost ledger and the decision log.
///
/// Implementations must preserve append order and never rewrite an
/// appended record.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one ledger entry.
    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), AuditError>;

    /// Append one decision version.
    async fn append_decision(&self, record: DecisionRecord) -> Result<(), AuditError>;

    /// Ledger entries with `timestamp >= since`, in append order.
    async fn ledger_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, AuditError>;

    /// Every decision record, in append order.
    async fn decisions(&self) -> Result<Vec<DecisionRecord>, AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionKind, DecisionStatus};

    fn entry() -> LedgerEntry {
        LedgerEntry {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            scope_id: ScopeId::global_daily(),
            amount: Decimal::new(400, 2),
            operation: "worker_run".into(),
            worker_id: Some(WorkerId::new("w1")),
            reservation: Some(ReservationId::new("rsv-1")),
        }
    }

    #[test]
    fn sealed_record_detects_edits() {
        let sealed = SealedRecord::seal(entry()).unwrap();
        assert_eq!(sealed.digest.len(), 64);
        assert!(sealed.verify());

        let mut edited = sealed.clone();
        edited.record.amount = Decimal::new(1, 2);
        assert!(!edited.verify());
        assert!(matches!(
            edited.open("ledger", 3),
            Err(AuditError::Tampered { index: 3, .. })
        ));
        assert_eq!(sealed.open("ledger", 0).unwrap(), entry());
    }

    #[test]
    fn sealed_record_survives_json_round_trip() {
        let sealed = SealedRecord::seal(entry()).unwrap();
        let line = serde_json::to_string(&sealed).unwrap();
        let back: SealedRecord<LedgerEntry> = serde_json::from_str(&line).unwrap();
        assert!(back.verify());
    }

    #[test]
    fn latest_decisions_keeps_last_version() {
        let t = DateTime::<Utc>::UNIX_EPOCH;
        let d1 = Decision::new("d1", DecisionKind::Kill, "w1", t);
        let d2 = Decision::new("d2", DecisionKind::Pause, "w2", t);
        let mut d1_done = d1.clone();
        d1_done.resolve(DecisionStatus::Approved, Some("ops"), t);
        let records = vec![
            DecisionRecord { recorded_at: t, decision: d1 },
            DecisionRecord { recorded_at: t, decision: d2 },
            DecisionRecord { recorded_at: t, decision: d1_done },
        ];
        let latest = latest_decisions(&records);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].id.as_str(), "d1");
        assert_eq!(latest[0].status, DecisionStatus::Approved);
        assert!(latest[1].is_pending());
    }
}
