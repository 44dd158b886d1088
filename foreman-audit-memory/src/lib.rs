#![deny(missing_docs)]
//! In-memory implementation of foreman's [`AuditLog`] trait.
//!
//! Both logs are `Vec`s behind `RwLock`s. Append order is preserved and
//! nothing is ever rewritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{AuditError, AuditLog, DecisionRecord, LedgerEntry};
use tokio::sync::RwLock;

/// In-memory audit log.
///
/// Suitable for testing and single-process use where the audit trail
/// does not need to outlive the process.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    ledger: RwLock<Vec<LedgerEntry>>,
    decisions: RwLock<Vec<DecisionRecord>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger entries appended so far.
    pub async fn ledger_len(&self) -> usize {
        self.ledger.read().await.len()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append_ledger(&self, entry: LedgerEntry) -> Result<(), AuditError> {
        self.ledger.write().await.push(entry);
        Ok(())
    }

    async fn append_decision(&self, record: DecisionRecord) -> Result<(), AuditError> {
        self.decisions.write().await.push(record);
        Ok(())
    }

    async fn ledger_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>, AuditError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn decisions(&self) -> Result<Vec<DecisionRecord>, AuditError> {
        Ok(self.decisions.read().await.clone())
    }
}
