//! The approval outbox.

use chrono::{DateTime, Utc};
use foreman_core::{Decision, DecisionError, DecisionId, DecisionStatus, WorkerId};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolved decisions kept in memory by [`ApprovalOutbox::new`].
pub const DEFAULT_RESOLVED_RETAINED: usize = 256;

/// Pending decisions awaiting an actor, plus the most recent resolved
/// ones. Oldest first; a decision moves to the back when it is resolved.
///
/// The in-memory view of the decision log. The engine writes each
/// status change to its [`foreman_core::AuditLog`], which keeps the full
/// history, and [`crate::DecisionEngine::restore`] rebuilds this view
/// from it. Pending decisions are never evicted.
#[derive(Debug)]
pub struct ApprovalOutbox {
    decisions: Mutex<Vec<Decision>>,
    resolved_retained: usize,
}

impl Default for ApprovalOutbox {
    fn default() -> Self {
        Self::with_resolved_retained(DEFAULT_RESOLVED_RETAINED)
    }
}

impl ApprovalOutbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty outbox keeping at most `n` resolved decisions.
    pub fn with_resolved_retained(n: usize) -> Self {
        Self {
            decisions: Mutex::new(Vec::new()),
            resolved_retained: n,
        }
    }

    /// Decisions awaiting approval, oldest first.
    pub fn list_pending(&self) -> Vec<Decision> {
        lock(&self.decisions)
            .iter()
            .filter(|d| d.is_pending())
            .cloned()
            .collect()
    }

    /// One decision by id.
    pub fn get(&self, id: &DecisionId) -> Option<Decision> {
        lock(&self.decisions).iter().find(|d| &d.id == id).cloned()
    }

    /// Retained decisions, oldest first.
    pub fn history(&self) -> Vec<Decision> {
        lock(&self.decisions).clone()
    }

    /// Whether `worker` already has a decision waiting.
    pub fn has_pending_for(&self, worker: &WorkerId) -> bool {
        lock(&self.decisions)
            .iter()
            .any(|d| d.is_pending() && &d.target == worker)
    }

    pub(crate) fn insert(&self, decision: Decision) {
        let mut decisions = lock(&self.decisions);
        decisions.push(decision);
        self.evict(&mut decisions);
    }

    /// Drop the oldest resolved decisions beyond the retention bound.
    fn evict(&self, decisions: &mut Vec<Decision>) {
        let resolved = decisions.iter().filter(|d| !d.is_pending()).count();
        let mut excess = resolved.saturating_sub(self.resolved_retained);
        if excess == 0 {
            return;
        }
        decisions.retain(|d| {
            if excess > 0 && !d.is_pending() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Move a pending decision to `status` under the lock, so that two
    /// actors cannot both resolve it.
    pub(crate) fn claim(
        &self,
        id: &DecisionId,
        status: DecisionStatus,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Decision, DecisionError> {
        let mut decisions = lock(&self.decisions);
        let index = decisions
            .iter()
            .position(|d| &d.id == id)
            .ok_or_else(|| DecisionError::NotFound(id.clone()))?;
        if !decisions[index].is_pending() {
            return Err(DecisionError::NotPending {
                id: id.clone(),
                status: decisions[index].status,
            });
        }
        // Resolved decisions age from their resolution, not their creation.
        let mut decision = decisions.remove(index);
        decision.resolve(status, Some(actor), at);
        decisions.push(decision.clone());
        self.evict(&mut decisions);
        Ok(decision)
    }

    pub(crate) fn update(&self, decision: &Decision) {
        let mut decisions = lock(&self.decisions);
        if let Some(slot) = decisions.iter_mut().find(|d| d.id == decision.id) {
            *slot = decision.clone();
        }
    }

    /// Load decisions not already present. Returns how many of the
    /// loaded decisions are pending.
    pub(crate) fn restore(&self, restored: Vec<Decision>) -> usize {
        let mut decisions = lock(&self.decisions);
        let mut pending = 0;
        for decision in restored {
            if decisions.iter().any(|d| d.id == decision.id) {
                continue;
            }
            if decision.is_pending() {
                pending += 1;
            }
            decisions.push(decision);
        }
        self.evict(&mut decisions);
        pending
    }
}
