//! The budget enforcer: atomic reserve and settle across scopes.

use crate::BudgetError;
use crate::config::BudgetConfig;
use crate::ledger::{Ledger, ScopeStatus, lock};
use crate::pricing::CostPredictor;
use crate::rate::{RateLimiterState, TokenBucket};
use chrono::{DateTime, Utc};
use foreman_core::{
    Clock, ConfigError, DenyReason, EventObserver, LedgerEntry, LifecycleEvent, Observers,
    ReservationId, ScopeId, SystemClock, TokenBudgetHint, WorkerId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A provisional hold against one or more scopes.
///
/// Settle it exactly once with [`BudgetEnforcer::release_unused`]; later
/// calls are no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique id.
    pub id: ReservationId,
    /// Scopes held, in lock order.
    pub scopes: Vec<ScopeId>,
    /// Amount held in each scope.
    pub amount: Decimal,
    /// Operation label.
    pub operation: String,
    /// The worker the hold is for, if any.
    pub worker: Option<WorkerId>,
    /// When it was granted.
    pub created_at: DateTime<Utc>,
}

/// Result of settling a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// The reservation settled.
    pub reservation: ReservationId,
    /// What was held.
    pub reserved: Decimal,
    /// What was charged to every scope.
    pub actual: Decimal,
    /// How far `actual` exceeded the hold.
    pub overshoot: Decimal,
    /// One ledger entry per charged scope, ready to append to the audit log.
    pub entries: Vec<LedgerEntry>,
}

/// An engaged emergency stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStop {
    /// Why it engaged.
    pub reason: String,
    /// When it engaged.
    pub engaged_at: DateTime<Utc>,
}

/// Running counters since the enforcer was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnforcerStats {
    /// Reservations granted.
    pub total_operations: u64,
    /// Sum of granted estimates.
    pub total_reserved: Decimal,
    /// Reservations settled.
    pub settled_operations: u64,
    /// Sum of settled actual costs.
    pub total_settled: Decimal,
    /// Sum of actual cost above estimates.
    pub total_overshoot: Decimal,
    /// Reservations denied.
    pub blocked_operations: u64,
    /// Sum of denied estimates.
    pub blocked_cost_saved: Decimal,
}

/// Everything `get_status` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Every scope, in id order.
    pub scopes: Vec<ScopeStatus>,
    /// The emergency stop, when engaged.
    pub emergency: Option<EmergencyStop>,
    /// Rate limiter state.
    pub rate: RateLimiterState,
    /// Running counters.
    pub stats: EnforcerStats,
    /// Reservations granted but not yet settled.
    pub active_reservations: usize,
}

impl BudgetStatus {
    /// Status of one scope.
    pub fn scope(&self, id: &ScopeId) -> Option<&ScopeStatus> {
        self.scopes.iter().find(|s| &s.scope_id == id)
    }
}

/// Gatekeeper for all spend.
///
/// All state shared between workers lives here. Every mutation happens
/// with the involved scope locks held, taken in `ScopeId` order; the
/// rate limiter, emergency flag and bookkeeping locks are only ever taken
/// after scope locks and never held across each other.
pub struct BudgetEnforcer {
    ledger: Ledger,
    rate: Mutex<TokenBucket>,
    emergency: Mutex<Option<EmergencyStop>>,
    active: Mutex<HashMap<ReservationId, Reservation>>,
    stats: Mutex<EnforcerStats>,
    next_id: AtomicU64,
    config: BudgetConfig,
    predictor: CostPredictor,
    clock: Arc<dyn Clock>,
    observers: Observers,
}

impl BudgetEnforcer {
    /// Validate `config` and build an enforcer on the system clock.
    pub fn new(config: BudgetConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Validate `config` and build an enforcer on the given clock.
    pub fn with_clock(config: BudgetConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = clock.now();
        let rate = TokenBucket::new(
            f64::from(config.rate_limit.capacity),
            config.rate_limit.refill_per_minute / 60.0,
            now,
        );
        Ok(Self {
            ledger: Ledger::new(&config, now),
            rate: Mutex::new(rate),
            emergency: Mutex::new(None),
            active: Mutex::new(HashMap::new()),
            stats: Mutex::new(EnforcerStats::default()),
            next_id: AtomicU64::new(0),
            predictor: CostPredictor::new(config.pricing.clone()),
            config,
            clock,
            observers: Observers::new(),
        })
    }

    /// Deliver lifecycle events (scope pressure, emergency stop) to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    /// The configuration this enforcer was built with.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// The scope ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The scopes a worker's run is checked against: global daily and
    /// hourly, the worker's daily scope, and the operation's scope when
    /// one is configured.
    pub fn scopes_for(&self, worker: &WorkerId, operation: &str) -> Vec<ScopeId> {
        let mut scopes = vec![
            ScopeId::global_daily(),
            ScopeId::global_hourly(),
            ScopeId::worker_daily(worker),
        ];
        if self.config.operation_limits.contains_key(operation) {
            scopes.push(ScopeId::operation(operation));
        }
        scopes
    }

    /// Reserve `estimated_cost` against every scope in `scope_ids`, or
    /// against none of them.
    pub fn check_and_reserve(
        &self,
        scope_ids: &[ScopeId],
        estimated_cost: Decimal,
        operation: &str,
    ) -> Result<Reservation, DenyReason> {
        self.reserve(scope_ids, estimated_cost, operation, None)
    }

    /// Reserve for one run of `worker` against [`Self::scopes_for`].
    pub fn reserve_for(
        &self,
        worker: &WorkerId,
        operation: &str,
        estimated_cost: Decimal,
    ) -> Result<Reservation, DenyReason> {
        let scopes = self.scopes_for(worker, operation);
        self.reserve(&scopes, estimated_cost, operation, Some(worker))
    }

    fn reserve(
        &self,
        scope_ids: &[ScopeId],
        estimated_cost: Decimal,
        operation: &str,
        worker: Option<&WorkerId>,
    ) -> Result<Reservation, DenyReason> {
        let now = self.clock.now();
        if let Some(stop) = self.emergency() {
            let reason = DenyReason::EmergencyStop {
                reason: stop.reason,
            };
            return Err(self.deny(reason, estimated_cost, operation, worker));
        }
        if estimated_cost.is_sign_negative() {
            let reason = DenyReason::InvalidEstimate(estimated_cost);
            return Err(self.deny(reason, Decimal::ZERO, operation, worker));
        }
        if estimated_cost > self.config.max_operation_cost {
            let reason = DenyReason::OperationCap {
                requested: estimated_cost,
                cap: self.config.max_operation_cost,
            };
            return Err(self.deny(reason, estimated_cost, operation, worker));
        }
        let handles = match self.ledger.resolve(scope_ids, now) {
            Ok(handles) => handles,
            Err(reason) => return Err(self.deny(reason, estimated_cost, operation, worker)),
        };

        let mut events = Vec::new();
        let granted = {
            let mut guards: Vec<_> = handles.iter().map(|(_, scope)| lock(scope)).collect();
            for guard in guards.iter_mut() {
                guard.roll(now);
            }
            let check = if let Some(stop) = self.emergency() {
                Err(DenyReason::EmergencyStop { reason: stop.reason })
            } else if let Some(((id, _), guard)) = handles
                .iter()
                .zip(guards.iter())
                .find(|(_, guard)| !guard.fits(estimated_cost))
            {
                Err(DenyReason::ScopeLimit {
                    scope: id.clone(),
                    requested: estimated_cost,
                    available: guard.available(),
                })
            } else if !lock(&self.rate).try_acquire(now) {
                Err(DenyReason::RateLimit)
            } else {
                Ok(())
            };
            if check.is_ok() {
                for ((id, _), guard) in handles.iter().zip(guards.iter_mut()) {
                    guard.reserved += estimated_cost;
                    if let Some(level) = guard.update_level() {
                        events.push(LifecycleEvent::ScopePressure {
                            scope: id.clone(),
                            level,
                            percent: guard.percent(),
                            at: now,
                        });
                    }
                }
            }
            check
        };
        if let Err(reason) = granted {
            return Err(self.deny(reason, estimated_cost, operation, worker));
        }

        let id = ReservationId::new(format!(
            "rsv-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1
        ));
        let reservation = Reservation {
            id: id.clone(),
            scopes: handles.into_iter().map(|(id, _)| id).collect(),
            amount: estimated_cost,
            operation: operation.to_owned(),
            worker: worker.cloned(),
            created_at: now,
        };
        lock(&self.active).insert(id.clone(), reservation.clone());
        {
            let mut stats = lock(&self.stats);
            stats.total_operations += 1;
            stats.total_reserved += estimated_cost;
        }
        tracing::debug!(
            reservation = %id,
            amount = %estimated_cost,
            operation,
            worker = worker.map(|w| w.as_str()),
            "foreman.budget.reserved"
        );
        self.publish(&events);
        Ok(reservation)
    }

    fn deny(
        &self,
        reason: DenyReason,
        estimated_cost: Decimal,
        operation: &str,
        worker: Option<&WorkerId>,
    ) -> DenyReason {
        {
            let mut stats = lock(&self.stats);
            stats.blocked_operations += 1;
            stats.blocked_cost_saved += estimated_cost;
        }
        tracing::warn!(
            reason = %reason,
            amount = %estimated_cost,
            operation,
            worker = worker.map(|w| w.as_str()),
            "foreman.budget.reserve_denied"
        );
        reason
    }

    /// Settle a reservation at `actual_cost`.
    ///
    /// Every held scope gives back its hold and is charged `actual_cost`
    /// in full, including any excess over the estimate. Returns `None`
    /// when the reservation was already settled.
    pub fn release_unused(
        &self,
        reservation: &Reservation,
        actual_cost: Decimal,
    ) -> Option<Settlement> {
        let Some(held) = lock(&self.active).remove(&reservation.id) else {
            tracing::warn!(reservation = %reservation.id, "foreman.budget.release_ignored");
            return None;
        };
        let actual = if actual_cost.is_sign_negative() {
            tracing::warn!(
                reservation = %held.id,
                actual = %actual_cost,
                "foreman.budget.negative_cost"
            );
            Decimal::ZERO
        } else {
            actual_cost
        };
        let overshoot = (actual - held.amount).max(Decimal::ZERO);
        let now = self.clock.now();
        let handles = match self.ledger.resolve(&held.scopes, now) {
            Ok(handles) => handles,
            Err(reason) => {
                tracing::error!(
                    reservation = %held.id,
                    %reason,
                    "foreman.budget.release_scope_missing"
                );
                Vec::new()
            }
        };

        let mut events = Vec::new();
        {
            let mut guards: Vec<_> = handles.iter().map(|(_, scope)| lock(scope)).collect();
            for ((id, _), guard) in handles.iter().zip(guards.iter_mut()) {
                guard.roll(now);
                guard.reserved = (guard.reserved - held.amount).max(Decimal::ZERO);
                guard.consumed += actual;
                if let Some(level) = guard.update_level() {
                    events.push(LifecycleEvent::ScopePressure {
                        scope: id.clone(),
                        level,
                        percent: guard.percent(),
                        at: now,
                    });
                }
                if *id == ScopeId::global_daily()
                    && guard.committed() > self.config.emergency_threshold
                {
                    let reason = format!(
                        "global daily spend {} exceeded emergency threshold {}",
                        guard.committed(),
                        self.config.emergency_threshold
                    );
                    if let Some(event) = self.engage(reason, now) {
                        events.push(event);
                    }
                }
            }
        }

        if overshoot > Decimal::ZERO {
            tracing::warn!(
                reservation = %held.id,
                reserved = %held.amount,
                actual = %actual,
                overshoot = %overshoot,
                "foreman.budget.overshoot"
            );
        }
        {
            let mut stats = lock(&self.stats);
            stats.settled_operations += 1;
            stats.total_settled += actual;
            stats.total_overshoot += overshoot;
        }

        let entries = if actual.is_zero() {
            Vec::new()
        } else {
            held.scopes
                .iter()
                .map(|scope| LedgerEntry {
                    timestamp: now,
                    scope_id: scope.clone(),
                    amount: actual,
                    operation: held.operation.clone(),
                    worker_id: held.worker.clone(),
                    reservation: Some(held.id.clone()),
                })
                .collect()
        };
        tracing::debug!(reservation = %held.id, actual = %actual, "foreman.budget.settled");
        self.publish(&events);
        Some(Settlement {
            reservation: held.id,
            reserved: held.amount,
            actual,
            overshoot,
            entries,
        })
    }

    /// Engage the emergency stop by hand. Returns `false` when it was
    /// already engaged (the original reason is kept).
    pub fn trigger_emergency_stop(&self, reason: impl Into<String>) -> bool {
        let now = self.clock.now();
        match self.engage(reason.into(), now) {
            Some(event) => {
                self.publish(&[event]);
                true
            }
            None => false,
        }
    }

    fn engage(&self, reason: String, now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let mut emergency = lock(&self.emergency);
        if emergency.is_some() {
            return None;
        }
        tracing::error!(reason = %reason, "foreman.budget.emergency_stop");
        *emergency = Some(EmergencyStop {
            reason: reason.clone(),
            engaged_at: now,
        });
        Some(LifecycleEvent::EmergencyStop { reason, at: now })
    }

    /// Clear the emergency stop. `authorized_by` must name who did it.
    /// Returns the stop that was cleared, if one was engaged.
    pub fn clear_emergency_stop(
        &self,
        authorized_by: &str,
    ) -> Result<Option<EmergencyStop>, BudgetError> {
        if authorized_by.trim().is_empty() {
            return Err(BudgetError::MissingActor);
        }
        let cleared = lock(&self.emergency).take();
        if let Some(stop) = &cleared {
            tracing::warn!(
                authorized_by,
                reason = %stop.reason,
                "foreman.budget.emergency_cleared"
            );
        }
        Ok(cleared)
    }

    /// The engaged emergency stop, if any.
    pub fn emergency(&self) -> Option<EmergencyStop> {
        lock(&self.emergency).clone()
    }

    /// Whether the emergency stop is engaged.
    pub fn is_emergency_stopped(&self) -> bool {
        lock(&self.emergency).is_some()
    }

    /// Every scope, the emergency stop, the rate limiter and counters.
    pub fn get_status(&self) -> BudgetStatus {
        let now = self.clock.now();
        let scopes = self.ledger.status(now);
        let rate = {
            let mut bucket = lock(&self.rate);
            bucket.refill(now);
            bucket.state()
        };
        BudgetStatus {
            scopes,
            emergency: self.emergency(),
            rate,
            stats: lock(&self.stats).clone(),
            active_reservations: lock(&self.active).len(),
        }
    }

    /// Override one worker's daily limit.
    pub fn set_worker_limit(&self, worker: &WorkerId, limit: Decimal) {
        self.ledger.set_worker_limit(worker, limit);
    }

    /// Drop a removed worker's scope.
    pub fn remove_worker(&self, worker: &WorkerId) {
        self.ledger.remove_worker(worker);
    }

    /// Predicted cost of a run with the given token counts.
    pub fn predict_cost(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        model: Option<&str>,
    ) -> Decimal {
        self.predictor.predict(input_tokens, output_tokens, model)
    }

    /// Predicted cost of a run from a worker's token hint.
    pub fn predict_hint(&self, hint: &TokenBudgetHint) -> Decimal {
        self.predictor.predict_hint(hint)
    }

    /// Re-apply settled ledger entries after a restart.
    ///
    /// Entries outside their scope's current period are skipped. Returns
    /// the number applied. Engages the emergency stop if the replayed
    /// global daily spend is already over the threshold.
    pub fn restore(&self, entries: &[LedgerEntry]) -> usize {
        let now = self.clock.now();
        let mut applied = 0;
        let mut events = Vec::new();
        for entry in entries {
            let Ok(handles) = self
                .ledger
                .resolve(std::slice::from_ref(&entry.scope_id), now)
            else {
                tracing::warn!(scope = %entry.scope_id, "foreman.budget.restore_unknown_scope");
                continue;
            };
            for (id, scope) in &handles {
                let mut state = lock(scope);
                state.roll(now);
                if state.period.start_of(entry.timestamp) != state.period_start {
                    continue;
                }
                state.consumed += entry.amount;
                applied += 1;
                state.update_level();
                if *id == ScopeId::global_daily()
                    && state.committed() > self.config.emergency_threshold
                {
                    let reason = format!(
                        "restored global daily spend {} exceeds emergency threshold {}",
                        state.committed(),
                        self.config.emergency_threshold
                    );
                    events.extend(self.engage(reason, now));
                }
            }
        }
        tracing::info!(applied, total = entries.len(), "foreman.budget.restored");
        self.publish(&events);
        applied
    }

    fn publish(&self, events: &[LifecycleEvent]) {
        for event in events {
            if let LifecycleEvent::ScopePressure {
                scope,
                level,
                percent,
                ..
            } = event
            {
                tracing::warn!(
                    scope = %scope,
                    level = ?level,
                    percent,
                    "foreman.budget.scope_pressure"
                );
            }
            self.observers.emit(event);
        }
    }
}

impl std::fmt::Debug for BudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetEnforcer")
            .field("config", &self.config)
            .field("emergency", &self.emergency())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn daily_only(limit: i64) -> BudgetEnforcer {
        let cfg = BudgetConfig::default()
            .with_daily_limit(Decimal::new(limit, 0))
            .with_emergency_threshold(Decimal::new(limit * 2, 0))
            .with_rate_limit(RateLimitConfig::new(1000, 0.0));
        BudgetEnforcer::new(cfg).unwrap()
    }

    #[test]
    fn negative_estimate_is_invalid() {
        let e = daily_only(10);
        let err = e
            .check_and_reserve(&[ScopeId::global_daily()], Decimal::NEGATIVE_ONE, "op")
            .unwrap_err();
        assert_eq!(err, DenyReason::InvalidEstimate(Decimal::NEGATIVE_ONE));
    }

    #[test]
    fn operation_cap_applies_to_single_request() {
        let e = daily_only(100);
        let err = e
            .check_and_reserve(&[ScopeId::global_daily()], Decimal::new(31, 0), "op")
            .unwrap_err();
        assert!(matches!(err, DenyReason::OperationCap { .. }));
    }

    #[test]
    fn denial_updates_stats() {
        let e = daily_only(10);
        let _ = e.check_and_reserve(&[ScopeId::global_daily()], Decimal::new(11, 0), "op");
        let stats = e.get_status().stats;
        assert_eq!(stats.blocked_operations, 1);
        assert_eq!(stats.blocked_cost_saved, Decimal::new(11, 0));
        assert_eq!(stats.total_operations, 0);
    }

    #[test]
    fn negative_actual_settles_as_zero() {
        let e = daily_only(10);
        let r = e
            .check_and_reserve(&[ScopeId::global_daily()], Decimal::ONE, "op")
            .unwrap();
        let s = e.release_unused(&r, Decimal::NEGATIVE_ONE).unwrap();
        assert_eq!(s.actual, Decimal::ZERO);
        assert!(s.entries.is_empty());
        let daily = e.get_status().scope(&ScopeId::global_daily()).cloned().unwrap();
        assert_eq!(daily.consumed, Decimal::ZERO);
        assert_eq!(daily.reserved, Decimal::ZERO);
    }

    #[test]
    fn scopes_for_includes_configured_operation() {
        let cfg = BudgetConfig::default().with_operation_limit("llm", Decimal::new(5, 0));
        let e = BudgetEnforcer::new(cfg).unwrap();
        let w = WorkerId::new("w");
        assert_eq!(e.scopes_for(&w, "llm").len(), 4);
        assert_eq!(e.scopes_for(&w, "other").len(), 3);
    }
}
