//! Named budget scopes and their per-scope locks.

use crate::config::BudgetConfig;
use crate::period::BudgetPeriod;
use chrono::{DateTime, Utc};
use foreman_core::{DenyReason, ScopeId, ScopeLevel, WorkerId};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Limit and running totals of one scope.
#[derive(Debug)]
pub(crate) struct ScopeState {
    pub(crate) limit: Decimal,
    pub(crate) consumed: Decimal,
    pub(crate) reserved: Decimal,
    pub(crate) period: BudgetPeriod,
    pub(crate) period_start: DateTime<Utc>,
    pub(crate) level: ScopeLevel,
}

impl ScopeState {
    fn new(limit: Decimal, period: BudgetPeriod, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            consumed: Decimal::ZERO,
            reserved: Decimal::ZERO,
            period,
            period_start: period.start_of(now),
            level: ScopeLevel::Healthy,
        }
    }

    /// Reset consumption if `now` is in a later period. Outstanding
    /// reservations carry over so their release stays balanced.
    pub(crate) fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let start = self.period.start_of(now);
        if start > self.period_start {
            self.period_start = start;
            self.consumed = Decimal::ZERO;
            self.level = ScopeLevel::from_percent(self.percent());
            true
        } else {
            false
        }
    }

    pub(crate) fn committed(&self) -> Decimal {
        self.consumed + self.reserved
    }

    pub(crate) fn available(&self) -> Decimal {
        (self.limit - self.committed()).max(Decimal::ZERO)
    }

    pub(crate) fn fits(&self, amount: Decimal) -> bool {
        self.committed() + amount <= self.limit
    }

    pub(crate) fn percent(&self) -> f64 {
        if self.limit <= Decimal::ZERO {
            return 100.0;
        }
        (self.committed() * Decimal::ONE_HUNDRED / self.limit)
            .to_f64()
            .unwrap_or(100.0)
    }

    /// Recompute the level. Returns it when it rose.
    pub(crate) fn update_level(&mut self) -> Option<ScopeLevel> {
        let level = ScopeLevel::from_percent(self.percent());
        let rose = level > self.level;
        self.level = level;
        rose.then_some(level)
    }

    fn status(&self, id: &ScopeId) -> ScopeStatus {
        ScopeStatus {
            scope_id: id.clone(),
            limit: self.limit,
            consumed: self.consumed,
            reserved: self.reserved,
            remaining: self.available(),
            percent: self.percent(),
            level: self.level,
            period: self.period,
            resets_at: self.period.next_reset(self.period_start),
        }
    }
}

/// Point-in-time view of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStatus {
    /// The scope.
    pub scope_id: ScopeId,
    /// Its limit for the current period.
    pub limit: Decimal,
    /// Settled spend in the current period.
    pub consumed: Decimal,
    /// Held by outstanding reservations.
    pub reserved: Decimal,
    /// `limit − consumed − reserved`, floored at zero.
    pub remaining: Decimal,
    /// `(consumed + reserved) / limit` as a percentage.
    pub percent: f64,
    /// Consumption level.
    pub level: ScopeLevel,
    /// Reset period.
    pub period: BudgetPeriod,
    /// When consumption next resets.
    pub resets_at: DateTime<Utc>,
}

pub(crate) type ScopeHandle = (ScopeId, Arc<Mutex<ScopeState>>);

/// Every budget scope, each behind its own lock.
///
/// Global and per-operation scopes exist from construction. Per-worker
/// scopes are created the first time they are named, with the worker's
/// override or the default per-worker limit. Multi-scope operations lock
/// scopes in `ScopeId` order.
#[derive(Debug)]
pub struct Ledger {
    scopes: RwLock<BTreeMap<ScopeId, Arc<Mutex<ScopeState>>>>,
    worker_limit: Decimal,
    worker_overrides: RwLock<HashMap<WorkerId, Decimal>>,
}

impl Ledger {
    /// Build the configured scopes with periods starting at `now`.
    pub fn new(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let mut scopes = BTreeMap::new();
        let mut add = |id: ScopeId, limit: Decimal, period: BudgetPeriod| {
            scopes.insert(id, Arc::new(Mutex::new(ScopeState::new(limit, period, now))));
        };
        add(ScopeId::global_daily(), config.daily_limit, BudgetPeriod::Daily);
        add(ScopeId::global_hourly(), config.hourly_limit, BudgetPeriod::Hourly);
        for (operation, limit) in &config.operation_limits {
            add(ScopeId::operation(operation), *limit, BudgetPeriod::Daily);
        }
        Self {
            scopes: RwLock::new(scopes),
            worker_limit: config.per_worker_daily_limit,
            worker_overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a scope exists (or would be created on first use).
    pub fn knows(&self, id: &ScopeId) -> bool {
        id.worker().is_some()
            || self
                .scopes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(id)
    }

    /// Set the daily limit of one worker's scope, now or when it is created.
    pub fn set_worker_limit(&self, worker: &WorkerId, limit: Decimal) {
        self.worker_overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker.clone(), limit);
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(scope) = scopes.get(&ScopeId::worker_daily(worker)) {
            lock(scope).limit = limit;
        }
    }

    /// Drop a worker's scope and override.
    pub fn remove_worker(&self, worker: &WorkerId) {
        self.worker_overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker);
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ScopeId::worker_daily(worker));
    }

    /// Status of every scope, after rolling expired periods.
    pub fn status(&self, now: DateTime<Utc>) -> Vec<ScopeStatus> {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        scopes
            .iter()
            .map(|(id, scope)| {
                let mut state = lock(scope);
                state.roll(now);
                state.status(id)
            })
            .collect()
    }

    /// Status of one scope.
    pub fn scope_status(&self, id: &ScopeId, now: DateTime<Utc>) -> Option<ScopeStatus> {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        scopes.get(id).map(|scope| {
            let mut state = lock(scope);
            state.roll(now);
            state.status(id)
        })
    }

    /// Handles for `ids`, deduplicated and in lock order. Per-worker
    /// scopes are created as needed; any other unknown id is an error.
    pub(crate) fn resolve(
        &self,
        ids: &[ScopeId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScopeHandle>, DenyReason> {
        let mut wanted: Vec<&ScopeId> = ids.iter().collect();
        wanted.sort();
        wanted.dedup();

        let mut handles = Vec::with_capacity(wanted.len());
        let mut missing = Vec::new();
        {
            let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
            for id in &wanted {
                match scopes.get(*id) {
                    Some(scope) => handles.push(((*id).clone(), Arc::clone(scope))),
                    None if id.worker().is_some() => missing.push(*id),
                    None => return Err(DenyReason::UnknownScope((*id).clone())),
                }
            }
        }
        if !missing.is_empty() {
            let overrides = self
                .worker_overrides
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
            for id in missing {
                let limit = id
                    .worker()
                    .and_then(|w| overrides.get(&w).copied())
                    .unwrap_or(self.worker_limit);
                let scope = scopes.entry(id.clone()).or_insert_with(|| {
                    Arc::new(Mutex::new(ScopeState::new(limit, BudgetPeriod::Daily, now)))
                });
                handles.push((id.clone(), Arc::clone(scope)));
            }
            handles.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::hours(30)
    }

    #[test]
    fn resolves_in_lock_order_and_creates_worker_scopes() {
        let ledger = Ledger::new(&BudgetConfig::default(), now());
        let w = WorkerId::new("alpha");
        let ids = [
            ScopeId::worker_daily(&w),
            ScopeId::global_hourly(),
            ScopeId::global_daily(),
            ScopeId::global_daily(),
        ];
        let handles = ledger.resolve(&ids, now()).unwrap();
        let order: Vec<&str> = handles.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, ["global.daily", "global.hourly", "worker.alpha.daily"]);
        assert_eq!(lock(&handles[2].1).limit, Decimal::new(10, 0));
    }

    #[test]
    fn unknown_non_worker_scope_is_denied() {
        let ledger = Ledger::new(&BudgetConfig::default(), now());
        let err = ledger
            .resolve(&[ScopeId::operation("nope")], now())
            .unwrap_err();
        assert_eq!(err, DenyReason::UnknownScope(ScopeId::operation("nope")));
    }

    #[test]
    fn worker_override_applies_before_and_after_creation() {
        let ledger = Ledger::new(&BudgetConfig::default(), now());
        let w = WorkerId::new("beta");
        ledger.set_worker_limit(&w, Decimal::new(3, 0));
        let handles = ledger.resolve(&[ScopeId::worker_daily(&w)], now()).unwrap();
        assert_eq!(lock(&handles[0].1).limit, Decimal::new(3, 0));
        ledger.set_worker_limit(&w, Decimal::new(4, 0));
        assert_eq!(lock(&handles[0].1).limit, Decimal::new(4, 0));
    }

    #[test]
    fn roll_resets_consumed_but_keeps_reserved() {
        let mut state = ScopeState::new(Decimal::TEN, BudgetPeriod::Hourly, now());
        state.consumed = Decimal::new(8, 0);
        state.reserved = Decimal::ONE;
        assert!(state.update_level().is_some());
        assert!(!state.roll(now() + TimeDelta::minutes(59)));
        assert!(state.roll(now() + TimeDelta::minutes(60)));
        assert_eq!(state.consumed, Decimal::ZERO);
        assert_eq!(state.reserved, Decimal::ONE);
        assert_eq!(state.level, ScopeLevel::Healthy);
    }
}
