//! Budget enforcer behavior through the public API.

use foreman_budget::{BudgetConfig, BudgetEnforcer, BudgetError, RateLimitConfig};
use foreman_core::test_utils::{ManualClock, RecordingObserver};
use foreman_core::*;
use std::sync::Arc;
use std::time::Duration;

fn money(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Daily limit of `daily` with plenty of rate-limit headroom.
fn config(daily: Decimal) -> BudgetConfig {
    BudgetConfig::default()
        .with_daily_limit(daily)
        .with_hourly_limit(daily)
        .with_emergency_threshold(daily * Decimal::TWO)
        .with_rate_limit(RateLimitConfig::new(1000, 0.0))
}

fn daily(enforcer: &BudgetEnforcer) -> (Decimal, Decimal) {
    let status = enforcer.get_status();
    let scope = status.scope(&ScopeId::global_daily()).unwrap();
    (scope.consumed, scope.reserved)
}

#[test]
fn scenario_a_headroom_recomputes_after_release() {
    let e = BudgetEnforcer::new(config(money(1000))).unwrap();
    let scopes = [ScopeId::global_daily()];

    let first = e.check_and_reserve(&scopes, money(600), "run").unwrap();

    let denied = e.check_and_reserve(&scopes, money(500), "run").unwrap_err();
    assert_eq!(
        denied,
        DenyReason::ScopeLimit {
            scope: ScopeId::global_daily(),
            requested: money(500),
            available: money(400),
        }
    );

    let settled = e.release_unused(&first, money(400)).unwrap();
    assert_eq!(settled.actual, money(400));
    assert_eq!(settled.overshoot, Decimal::ZERO);
    assert_eq!(daily(&e), (money(400), Decimal::ZERO));

    e.check_and_reserve(&scopes, money(500), "run").unwrap();
    assert_eq!(daily(&e), (money(400), money(500)));
}

#[test]
fn scenario_d_emergency_stop_is_sticky_until_cleared() {
    let cfg = config(money(1000)).with_emergency_threshold(money(1200));
    let observer = Arc::new(RecordingObserver::new());
    let e = BudgetEnforcer::new(cfg)
        .unwrap()
        .with_observer(observer.clone());
    let scopes = [ScopeId::global_daily()];

    let r = e.check_and_reserve(&scopes, money(500), "run").unwrap();
    // The payload overshoots its estimate far past the threshold.
    e.release_unused(&r, money(1300)).unwrap();
    assert!(e.is_emergency_stopped());
    assert!(
        observer
            .events()
            .iter()
            .any(|ev| matches!(ev, LifecycleEvent::EmergencyStop { .. }))
    );

    // Even a scope with plenty of headroom is refused.
    let w = WorkerId::new("w1");
    for scope in [ScopeId::global_hourly(), ScopeId::worker_daily(&w)] {
        let err = e.check_and_reserve(&[scope], money(1), "run").unwrap_err();
        assert_eq!(err.kind(), DenyKind::EmergencyStop);
    }

    assert!(matches!(e.clear_emergency_stop("  "), Err(BudgetError::MissingActor)));
    assert!(e.is_emergency_stopped());

    let cleared = e.clear_emergency_stop("ops-oncall").unwrap().unwrap();
    assert!(cleared.reason.contains("emergency threshold"));
    assert!(!e.is_emergency_stopped());
    e.check_and_reserve(&[ScopeId::global_hourly()], money(1), "run")
        .unwrap();
}

#[test]
fn release_twice_never_double_credits() {
    let e = BudgetEnforcer::new(config(money(1000))).unwrap();
    let r = e
        .check_and_reserve(&[ScopeId::global_daily()], money(300), "run")
        .unwrap();
    assert!(e.release_unused(&r, money(200)).is_some());
    assert!(e.release_unused(&r, money(200)).is_none());
    assert_eq!(daily(&e), (money(200), Decimal::ZERO));
    assert_eq!(e.get_status().stats.settled_operations, 1);
}

#[test]
fn all_or_nothing_across_scopes() {
    let e = BudgetEnforcer::new(config(money(1000)).with_per_worker_daily_limit(money(100)))
        .unwrap();
    let w = WorkerId::new("tight");
    let err = e.reserve_for(&w, "run", money(200)).unwrap_err();
    assert!(matches!(err, DenyReason::ScopeLimit { ref scope, .. } if *scope == ScopeId::worker_daily(&w)));
    // Nothing was held in the scopes that did have room.
    let status = e.get_status();
    for scope in &status.scopes {
        assert_eq!(scope.reserved, Decimal::ZERO, "{}", scope.scope_id);
    }
    assert_eq!(status.active_reservations, 0);
}

#[test]
fn overshoot_is_charged_and_ledgered_per_scope() {
    let e = BudgetEnforcer::new(config(money(1000))).unwrap();
    let w = WorkerId::new("w");
    let r = e.reserve_for(&w, "run", money(100)).unwrap();
    let s = e.release_unused(&r, money(150)).unwrap();
    assert_eq!(s.overshoot, money(50));
    assert_eq!(s.entries.len(), 3);
    assert!(s.entries.iter().all(|entry| entry.amount == money(150)));
    assert!(s.entries.iter().all(|entry| entry.worker_id.as_ref() == Some(&w)));
    assert_eq!(daily(&e), (money(150), Decimal::ZERO));
    assert_eq!(e.get_status().stats.total_overshoot, money(50));
}

#[test]
fn rate_limit_denies_without_holding_budget() {
    let cfg = config(money(1000)).with_rate_limit(RateLimitConfig::new(2, 60.0));
    let clock = Arc::new(ManualClock::at_epoch_day());
    let e = BudgetEnforcer::with_clock(cfg, clock.clone()).unwrap();
    let scopes = [ScopeId::global_daily()];
    e.check_and_reserve(&scopes, money(1), "run").unwrap();
    e.check_and_reserve(&scopes, money(1), "run").unwrap();
    assert_eq!(
        e.check_and_reserve(&scopes, money(1), "run").unwrap_err(),
        DenyReason::RateLimit
    );
    assert_eq!(daily(&e).1, money(2));

    clock.advance(Duration::from_secs(1));
    e.check_and_reserve(&scopes, money(1), "run").unwrap();
}

#[test]
fn hourly_scope_resets_with_its_period() {
    let clock = Arc::new(ManualClock::at_epoch_day());
    let cfg = config(money(10_000)).with_hourly_limit(money(500));
    let e = BudgetEnforcer::with_clock(cfg, clock.clone()).unwrap();
    let scopes = [ScopeId::global_hourly()];

    let r = e.check_and_reserve(&scopes, money(500), "run").unwrap();
    e.release_unused(&r, money(500)).unwrap();
    assert!(e.check_and_reserve(&scopes, money(1), "run").is_err());

    clock.advance(Duration::from_secs(3600));
    e.check_and_reserve(&scopes, money(500), "run").unwrap();
}

#[test]
fn scope_pressure_is_published_when_level_rises() {
    let observer = Arc::new(RecordingObserver::new());
    let e = BudgetEnforcer::new(config(money(1000)))
        .unwrap()
        .with_observer(observer.clone());
    let r = e
        .check_and_reserve(&[ScopeId::global_daily()], money(800), "run")
        .unwrap();
    e.release_unused(&r, money(950)).unwrap();
    let levels: Vec<ScopeLevel> = observer
        .events()
        .into_iter()
        .filter_map(|ev| match ev {
            LifecycleEvent::ScopePressure { level, .. } => Some(level),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![ScopeLevel::Warning, ScopeLevel::Critical]);
}

#[test]
fn worker_limit_override() {
    let e = BudgetEnforcer::new(config(money(10_000))).unwrap();
    let w = WorkerId::new("big");
    e.set_worker_limit(&w, money(5000));
    e.reserve_for(&w, "run", money(2000)).unwrap();
    let status = e.get_status();
    assert_eq!(
        status.scope(&ScopeId::worker_daily(&w)).unwrap().limit,
        money(5000)
    );
}

#[test]
fn restore_replays_current_period_only() {
    let clock = Arc::new(ManualClock::at_epoch_day());
    let e = BudgetEnforcer::with_clock(config(money(1000)), clock.clone()).unwrap();
    let today = clock.now();
    let yesterday = today - chrono::TimeDelta::hours(2);
    let entry = |timestamp, amount| LedgerEntry {
        timestamp,
        scope_id: ScopeId::global_daily(),
        amount,
        operation: "run".into(),
        worker_id: None,
        reservation: None,
    };
    let applied = e.restore(&[entry(yesterday, money(900)), entry(today, money(300))]);
    assert_eq!(applied, 1);
    assert_eq!(daily(&e), (money(300), Decimal::ZERO));
    assert!(!e.is_emergency_stopped());

    let applied = e.restore(&[entry(today, money(2000))]);
    assert_eq!(applied, 1);
    assert!(e.is_emergency_stopped());
}

#[test]
fn manual_trigger_keeps_first_reason() {
    let e = BudgetEnforcer::new(config(money(1000))).unwrap();
    assert!(e.trigger_emergency_stop("suspicious spend"));
    assert!(!e.trigger_emergency_stop("second"));
    assert_eq!(e.emergency().unwrap().reason, "suspicious spend");
    assert_eq!(
        e.get_status().emergency.map(|stop| stop.reason).as_deref(),
        Some("suspicious spend")
    );
}

#[test]
fn predict_cost_uses_price_table() {
    let e = BudgetEnforcer::new(BudgetConfig::default()).unwrap();
    assert_eq!(
        e.predict_cost(1_000_000, 0, Some("claude-opus-4")),
        Decimal::new(165, 1)
    );
}
