//! Decision engine behavior against a recording control surface.

use foreman_audit_memory::MemoryAuditLog;
use foreman_budget::{BudgetConfig, BudgetEnforcer, RateLimitConfig};
use foreman_core::test_utils::{ControlCall, ManualClock, RecordingControl};
use foreman_core::*;
use foreman_decision::{DecisionConfig, DecisionEngine};
use std::sync::Arc;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A one-instance worker on an hourly interval with `runs` runs, of
/// which `successes` succeeded, costing `cost` and earning `revenue`.
fn worker(id: &str, runs: u64, successes: u64, cost: i64, revenue: i64) -> WorkerSnapshot {
    let mut state = WorkerState::new();
    state.status = WorkerStatus::Idle;
    state.total_runs = runs;
    state.total_successes = successes;
    state.total_failures = runs - successes;
    state.cumulative_cost = Decimal::new(cost, 0);
    state.cumulative_revenue = Decimal::new(revenue, 0);
    WorkerSnapshot {
        definition: WorkerDefinition::new(id, "noop")
            .with_run_interval(DurationMs::from_hours(1)),
        instances: vec![InstanceSnapshot {
            id: InstanceId::primary(WorkerId::new(id)),
            state,
        }],
        retired: false,
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    control: Arc<RecordingControl>,
    enforcer: Arc<BudgetEnforcer>,
}

impl Harness {
    fn new(snapshots: Vec<WorkerSnapshot>) -> Self {
        let clock = Arc::new(ManualClock::at_epoch_day());
        let budget = BudgetConfig::default()
            .with_daily_limit(Decimal::new(100, 0))
            .with_hourly_limit(Decimal::new(1000, 0))
            .with_max_operation_cost(Decimal::new(100, 0))
            .with_emergency_threshold(Decimal::new(200, 0))
            .with_rate_limit(RateLimitConfig::new(1000, 0.0));
        let enforcer = Arc::new(BudgetEnforcer::with_clock(budget, clock.clone()).unwrap());
        Self {
            clock,
            control: Arc::new(RecordingControl::new(snapshots)),
            enforcer,
        }
    }

    fn engine(&self, config: DecisionConfig) -> DecisionEngine {
        DecisionEngine::builder(self.control.clone(), self.enforcer.clone())
            .config(config)
            .clock(self.clock.clone())
            .build()
            .unwrap()
    }

    fn engine_with_audit(&self, config: DecisionConfig, audit: Arc<MemoryAuditLog>) -> DecisionEngine {
        DecisionEngine::builder(self.control.clone(), self.enforcer.clone())
            .config(config)
            .clock(self.clock.clone())
            .audit(audit)
            .build()
            .unwrap()
    }
}

fn scale(id: &str) -> ControlCall {
    ControlCall::Scale(WorkerId::new(id), 2)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ROI decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn scenario_b_profitable_worker_is_scaled_automatically() {
    let h = Harness::new(vec![worker("w", 20, 19, 10, 50)]);
    let engine = h.engine(DecisionConfig::default());

    let made = engine.run_cycle().await;
    assert_eq!(made.len(), 1);
    let d = &made[0];
    assert_eq!(d.action, DecisionKind::ScaleUp { multiplier: 2 });
    assert_eq!(d.status, DecisionStatus::AutoExecuted);
    // 0.50 a run, 24 runs a day, one extra instance
    assert_eq!(d.cost_impact, Decimal::new(12, 0));
    assert_eq!(d.confidence, 0.2);
    assert_eq!(h.control.calls(), vec![scale("w")]);
    assert_eq!(engine.spent_today(), Decimal::new(12, 0));
}

#[tokio::test]
async fn scenario_c_unprofitable_worker_is_killed() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 0)]);
    let engine = h.engine(DecisionConfig::default());

    let made = engine.run_cycle().await;
    assert_eq!(made.len(), 1);
    assert_eq!(made[0].action, DecisionKind::Kill);
    assert_eq!(made[0].status, DecisionStatus::AutoExecuted);
    assert_eq!(made[0].cost_impact, Decimal::new(-12, 0));
    assert_eq!(h.control.calls(), vec![ControlCall::Kill(WorkerId::new("w"))]);
    // Savings are never charged.
    assert_eq!(engine.spent_today(), Decimal::ZERO);
}

#[tokio::test]
async fn small_samples_and_middling_roi_are_left_alone() {
    let h = Harness::new(vec![
        worker("young", 5, 0, 10, 0),
        worker("steady", 40, 40, 10, 20),
    ]);
    let engine = h.engine(DecisionConfig::default());
    assert!(engine.run_cycle().await.is_empty());
    assert!(h.control.calls().is_empty());
}

#[tokio::test]
async fn disabled_engine_decides_nothing() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 0)]);
    let engine = h.engine(DecisionConfig::default().with_enabled(false));
    assert!(engine.run_cycle().await.is_empty());
    assert!(h.control.calls().is_empty());
}

#[tokio::test]
async fn daily_decision_budget_drops_proposals_that_do_not_fit() {
    let h = Harness::new(vec![
        worker("a", 20, 20, 10, 50),
        worker("b", 20, 20, 10, 50),
    ]);
    let engine = h.engine(DecisionConfig::default().with_daily_decision_budget(Decimal::new(20, 0)));

    let made = engine.run_cycle().await;
    assert_eq!(made.len(), 1);
    assert_eq!(h.control.calls(), vec![scale("a")]);

    // A new day frees the budget again.
    h.clock.advance(Duration::from_secs(86_400));
    assert_eq!(engine.spent_today(), Decimal::ZERO);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budget pressure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn near_exhaustion_pauses_lowest_roi_first() {
    let h = Harness::new(vec![
        worker("good", 20, 20, 10, 50),
        worker("meh", 20, 20, 10, 15),
        worker("bad", 20, 20, 10, 11),
    ]);
    // Midday, 92 of 100 spent: 8 left for the next 12 hours.
    h.clock.advance(Duration::from_secs(12 * 3600));
    let held = h
        .enforcer
        .check_and_reserve(&[ScopeId::global_daily()], Decimal::new(92, 0), "seed")
        .unwrap();
    h.enforcer.release_unused(&held, Decimal::new(92, 0)).unwrap();

    let engine = h.engine(DecisionConfig::default());
    let made = engine.run_cycle().await;

    // Each worker projects 6 over the rest of the day. Pausing two leaves 6.
    assert_eq!(
        h.control.calls(),
        vec![
            ControlCall::Pause(WorkerId::new("bad")),
            ControlCall::Pause(WorkerId::new("meh")),
            scale("good"),
        ]
    );
    let pause = &made[0];
    assert_eq!(pause.action, DecisionKind::Pause);
    assert_eq!(pause.cost_impact, Decimal::new(-12, 0));
    assert!(pause.rationale.contains("global.daily"));
}

#[tokio::test]
async fn killed_workers_are_not_also_paused() {
    let h = Harness::new(vec![worker("loser", 20, 20, 10, 0), worker("ok", 20, 20, 10, 12)]);
    h.clock.advance(Duration::from_secs(12 * 3600));
    let held = h
        .enforcer
        .check_and_reserve(&[ScopeId::global_daily()], Decimal::new(95, 0), "seed")
        .unwrap();
    h.enforcer.release_unused(&held, Decimal::new(95, 0)).unwrap();

    let engine = h.engine(DecisionConfig::default());
    engine.run_cycle().await;
    assert_eq!(
        h.control.calls(),
        vec![
            ControlCall::Kill(WorkerId::new("loser")),
            ControlCall::Pause(WorkerId::new("ok")),
        ]
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval outbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn large_impact_waits_for_approval() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 50)]);
    let engine = h.engine(DecisionConfig::default().with_approval_threshold(Decimal::new(5, 0)));

    let made = engine.run_cycle().await;
    assert_eq!(made[0].status, DecisionStatus::PendingApproval);
    assert!(h.control.calls().is_empty());
    assert_eq!(engine.list_pending().len(), 1);

    // Not proposed again while pending.
    assert!(engine.run_cycle().await.is_empty());

    let id = made[0].id.clone();
    assert!(matches!(
        engine.approve(&id, "  ").await,
        Err(DecisionError::MissingActor)
    ));
    let approved = engine.approve(&id, "ops").await.unwrap();
    assert_eq!(approved.status, DecisionStatus::Approved);
    assert_eq!(approved.resolved_by.as_deref(), Some("ops"));
    assert_eq!(h.control.calls(), vec![scale("w")]);
    assert_eq!(engine.spent_today(), Decimal::new(12, 0));
    assert!(engine.list_pending().is_empty());

    assert!(matches!(
        engine.approve(&id, "ops").await,
        Err(DecisionError::NotPending {
            status: DecisionStatus::Approved,
            ..
        })
    ));
}

#[tokio::test]
async fn rejected_decisions_are_never_applied() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 0)]);
    let engine = h.engine(DecisionConfig::default().with_approval_threshold(Decimal::ONE));

    let id = engine.run_cycle().await[0].id.clone();
    let rejected = engine.reject(&id, "ops").await.unwrap();
    assert_eq!(rejected.status, DecisionStatus::Rejected);
    assert!(h.control.calls().is_empty());
    assert!(matches!(
        engine.reject(&DecisionId::new("missing"), "ops").await,
        Err(DecisionError::NotFound(_))
    ));
}

#[tokio::test]
async fn failed_apply_is_recorded() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 0)]);
    let engine = h.engine(DecisionConfig::default().with_approval_threshold(Decimal::ONE));
    let id = engine.run_cycle().await[0].id.clone();

    // The worker went away before anyone approved.
    h.control.set_snapshots(Vec::new());
    let err = engine.approve(&id, "ops").await.unwrap_err();
    assert!(matches!(
        err,
        DecisionError::Apply(SupervisorError::WorkerNotFound(_))
    ));
    let stored = engine.outbox().get(&id).unwrap();
    assert_eq!(stored.status, DecisionStatus::Failed);
    assert!(stored.error.is_some());
}

#[tokio::test]
async fn pending_decisions_survive_a_restart() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 50)]);
    let audit = Arc::new(MemoryAuditLog::new());
    let config = DecisionConfig::default().with_approval_threshold(Decimal::new(5, 0));

    let first = h.engine_with_audit(config.clone(), audit.clone());
    let id = first.run_cycle().await[0].id.clone();
    drop(first);

    let second = h.engine_with_audit(config, audit.clone());
    assert_eq!(second.restore().await.unwrap(), 1);
    assert_eq!(second.list_pending()[0].id, id);
    second.approve(&id, "ops").await.unwrap();
    assert_eq!(h.control.calls(), vec![scale("w")]);

    let records = audit.decisions().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].decision.status, DecisionStatus::Approved);
}

#[tokio::test]
async fn restore_recharges_todays_spend() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 50)]);
    let audit = Arc::new(MemoryAuditLog::new());
    let first = h.engine_with_audit(DecisionConfig::default(), audit.clone());
    first.run_cycle().await;

    let second = h.engine_with_audit(DecisionConfig::default(), audit);
    assert_eq!(second.restore().await.unwrap(), 0);
    assert_eq!(second.spent_today(), Decimal::new(12, 0));
    assert_eq!(second.outbox().history().len(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deploy proposals and the loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn deploy_proposals_are_gated_by_roi_and_cost() {
    let h = Harness::new(Vec::new());
    let engine = h.engine(DecisionConfig::default());
    let def = WorkerDefinition::new("fresh", "noop");

    let low = engine
        .propose_deploy(def.clone(), 1.0, Decimal::new(10, 0))
        .await
        .unwrap();
    assert!(low.is_none());

    let small = engine
        .propose_deploy(def.clone(), 2.0, Decimal::new(10, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(small.status, DecisionStatus::AutoExecuted);
    assert_eq!(small.confidence, 0.5);
    assert_eq!(h.control.calls(), vec![ControlCall::Deploy(WorkerId::new("fresh"))]);

    let big = engine
        .propose_deploy(WorkerDefinition::new("big", "noop"), 2.0, Decimal::new(60, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(big.status, DecisionStatus::PendingApproval);
    assert_eq!(h.control.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn spawned_engine_runs_every_period() {
    let h = Harness::new(vec![worker("w", 20, 20, 10, 0)]);
    let engine = h.engine(DecisionConfig::default().with_period(DurationMs::from_mins(10)));
    let handle = engine.spawn();

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert!(h.control.calls().is_empty());

    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    assert_eq!(h.control.calls(), vec![ControlCall::Kill(WorkerId::new("w"))]);

    handle.shutdown().await;
}
