//! The decision engine.

use crate::analysis::{Recommendation, WorkerAnalysis, analyze, plan_pauses};
use crate::config::DecisionConfig;
use crate::outbox::ApprovalOutbox;
use chrono::{DateTime, NaiveDate, Utc};
use foreman_budget::BudgetEnforcer;
use foreman_core::audit::latest_decisions;
use foreman_core::{
    AuditLog, Clock, ConfigError, Decision, DecisionError, DecisionId, DecisionKind,
    DecisionRecord, DecisionStatus, SupervisorError, SystemClock, WorkerControl,
    WorkerDefinition, WorkerId,
};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Positive cost impact of executed decisions, per UTC day.
#[derive(Debug)]
struct DailySpend {
    day: NaiveDate,
    spent: Decimal,
}

impl DailySpend {
    fn roll(&mut self, today: NaiveDate) {
        if today != self.day {
            self.day = today;
            self.spent = Decimal::ZERO;
        }
    }
}

/// Builder for [`DecisionEngine`].
pub struct DecisionEngineBuilder {
    control: Arc<dyn WorkerControl>,
    enforcer: Arc<BudgetEnforcer>,
    config: DecisionConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl DecisionEngineBuilder {
    /// Replace the default configuration.
    pub fn config(mut self, config: DecisionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock for decision timestamps and the daily decision
    /// budget. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record every decision status change in `audit`.
    pub fn audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and build.
    pub fn build(self) -> Result<DecisionEngine, ConfigError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let today = clock.now().date_naive();
        Ok(DecisionEngine {
            inner: Arc::new(Inner {
                config: self.config,
                control: self.control,
                enforcer: self.enforcer,
                clock,
                audit: self.audit,
                outbox: ApprovalOutbox::new(),
                spend: Mutex::new(DailySpend {
                    day: today,
                    spent: Decimal::ZERO,
                }),
                cycle: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

struct Inner {
    config: DecisionConfig,
    control: Arc<dyn WorkerControl>,
    enforcer: Arc<BudgetEnforcer>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditLog>>,
    outbox: ApprovalOutbox,
    spend: Mutex<DailySpend>,
    cycle: tokio::sync::Mutex<()>,
}

/// Reads worker metrics, decides and applies.
///
/// Each cycle analyzes every worker through [`WorkerControl::snapshots`],
/// proposes scale-ups and kills from ROI, and pauses the lowest-ROI
/// workers when a global budget scope is close to exhaustion. Decisions
/// whose cost impact exceeds the approval threshold wait in the
/// [`ApprovalOutbox`]; the rest are applied at once. Approved decisions
/// are applied through the same path.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct DecisionEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.inner.config)
            .field("outbox", &self.inner.outbox)
            .finish()
    }
}

impl DecisionEngine {
    /// Start building an engine that acts through `control` and reads
    /// budget pressure from `enforcer`.
    pub fn builder(
        control: Arc<dyn WorkerControl>,
        enforcer: Arc<BudgetEnforcer>,
    ) -> DecisionEngineBuilder {
        DecisionEngineBuilder {
            control,
            enforcer,
            config: DecisionConfig::default(),
            clock: None,
            audit: None,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &DecisionConfig {
        &self.inner.config
    }

    /// The outbox holding pending and recently resolved decisions.
    pub fn outbox(&self) -> &ApprovalOutbox {
        &self.inner.outbox
    }

    /// Decisions awaiting approval, oldest first.
    pub fn list_pending(&self) -> Vec<Decision> {
        self.inner.outbox.list_pending()
    }

    /// Positive cost impact executed today.
    pub fn spent_today(&self) -> Decimal {
        let mut spend = lock(&self.inner.spend);
        spend.roll(self.inner.clock.now().date_naive());
        spend.spent
    }

    /// Analyze every registered worker without deciding anything.
    pub async fn analyze(&self) -> Vec<WorkerAnalysis> {
        self.inner
            .control
            .snapshots()
            .await
            .iter()
            .filter_map(|s| analyze(s, &self.inner.config))
            .collect()
    }

    /// Run one decision cycle. Returns the decisions made, executed or
    /// pending.
    ///
    /// Workers with a decision already pending are left out. Cycles never
    /// overlap; a second caller waits for the first to finish.
    pub async fn run_cycle(&self) -> Vec<Decision> {
        let inner = &self.inner;
        if !inner.config.enabled {
            tracing::debug!("foreman.decision.disabled");
            return Vec::new();
        }
        let _cycle = inner.cycle.lock().await;
        let now = inner.clock.now();
        let analyses: Vec<WorkerAnalysis> = self
            .analyze()
            .await
            .into_iter()
            .filter(|a| !inner.outbox.has_pending_for(&a.worker))
            .collect();

        let mut killed = BTreeSet::new();
        let mut scale_ups = Vec::new();
        let mut proposals = Vec::new();
        for analysis in &analyses {
            match analysis.recommendation {
                Recommendation::ScaleUp => scale_ups.push(self.scale_proposal(analysis, now)),
                Recommendation::Kill => {
                    killed.insert(analysis.worker.clone());
                    proposals.push(self.kill_proposal(analysis, now));
                }
                Recommendation::InsufficientData | Recommendation::Maintain => {}
            }
        }

        let status = inner.enforcer.get_status();
        let pauses = plan_pauses(&analyses, &status.scopes, &inner.config, now, &killed);
        for pause in &pauses {
            let Some(analysis) = analyses.iter().find(|a| a.worker == pause.worker) else {
                continue;
            };
            let decision = self
                .new_decision(DecisionKind::Pause, pause.worker.clone(), now)
                .with_rationale(format!(
                    "{} near exhaustion; ROI {:.2} is the lowest running and projects {} more spend this period",
                    pause.scope, pause.roi, pause.projected.round_dp(2)
                ))
                .with_cost_impact(-analysis.daily_cost())
                .with_expected_roi_impact(-pause.roi)
                .with_confidence(analysis.confidence());
            proposals.push(decision);
        }
        proposals.extend(
            scale_ups
                .into_iter()
                .filter(|d| !pauses.iter().any(|p| p.worker == d.target)),
        );

        let mut made = Vec::with_capacity(proposals.len());
        for decision in proposals {
            match self.submit(decision).await {
                Ok(Some(decision)) => made.push(decision),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "foreman.decision.submit_failed");
                }
            }
        }
        tracing::info!(
            workers = analyses.len(),
            decisions = made.len(),
            "foreman.decision.cycle"
        );
        made
    }

    /// Propose deploying a new worker. Dropped (returns `None`) while
    /// disabled, when `expected_roi` is below the deploy minimum, or when
    /// the daily decision budget cannot cover `estimated_daily_cost`.
    pub async fn propose_deploy(
        &self,
        definition: WorkerDefinition,
        expected_roi: f64,
        estimated_daily_cost: Decimal,
    ) -> Result<Option<Decision>, DecisionError> {
        let config = &self.inner.config;
        if !config.enabled {
            return Ok(None);
        }
        if expected_roi < config.min_deploy_roi {
            tracing::info!(
                worker = %definition.id,
                expected_roi,
                min_roi = config.min_deploy_roi,
                "foreman.decision.deploy_below_threshold"
            );
            return Ok(None);
        }
        definition.validate().map_err(SupervisorError::from)?;
        let target = definition.id.clone();
        let decision = self
            .new_decision(
                DecisionKind::Deploy {
                    definition: Box::new(definition),
                },
                target,
                self.inner.clock.now(),
            )
            .with_rationale(format!("expected ROI {expected_roi:.2}"))
            .with_cost_impact(estimated_daily_cost)
            .with_expected_roi_impact(expected_roi)
            .with_confidence(0.5);
        self.submit(decision).await
    }

    /// Approve a pending decision and apply it.
    ///
    /// When applying fails the decision is recorded as
    /// [`DecisionStatus::Failed`] and the error is returned.
    pub async fn approve(&self, id: &DecisionId, actor: &str) -> Result<Decision, DecisionError> {
        let actor = require_actor(actor)?;
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut decision = inner
            .outbox
            .claim(id, DecisionStatus::Approved, actor, now)?;
        match self.apply(&decision).await {
            Ok(()) => {
                self.charge(&decision, now);
                tracing::info!(
                    id = %decision.id,
                    action = decision.action.label(),
                    target = %decision.target,
                    actor,
                    "foreman.decision.approved"
                );
                self.record(&decision, now).await;
                Ok(decision)
            }
            Err(error) => {
                decision.status = DecisionStatus::Failed;
                decision.error = Some(error.to_string());
                inner.outbox.update(&decision);
                tracing::warn!(
                    id = %decision.id,
                    action = decision.action.label(),
                    target = %decision.target,
                    error = %error,
                    "foreman.decision.apply_failed"
                );
                self.record(&decision, now).await;
                Err(error.into())
            }
        }
    }

    /// Reject a pending decision. It is never applied.
    pub async fn reject(&self, id: &DecisionId, actor: &str) -> Result<Decision, DecisionError> {
        let actor = require_actor(actor)?;
        let now = self.inner.clock.now();
        let decision = self
            .inner
            .outbox
            .claim(id, DecisionStatus::Rejected, actor, now)?;
        tracing::info!(
            id = %decision.id,
            action = decision.action.label(),
            target = %decision.target,
            actor,
            "foreman.decision.rejected"
        );
        self.record(&decision, now).await;
        Ok(decision)
    }

    /// Rebuild the outbox from the decision log and re-charge today's
    /// executed decisions against the daily decision budget. Returns how
    /// many pending decisions were restored.
    pub async fn restore(&self) -> Result<usize, DecisionError> {
        let Some(audit) = &self.inner.audit else {
            return Ok(0);
        };
        let records = audit.decisions().await?;
        let decisions = latest_decisions(&records);
        let today = self.inner.clock.now().date_naive();
        {
            let mut spend = lock(&self.inner.spend);
            spend.roll(today);
            for decision in &decisions {
                let executed = matches!(
                    decision.status,
                    DecisionStatus::AutoExecuted | DecisionStatus::Approved
                );
                let day = decision.resolved_at.unwrap_or(decision.created_at).date_naive();
                if executed && day == today && decision.cost_impact > Decimal::ZERO {
                    spend.spent += decision.cost_impact;
                }
            }
        }
        let pending = self.inner.outbox.restore(decisions);
        tracing::info!(pending, "foreman.decision.restored");
        Ok(pending)
    }

    /// Run [`DecisionEngine::run_cycle`] every `period` on a new task.
    /// The first cycle runs one period after the call.
    pub fn spawn(&self) -> EngineHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.inner.config.period.to_std();
        let task = tokio::spawn(async move {
            tracing::info!(period_ms = period.as_millis() as u64, "foreman.decision.started");
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(period) => {
                        engine.run_cycle().await;
                    }
                }
            }
            tracing::info!("foreman.decision.stopped");
        });
        EngineHandle { shutdown, task }
    }

    fn new_decision(&self, action: DecisionKind, target: WorkerId, now: DateTime<Utc>) -> Decision {
        Decision::new(DecisionId::new(format!("dec-{}", Uuid::new_v4())), action, target, now)
    }

    fn scale_proposal(&self, analysis: &WorkerAnalysis, now: DateTime<Utc>) -> Decision {
        let multiplier = self.inner.config.scale_multiplier;
        let added = Decimal::from(multiplier.saturating_sub(1));
        self.new_decision(DecisionKind::ScaleUp { multiplier }, analysis.worker.clone(), now)
            .with_rationale(format!(
                "ROI {:.2} and success rate {:.0}% over {} runs",
                analysis.roi,
                analysis.success_rate * 100.0,
                analysis.metrics.total_runs
            ))
            .with_cost_impact(analysis.daily_cost_per_instance * added)
            .with_expected_roi_impact(analysis.roi)
            .with_confidence(analysis.confidence())
    }

    fn kill_proposal(&self, analysis: &WorkerAnalysis, now: DateTime<Utc>) -> Decision {
        let saved = analysis.daily_cost();
        self.new_decision(DecisionKind::Kill, analysis.worker.clone(), now)
            .with_rationale(format!(
                "ROI {:.2} at or below {:.2} over {} runs; profit {}",
                analysis.roi,
                self.inner.config.kill_threshold,
                analysis.metrics.total_runs,
                analysis.metrics.profit()
            ))
            .with_cost_impact(-saved)
            .with_expected_roi_impact(-analysis.roi)
            .with_confidence(analysis.confidence())
    }

    /// Park or apply a proposal. `None` when the daily decision budget
    /// cannot cover it.
    async fn submit(&self, mut decision: Decision) -> Result<Option<Decision>, DecisionError> {
        let inner = &self.inner;
        let now = decision.created_at;
        if !self.fits_budget(&decision, now) {
            tracing::warn!(
                action = decision.action.label(),
                target = %decision.target,
                cost_impact = %decision.cost_impact,
                "foreman.decision.over_budget"
            );
            return Ok(None);
        }

        if decision.cost_impact.abs() > inner.config.approval_threshold {
            decision.status = DecisionStatus::PendingApproval;
            // Durable before it becomes approvable.
            if let Some(audit) = &inner.audit {
                audit
                    .append_decision(DecisionRecord {
                        recorded_at: now,
                        decision: decision.clone(),
                    })
                    .await?;
            }
            inner.outbox.insert(decision.clone());
            tracing::info!(
                id = %decision.id,
                action = decision.action.label(),
                target = %decision.target,
                cost_impact = %decision.cost_impact,
                "foreman.decision.pending"
            );
            return Ok(Some(decision));
        }

        match self.apply(&decision).await {
            Ok(()) => {
                decision.resolve(DecisionStatus::AutoExecuted, None, now);
                self.charge(&decision, now);
                tracing::info!(
                    id = %decision.id,
                    action = decision.action.label(),
                    target = %decision.target,
                    cost_impact = %decision.cost_impact,
                    confidence = decision.confidence,
                    "foreman.decision.executed"
                );
            }
            Err(error) => {
                decision.resolve(DecisionStatus::Failed, None, now);
                decision.error = Some(error.to_string());
                tracing::warn!(
                    id = %decision.id,
                    action = decision.action.label(),
                    target = %decision.target,
                    error = %error,
                    "foreman.decision.apply_failed"
                );
            }
        }
        inner.outbox.insert(decision.clone());
        self.record(&decision, now).await;
        Ok(Some(decision))
    }

    async fn apply(&self, decision: &Decision) -> Result<(), SupervisorError> {
        let control = &self.inner.control;
        match &decision.action {
            DecisionKind::ScaleUp { multiplier } => {
                control.scale(&decision.target, *multiplier).await.map(drop)
            }
            DecisionKind::Pause => control.pause(&decision.target).await,
            DecisionKind::Kill => control.kill(&decision.target).await,
            DecisionKind::Deploy { definition } => {
                control.deploy(definition.as_ref().clone()).await.map(drop)
            }
        }
    }

    fn fits_budget(&self, decision: &Decision, now: DateTime<Utc>) -> bool {
        if decision.cost_impact <= Decimal::ZERO {
            return true;
        }
        let mut spend = lock(&self.inner.spend);
        spend.roll(now.date_naive());
        spend.spent + decision.cost_impact <= self.inner.config.daily_decision_budget
    }

    fn charge(&self, decision: &Decision, now: DateTime<Utc>) {
        if decision.cost_impact <= Decimal::ZERO {
            return;
        }
        let mut spend = lock(&self.inner.spend);
        spend.roll(now.date_naive());
        spend.spent += decision.cost_impact;
        tracing::debug!(
            spent = %spend.spent,
            budget = %self.inner.config.daily_decision_budget,
            "foreman.decision.budget_charged"
        );
    }

    /// Append a resolved version to the decision log. Failures are
    /// logged; the decision has already taken effect.
    async fn record(&self, decision: &Decision, now: DateTime<Utc>) {
        let Some(audit) = &self.inner.audit else {
            return;
        };
        let record = DecisionRecord {
            recorded_at: now,
            decision: decision.clone(),
        };
        if let Err(error) = audit.append_decision(record).await {
            tracing::warn!(
                id = %decision.id,
                error = %error,
                "foreman.audit.append_failed"
            );
        }
    }
}

fn require_actor(actor: &str) -> Result<&str, DecisionError> {
    let actor = actor.trim();
    if actor.is_empty() {
        Err(DecisionError::MissingActor)
    } else {
        Ok(actor)
    }
}

/// Handle to a spawned engine loop.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop the loop. A cycle already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::error!(error = %error, "foreman.decision.join_failed");
        }
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
