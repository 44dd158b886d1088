//! Per-worker ROI analysis and the pause plan.
//!
//! Everything here is pure: snapshots and budget status in, verdicts out.

use crate::config::DecisionConfig;
use chrono::{DateTime, Utc};
use foreman_budget::ScopeStatus;
use foreman_core::{ScopeId, WorkerId, WorkerMetrics, WorkerSnapshot};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// What the thresholds say about a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Fewer runs than the minimum sample size.
    InsufficientData,
    /// Profitable and reliable enough to grow.
    ScaleUp,
    /// Leave it alone.
    Maintain,
    /// Losing money.
    Kill,
}

/// One worker's numbers as the engine sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAnalysis {
    /// The worker.
    pub worker: WorkerId,
    /// Counters summed over every instance.
    pub metrics: WorkerMetrics,
    /// `(revenue − cost) / max(cost, ε)`.
    pub roi: f64,
    /// Successes over runs.
    pub success_rate: f64,
    /// Instances, stopped or not.
    pub instances: usize,
    /// Instances that are not stopped.
    pub active_instances: usize,
    /// Scheduled runs per day of one instance.
    pub runs_per_day: Decimal,
    /// Projected daily spend of one instance at its average run cost.
    pub daily_cost_per_instance: Decimal,
    /// The verdict.
    pub recommendation: Recommendation,
}

impl WorkerAnalysis {
    /// Projected daily spend of the running instances.
    pub fn daily_cost(&self) -> Decimal {
        self.daily_cost_per_instance * Decimal::from(self.active_instances)
    }

    /// `min(total_runs / 100, 1)`.
    pub fn confidence(&self) -> f64 {
        (self.metrics.total_runs as f64 / 100.0).min(1.0)
    }
}

/// Analyze one worker. Retired workers are not analyzed.
pub fn analyze(snapshot: &WorkerSnapshot, config: &DecisionConfig) -> Option<WorkerAnalysis> {
    if snapshot.retired {
        return None;
    }
    let metrics = snapshot.metrics();
    let roi = metrics.roi(config.roi_epsilon);
    let success_rate = metrics.success_rate();
    let interval = snapshot.definition.run_interval.as_millis().max(1);
    let runs_per_day = Decimal::from(MILLIS_PER_DAY)
        .checked_div(Decimal::from(interval))
        .unwrap_or(Decimal::ZERO);
    let daily_cost_per_instance = metrics.avg_cost_per_run() * runs_per_day;
    let instances = snapshot.instances.len();
    let active_instances = snapshot.active_instances();

    let recommendation = if metrics.total_runs < config.min_sample_size {
        Recommendation::InsufficientData
    } else if roi >= config.scale_threshold && success_rate >= config.min_success_rate {
        let after = instances + config.scale_multiplier.saturating_sub(1) as usize;
        if snapshot.is_stopped() || after > config.max_instances {
            Recommendation::Maintain
        } else {
            Recommendation::ScaleUp
        }
    } else if roi <= config.kill_threshold {
        Recommendation::Kill
    } else {
        Recommendation::Maintain
    };

    Some(WorkerAnalysis {
        worker: snapshot.id().clone(),
        metrics,
        roi,
        success_rate,
        instances,
        active_instances,
        runs_per_day,
        daily_cost_per_instance,
        recommendation,
    })
}

/// One worker chosen to be paused.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedPause {
    pub worker: WorkerId,
    pub scope: ScopeId,
    pub roi: f64,
    pub projected: Decimal,
}

/// Pick workers to pause so that each near-exhausted global scope keeps
/// its projected spend for the rest of its period inside the remaining
/// headroom. Lowest ROI goes first. Workers in `exclude` are never
/// picked.
pub(crate) fn plan_pauses(
    analyses: &[WorkerAnalysis],
    scopes: &[ScopeStatus],
    config: &DecisionConfig,
    now: DateTime<Utc>,
    exclude: &BTreeSet<WorkerId>,
) -> Vec<PlannedPause> {
    let mut picked: Vec<PlannedPause> = Vec::new();
    let global = [ScopeId::global_daily(), ScopeId::global_hourly()];
    for scope in scopes.iter().filter(|s| global.contains(&s.scope_id)) {
        if scope.limit <= Decimal::ZERO || scope.percent < config.near_exhaustion * 100.0 {
            continue;
        }
        let remaining_ms = (scope.resets_at - now).num_milliseconds().max(0) as u64;
        let headroom = scope.remaining;

        let mut candidates: Vec<(&WorkerAnalysis, Decimal)> = analyses
            .iter()
            .filter(|a| a.active_instances > 0 && a.metrics.total_runs > 0)
            .filter(|a| !exclude.contains(&a.worker))
            .filter(|a| !picked.iter().any(|p| p.worker == a.worker))
            .map(|a| (a, projected_spend(a, remaining_ms)))
            .filter(|(_, projected)| *projected > Decimal::ZERO)
            .collect();
        candidates.sort_by(|(a, _), (b, _)| {
            a.roi
                .total_cmp(&b.roi)
                .then_with(|| a.worker.cmp(&b.worker))
        });

        let mut total: Decimal = candidates.iter().map(|(_, p)| *p).sum();
        for (analysis, projected) in candidates {
            if total <= headroom {
                break;
            }
            total -= projected;
            picked.push(PlannedPause {
                worker: analysis.worker.clone(),
                scope: scope.scope_id.clone(),
                roi: analysis.roi,
                projected,
            });
        }
    }
    picked
}

/// What the running instances will spend over `remaining_ms` at their
/// average run cost.
fn projected_spend(analysis: &WorkerAnalysis, remaining_ms: u64) -> Decimal {
    let fraction = Decimal::from(remaining_ms)
        .checked_div(Decimal::from(MILLIS_PER_DAY))
        .unwrap_or(Decimal::ZERO);
    analysis.daily_cost() * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_budget::BudgetPeriod;
    use foreman_core::{
        DurationMs, InstanceId, InstanceSnapshot, ScopeLevel, WorkerDefinition, WorkerState,
        WorkerStatus,
    };

    fn snapshot(id: &str, runs: u64, successes: u64, cost: i64, revenue: i64) -> WorkerSnapshot {
        let definition =
            WorkerDefinition::new(id, "noop").with_run_interval(DurationMs::from_hours(1));
        let mut state = WorkerState::new();
        state.status = WorkerStatus::Idle;
        state.total_runs = runs;
        state.total_successes = successes;
        state.total_failures = runs - successes;
        state.cumulative_cost = Decimal::new(cost, 0);
        state.cumulative_revenue = Decimal::new(revenue, 0);
        WorkerSnapshot {
            definition,
            instances: vec![InstanceSnapshot {
                id: InstanceId::primary(WorkerId::new(id)),
                state,
            }],
            retired: false,
        }
    }

    fn daily_scope(percent: f64, remaining: i64, resets_in_hours: i64) -> ScopeStatus {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        ScopeStatus {
            scope_id: ScopeId::global_daily(),
            limit: Decimal::new(100, 0),
            consumed: Decimal::new(100 - remaining, 0),
            reserved: Decimal::ZERO,
            remaining: Decimal::new(remaining, 0),
            percent,
            level: ScopeLevel::Critical,
            period: BudgetPeriod::Daily,
            resets_at: now + chrono::TimeDelta::hours(resets_in_hours),
        }
    }

    #[test]
    fn profitable_reliable_worker_scales() {
        let a = analyze(&snapshot("w", 20, 19, 10, 50), &DecisionConfig::default()).unwrap();
        assert_eq!(a.roi, 4.0);
        assert_eq!(a.recommendation, Recommendation::ScaleUp);
        assert_eq!(a.runs_per_day, Decimal::new(24, 0));
        // 0.50 per run, 24 runs a day
        assert_eq!(a.daily_cost(), Decimal::new(12, 0));
        assert_eq!(a.confidence(), 0.2);
    }

    #[test]
    fn unreliable_worker_is_maintained() {
        let a = analyze(&snapshot("w", 20, 10, 10, 50), &DecisionConfig::default()).unwrap();
        assert_eq!(a.recommendation, Recommendation::Maintain);
    }

    #[test]
    fn losing_worker_is_killed() {
        let a = analyze(&snapshot("w", 20, 20, 10, 0), &DecisionConfig::default()).unwrap();
        assert_eq!(a.roi, -1.0);
        assert_eq!(a.recommendation, Recommendation::Kill);
    }

    #[test]
    fn small_samples_are_left_alone() {
        let a = analyze(&snapshot("w", 19, 0, 10, 0), &DecisionConfig::default()).unwrap();
        assert_eq!(a.recommendation, Recommendation::InsufficientData);
    }

    #[test]
    fn scale_respects_instance_cap() {
        let mut snap = snapshot("w", 20, 20, 10, 50);
        let extra = snap.instances[0].clone();
        for ordinal in 1..8 {
            let mut i = extra.clone();
            i.id = InstanceId::new(WorkerId::new("w"), ordinal);
            snap.instances.push(i);
        }
        let a = analyze(&snap, &DecisionConfig::default()).unwrap();
        assert_eq!(a.recommendation, Recommendation::Maintain);
    }

    #[test]
    fn retired_workers_are_skipped() {
        let mut snap = snapshot("w", 20, 20, 10, 0);
        snap.retired = true;
        assert!(analyze(&snap, &DecisionConfig::default()).is_none());
    }

    #[test]
    fn pauses_lowest_roi_until_projection_fits() {
        let config = DecisionConfig::default();
        // Each worker projects 12/day, so 6 over the remaining 12 hours.
        let analyses: Vec<_> = [
            snapshot("good", 20, 20, 10, 50),
            snapshot("meh", 20, 20, 10, 15),
            snapshot("bad", 20, 20, 10, 11),
        ]
        .iter()
        .filter_map(|s| analyze(s, &config))
        .collect();
        let now = DateTime::<Utc>::UNIX_EPOCH;

        let plan = plan_pauses(
            &analyses,
            &[daily_scope(92.0, 8, 12)],
            &config,
            now,
            &BTreeSet::new(),
        );
        let paused: Vec<&str> = plan.iter().map(|p| p.worker.as_str()).collect();
        assert_eq!(paused, ["bad", "meh"]);
        assert_eq!(plan[0].projected, Decimal::new(6, 0));
    }

    #[test]
    fn no_pauses_below_threshold_or_for_excluded() {
        let config = DecisionConfig::default();
        let analyses: Vec<_> = [snapshot("a", 20, 20, 10, 11)]
            .iter()
            .filter_map(|s| analyze(s, &config))
            .collect();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert!(plan_pauses(&analyses, &[daily_scope(50.0, 1, 12)], &config, now, &BTreeSet::new())
            .is_empty());
        let exclude = BTreeSet::from([WorkerId::new("a")]);
        assert!(plan_pauses(&analyses, &[daily_scope(99.0, 1, 12)], &config, now, &exclude)
            .is_empty());
    }
}
