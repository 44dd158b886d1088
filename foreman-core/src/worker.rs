//! Worker definitions, runtime state and derived metrics.

use crate::duration::DurationMs;
use crate::error::ConfigError;
use crate::id::{InstanceId, WorkerId};
use crate::lifecycle::StopCause;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Token usage a worker expects per run, used to predict its cost when
/// no explicit estimate is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudgetHint {
    /// Expected input tokens per run.
    pub input_tokens: u64,
    /// Expected output tokens per run.
    pub output_tokens: u64,
    /// Model name used to look up pricing. Unknown models use the default tier.
    #[serde(default)]
    pub model: Option<String>,
}

/// Immutable description of a worker, fixed at registration.
///
/// # Examples
///
/// ```
/// use foreman_core::{DurationMs, WorkerDefinition};
///
/// let def = WorkerDefinition::new("scraper", "http_scrape")
///     .with_run_interval(DurationMs::from_secs(30))
///     .with_max_consecutive_crashes(3);
/// assert!(def.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Unique worker id. Letters, digits, `-` and `_` only.
    pub id: WorkerId,
    /// Human-readable name. Defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Payload selector, looked up in the payload registry.
    #[serde(rename = "type")]
    pub kind: String,
    /// Time between the start of consecutive runs.
    #[serde(default = "default_run_interval")]
    pub run_interval: DurationMs,
    /// Crashes in a row before the instance is stopped.
    #[serde(default = "default_max_crashes")]
    pub max_consecutive_crashes: u32,
    /// Wait after a crash before the next attempt.
    #[serde(default = "default_cooldown")]
    pub cooldown_duration: DurationMs,
    /// Expected token usage, for cost prediction.
    #[serde(default)]
    pub token_budget_hint: Option<TokenBudgetHint>,
    /// Opaque configuration passed to the payload on every run.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Fixed per-run cost estimate.
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
    /// Wall-clock limit for one run. Falls back to the supervisor default.
    #[serde(default)]
    pub execution_timeout: Option<DurationMs>,
    /// Override of the per-worker daily limit.
    #[serde(default)]
    pub daily_budget: Option<Decimal>,
}

fn default_run_interval() -> DurationMs {
    DurationMs::from_secs(60)
}

fn default_max_crashes() -> u32 {
    5
}

fn default_cooldown() -> DurationMs {
    DurationMs::from_mins(5)
}

impl WorkerDefinition {
    /// A definition with default interval (60s), crash limit (5) and
    /// cooldown (5 min).
    pub fn new(id: impl Into<WorkerId>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind: kind.into(),
            run_interval: default_run_interval(),
            max_consecutive_crashes: default_max_crashes(),
            cooldown_duration: default_cooldown(),
            token_budget_hint: None,
            config: serde_json::Value::Null,
            estimated_cost: None,
            execution_timeout: None,
            daily_budget: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the run interval.
    pub fn with_run_interval(mut self, interval: DurationMs) -> Self {
        self.run_interval = interval;
        self
    }

    /// Set the consecutive crash limit.
    pub fn with_max_consecutive_crashes(mut self, max: u32) -> Self {
        self.max_consecutive_crashes = max;
        self
    }

    /// Set the post-crash cooldown.
    pub fn with_cooldown(mut self, cooldown: DurationMs) -> Self {
        self.cooldown_duration = cooldown;
        self
    }

    /// Set the token budget hint.
    pub fn with_token_budget_hint(mut self, hint: TokenBudgetHint) -> Self {
        self.token_budget_hint = Some(hint);
        self
    }

    /// Set the payload configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Set a fixed per-run cost estimate.
    pub fn with_estimated_cost(mut self, cost: Decimal) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    /// Set the execution timeout.
    pub fn with_execution_timeout(mut self, timeout: DurationMs) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Override the per-worker daily limit.
    pub fn with_daily_budget(mut self, limit: Decimal) -> Self {
        self.daily_budget = Some(limit);
        self
    }

    /// Check the definition for values the supervisor cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.id.as_str();
        if id.is_empty() {
            return Err(ConfigError::invalid("id", "must not be empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid(
                "id",
                format!("{id:?} may only contain letters, digits, '-' and '_'"),
            ));
        }
        if self.kind.trim().is_empty() {
            return Err(ConfigError::invalid("type", "must not be empty"));
        }
        if self.run_interval.is_zero() {
            return Err(ConfigError::invalid("run_interval", "must be positive"));
        }
        if self.max_consecutive_crashes == 0 {
            return Err(ConfigError::invalid(
                "max_consecutive_crashes",
                "must be at least 1",
            ));
        }
        if let Some(cost) = self.estimated_cost
            && cost.is_sign_negative()
        {
            return Err(ConfigError::invalid("estimated_cost", "must not be negative"));
        }
        if let Some(timeout) = self.execution_timeout
            && timeout.is_zero()
        {
            return Err(ConfigError::invalid("execution_timeout", "must be positive"));
        }
        if let Some(limit) = self.daily_budget
            && limit <= Decimal::ZERO
        {
            return Err(ConfigError::invalid("daily_budget", "must be positive"));
        }
        Ok(())
    }
}

/// Where an instance is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for its next due time.
    Idle,
    /// Asking the enforcer for budget.
    Reserving,
    /// The payload is executing.
    Running,
    /// Reporting the run's cost back to the enforcer.
    Settling,
    /// Waiting out the cooldown after a crash.
    CrashBackoff,
    /// Not scheduled. See [`WorkerState::stop_cause`].
    Stopped,
}

impl WorkerStatus {
    /// Whether the instance is between reserving and settling.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Reserving | Self::Running | Self::Settling)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Reserving => "reserving",
            Self::Running => "running",
            Self::Settling => "settling",
            Self::CrashBackoff => "crash_backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Mutable runtime state of one instance. Owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    /// Current state-machine position.
    pub status: WorkerStatus,
    /// Why the instance is stopped, when it is.
    pub stop_cause: Option<StopCause>,
    /// Crashes since the last success.
    pub consecutive_crash_count: u32,
    /// When the last run started.
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the instance was last started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the next run is scheduled.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Runs attempted (reservation granted).
    pub total_runs: u64,
    /// Runs that succeeded.
    pub total_successes: u64,
    /// Runs that failed, timed out or panicked.
    pub total_failures: u64,
    /// Due cycles skipped because budget was denied.
    pub skipped_cycles: u64,
    /// Times the instance was revived by `reset`.
    pub restart_count: u32,
    /// Settled cost across all runs.
    pub cumulative_cost: Decimal,
    /// Reported revenue across all runs.
    pub cumulative_revenue: Decimal,
    /// Display form of the most recent failure.
    pub last_error: Option<String>,
}

impl WorkerState {
    /// Fresh state for a just-registered instance.
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            stop_cause: Some(StopCause::NotStarted),
            consecutive_crash_count: 0,
            last_run_at: None,
            started_at: None,
            next_run_at: None,
            total_runs: 0,
            total_successes: 0,
            total_failures: 0,
            skipped_cycles: 0,
            restart_count: 0,
            cumulative_cost: Decimal::ZERO,
            cumulative_revenue: Decimal::ZERO,
            last_error: None,
        }
    }

    /// Counters relevant to ROI analysis.
    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            total_runs: self.total_runs,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            cumulative_cost: self.cumulative_cost,
            cumulative_revenue: self.cumulative_revenue,
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run and money counters, per instance or summed over many.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Runs attempted.
    pub total_runs: u64,
    /// Runs that succeeded.
    pub total_successes: u64,
    /// Runs that failed.
    pub total_failures: u64,
    /// Settled cost.
    pub cumulative_cost: Decimal,
    /// Reported revenue.
    pub cumulative_revenue: Decimal,
}

impl WorkerMetrics {
    /// Add another set of counters into this one.
    pub fn merge(&mut self, other: &WorkerMetrics) {
        self.total_runs += other.total_runs;
        self.total_successes += other.total_successes;
        self.total_failures += other.total_failures;
        self.cumulative_cost += other.cumulative_cost;
        self.cumulative_revenue += other.cumulative_revenue;
    }

    /// Revenue minus cost.
    pub fn profit(&self) -> Decimal {
        self.cumulative_revenue - self.cumulative_cost
    }

    /// `(revenue − cost) / max(cost, epsilon)` as a ratio (1.0 = 100%).
    pub fn roi(&self, epsilon: Decimal) -> f64 {
        let denominator = self.cumulative_cost.max(epsilon);
        let profit = self.profit();
        if denominator <= Decimal::ZERO {
            return if profit > Decimal::ZERO { f64::INFINITY } else { 0.0 };
        }
        profit
            .checked_div(denominator)
            .and_then(|r| r.to_f64())
            .unwrap_or(0.0)
    }

    /// Successes over runs, or `0.0` before the first run.
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.total_successes as f64 / self.total_runs as f64
        }
    }

    /// Failures over runs, or `0.0` before the first run.
    pub fn failure_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_runs as f64
        }
    }

    /// Mean settled cost per run, or zero before the first run.
    pub fn avg_cost_per_run(&self) -> Decimal {
        if self.total_runs == 0 {
            Decimal::ZERO
        } else {
            self.cumulative_cost / Decimal::from(self.total_runs)
        }
    }
}

/// Point-in-time copy of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Which instance.
    pub id: InstanceId,
    /// Its state at the time of the snapshot.
    pub state: WorkerState,
}

/// Point-in-time copy of a worker and all of its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// The registered definition.
    pub definition: WorkerDefinition,
    /// Every instance, ordered by ordinal.
    pub instances: Vec<InstanceSnapshot>,
    /// Killed and awaiting removal.
    pub retired: bool,
}

impl WorkerSnapshot {
    /// The worker's id.
    pub fn id(&self) -> &WorkerId {
        &self.definition.id
    }

    /// Counters summed over every instance.
    pub fn metrics(&self) -> WorkerMetrics {
        let mut total = WorkerMetrics::default();
        for instance in &self.instances {
            total.merge(&instance.state.metrics());
        }
        total
    }

    /// Instances that are not stopped.
    pub fn active_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state.status != WorkerStatus::Stopped)
            .count()
    }

    /// Whether every instance is stopped.
    pub fn is_stopped(&self) -> bool {
        self.active_instances() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults() {
        let def = WorkerDefinition::new("w1", "noop");
        assert_eq!(def.name, "w1");
        assert_eq!(def.run_interval, DurationMs::from_secs(60));
        assert_eq!(def.max_consecutive_crashes, 5);
        assert_eq!(def.cooldown_duration, DurationMs::from_secs(300));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(WorkerDefinition::new("", "noop").validate().is_err());
        assert!(WorkerDefinition::new("a.b", "noop").validate().is_err());
        assert!(WorkerDefinition::new("w", " ").validate().is_err());
        assert!(
            WorkerDefinition::new("w", "noop")
                .with_run_interval(DurationMs::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            WorkerDefinition::new("w", "noop")
                .with_max_consecutive_crashes(0)
                .validate()
                .is_err()
        );
        assert!(
            WorkerDefinition::new("w", "noop")
                .with_estimated_cost(Decimal::NEGATIVE_ONE)
                .validate()
                .is_err()
        );
        assert!(
            WorkerDefinition::new("w", "noop")
                .with_daily_budget(Decimal::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let def: WorkerDefinition =
            serde_json::from_str(r#"{"id":"w","type":"noop","estimated_cost":"0.25"}"#).unwrap();
        assert_eq!(def.kind, "noop");
        assert_eq!(def.estimated_cost, Some(Decimal::new(25, 2)));
        assert_eq!(def.max_consecutive_crashes, 5);
    }

    #[test]
    fn roi_and_rates() {
        let m = WorkerMetrics {
            total_runs: 20,
            total_successes: 19,
            total_failures: 1,
            cumulative_cost: Decimal::TEN,
            cumulative_revenue: Decimal::new(50, 0),
        };
        assert!((m.roi(Decimal::new(1, 2)) - 4.0).abs() < 1e-9);
        assert!((m.success_rate() - 0.95).abs() < 1e-9);
        assert_eq!(m.avg_cost_per_run(), Decimal::new(5, 1));
        assert_eq!(m.profit(), Decimal::new(40, 0));
    }

    #[test]
    fn roi_uses_epsilon_for_zero_cost() {
        let m = WorkerMetrics {
            cumulative_revenue: Decimal::ONE,
            ..WorkerMetrics::default()
        };
        assert!((m.roi(Decimal::new(5, 1)) - 2.0).abs() < 1e-9);
        assert_eq!(WorkerMetrics::default().roi(Decimal::ZERO), 0.0);
    }

    #[test]
    fn snapshot_sums_instances() {
        let def = WorkerDefinition::new("w", "noop");
        let mut a = WorkerState::new();
        a.status = WorkerStatus::Idle;
        a.total_runs = 2;
        a.cumulative_cost = Decimal::ONE;
        let mut b = WorkerState::new();
        b.total_runs = 3;
        b.cumulative_cost = Decimal::TWO;
        let snap = WorkerSnapshot {
            definition: def,
            instances: vec![
                InstanceSnapshot {
                    id: InstanceId::new("w".into(), 0),
                    state: a,
                },
                InstanceSnapshot {
                    id: InstanceId::new("w".into(), 1),
                    state: b,
                },
            ],
            retired: false,
        };
        assert_eq!(snap.metrics().total_runs, 5);
        assert_eq!(snap.metrics().cumulative_cost, Decimal::new(3, 0));
        assert_eq!(snap.active_instances(), 1);
    }
}
