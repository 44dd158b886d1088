//! Health classification of worker instances.

use chrono::{DateTime, Utc};
use foreman_core::{
    ConfigError, InstanceId, StopCause, WorkerDefinition, WorkerId, WorkerState, WorkerStatus,
};
use serde::{Deserialize, Serialize};

/// Thresholds for [`HealthState::Unhealthy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// An instance is stale when its last run (or start) is older than
    /// this many run intervals. Cooldown replaces the interval while the
    /// instance is backing off.
    pub staleness_factor: f64,
    /// Failure ratio above which an instance is unhealthy.
    pub max_failure_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            staleness_factor: 2.0,
            max_failure_rate: 0.2,
        }
    }
}

impl HealthConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(self.staleness_factor >= 1.0) {
            return Err(ConfigError::invalid(
                "supervisor.health.staleness_factor",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(ConfigError::invalid(
                "supervisor.health.max_failure_rate",
                "must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Coarse health of an instance or worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Not running by request, or not started yet.
    Stopped,
    /// Running on schedule with an acceptable failure rate.
    Healthy,
    /// Stale, failing too often, or stopped by its crash limit.
    Unhealthy,
}

/// Health of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    /// The instance.
    pub instance: InstanceId,
    /// Its classification.
    pub state: HealthState,
    /// Why it is unhealthy. Empty otherwise.
    pub reasons: Vec<String>,
}

/// Health of a worker: the worst of its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// The worker.
    pub worker: WorkerId,
    /// Worst instance state (`Unhealthy` over `Healthy` over `Stopped`).
    pub state: HealthState,
    /// Per-instance detail.
    pub instances: Vec<InstanceHealth>,
}

/// Result of a health check over every worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// When the check ran.
    pub checked_at: Option<DateTime<Utc>>,
    /// Every worker, in id order.
    pub workers: Vec<WorkerHealth>,
}

impl HealthReport {
    /// Workers classified healthy.
    pub fn healthy(&self) -> Vec<&WorkerId> {
        self.with_state(HealthState::Healthy)
    }

    /// Workers classified unhealthy.
    pub fn unhealthy(&self) -> Vec<&WorkerId> {
        self.with_state(HealthState::Unhealthy)
    }

    /// Whether no worker is unhealthy.
    pub fn all_healthy(&self) -> bool {
        self.unhealthy().is_empty()
    }

    fn with_state(&self, state: HealthState) -> Vec<&WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.state == state)
            .map(|w| &w.worker)
            .collect()
    }
}

/// Classify one instance.
pub(crate) fn classify(
    definition: &WorkerDefinition,
    id: &InstanceId,
    state: &WorkerState,
    now: DateTime<Utc>,
    config: &HealthConfig,
) -> InstanceHealth {
    let mut reasons = Vec::new();
    if state.status == WorkerStatus::Stopped {
        if state.stop_cause == Some(StopCause::CrashLimit) {
            reasons.push(format!(
                "stopped after {} consecutive crashes",
                state.consecutive_crash_count
            ));
        }
    } else {
        let window = if state.status == WorkerStatus::CrashBackoff {
            definition.cooldown_duration.max(definition.run_interval)
        } else {
            definition.run_interval
        };
        let allowance = window.as_secs_f64() * config.staleness_factor;
        if let Some(reference) = state.last_run_at.or(state.started_at) {
            let age = (now - reference).num_milliseconds() as f64 / 1000.0;
            if age > allowance {
                reasons.push(format!(
                    "no run for {age:.0}s (allowed {allowance:.0}s)"
                ));
            }
        }
        let failure_rate = state.metrics().failure_rate();
        if state.total_runs > 0 && failure_rate > config.max_failure_rate {
            reasons.push(format!(
                "failure rate {:.0}% above {:.0}%",
                failure_rate * 100.0,
                config.max_failure_rate * 100.0
            ));
        }
    }
    let health = if !reasons.is_empty() {
        HealthState::Unhealthy
    } else if state.status == WorkerStatus::Stopped {
        HealthState::Stopped
    } else {
        HealthState::Healthy
    };
    InstanceHealth {
        instance: id.clone(),
        state: health,
        reasons,
    }
}
