//! Supervisor configuration.

use crate::health::HealthConfig;
use foreman_core::{ConfigError, DurationMs};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Settings for the supervisor and its dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Cycles that may run at once across all workers.
    pub max_concurrency: usize,
    /// Estimate reserved when neither the payload, the definition nor a
    /// token hint provides one.
    pub default_estimated_cost: Decimal,
    /// Execution timeout for definitions that do not set one.
    pub default_execution_timeout: DurationMs,
    /// Operation label passed to the enforcer for worker runs.
    pub operation: String,
    /// Denominator floor used when computing ROI.
    pub roi_epsilon: Decimal,
    /// Health classification thresholds.
    pub health: HealthConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_estimated_cost: Decimal::new(5, 2),
            default_execution_timeout: DurationMs::from_mins(5),
            operation: "worker_run".to_owned(),
            roi_epsilon: Decimal::new(1, 2),
            health: HealthConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Set the concurrency bound.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Set the fallback estimate.
    pub fn with_default_estimated_cost(mut self, cost: Decimal) -> Self {
        self.default_estimated_cost = cost;
        self
    }

    /// Set the fallback execution timeout.
    pub fn with_default_execution_timeout(mut self, timeout: DurationMs) -> Self {
        self.default_execution_timeout = timeout;
        self
    }

    /// Set the health thresholds.
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Check settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("supervisor.max_concurrency", "must be at least 1"));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "supervisor.max_concurrency",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.default_estimated_cost.is_sign_negative() {
            return Err(ConfigError::invalid(
                "supervisor.default_estimated_cost",
                "must not be negative",
            ));
        }
        if self.default_execution_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "supervisor.default_execution_timeout",
                "must be positive",
            ));
        }
        if self.operation.trim().is_empty() {
            return Err(ConfigError::invalid("supervisor.operation", "must not be empty"));
        }
        if self.roi_epsilon <= Decimal::ZERO {
            return Err(ConfigError::invalid("supervisor.roi_epsilon", "must be positive"));
        }
        self.health.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_is_bounded_on_both_sides() {
        assert!(SupervisorConfig::default().validate().is_ok());
        assert!(
            SupervisorConfig::default()
                .with_max_concurrency(0)
                .validate()
                .is_err()
        );
        let err = SupervisorConfig::default()
            .with_max_concurrency(Semaphore::MAX_PERMITS + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(
            SupervisorConfig::default()
                .with_max_concurrency(Semaphore::MAX_PERMITS)
                .validate()
                .is_ok()
        );
    }
}
