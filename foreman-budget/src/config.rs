//! Budget configuration.

use crate::pricing::ModelPrice;
use foreman_core::ConfigError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Limits for every budget scope plus the rate limiter and emergency stop.
///
/// Amounts are in the same currency the payloads report. The defaults
/// are deliberately small: 100/day, 20/hour, 10/day per worker, 30 per
/// single operation, emergency stop at 150.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Limit of the `global.daily` scope.
    pub daily_limit: Decimal,
    /// Limit of the `global.hourly` scope.
    pub hourly_limit: Decimal,
    /// Default limit of each `worker.<id>.daily` scope.
    pub per_worker_daily_limit: Decimal,
    /// Largest estimate a single reservation may carry.
    pub max_operation_cost: Decimal,
    /// Daily limits for named operations, creating `operation.<name>` scopes.
    pub operation_limits: BTreeMap<String, Decimal>,
    /// Global daily spend above which the emergency stop engages.
    pub emergency_threshold: Decimal,
    /// Token bucket settings.
    pub rate_limit: RateLimitConfig,
    /// Price table for token-based cost prediction.
    pub pricing: PricingConfig,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: Decimal::new(100, 0),
            hourly_limit: Decimal::new(20, 0),
            per_worker_daily_limit: Decimal::new(10, 0),
            max_operation_cost: Decimal::new(30, 0),
            operation_limits: BTreeMap::new(),
            emergency_threshold: Decimal::new(150, 0),
            rate_limit: RateLimitConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl BudgetConfig {
    /// Set the global daily limit.
    pub fn with_daily_limit(mut self, limit: Decimal) -> Self {
        self.daily_limit = limit;
        self
    }

    /// Set the global hourly limit.
    pub fn with_hourly_limit(mut self, limit: Decimal) -> Self {
        self.hourly_limit = limit;
        self
    }

    /// Set the default per-worker daily limit.
    pub fn with_per_worker_daily_limit(mut self, limit: Decimal) -> Self {
        self.per_worker_daily_limit = limit;
        self
    }

    /// Set the single-operation cap.
    pub fn with_max_operation_cost(mut self, cap: Decimal) -> Self {
        self.max_operation_cost = cap;
        self
    }

    /// Add a daily limit for a named operation.
    pub fn with_operation_limit(mut self, operation: impl Into<String>, limit: Decimal) -> Self {
        self.operation_limits.insert(operation.into(), limit);
        self
    }

    /// Set the emergency threshold.
    pub fn with_emergency_threshold(mut self, threshold: Decimal) -> Self {
        self.emergency_threshold = threshold;
        self
    }

    /// Set the rate limiter.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Check limits for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("budget.daily_limit", self.daily_limit)?;
        positive("budget.hourly_limit", self.hourly_limit)?;
        positive("budget.per_worker_daily_limit", self.per_worker_daily_limit)?;
        positive("budget.max_operation_cost", self.max_operation_cost)?;
        for (name, limit) in &self.operation_limits {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "budget.operation_limits",
                    "operation names must not be empty",
                ));
            }
            positive(&format!("budget.operation_limits.{name}"), *limit)?;
        }
        if self.emergency_threshold <= self.daily_limit {
            return Err(ConfigError::invalid(
                "budget.emergency_threshold",
                format!(
                    "must be above the daily limit ({} <= {})",
                    self.emergency_threshold, self.daily_limit
                ),
            ));
        }
        self.rate_limit.validate()?;
        self.pricing.validate()
    }
}

fn positive(field: &str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO {
        Err(ConfigError::invalid(field, "must be positive"))
    } else {
        Ok(())
    }
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size. The bucket starts full.
    pub capacity: u32,
    /// Tokens added per minute.
    pub refill_per_minute: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_minute: 60.0,
        }
    }
}

impl RateLimitConfig {
    /// A bucket of `capacity` refilled at `refill_per_minute`.
    pub fn new(capacity: u32, refill_per_minute: f64) -> Self {
        Self {
            capacity,
            refill_per_minute,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("budget.rate_limit.capacity", "must be at least 1"));
        }
        if !self.refill_per_minute.is_finite() || self.refill_per_minute < 0.0 {
            return Err(ConfigError::invalid(
                "budget.rate_limit.refill_per_minute",
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Per-million-token prices used by [`crate::CostPredictor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Prices keyed by model family. A model name matches the first key
    /// it equals, or else the first key it contains.
    pub models: BTreeMap<String, ModelPrice>,
    /// Family used when no key matches.
    pub default_model: String,
    /// Multiplier applied to every prediction to absorb uncertainty.
    pub uncertainty_buffer: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "opus".to_owned(),
            ModelPrice::new(Decimal::new(15, 0), Decimal::new(75, 0)),
        );
        models.insert(
            "sonnet".to_owned(),
            ModelPrice::new(Decimal::new(3, 0), Decimal::new(15, 0)),
        );
        models.insert(
            "haiku".to_owned(),
            ModelPrice::new(Decimal::new(8, 1), Decimal::new(4, 0)),
        );
        Self {
            models,
            default_model: "sonnet".to_owned(),
            uncertainty_buffer: Decimal::new(11, 1),
        }
    }
}

impl PricingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.models.contains_key(&self.default_model) {
            return Err(ConfigError::invalid(
                "budget.pricing.default_model",
                format!("{:?} has no price entry", self.default_model),
            ));
        }
        if self.uncertainty_buffer < Decimal::ONE {
            return Err(ConfigError::invalid(
                "budget.pricing.uncertainty_buffer",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BudgetConfig::default().validate().unwrap();
    }

    #[test]
    fn emergency_threshold_must_exceed_daily_limit() {
        let cfg = BudgetConfig::default().with_emergency_threshold(Decimal::new(100, 0));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("emergency_threshold"));
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(BudgetConfig::default().with_hourly_limit(Decimal::ZERO).validate().is_err());
        assert!(
            BudgetConfig::default()
                .with_operation_limit("llm", Decimal::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            BudgetConfig::default()
                .with_rate_limit(RateLimitConfig::new(0, 60.0))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: BudgetConfig =
            serde_json::from_str(r#"{"daily_limit": "10.00", "rate_limit": {"capacity": 3}}"#)
                .unwrap();
        assert_eq!(cfg.daily_limit, Decimal::new(1000, 2));
        assert_eq!(cfg.hourly_limit, Decimal::new(20, 0));
        assert_eq!(cfg.rate_limit.capacity, 3);
        assert_eq!(cfg.rate_limit.refill_per_minute, 60.0);
    }
}
