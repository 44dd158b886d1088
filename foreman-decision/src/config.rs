//! Decision thresholds.

use foreman_core::{ConfigError, DurationMs};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settings for [`crate::DecisionEngine`].
///
/// ROI values are ratios: `1.0` means revenue exceeded cost by 100%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Decisions are only emitted while enabled.
    pub enabled: bool,
    /// Time between cycles of a spawned engine.
    pub period: DurationMs,
    /// Runs a worker needs before scale or kill is considered.
    pub min_sample_size: u64,
    /// ROI at or above which a worker is scaled up.
    pub scale_threshold: f64,
    /// Success rate a worker needs to be scaled up.
    pub min_success_rate: f64,
    /// ROI at or below which a worker is killed.
    pub kill_threshold: f64,
    /// Instance multiple a scale-up asks for.
    pub scale_multiplier: u32,
    /// Instances beyond which a worker is never scaled.
    pub max_instances: usize,
    /// Decisions whose `|cost_impact|` exceeds this wait for approval.
    pub approval_threshold: Decimal,
    /// Denominator floor used when computing ROI.
    pub roi_epsilon: Decimal,
    /// Fraction of a global scope's limit above which workers are paused.
    pub near_exhaustion: f64,
    /// Positive cost impact that executed decisions may add per day.
    pub daily_decision_budget: Decimal,
    /// Expected ROI a deploy proposal needs.
    pub min_deploy_roi: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: DurationMs::from_hours(1),
            min_sample_size: 20,
            scale_threshold: 3.0,
            min_success_rate: 0.8,
            kill_threshold: 0.0,
            scale_multiplier: 2,
            max_instances: 8,
            approval_threshold: Decimal::new(50, 0),
            roi_epsilon: Decimal::new(1, 2),
            near_exhaustion: 0.9,
            daily_decision_budget: Decimal::new(100, 0),
            min_deploy_roi: 1.5,
        }
    }
}

impl DecisionConfig {
    /// Turn decision-making on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the cycle period.
    pub fn with_period(mut self, period: DurationMs) -> Self {
        self.period = period;
        self
    }

    /// Set the minimum run count.
    pub fn with_min_sample_size(mut self, runs: u64) -> Self {
        self.min_sample_size = runs;
        self
    }

    /// Set the scale-up ROI and success-rate thresholds.
    pub fn with_scale_threshold(mut self, roi: f64, min_success_rate: f64) -> Self {
        self.scale_threshold = roi;
        self.min_success_rate = min_success_rate;
        self
    }

    /// Set the kill ROI threshold.
    pub fn with_kill_threshold(mut self, roi: f64) -> Self {
        self.kill_threshold = roi;
        self
    }

    /// Set the approval threshold.
    pub fn with_approval_threshold(mut self, amount: Decimal) -> Self {
        self.approval_threshold = amount;
        self
    }

    /// Set the near-exhaustion fraction.
    pub fn with_near_exhaustion(mut self, fraction: f64) -> Self {
        self.near_exhaustion = fraction;
        self
    }

    /// Set the daily decision budget.
    pub fn with_daily_decision_budget(mut self, amount: Decimal) -> Self {
        self.daily_decision_budget = amount;
        self
    }

    /// Check settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::invalid("decision.period", "must be positive"));
        }
        if self.scale_multiplier < 2 {
            return Err(ConfigError::invalid(
                "decision.scale_multiplier",
                "must be at least 2",
            ));
        }
        if self.scale_threshold <= self.kill_threshold {
            return Err(ConfigError::invalid(
                "decision.scale_threshold",
                "must be above kill_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(ConfigError::invalid(
                "decision.min_success_rate",
                "must be between 0 and 1",
            ));
        }
        if !(self.near_exhaustion > 0.0 && self.near_exhaustion <= 1.0) {
            return Err(ConfigError::invalid(
                "decision.near_exhaustion",
                "must be in (0, 1]",
            ));
        }
        if self.approval_threshold.is_sign_negative() {
            return Err(ConfigError::invalid(
                "decision.approval_threshold",
                "must not be negative",
            ));
        }
        if self.roi_epsilon <= Decimal::ZERO {
            return Err(ConfigError::invalid("decision.roi_epsilon", "must be positive"));
        }
        if self.daily_decision_budget.is_sign_negative() {
            return Err(ConfigError::invalid(
                "decision.daily_decision_budget",
                "must not be negative",
            ));
        }
        Ok(())
    }
}
