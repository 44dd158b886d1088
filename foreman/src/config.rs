//! Whole-system configuration, loadable from TOML.

use foreman_budget::BudgetConfig;
use foreman_core::{ConfigError, WorkerDefinition};
use foreman_supervisor::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[cfg(feature = "anomaly")]
use foreman_anomaly::AnomalyConfig;
#[cfg(feature = "decision")]
use foreman_decision::DecisionConfig;

/// Where the cost ledger and decision log are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum AuditConfig {
    /// Nothing is recorded and nothing is recovered on restart.
    #[default]
    None,
    /// In memory. Needs the `audit-memory` feature.
    Memory,
    /// JSON-lines files under `dir`. Needs the `audit-fs` feature.
    Fs {
        /// Directory holding `ledger.jsonl` and `decisions.jsonl`.
        dir: PathBuf,
    },
}

/// Configuration for every component plus the workers to register.
///
/// Every section is optional in TOML; missing sections and fields take
/// their defaults.
///
/// ```
/// use foreman::ForemanConfig;
///
/// let config = ForemanConfig::from_toml_str(r#"
///     [budget]
///     daily_limit = "25"
///     emergency_threshold = "40"
///
///     [[workers]]
///     id = "digest"
///     type = "summarize"
///     run_interval = 600000
/// "#).unwrap();
/// assert_eq!(config.workers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Budget limits, rate limiter and emergency stop.
    pub budget: BudgetConfig,
    /// Scheduling and health.
    pub supervisor: SupervisorConfig,
    /// Anomaly detection thresholds.
    #[cfg(feature = "anomaly")]
    pub anomaly: AnomalyConfig,
    /// Autonomous decision thresholds.
    #[cfg(feature = "decision")]
    pub decision: DecisionConfig,
    /// Audit backend.
    pub audit: AuditConfig,
    /// Workers registered at build time.
    pub workers: Vec<WorkerDefinition>,
}

impl ForemanConfig {
    /// Parse and validate TOML.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Check every section and the worker list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.budget.validate()?;
        self.supervisor.validate()?;
        #[cfg(feature = "anomaly")]
        self.anomaly.validate()?;
        #[cfg(feature = "decision")]
        self.decision.validate()?;
        let mut seen = BTreeSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !seen.insert(&worker.id) {
                return Err(ConfigError::Duplicate(worker.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{Decimal, DurationMs};

    #[test]
    fn empty_source_is_all_defaults() {
        let config = ForemanConfig::from_toml_str("").unwrap();
        assert_eq!(config, ForemanConfig::default());
    }

    #[test]
    fn sections_and_workers_parse() {
        let config = ForemanConfig::from_toml_str(
            r#"
            [budget]
            daily_limit = "50"
            hourly_limit = "10"
            emergency_threshold = "75"

            [budget.rate_limit]
            capacity = 30
            refill_per_minute = 30.0

            [supervisor]
            max_concurrency = 2

            [audit]
            backend = "fs"
            dir = "/var/lib/foreman"

            [[workers]]
            id = "leads"
            type = "lead_gen"
            run_interval = 300000
            estimated_cost = "0.25"
            config = { region = "eu", pages = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(config.budget.daily_limit, Decimal::new(50, 0));
        assert_eq!(config.budget.rate_limit.capacity, 30);
        assert_eq!(config.supervisor.max_concurrency, 2);
        assert_eq!(
            config.audit,
            AuditConfig::Fs {
                dir: PathBuf::from("/var/lib/foreman")
            }
        );
        let w = &config.workers[0];
        assert_eq!(w.kind, "lead_gen");
        assert_eq!(w.run_interval, DurationMs::from_mins(5));
        assert_eq!(w.estimated_cost, Some(Decimal::new(25, 2)));
        assert_eq!(w.config["pages"], 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ForemanConfig::from_toml_str(
            r#"
            [budget]
            daily_limit = "100"
            emergency_threshold = "50"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ForemanConfig::from_toml_str("budget = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn duplicate_workers_are_rejected() {
        let err = ForemanConfig::from_toml_str(
            r#"
            [[workers]]
            id = "a"
            type = "x"

            [[workers]]
            id = "a"
            type = "y"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(_)));
    }
}
