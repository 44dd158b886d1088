//! Anomaly events and the alert callback interface.

use crate::error::AlertError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of anomaly was detected.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A run's cost was a statistical outlier for its worker.
    CostSpike,
    /// An instance crashed repeatedly within a short window.
    CrashLoop,
    /// The global emergency stop engaged.
    EmergencyStop,
    /// A budget scope reached a critical consumption level.
    BudgetPressure,
    /// An instance was stopped by its crash limit.
    WorkerStopped,
}

/// How urgent an anomaly is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// For the record.
    Info,
    /// Worth a look.
    Warning,
    /// Needs attention soon.
    Critical,
    /// Spend has been halted.
    Emergency,
}

/// A detected anomaly, delivered to every registered [`AlertSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// What was detected.
    pub kind: AnomalyKind,
    /// How urgent it is.
    pub severity: Severity,
    /// The worker instance, scope or component it concerns.
    pub source: String,
    /// When it was detected.
    pub timestamp: DateTime<Utc>,
    /// One-line description.
    pub message: String,
    /// Detector-specific details.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AnomalyEvent {
    /// A new event with no metadata.
    pub fn new(
        kind: AnomalyKind,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity,
            source: source.into(),
            timestamp,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Receives anomaly alerts.
///
/// Sinks run on the alert-dispatch task, never on a worker's cycle. An
/// error is logged and does not stop delivery to the other sinks.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Handle one anomaly.
    async fn on_anomaly(&self, event: &AnomalyEvent) -> Result<(), AlertError>;
}
