//! Autonomous decisions and their approval lifecycle.

use crate::id::{DecisionId, WorkerId};
use crate::worker::WorkerDefinition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a decision does to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionKind {
    /// Grow the worker to `multiplier` instances.
    ScaleUp {
        /// Target instance count as a multiple of one.
        multiplier: u32,
    },
    /// Stop every instance of the worker. It stays registered.
    Pause,
    /// Stop the worker and remove it once its in-flight run settles.
    Kill,
    /// Register and start a new worker.
    Deploy {
        /// The worker to deploy.
        definition: Box<WorkerDefinition>,
    },
}

impl DecisionKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScaleUp { .. } => "scale_up",
            Self::Pause => "pause",
            Self::Kill => "kill",
            Self::Deploy { .. } => "deploy",
        }
    }
}

/// Where a decision is in the approval flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Within the approval threshold; applied immediately.
    AutoExecuted,
    /// Parked in the outbox awaiting an actor.
    PendingApproval,
    /// Approved and applied.
    Approved,
    /// Rejected; never applied.
    Rejected,
    /// Approved, but applying it failed.
    Failed,
}

impl DecisionStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingApproval)
    }
}

/// A proposed (or executed) change to the worker population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique id.
    pub id: DecisionId,
    /// What to do.
    pub action: DecisionKind,
    /// The worker it applies to.
    pub target: WorkerId,
    /// Why, in words.
    pub rationale: String,
    /// Projected change in daily spend. Negative means savings.
    pub cost_impact: Decimal,
    /// Projected change in ROI (ratio).
    pub expected_roi_impact: f64,
    /// How much history backs the decision, in `[0, 1]`.
    pub confidence: f64,
    /// Current approval state.
    pub status: DecisionStatus,
    /// When the engine proposed it.
    pub created_at: DateTime<Utc>,
    /// When it left `PendingApproval`.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who approved or rejected it.
    #[serde(default)]
    pub resolved_by: Option<String>,
    /// Why applying it failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Decision {
    /// A new pending decision with no rationale and zero impact.
    pub fn new(
        id: impl Into<DecisionId>,
        action: DecisionKind,
        target: impl Into<WorkerId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            action,
            target: target.into(),
            rationale: String::new(),
            cost_impact: Decimal::ZERO,
            expected_roi_impact: 0.0,
            confidence: 0.0,
            status: DecisionStatus::PendingApproval,
            created_at,
            resolved_at: None,
            resolved_by: None,
            error: None,
        }
    }

    /// Set the rationale.
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Set the projected daily cost change.
    pub fn with_cost_impact(mut self, impact: Decimal) -> Self {
        self.cost_impact = impact;
        self
    }

    /// Set the projected ROI change.
    pub fn with_expected_roi_impact(mut self, impact: f64) -> Self {
        self.expected_roi_impact = impact;
        self
    }

    /// Set the confidence, clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Whether it still awaits an actor.
    pub fn is_pending(&self) -> bool {
        self.status == DecisionStatus::PendingApproval
    }

    /// Move to a resolved status.
    pub fn resolve(&mut self, status: DecisionStatus, actor: Option<&str>, at: DateTime<Utc>) {
        self.status = status;
        self.resolved_at = Some(at);
        self.resolved_by = actor.map(str::to_owned);
    }
}
