//! The payload contract: what a worker actually runs.
//!
//! The supervisor knows nothing about what a payload does. It reserves
//! budget, calls [`Payload::run`] with the worker's configuration, and
//! settles whatever the [`Outcome`] reports.

use crate::error::PayloadError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a successful run reports back.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Outcome {
    /// Revenue attributed to this run.
    pub revenue: Decimal,
    /// Actual cost incurred by this run.
    pub cost: Decimal,
    /// Free-form details for audit and debugging.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Outcome {
    /// An outcome with the given revenue and cost and no metadata.
    pub fn new(revenue: Decimal, cost: Decimal) -> Self {
        Self {
            revenue,
            cost,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One recurring unit of work, selected by a worker definition's `type`.
///
/// Implementations are shared across every instance of every worker
/// registered with that type, so they must be `Send + Sync` and must not
/// keep per-run state in `&self` without their own synchronization.
#[async_trait]
pub trait Payload: Send + Sync {
    /// Execute one run.
    ///
    /// The supervisor enforces a wall-clock timeout around this call; a
    /// run that overruns is abandoned and settled at its estimate.
    async fn run(&self, config: &serde_json::Value) -> Result<Outcome, PayloadError>;

    /// Estimated cost of the next run, reserved before it starts.
    ///
    /// `None` defers to the worker definition's estimate, then to the
    /// token-based predictor, then to the supervisor default.
    fn estimate_cost(&self, config: &serde_json::Value) -> Option<Decimal> {
        let _ = config;
        None
    }
}
