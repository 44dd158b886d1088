#![deny(missing_docs)]
//! Autonomous decisions for foreman.
//!
//! The [`DecisionEngine`] reads worker snapshots through
//! [`foreman_core::WorkerControl`] and budget pressure from the
//! [`foreman_budget::BudgetEnforcer`], then decides:
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | ROI ≥ scale threshold and success rate ≥ minimum | `scale_up` by the configured multiplier |
//! | ROI ≤ kill threshold | `kill` |
//! | a global scope is near exhaustion | `pause`, lowest ROI first |
//!
//! Only workers with at least `min_sample_size` runs are scaled or
//! killed. A decision whose `|cost_impact|` exceeds the approval threshold
//! is parked in the [`ApprovalOutbox`] until someone calls
//! [`DecisionEngine::approve`] or [`DecisionEngine::reject`]; every other
//! decision is applied at once.

mod analysis;
mod config;
mod engine;
mod outbox;

pub use analysis::{Recommendation, WorkerAnalysis, analyze};
pub use config::DecisionConfig;
pub use engine::{DecisionEngine, DecisionEngineBuilder, EngineHandle};
pub use outbox::{ApprovalOutbox, DEFAULT_RESOLVED_RETAINED};
