//! # foreman-core: protocol types for a budget-gated worker supervisor
//!
//! This crate defines the vocabulary shared by every foreman component.
//! It contains no scheduling, no locking and no storage: only the types
//! that cross component boundaries and the traits that implementations
//! plug into.
//!
//! ## The Seams
//!
//! | Seam | Trait | What it does |
//! |------|-------|-------------|
//! | Payload | [`Payload`] | The opaque unit of work a worker runs |
//! | Control | [`WorkerControl`] | How decisions act on the worker population |
//! | Audit | [`AuditLog`] | Append-only ledger and decision history |
//! | Alerts | [`AlertSink`] | Where anomaly notifications are delivered |
//! | Lifecycle | [`EventObserver`], [`LifecycleEvent`] | Cross-component event stream |
//! | Time | [`Clock`] | Wall-clock source for periods, health and audit |
//!
//! ## Money
//!
//! All monetary amounts are [`rust_decimal::Decimal`]. Ratios that are
//! only compared against thresholds (ROI, success rate) are `f64`.

#![deny(missing_docs)]

pub mod anomaly;
pub mod audit;
pub mod clock;
pub mod control;
pub mod decision;
pub mod duration;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod payload;
pub mod worker;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use anomaly::{AlertSink, AnomalyEvent, AnomalyKind, Severity};
pub use audit::{AuditLog, DecisionRecord, LedgerEntry, SealedRecord};
pub use clock::{Clock, SystemClock};
pub use control::WorkerControl;
pub use decision::{Decision, DecisionKind, DecisionStatus};
pub use duration::DurationMs;
pub use error::{
    AlertError, AuditError, ConfigError, DecisionError, DenyKind, DenyReason, PayloadError,
    ReservationDenied, SupervisorError,
};
pub use id::{DecisionId, InstanceId, ReservationId, ScopeId, WorkerId};
pub use lifecycle::{EventObserver, LifecycleEvent, Observers, ScopeLevel, StopCause};
pub use payload::{Outcome, Payload};
pub use rust_decimal::Decimal;
pub use worker::{
    InstanceSnapshot, TokenBudgetHint, WorkerDefinition, WorkerMetrics, WorkerSnapshot, WorkerState,
    WorkerStatus,
};
