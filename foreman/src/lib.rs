#![deny(missing_docs)]
//! # foreman: umbrella crate
//!
//! A single import surface for the foreman crates. Re-exports each
//! component behind a feature flag, adds [`ForemanConfig`] for loading
//! the whole system from TOML and [`Foreman`] for wiring it together,
//! plus a `prelude` for the happy path.
//!
//! | Feature | Crate |
//! |---|---|
//! | always | `foreman-core`, `foreman-budget`, `foreman-supervisor` |
//! | `anomaly` | `foreman-anomaly` |
//! | `decision` | `foreman-decision` |
//! | `audit-memory` | `foreman-audit-memory` |
//! | `audit-fs` | `foreman-audit-fs` |

mod config;
mod runtime;

pub use config::{AuditConfig, ForemanConfig};
pub use runtime::{Foreman, ForemanBuilder, ForemanError};

pub use foreman_budget;
pub use foreman_core;
pub use foreman_supervisor;

#[cfg(feature = "anomaly")]
pub use foreman_anomaly;
#[cfg(feature = "audit-fs")]
pub use foreman_audit_fs;
#[cfg(feature = "audit-memory")]
pub use foreman_audit_memory;
#[cfg(feature = "decision")]
pub use foreman_decision;

/// Happy-path imports for running a supervised fleet.
pub mod prelude {
    pub use crate::{Foreman, ForemanConfig, ForemanError};

    pub use foreman_core::{
        AlertSink, AnomalyEvent, AuditLog, Clock, Decimal, Decision, DecisionKind,
        DecisionStatus, DurationMs, Outcome, Payload, PayloadError, WorkerControl,
        WorkerDefinition, WorkerId, WorkerSnapshot,
    };

    pub use foreman_budget::{BudgetConfig, BudgetEnforcer, BudgetStatus};

    pub use foreman_supervisor::{HealthState, Supervisor, SupervisorConfig};

    #[cfg(feature = "anomaly")]
    pub use foreman_anomaly::{AnomalyConfig, AnomalyMonitor};

    #[cfg(feature = "decision")]
    pub use foreman_decision::{DecisionConfig, DecisionEngine};

    #[cfg(feature = "audit-memory")]
    pub use foreman_audit_memory::MemoryAuditLog;

    #[cfg(feature = "audit-fs")]
    pub use foreman_audit_fs::FsAuditLog;
}
