#![deny(missing_docs)]
//! Budget enforcement for foreman workers.
//!
//! [`BudgetEnforcer`] composes a [`Ledger`] of named scopes with a
//! [`TokenBucket`] rate limiter behind two atomic operations:
//! [`BudgetEnforcer::check_and_reserve`] holds an estimate against every
//! applicable scope (or none of them), and
//! [`BudgetEnforcer::release_unused`] settles the actual cost. A sticky
//! emergency stop denies everything once global daily spend crosses the
//! configured threshold, until an operator clears it.
//!
//! ```
//! use foreman_budget::{BudgetConfig, BudgetEnforcer};
//! use foreman_core::{Decimal, ScopeId};
//!
//! let enforcer = BudgetEnforcer::new(BudgetConfig::default()).unwrap();
//! let rsv = enforcer
//!     .check_and_reserve(&[ScopeId::global_daily()], Decimal::ONE, "example")
//!     .unwrap();
//! let settled = enforcer.release_unused(&rsv, Decimal::new(5, 1)).unwrap();
//! assert_eq!(settled.actual, Decimal::new(5, 1));
//! ```

mod config;
mod enforcer;
mod ledger;
mod period;
mod pricing;
mod rate;

pub use config::{BudgetConfig, PricingConfig, RateLimitConfig};
pub use enforcer::{
    BudgetEnforcer, BudgetStatus, EmergencyStop, EnforcerStats, Reservation, Settlement,
};
pub use ledger::{Ledger, ScopeStatus};
pub use period::BudgetPeriod;
pub use pricing::{CostPredictor, ModelPrice};
pub use rate::{RateLimiterState, TokenBucket};

use thiserror::Error;

/// Errors returned by `foreman-budget` outside of reservation denials.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BudgetError {
    /// Clearing the emergency stop requires a named actor.
    #[error("clearing the emergency stop requires a named actor")]
    MissingActor,
    /// A limit or setting is out of range.
    #[error("configuration error: {0}")]
    Config(#[from] foreman_core::ConfigError),
}
