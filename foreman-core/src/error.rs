//! Error types for each concern.

use crate::decision::DecisionStatus;
use crate::duration::DurationMs;
use crate::id::{DecisionId, ScopeId, WorkerId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the budget enforcer refused a reservation.
///
/// Denials are recoverable: the calling worker skips its cycle without
/// counting a crash and tries again at its next interval.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenyReason {
    /// The reservation would push a scope past its limit.
    #[error("scope {scope} exhausted: requested {requested}, available {available}")]
    ScopeLimit {
        /// The first scope (in lock order) that could not fit the request.
        scope: ScopeId,
        /// The estimate that was requested.
        requested: Decimal,
        /// What was still available in that scope.
        available: Decimal,
    },

    /// A single request exceeded the per-operation cost cap.
    #[error("operation cost {requested} exceeds per-operation cap {cap}")]
    OperationCap {
        /// The estimate that was requested.
        requested: Decimal,
        /// The configured cap.
        cap: Decimal,
    },

    /// The rate limiter had no token available.
    #[error("rate limit reached")]
    RateLimit,

    /// The global emergency stop is engaged.
    #[error("emergency stop engaged: {reason}")]
    EmergencyStop {
        /// Why the stop was engaged.
        reason: String,
    },

    /// A scope named in the request is not configured.
    #[error("unknown budget scope: {0}")]
    UnknownScope(ScopeId),

    /// The estimate was negative.
    #[error("invalid cost estimate: {0}")]
    InvalidEstimate(Decimal),
}

/// Alias used by callers that talk about denied reservations.
pub type ReservationDenied = DenyReason;

/// Coarse classification of a [`DenyReason`], for events and metrics.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyKind {
    /// Scope or per-operation limit.
    ScopeLimit,
    /// Rate limiter.
    RateLimit,
    /// Emergency stop.
    EmergencyStop,
    /// Malformed request.
    Invalid,
}

impl DenyReason {
    /// The coarse kind of this denial.
    pub fn kind(&self) -> DenyKind {
        match self {
            Self::ScopeLimit { .. } | Self::OperationCap { .. } => DenyKind::ScopeLimit,
            Self::RateLimit => DenyKind::RateLimit,
            Self::EmergencyStop { .. } => DenyKind::EmergencyStop,
            Self::UnknownScope(_) | Self::InvalidEstimate(_) => DenyKind::Invalid,
        }
    }
}

/// Failure reported by (or imposed on) a worker payload.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload ran and reported failure.
    #[error("payload failed: {message}")]
    Failed {
        /// What went wrong.
        message: String,
        /// Cost actually incurred before failing, if the payload knows it.
        cost: Option<Decimal>,
    },

    /// The payload exceeded its execution timeout and was abandoned.
    #[error("payload timed out after {0}")]
    Timeout(DurationMs),

    /// The payload task panicked.
    #[error("payload panicked: {0}")]
    Panicked(String),

    /// Catch-all. Include context.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl PayloadError {
    /// A failure with a message and no known cost.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cost: None,
        }
    }

    /// A failure that still incurred a known cost.
    pub fn failed_with_cost(message: impl Into<String>, cost: Decimal) -> Self {
        Self::Failed {
            message: message.into(),
            cost: Some(cost),
        }
    }

    /// The cost the payload reported before failing, if any.
    pub fn reported_cost(&self) -> Option<Decimal> {
        match self {
            Self::Failed { cost, .. } => *cost,
            _ => None,
        }
    }
}

/// Invalid configuration or worker definition.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No payload is registered under the definition's type.
    #[error("no payload registered for type {0:?}")]
    UnknownPayload(String),

    /// A worker with this id is already registered.
    #[error("worker already registered: {0}")]
    Duplicate(WorkerId),

    /// The configuration source could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The configuration source could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Supervisor API errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The requested worker is not registered.
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// Registration rejected the definition.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scale multipliers start at 1.
    #[error("invalid scale multiplier {0}")]
    InvalidMultiplier(u32),

    /// The worker still has an instance mid-cycle.
    #[error("worker busy: {0}")]
    WorkerBusy(WorkerId),

    /// The worker was killed and is waiting to be purged.
    #[error("worker retired: {0}")]
    Retired(WorkerId),
}

/// Audit log errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AuditError {
    /// Reading or writing the underlying medium failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted record does not match its digest.
    #[error("digest mismatch in {log} at record {index}")]
    Tampered {
        /// Which log the record came from.
        log: String,
        /// Zero-based position of the record.
        index: usize,
    },

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Decision outbox errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DecisionError {
    /// No decision with this id exists.
    #[error("decision not found: {0}")]
    NotFound(DecisionId),

    /// Only pending decisions can be approved or rejected.
    #[error("decision {id} is {status:?}, not pending approval")]
    NotPending {
        /// The decision.
        id: DecisionId,
        /// Its current status.
        status: DecisionStatus,
    },

    /// Approval and rejection must name who made the call.
    #[error("approval requires a named actor")]
    MissingActor,

    /// Applying the decision through the supervisor failed.
    #[error("apply failed: {0}")]
    Apply(#[from] SupervisorError),

    /// The decision log could not be written.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Alert delivery errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AlertError {
    /// The sink could not deliver the alert.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_kinds() {
        let scope = DenyReason::ScopeLimit {
            scope: ScopeId::global_daily(),
            requested: Decimal::ONE,
            available: Decimal::ZERO,
        };
        assert_eq!(scope.kind(), DenyKind::ScopeLimit);
        assert_eq!(DenyReason::RateLimit.kind(), DenyKind::RateLimit);
        assert_eq!(
            DenyReason::EmergencyStop {
                reason: "x".into()
            }
            .kind(),
            DenyKind::EmergencyStop
        );
        assert_eq!(
            DenyReason::InvalidEstimate(Decimal::NEGATIVE_ONE).kind(),
            DenyKind::Invalid
        );
    }

    #[test]
    fn payload_reported_cost() {
        assert_eq!(PayloadError::failed("boom").reported_cost(), None);
        assert_eq!(
            PayloadError::failed_with_cost("boom", Decimal::TEN).reported_cost(),
            Some(Decimal::TEN)
        );
        assert_eq!(
            PayloadError::Timeout(DurationMs::from_secs(1)).reported_cost(),
            None
        );
    }

    #[test]
    fn display_includes_context() {
        let err = SupervisorError::WorkerNotFound(WorkerId::new("scraper"));
        assert_eq!(err.to_string(), "worker not found: scraper");
        let err = ConfigError::invalid("budget.daily_limit", "must be positive");
        assert_eq!(err.to_string(), "invalid budget.daily_limit: must be positive");
    }
}
