//! Typed ID wrappers for workers, instances, scopes, decisions and reservations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed ID wrappers prevent mixing up worker IDs, scope IDs, etc.
/// These are just strings underneath. No format is enforced beyond
/// what [`crate::worker::WorkerDefinition::validate`] checks for workers.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new typed ID from anything that converts to String.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_id!(WorkerId, "Unique identifier for a registered worker definition.");
typed_id!(ScopeId, "Unique identifier for a budget scope.");
typed_id!(DecisionId, "Unique identifier for an autonomous decision.");
typed_id!(ReservationId, "Unique identifier for a budget reservation.");

impl ScopeId {
    /// Scope covering all spend in the current day.
    pub fn global_daily() -> Self {
        Self::new("global.daily")
    }

    /// Scope covering all spend in the current hour.
    pub fn global_hourly() -> Self {
        Self::new("global.hourly")
    }

    /// Daily scope for a single worker (shared by all of its instances).
    pub fn worker_daily(worker: &WorkerId) -> Self {
        Self(format!("worker.{worker}.daily"))
    }

    /// Daily scope for a named operation.
    pub fn operation(operation: &str) -> Self {
        Self(format!("operation.{operation}"))
    }

    /// If this is a per-worker scope, the worker it belongs to.
    pub fn worker(&self) -> Option<WorkerId> {
        self.0
            .strip_prefix("worker.")
            .and_then(|rest| rest.strip_suffix(".daily"))
            .map(WorkerId::from)
    }
}

/// One running copy of a worker definition.
///
/// Scaling a worker creates additional instances that share the
/// definition but keep independent runtime state and crash counters.
/// Ordinal `0` is the instance created at registration.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceId {
    /// The worker definition this instance runs.
    pub worker: WorkerId,
    /// Position of this instance within the worker, starting at zero.
    pub ordinal: u32,
}

impl InstanceId {
    /// Create an instance ID.
    pub fn new(worker: WorkerId, ordinal: u32) -> Self {
        Self { worker, ordinal }
    }

    /// The primary instance of a worker.
    pub fn primary(worker: WorkerId) -> Self {
        Self::new(worker, 0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.worker, self.ordinal)
    }
}
