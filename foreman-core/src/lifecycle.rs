//! Lifecycle events: the stream that ties the components together.
//!
//! The enforcer and the supervisor emit these; the anomaly monitor (and
//! anything else that cares) consumes them through [`EventObserver`].
//! Observers are called synchronously on the emitting task, often while
//! it holds a lock, so they must return quickly and never block. The
//! anomaly monitor, for instance, only pushes into a bounded channel.

use crate::error::DenyKind;
use crate::id::{InstanceId, ScopeId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why a worker instance stopped.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// Registered but never started.
    NotStarted,
    /// `stop()` was called, or a pause decision was applied.
    Requested,
    /// Too many consecutive crashes. Only `reset()` revives it.
    CrashLimit,
    /// The worker was killed and will be removed.
    Retired,
}

/// Consumption level of a budget scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    /// Below 75% of the limit.
    Healthy,
    /// At least 75%.
    Warning,
    /// At least 90%.
    Critical,
    /// At or over the limit.
    Exceeded,
}

impl ScopeLevel {
    /// Classify a utilization percentage (0–100+).
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 90.0 {
            Self::Critical
        } else if percent >= 75.0 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

/// Something happened that other components may want to react to.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A run succeeded and its cost was settled.
    RunSettled {
        /// The instance that ran.
        instance: InstanceId,
        /// Actual cost settled.
        cost: Decimal,
        /// Revenue reported.
        revenue: Decimal,
        /// When it settled.
        at: DateTime<Utc>,
    },
    /// A run failed (error, timeout or panic).
    RunFailed {
        /// The instance that ran.
        instance: InstanceId,
        /// Display form of the failure.
        error: String,
        /// Consecutive crashes including this one.
        consecutive_crashes: u32,
        /// Cost settled for the failed run.
        cost: Decimal,
        /// When it failed.
        at: DateTime<Utc>,
    },
    /// A due cycle was skipped because the reservation was denied.
    RunSkipped {
        /// The instance that skipped.
        instance: InstanceId,
        /// Why the enforcer said no.
        reason: DenyKind,
        /// When it was denied.
        at: DateTime<Utc>,
    },
    /// An instance moved to `Stopped`.
    InstanceStopped {
        /// The instance.
        instance: InstanceId,
        /// Why.
        cause: StopCause,
        /// When.
        at: DateTime<Utc>,
    },
    /// The global emergency stop engaged.
    EmergencyStop {
        /// Why it engaged.
        reason: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// A budget scope crossed into a higher consumption level.
    ScopePressure {
        /// The scope.
        scope: ScopeId,
        /// Its new level.
        level: ScopeLevel,
        /// Utilization percentage (consumed + reserved over limit).
        percent: f64,
        /// When.
        at: DateTime<Utc>,
    },
}

/// Receives lifecycle events. Must not block.
pub trait EventObserver: Send + Sync {
    /// Called once per event, on the emitting task.
    fn observe(&self, event: &LifecycleEvent);
}

/// An ordered set of observers that events are fanned out to.
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl Observers {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Observers run in registration order.
    pub fn add(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    /// Deliver an event to every observer.
    pub fn emit(&self, event: &LifecycleEvent) {
        for observer in &self.observers {
            observer.observe(event);
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}
