//! The anomaly monitor.

use crate::alerts::AlertStream;
use crate::config::AnomalyConfig;
use crate::window::RollingWindow;
use chrono::{DateTime, Utc};
use foreman_core::{
    AnomalyEvent, AnomalyKind, ConfigError, EventObserver, InstanceId, LifecycleEvent, ScopeLevel,
    Severity, StopCause, WorkerId,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters since the monitor was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Anomalies raised, by kind. Suppressed repeats are not counted.
    pub by_kind: BTreeMap<AnomalyKind, u64>,
    /// Anomalies handed to the channel.
    pub delivered: u64,
    /// Anomalies lost because the channel was full or closed.
    pub dropped: u64,
    /// Repeats suppressed by dedup.
    pub suppressed: u64,
}

#[derive(Debug, Default)]
struct CrashTracker {
    crashes: VecDeque<DateTime<Utc>>,
    flagged: bool,
}

/// Turns lifecycle events into anomalies.
///
/// Register it as an observer on the enforcer and the supervisor. All
/// work in [`EventObserver::observe`] is a few map lookups under short
/// locks followed by a `try_send`.
pub struct AnomalyMonitor {
    config: AnomalyConfig,
    costs: Mutex<HashMap<WorkerId, RollingWindow>>,
    crashes: Mutex<HashMap<InstanceId, CrashTracker>>,
    last_raised: Mutex<HashMap<(AnomalyKind, String), (Severity, DateTime<Utc>)>>,
    recent: Mutex<VecDeque<AnomalyEvent>>,
    stats: Mutex<MonitorStats>,
    sender: mpsc::Sender<AnomalyEvent>,
}

impl std::fmt::Debug for AnomalyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyMonitor")
            .field("config", &self.config)
            .field("stats", &*lock(&self.stats))
            .finish()
    }
}

impl AnomalyMonitor {
    /// Build a monitor and the stream its alerts come out of.
    pub fn new(config: AnomalyConfig) -> Result<(Self, AlertStream), ConfigError> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let monitor = Self {
            config,
            costs: Mutex::new(HashMap::new()),
            crashes: Mutex::new(HashMap::new()),
            last_raised: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
            stats: Mutex::new(MonitorStats::default()),
            sender,
        };
        Ok((monitor, AlertStream::new(receiver)))
    }

    /// The configuration in use.
    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Counters so far.
    pub fn stats(&self) -> MonitorStats {
        lock(&self.stats).clone()
    }

    /// The last `n` anomalies raised, newest last.
    pub fn recent(&self, n: usize) -> Vec<AnomalyEvent> {
        let recent = lock(&self.recent);
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Feed one cost sample for `worker`. Raises a cost spike when the
    /// sample exceeds the window's upper bound.
    ///
    /// The sample is compared against the window before it joins it.
    pub fn record_cost(
        &self,
        worker: &WorkerId,
        cost: Decimal,
        at: DateTime<Utc>,
    ) -> Option<AnomalyEvent> {
        let value = cost.to_f64()?;
        let spike = {
            let mut costs = lock(&self.costs);
            let window = costs
                .entry(worker.clone())
                .or_insert_with(|| RollingWindow::new(self.config.window_size));
            let spike = if window.len() >= self.config.min_samples {
                let mean = window.mean();
                let bound = window.upper_bound(self.config.sigma);
                (value > bound && value > mean).then(|| (mean, window.stddev(), bound))
            } else {
                None
            };
            window.push(value);
            spike
        };
        let (mean, stddev, bound) = spike?;
        let event = AnomalyEvent::new(
            AnomalyKind::CostSpike,
            Severity::Warning,
            worker.as_str(),
            format!("run cost {cost} above {bound:.6} (mean {mean:.6}, stddev {stddev:.6})"),
            at,
        )
        .with_metadata(json!({
            "cost": cost.to_string(),
            "mean": mean,
            "stddev": stddev,
            "threshold": bound,
        }));
        self.raise(event)
    }

    /// Count a crash of `instance`. Raises a crash loop when the count
    /// inside the window exceeds the threshold. It stays quiet until the
    /// count falls back to the threshold or the instance succeeds.
    pub fn record_crash(&self, instance: &InstanceId, at: DateTime<Utc>) -> Option<AnomalyEvent> {
        let window = self.config.crash_loop_window.to_chrono();
        let count = {
            let mut crashes = lock(&self.crashes);
            let tracker = crashes.entry(instance.clone()).or_default();
            tracker.crashes.push_back(at);
            while tracker
                .crashes
                .front()
                .is_some_and(|first| at - *first > window)
            {
                tracker.crashes.pop_front();
            }
            let count = tracker.crashes.len();
            if count <= self.config.crash_loop_threshold {
                tracker.flagged = false;
                return None;
            }
            if tracker.flagged {
                return None;
            }
            tracker.flagged = true;
            count
        };
        let event = AnomalyEvent::new(
            AnomalyKind::CrashLoop,
            Severity::Critical,
            instance.to_string(),
            format!(
                "{count} crashes within {}s",
                self.config.crash_loop_window.as_secs_f64()
            ),
            at,
        )
        .with_metadata(json!({ "crashes": count }));
        self.raise(event)
    }

    /// Forget an instance's crash history. Called on every success.
    pub fn record_success(&self, instance: &InstanceId) {
        lock(&self.crashes).remove(instance);
    }

    /// Drop everything tracked for a worker that was killed or removed.
    pub fn forget(&self, instance: &InstanceId) {
        let worker = &instance.worker;
        lock(&self.costs).remove(worker);
        lock(&self.crashes).retain(|id, _| &id.worker != worker);
        let prefix = format!("{worker}#");
        lock(&self.last_raised)
            .retain(|(_, source), _| source != worker.as_str() && !source.starts_with(&prefix));
    }

    /// Dedup, count, remember and send. Returns the event when it was
    /// raised (even if the channel then dropped it).
    fn raise(&self, event: AnomalyEvent) -> Option<AnomalyEvent> {
        if self.is_repeat(&event) {
            lock(&self.stats).suppressed += 1;
            tracing::debug!(
                kind = ?event.kind,
                source = %event.source,
                "foreman.anomaly.suppressed"
            );
            return None;
        }
        match event.severity {
            Severity::Emergency | Severity::Critical => tracing::error!(
                kind = ?event.kind,
                source = %event.source,
                message = %event.message,
                "foreman.anomaly.detected"
            ),
            _ => tracing::warn!(
                kind = ?event.kind,
                source = %event.source,
                message = %event.message,
                "foreman.anomaly.detected"
            ),
        }
        {
            let mut recent = lock(&self.recent);
            recent.push_back(event.clone());
            while recent.len() > self.config.history {
                recent.pop_front();
            }
        }
        let sent = match self.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(kind = ?event.kind, "foreman.anomaly.dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(kind = ?event.kind, "foreman.anomaly.stream_closed");
                false
            }
        };
        let mut stats = lock(&self.stats);
        *stats.by_kind.entry(event.kind).or_default() += 1;
        if sent {
            stats.delivered += 1;
        } else {
            stats.dropped += 1;
        }
        Some(event)
    }

    fn is_repeat(&self, event: &AnomalyEvent) -> bool {
        if self.config.dedup_window.is_zero() {
            return false;
        }
        let window = self.config.dedup_window.to_chrono();
        let key = (event.kind, event.source.clone());
        let mut last = lock(&self.last_raised);
        last.retain(|_, (_, at)| event.timestamp - *at < window);
        if let Some((severity, at)) = last.get(&key)
            && event.severity <= *severity
            && event.timestamp - *at < window
        {
            return true;
        }
        last.insert(key, (event.severity, event.timestamp));
        false
    }
}

impl EventObserver for AnomalyMonitor {
    fn observe(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::RunSettled { instance, cost, at, .. } => {
                self.record_success(instance);
                self.record_cost(&instance.worker, *cost, *at);
            }
            LifecycleEvent::RunFailed { instance, cost, at, .. } => {
                self.record_cost(&instance.worker, *cost, *at);
                self.record_crash(instance, *at);
            }
            LifecycleEvent::EmergencyStop { reason, at } => {
                self.raise(AnomalyEvent::new(
                    AnomalyKind::EmergencyStop,
                    Severity::Emergency,
                    "budget",
                    format!("emergency stop engaged: {reason}"),
                    *at,
                ));
            }
            LifecycleEvent::ScopePressure {
                scope,
                level,
                percent,
                at,
            } if *level >= ScopeLevel::Critical => {
                let severity = if *level == ScopeLevel::Exceeded {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                self.raise(
                    AnomalyEvent::new(
                        AnomalyKind::BudgetPressure,
                        severity,
                        scope.as_str(),
                        format!("scope {scope} at {percent:.1}%"),
                        *at,
                    )
                    .with_metadata(json!({ "percent": percent })),
                );
            }
            LifecycleEvent::InstanceStopped {
                instance,
                cause: StopCause::CrashLimit,
                at,
            } => {
                self.raise(AnomalyEvent::new(
                    AnomalyKind::WorkerStopped,
                    Severity::Critical,
                    instance.to_string(),
                    format!("{instance} stopped after reaching its crash limit"),
                    *at,
                ));
            }
            LifecycleEvent::InstanceStopped {
                instance,
                cause: StopCause::Retired,
                ..
            } => self.forget(instance),
            _ => {}
        }
    }
}
