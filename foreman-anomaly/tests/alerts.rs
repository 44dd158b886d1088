//! End-to-end: lifecycle events in, alerts out of the sinks.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use foreman_anomaly::{AnomalyConfig, AnomalyMonitor};
use foreman_core::test_utils::RecordingSink;
use foreman_core::*;
use std::sync::Arc;

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
}

struct FailingSink;

#[async_trait]
impl AlertSink for FailingSink {
    async fn on_anomaly(&self, _event: &AnomalyEvent) -> Result<(), AlertError> {
        Err(AlertError::Delivery("pager offline".into()))
    }
}

#[tokio::test]
async fn sinks_receive_alerts_in_order_despite_failures() {
    let (monitor, stream) = AnomalyMonitor::new(AnomalyConfig::default()).unwrap();
    let sink = Arc::new(RecordingSink::new());
    let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(FailingSink), sink.clone()];
    let task = stream.spawn(sinks);

    let instance = InstanceId::primary(WorkerId::new("w"));
    for secs in [0, 10, 20] {
        monitor.observe(&LifecycleEvent::RunFailed {
            instance: instance.clone(),
            error: "boom".into(),
            consecutive_crashes: 1,
            cost: Decimal::ONE,
            at: t(secs),
        });
    }
    monitor.observe(&LifecycleEvent::InstanceStopped {
        instance: instance.clone(),
        cause: StopCause::CrashLimit,
        at: t(30),
    });
    monitor.observe(&LifecycleEvent::InstanceStopped {
        instance: instance.clone(),
        cause: StopCause::Requested,
        at: t(40),
    });

    drop(monitor);
    task.await.unwrap();

    let kinds: Vec<AnomalyKind> = sink.events().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [AnomalyKind::CrashLoop, AnomalyKind::WorkerStopped]);
    assert_eq!(sink.events()[1].severity, Severity::Critical);
}

#[tokio::test]
async fn settled_costs_feed_spike_detection() {
    let config = AnomalyConfig::default().with_window(10, 5);
    let (monitor, mut stream) = AnomalyMonitor::new(config).unwrap();
    let instance = InstanceId::primary(WorkerId::new("w"));
    let settle = |cents: i64, secs: i64| LifecycleEvent::RunSettled {
        instance: instance.clone(),
        cost: Decimal::new(cents, 2),
        revenue: Decimal::ONE,
        at: t(secs),
    };
    for secs in 0..5 {
        monitor.observe(&settle(10, secs));
    }
    assert!(stream.try_recv().is_none());

    monitor.observe(&settle(90, 5));
    let alert = stream.recv().await.unwrap();
    assert_eq!(alert.kind, AnomalyKind::CostSpike);
    assert_eq!(alert.source, "w");
    assert_eq!(alert.metadata["cost"], "0.90");
    assert_eq!(monitor.stats().by_kind[&AnomalyKind::CostSpike], 1);
}

#[tokio::test]
async fn emergency_stop_alerts_at_emergency_severity() {
    let (monitor, mut stream) = AnomalyMonitor::new(AnomalyConfig::default()).unwrap();
    monitor.observe(&LifecycleEvent::EmergencyStop {
        reason: "over".into(),
        at: t(0),
    });
    let alert = stream.recv().await.unwrap();
    assert_eq!(alert.kind, AnomalyKind::EmergencyStop);
    assert_eq!(alert.severity, Severity::Emergency);
    assert_eq!(monitor.recent(1)[0], alert);
}
