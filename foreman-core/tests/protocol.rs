//! Protocol tests for the core crate.
//!
//! Tests cover:
//! - Trait object safety (Arc<dyn Trait> is Send + Sync)
//! - Wire formats of persisted and configured types
//! - Typed ID helpers

use foreman_core::*;
use serde_json::json;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object Safety
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn _assert_send_sync<T: Send + Sync>() {}

#[test]
fn arc_payload_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn Payload>>();
}

#[test]
fn arc_worker_control_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn WorkerControl>>();
}

#[test]
fn arc_audit_log_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn AuditLog>>();
}

#[test]
fn arc_alert_sink_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn AlertSink>>();
}

#[test]
fn arc_event_observer_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn EventObserver>>();
}

#[test]
fn arc_clock_is_send_sync() {
    _assert_send_sync::<std::sync::Arc<dyn Clock>>();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire formats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn duration_serializes_as_millis() {
    let json = serde_json::to_value(DurationMs::from_secs(60)).unwrap();
    assert_eq!(json, json!(60000));
}

#[test]
fn money_serializes_as_string() {
    let outcome = Outcome::new(Decimal::new(5000, 2), Decimal::new(1000, 2));
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json, json!({"revenue": "50.00", "cost": "10.00"}));
}

#[test]
fn worker_definition_uses_type_key() {
    let def = WorkerDefinition::new("scraper", "http_scrape")
        .with_config(json!({"url": "https://example.com"}));
    let json = serde_json::to_value(&def).unwrap();
    assert_eq!(json["type"], "http_scrape");
    assert_eq!(json["run_interval"], 60000);
    assert_eq!(json["cooldown_duration"], 300000);
    let back: WorkerDefinition = serde_json::from_value(json).unwrap();
    assert_eq!(back, def);
}

#[test]
fn lifecycle_event_is_tagged() {
    let event = LifecycleEvent::RunSkipped {
        instance: InstanceId::new(WorkerId::new("w"), 1),
        reason: DenyKind::RateLimit,
        at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "run_skipped");
    assert_eq!(json["reason"], "rate_limit");
    assert_eq!(json["instance"]["ordinal"], 1);
}

#[test]
fn anomaly_severity_orders_by_urgency() {
    assert!(Severity::Emergency > Severity::Critical);
    assert!(Severity::Critical > Severity::Warning);
    assert!(Severity::Warning > Severity::Info);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IDs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn scope_ids_follow_naming_scheme() {
    let w = WorkerId::new("scraper");
    assert_eq!(ScopeId::global_daily().as_str(), "global.daily");
    assert_eq!(ScopeId::global_hourly().as_str(), "global.hourly");
    assert_eq!(ScopeId::worker_daily(&w).as_str(), "worker.scraper.daily");
    assert_eq!(ScopeId::operation("llm").as_str(), "operation.llm");
    assert_eq!(ScopeId::worker_daily(&w).worker(), Some(w));
    assert_eq!(ScopeId::global_daily().worker(), None);
}

#[test]
fn instance_id_display() {
    let id = InstanceId::new(WorkerId::new("scraper"), 2);
    assert_eq!(id.to_string(), "scraper#2");
    assert_eq!(InstanceId::primary(WorkerId::new("a")).ordinal, 0);
}
