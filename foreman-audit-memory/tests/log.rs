use chrono::{DateTime, TimeDelta, Utc};
use foreman_audit_memory::MemoryAuditLog;
use foreman_core::audit::latest_decisions;
use foreman_core::*;
use std::sync::Arc;

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
}

fn entry(secs: i64, cents: i64) -> LedgerEntry {
    LedgerEntry {
        timestamp: t(secs),
        scope_id: ScopeId::global_daily(),
        amount: Decimal::new(cents, 2),
        operation: "worker_run".into(),
        worker_id: Some(WorkerId::new("w1")),
        reservation: None,
    }
}

#[tokio::test]
async fn ledger_since_filters_by_timestamp() {
    let log = MemoryAuditLog::new();
    log.append_ledger(entry(10, 100)).await.unwrap();
    log.append_ledger(entry(20, 200)).await.unwrap();
    log.append_ledger(entry(30, 300)).await.unwrap();

    let since = log.ledger_since(t(20)).await.unwrap();
    assert_eq!(since.len(), 2);
    assert_eq!(since[0].amount, Decimal::new(200, 2));
    assert_eq!(log.ledger_len().await, 3);
}

#[tokio::test]
async fn decisions_keep_every_version_in_order() {
    let log = MemoryAuditLog::new();
    let mut d = Decision::new("d1", DecisionKind::Pause, "w1", t(0));
    log.append_decision(DecisionRecord {
        recorded_at: t(0),
        decision: d.clone(),
    })
    .await
    .unwrap();
    d.resolve(DecisionStatus::Approved, Some("ops"), t(5));
    log.append_decision(DecisionRecord {
        recorded_at: t(5),
        decision: d.clone(),
    })
    .await
    .unwrap();

    let records = log.decisions().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].decision.is_pending());
    assert_eq!(latest_decisions(&records), vec![d]);
}

#[tokio::test]
async fn concurrent_appends_are_all_kept() {
    let log = Arc::new(MemoryAuditLog::new());
    let mut tasks = Vec::new();
    for i in 0..16 {
        let log = log.clone();
        tasks.push(tokio::spawn(async move {
            log.append_ledger(entry(i, i)).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(log.ledger_since(t(0)).await.unwrap().len(), 16);
}

#[test]
fn memory_log_is_an_audit_log() {
    fn assert_audit_log<T: AuditLog>() {}
    assert_audit_log::<MemoryAuditLog>();
}
