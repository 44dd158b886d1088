//! Example: a small fleet under a daily budget.
//!
//! Two workers share one budget. One earns more than it spends, the other
//! loses money on every run. The supervisor schedules both, the anomaly
//! monitor prints alerts, and a decision cycle at the end shows what the
//! engine would do with each.
//!
//! Run with: `cargo run --example fleet -p foreman`

use async_trait::async_trait;
use foreman::foreman_core::AlertError;
use foreman::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// A payload that reports fixed revenue and cost, read from the worker's
/// configuration.
struct Fixed;

#[async_trait]
impl Payload for Fixed {
    async fn run(&self, config: &serde_json::Value) -> Result<Outcome, PayloadError> {
        let field = |name: &str| {
            config[name]
                .as_str()
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or_default()
        };
        Ok(Outcome::new(field("revenue"), field("cost")))
    }

    fn estimate_cost(&self, config: &serde_json::Value) -> Option<Decimal> {
        config["cost"].as_str().and_then(|s| s.parse().ok())
    }
}

/// Prints every alert.
struct Stdout;

#[async_trait]
impl AlertSink for Stdout {
    async fn on_anomaly(&self, event: &AnomalyEvent) -> Result<(), AlertError> {
        println!("ALERT [{:?}] {}: {}", event.severity, event.source, event.message);
        Ok(())
    }
}

const CONFIG: &str = r#"
[budget]
daily_limit = "5"
hourly_limit = "5"
emergency_threshold = "8"

[budget.rate_limit]
capacity = 1000
refill_per_minute = 60000.0

[decision]
min_sample_size = 5

[audit]
backend = "memory"

[[workers]]
id = "earner"
type = "fixed"
run_interval = 100
config = { revenue = "0.50", cost = "0.05" }

[[workers]]
id = "burner"
type = "fixed"
run_interval = 100
config = { revenue = "0.00", cost = "0.10" }
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = ForemanConfig::from_toml_str(CONFIG)?;
    let mut foreman = Foreman::builder(config)
        .payload("fixed", Arc::new(Fixed))
        .alert_sink(Arc::new(Stdout))
        .build()
        .await?;

    foreman.start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    for analysis in foreman.engine().analyze().await {
        println!(
            "{:<8} runs={:<3} roi={:>6.2} -> {:?}",
            analysis.worker, analysis.metrics.total_runs, analysis.roi, analysis.recommendation
        );
    }
    for decision in foreman.engine().run_cycle().await {
        println!(
            "decision {} {} on {}: {:?} ({})",
            decision.id,
            decision.action.label(),
            decision.target,
            decision.status,
            decision.rationale
        );
    }

    foreman.shutdown().await;

    let summary = foreman.supervisor().summary();
    let status = foreman.enforcer().get_status();
    println!(
        "runs={} profit={} roi={:.2}",
        summary.metrics.total_runs, summary.profit, summary.roi
    );
    for scope in status.scopes {
        println!("{:<24} {}/{} ({:.1}%)", scope.scope_id, scope.consumed, scope.limit, scope.percent);
    }
    Ok(())
}
