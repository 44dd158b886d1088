//! Fleet-wide totals and ROI rankings.

use foreman_core::{WorkerId, WorkerMetrics, WorkerSnapshot, WorkerStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Totals over every registered worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    /// Registered workers.
    pub workers: usize,
    /// Instances across all workers.
    pub instances: usize,
    /// Instance count per status.
    pub by_status: BTreeMap<String, usize>,
    /// Summed counters.
    pub metrics: WorkerMetrics,
    /// Revenue minus cost.
    pub profit: Decimal,
    /// Fleet ROI as a ratio.
    pub roi: f64,
    /// Fleet success rate.
    pub success_rate: f64,
}

impl FleetSummary {
    pub(crate) fn from_snapshots(snapshots: &[WorkerSnapshot], epsilon: Decimal) -> Self {
        let mut summary = Self {
            workers: snapshots.len(),
            ..Self::default()
        };
        for snapshot in snapshots {
            summary.metrics.merge(&snapshot.metrics());
            for instance in &snapshot.instances {
                summary.instances += 1;
                *summary
                    .by_status
                    .entry(instance.state.status.to_string())
                    .or_default() += 1;
            }
        }
        summary.profit = summary.metrics.profit();
        summary.roi = summary.metrics.roi(epsilon);
        summary.success_rate = summary.metrics.success_rate();
        summary
    }

    /// Instances currently in `status`.
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.by_status
            .get(&status.to_string())
            .copied()
            .unwrap_or(0)
    }
}

/// One worker in an ROI ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performer {
    /// The worker.
    pub worker: WorkerId,
    /// Its ROI ratio.
    pub roi: f64,
    /// Summed counters.
    pub metrics: WorkerMetrics,
}

/// Workers with at least one run, best ROI first.
pub(crate) fn rank(snapshots: &[WorkerSnapshot], epsilon: Decimal) -> Vec<Performer> {
    let mut ranked: Vec<Performer> = snapshots
        .iter()
        .map(|s| (s.id().clone(), s.metrics()))
        .filter(|(_, m)| m.total_runs > 0)
        .map(|(worker, metrics)| Performer {
            roi: metrics.roi(epsilon),
            worker,
            metrics,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.roi
            .total_cmp(&a.roi)
            .then_with(|| a.worker.cmp(&b.worker))
    });
    ranked
}
