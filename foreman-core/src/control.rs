//! The control surface decisions are applied through.
//!
//! The decision engine never touches runtime state directly. It reads
//! snapshots and issues commands through [`WorkerControl`], which the
//! supervisor implements by taking the same per-instance locks its own
//! scheduling loop uses.

use crate::error::SupervisorError;
use crate::id::WorkerId;
use crate::worker::{WorkerDefinition, WorkerSnapshot};
use async_trait::async_trait;

/// Commands and reads on the worker population.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Snapshot every registered worker.
    async fn snapshots(&self) -> Vec<WorkerSnapshot>;

    /// Add `multiplier - 1` instances to a worker. Returns the new
    /// instance count.
    async fn scale(&self, id: &WorkerId, multiplier: u32) -> Result<usize, SupervisorError>;

    /// Stop every instance of a worker, keeping it registered.
    async fn pause(&self, id: &WorkerId) -> Result<(), SupervisorError>;

    /// Stop a worker and remove it once nothing is in flight.
    async fn kill(&self, id: &WorkerId) -> Result<(), SupervisorError>;

    /// Register and start a new worker.
    async fn deploy(&self, definition: WorkerDefinition) -> Result<WorkerId, SupervisorError>;
}
