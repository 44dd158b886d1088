#![deny(missing_docs)]
//! In-process worker supervisor for foreman.
//!
//! Payloads are registered by type name in a [`PayloadRegistry`]; worker
//! definitions select one with their `type` field. Every instance of a
//! worker runs the same cycle:
//!
//! ```text
//! Idle ─► Reserving ─► Running ─► Settling ─► Idle
//!            │            │
//!            │ denied     │ failed / timed out / panicked
//!            ▼            ▼
//!          Idle      CrashBackoff ─► Idle (after cooldown)
//!                         │
//!                         └─► Stopped (crash limit, until reset)
//! ```
//!
//! A single dispatcher task pops due instances from a min-heap and runs
//! their cycles on a pool bounded by a semaphore. Stopping is
//! cooperative: an in-flight cycle settles before the stop takes effect.

mod aggregate;
mod config;
mod health;
mod instance;
mod registry;
mod supervisor;

pub use aggregate::{FleetSummary, Performer};
pub use config::SupervisorConfig;
pub use health::{HealthConfig, HealthReport, HealthState, InstanceHealth, WorkerHealth};
pub use registry::PayloadRegistry;
pub use supervisor::{DispatcherHandle, Supervisor, SupervisorBuilder};
