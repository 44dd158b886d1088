#![deny(missing_docs)]
//! Anomaly detection for foreman.
//!
//! [`AnomalyMonitor`] observes lifecycle events and keeps a rolling
//! window of run costs per worker and a crash history per instance. What
//! it finds goes out as [`foreman_core::AnomalyEvent`]s through a bounded
//! channel to an [`AlertStream`], which calls the registered
//! [`foreman_core::AlertSink`]s.
//!
//! ```
//! use foreman_anomaly::{AnomalyConfig, AnomalyMonitor};
//! use foreman_core::{EventObserver, LifecycleEvent};
//!
//! let (monitor, mut alerts) = AnomalyMonitor::new(AnomalyConfig::default()).unwrap();
//! monitor.observe(&LifecycleEvent::EmergencyStop {
//!     reason: "daily spend over threshold".into(),
//!     at: chrono::Utc::now(),
//! });
//! assert!(alerts.try_recv().is_some());
//! ```

mod alerts;
mod config;
mod monitor;
mod window;

pub use alerts::AlertStream;
pub use config::AnomalyConfig;
pub use monitor::{AnomalyMonitor, MonitorStats};
pub use window::RollingWindow;
