//! Detection thresholds.

use foreman_core::{ConfigError, DurationMs};
use serde::{Deserialize, Serialize};

/// Settings for [`crate::AnomalyMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Cost samples kept per worker.
    pub window_size: usize,
    /// Standard deviations above the mean that count as a spike.
    pub sigma: f64,
    /// Samples needed before spikes are reported.
    pub min_samples: usize,
    /// Crashes inside `crash_loop_window` above which an instance is in a
    /// crash loop.
    pub crash_loop_threshold: usize,
    /// Window for counting crashes.
    pub crash_loop_window: DurationMs,
    /// Repeats of the same kind from the same source inside this window
    /// are suppressed unless the severity rises.
    pub dedup_window: DurationMs,
    /// Alerts buffered between the monitor and the sinks.
    pub channel_capacity: usize,
    /// Alerts kept for [`crate::AnomalyMonitor::recent`].
    pub history: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            sigma: 2.0,
            min_samples: 10,
            crash_loop_threshold: 2,
            crash_loop_window: DurationMs::from_mins(15),
            dedup_window: DurationMs::from_mins(5),
            channel_capacity: 256,
            history: 100,
        }
    }
}

impl AnomalyConfig {
    /// Set the window size and minimum sample count.
    pub fn with_window(mut self, size: usize, min_samples: usize) -> Self {
        self.window_size = size;
        self.min_samples = min_samples;
        self
    }

    /// Set the spike threshold.
    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    /// Set the crash-loop threshold and window.
    pub fn with_crash_loop(mut self, threshold: usize, window: DurationMs) -> Self {
        self.crash_loop_threshold = threshold;
        self.crash_loop_window = window;
        self
    }

    /// Set the dedup window. Zero disables dedup.
    pub fn with_dedup_window(mut self, window: DurationMs) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set the channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Check settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::invalid("anomaly.window_size", "must be at least 1"));
        }
        if self.min_samples == 0 || self.min_samples > self.window_size {
            return Err(ConfigError::invalid(
                "anomaly.min_samples",
                "must be between 1 and window_size",
            ));
        }
        if !(self.sigma > 0.0) {
            return Err(ConfigError::invalid("anomaly.sigma", "must be positive"));
        }
        if self.crash_loop_window.is_zero() {
            return Err(ConfigError::invalid(
                "anomaly.crash_loop_window",
                "must be positive",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "anomaly.channel_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
