//! Payloads with fixed, scripted or delayed behavior.

use crate::error::PayloadError;
use crate::payload::{Outcome, Payload};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Returns the same outcome on every run.
pub struct StaticPayload {
    outcome: Outcome,
    estimate: Option<Decimal>,
    runs: AtomicUsize,
}

impl StaticPayload {
    /// Always succeed with `revenue` and `cost`.
    pub fn new(revenue: Decimal, cost: Decimal) -> Self {
        Self {
            outcome: Outcome::new(revenue, cost),
            estimate: None,
            runs: AtomicUsize::new(0),
        }
    }

    /// Report a cost estimate before each run.
    pub fn with_estimate(mut self, estimate: Decimal) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// How many times `run` was called.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Payload for StaticPayload {
    async fn run(&self, _config: &serde_json::Value) -> Result<Outcome, PayloadError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }

    fn estimate_cost(&self, _config: &serde_json::Value) -> Option<Decimal> {
        self.estimate
    }
}

/// One scripted step of a [`ScriptedPayload`].
type Step = Result<Outcome, String>;

/// Plays back a script of results, then repeats the last one.
pub struct ScriptedPayload {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    runs: AtomicUsize,
}

impl ScriptedPayload {
    /// An empty script. Runs fail until steps are added.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            runs: AtomicUsize::new(0),
        }
    }

    /// Append a successful step.
    pub fn then_ok(self, revenue: Decimal, cost: Decimal) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(Outcome::new(revenue, cost)));
        self
    }

    /// Append a failing step.
    pub fn then_fail(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
        self
    }

    /// A payload that always fails.
    pub fn always_failing(message: &str) -> Self {
        Self::new().then_fail(message)
    }

    /// How many times `run` was called.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedPayload {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Payload for ScriptedPayload {
    async fn run(&self, _config: &serde_json::Value) -> Result<Outcome, PayloadError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match script.pop_front() {
                Some(step) => {
                    *last = Some(step.clone());
                    step
                }
                None => last
                    .clone()
                    .unwrap_or_else(|| Err("empty script".to_owned())),
            }
        };
        step.map_err(PayloadError::failed)
    }
}

/// Sleeps before succeeding. Use with `tokio::time::pause` to test timeouts.
pub struct SlowPayload {
    delay: Duration,
    outcome: Outcome,
    runs: AtomicUsize,
}

impl SlowPayload {
    /// Sleep for `delay`, then succeed with `revenue` and `cost`.
    pub fn new(delay: Duration, revenue: Decimal, cost: Decimal) -> Self {
        Self {
            delay,
            outcome: Outcome::new(revenue, cost),
            runs: AtomicUsize::new(0),
        }
    }

    /// How many times `run` was called.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Payload for SlowPayload {
    async fn run(&self, _config: &serde_json::Value) -> Result<Outcome, PayloadError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.outcome.clone())
    }
}
