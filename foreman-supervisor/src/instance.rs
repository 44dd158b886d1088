//! The per-instance state machine.
//!
//! A [`Slot`] is the only thing that mutates a [`WorkerState`]. Every
//! transition is a method here, called by the supervisor with the
//! instance lock held. The lock is never held across an await.
//!
//! Scheduled entries carry the slot's generation. Starting, stopping and
//! resetting bump it, which turns every entry already in the queue stale.

use chrono::{DateTime, Utc};
use foreman_core::{StopCause, WorkerState, WorkerStatus};
use rust_decimal::Decimal;

/// Result of asking a due entry to begin a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Begin {
    /// Moved to `Reserving`.
    Proceed,
    /// The entry no longer matches the slot. Drop it.
    Stale,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopOutcome {
    /// The slot stopped immediately.
    Stopped,
    /// A cycle is in flight. It stops when the cycle settles.
    Deferred,
    /// Already stopped. Only the cause may have changed.
    AlreadyStopped,
}

/// Result of finishing a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    /// Schedule the next cycle with this generation.
    Scheduled(u64),
    /// A stop arrived mid-cycle and took effect.
    Stopped(StopCause),
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub state: WorkerState,
    generation: u64,
    pending_stop: Option<StopCause>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            state: WorkerState::new(),
            generation: 0,
            pending_stop: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.status.is_in_flight()
    }

    /// Bring a stopped slot back to `Idle`, due now.
    ///
    /// Only slots stopped by request (or never started) revive here.
    /// Crash-stopped slots need [`Self::reset`]. Returns the generation to
    /// schedule, or `None` when there is nothing to schedule.
    pub fn start(&mut self, now: DateTime<Utc>) -> Option<u64> {
        match (self.state.status, self.state.stop_cause) {
            (WorkerStatus::Stopped, Some(StopCause::NotStarted | StopCause::Requested)) => {
                Some(self.revive(now))
            }
            (status, _) if status.is_in_flight() => {
                // The running cycle reschedules itself when it settles.
                if self.pending_stop == Some(StopCause::Requested) {
                    self.pending_stop = None;
                }
                None
            }
            _ => None,
        }
    }

    /// Revive a slot stopped by its crash limit. Counts as a restart.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<u64> {
        if self.state.status == WorkerStatus::Stopped
            && self.state.stop_cause == Some(StopCause::CrashLimit)
        {
            self.state.consecutive_crash_count = 0;
            self.state.restart_count += 1;
            Some(self.revive(now))
        } else {
            None
        }
    }

    fn revive(&mut self, now: DateTime<Utc>) -> u64 {
        self.state.status = WorkerStatus::Idle;
        self.state.stop_cause = None;
        self.state.started_at = Some(now);
        self.state.next_run_at = Some(now);
        self.pending_stop = None;
        self.generation += 1;
        self.generation
    }

    /// Stop now, or after the in-flight cycle settles.
    pub fn request_stop(&mut self, cause: StopCause) -> StopOutcome {
        if self.state.status == WorkerStatus::Stopped {
            if cause == StopCause::Retired {
                self.state.stop_cause = Some(cause);
            }
            return StopOutcome::AlreadyStopped;
        }
        if self.is_in_flight() {
            // Retirement wins over a plain stop request.
            if self.pending_stop != Some(StopCause::Retired) {
                self.pending_stop = Some(cause);
            }
            return StopOutcome::Deferred;
        }
        self.halt(cause);
        StopOutcome::Stopped
    }

    fn halt(&mut self, cause: StopCause) {
        self.state.status = WorkerStatus::Stopped;
        self.state.stop_cause = Some(cause);
        self.state.next_run_at = None;
        self.pending_stop = None;
        self.generation += 1;
    }

    /// Claim a due entry.
    pub fn begin(&mut self, generation: u64) -> Begin {
        if generation != self.generation {
            return Begin::Stale;
        }
        match self.state.status {
            WorkerStatus::Idle | WorkerStatus::CrashBackoff => {
                self.state.status = WorkerStatus::Reserving;
                Begin::Proceed
            }
            _ => Begin::Stale,
        }
    }

    /// The reservation was denied. The cycle is skipped.
    pub fn denied(&mut self, next: DateTime<Utc>) -> Finish {
        self.state.skipped_cycles += 1;
        self.finish(WorkerStatus::Idle, next)
    }

    /// The reservation was granted. The payload is about to run.
    pub fn granted(&mut self, now: DateTime<Utc>) {
        self.state.status = WorkerStatus::Running;
        self.state.total_runs += 1;
        self.state.last_run_at = Some(now);
    }

    pub fn settling(&mut self) {
        self.state.status = WorkerStatus::Settling;
    }

    pub fn succeeded(&mut self, cost: Decimal, revenue: Decimal, next: DateTime<Utc>) -> Finish {
        self.state.total_successes += 1;
        self.state.consecutive_crash_count = 0;
        self.state.cumulative_cost += cost;
        self.state.cumulative_revenue += revenue;
        self.finish(WorkerStatus::Idle, next)
    }

    /// Record a failed run. Returns the consecutive crash count and
    /// whether it reached `max_crashes`.
    pub fn failed(&mut self, cost: Decimal, error: String, max_crashes: u32) -> (u32, bool) {
        self.state.total_failures += 1;
        self.state.consecutive_crash_count += 1;
        self.state.cumulative_cost += cost;
        self.state.last_error = Some(error);
        let count = self.state.consecutive_crash_count;
        (count, count >= max_crashes)
    }

    /// Back off until `next`.
    pub fn backoff(&mut self, next: DateTime<Utc>) -> Finish {
        self.finish(WorkerStatus::CrashBackoff, next)
    }

    /// Stop after reaching the crash limit. A pending retirement wins.
    pub fn crash_stop(&mut self) -> StopCause {
        let cause = match self.pending_stop {
            Some(StopCause::Retired) => StopCause::Retired,
            _ => StopCause::CrashLimit,
        };
        self.halt(cause);
        cause
    }

    fn finish(&mut self, status: WorkerStatus, next: DateTime<Utc>) -> Finish {
        if let Some(cause) = self.pending_stop.take() {
            self.halt(cause);
            return Finish::Stopped(cause);
        }
        self.state.status = status;
        self.state.next_run_at = Some(next);
        Finish::Scheduled(self.generation)
    }
}
