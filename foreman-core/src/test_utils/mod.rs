//! Deterministic collaborators for testing.
//!
//! Available behind the `test-utils` feature flag. These are small
//! implementations of the core traits that record what happened so
//! tests can assert on it.

mod manual_clock;
mod payloads;
mod recording;

pub use manual_clock::ManualClock;
pub use payloads::{ScriptedPayload, SlowPayload, StaticPayload};
pub use recording::{ControlCall, RecordingControl, RecordingObserver, RecordingSink};
