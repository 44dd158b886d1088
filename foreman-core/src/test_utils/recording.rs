//! Recorders for alerts, lifecycle events and control commands.

use crate::anomaly::{AlertSink, AnomalyEvent};
use crate::control::WorkerControl;
use crate::error::{AlertError, SupervisorError};
use crate::id::WorkerId;
use crate::lifecycle::{EventObserver, LifecycleEvent};
use crate::worker::{WorkerDefinition, WorkerSnapshot};
use async_trait::async_trait;
use std::sync::Mutex;

/// An alert sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AnomalyEvent>>,
}

impl RecordingSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn events(&self) -> Vec<AnomalyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn on_anomaly(&self, event: &AnomalyEvent) -> Result<(), AlertError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A lifecycle observer that keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    /// An empty observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything observed so far.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventObserver for RecordingObserver {
    fn observe(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A command received by [`RecordingControl`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    /// `scale(id, multiplier)`.
    Scale(WorkerId, u32),
    /// `pause(id)`.
    Pause(WorkerId),
    /// `kill(id)`.
    Kill(WorkerId),
    /// `deploy(definition)`.
    Deploy(WorkerId),
}

/// A [`WorkerControl`] that serves fixed snapshots and records commands.
#[derive(Default)]
pub struct RecordingControl {
    snapshots: Mutex<Vec<WorkerSnapshot>>,
    calls: Mutex<Vec<ControlCall>>,
}

impl RecordingControl {
    /// Serve these snapshots.
    pub fn new(snapshots: Vec<WorkerSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the served snapshots.
    pub fn set_snapshots(&self, snapshots: Vec<WorkerSnapshot>) {
        *self.snapshots.lock().unwrap() = snapshots;
    }

    /// Every command received so far.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    fn known(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        if self.snapshots.lock().unwrap().iter().any(|s| s.id() == id) {
            Ok(())
        } else {
            Err(SupervisorError::WorkerNotFound(id.clone()))
        }
    }
}

#[async_trait]
impl WorkerControl for RecordingControl {
    async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    async fn scale(&self, id: &WorkerId, multiplier: u32) -> Result<usize, SupervisorError> {
        self.known(id)?;
        self.calls
            .lock()
            .unwrap()
            .push(ControlCall::Scale(id.clone(), multiplier));
        Ok(multiplier as usize)
    }

    async fn pause(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        self.known(id)?;
        self.calls.lock().unwrap().push(ControlCall::Pause(id.clone()));
        Ok(())
    }

    async fn kill(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        self.known(id)?;
        self.calls.lock().unwrap().push(ControlCall::Kill(id.clone()));
        Ok(())
    }

    async fn deploy(&self, definition: WorkerDefinition) -> Result<WorkerId, SupervisorError> {
        let id = definition.id.clone();
        self.calls.lock().unwrap().push(ControlCall::Deploy(id.clone()));
        Ok(id)
    }
}
