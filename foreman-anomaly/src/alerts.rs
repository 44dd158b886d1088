//! Delivery of anomalies to alert sinks.

use foreman_core::{AlertSink, AnomalyEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The receiving end of a monitor's alert channel.
///
/// Either pull events with [`AlertStream::recv`] or hand the stream to
/// [`AlertStream::spawn`] to fan them out to sinks on a background task.
#[derive(Debug)]
pub struct AlertStream {
    receiver: mpsc::Receiver<AnomalyEvent>,
}

impl AlertStream {
    pub(crate) fn new(receiver: mpsc::Receiver<AnomalyEvent>) -> Self {
        Self { receiver }
    }

    /// The next anomaly. `None` once the monitor is gone and the channel
    /// is drained.
    pub async fn recv(&mut self) -> Option<AnomalyEvent> {
        self.receiver.recv().await
    }

    /// An anomaly already waiting, without waiting for one.
    pub fn try_recv(&mut self) -> Option<AnomalyEvent> {
        self.receiver.try_recv().ok()
    }

    /// Deliver every anomaly to every sink, in order, until the monitor
    /// is dropped. Sink errors are logged and do not stop delivery.
    pub async fn run(mut self, sinks: Vec<Arc<dyn AlertSink>>) {
        while let Some(event) = self.receiver.recv().await {
            for sink in &sinks {
                if let Err(error) = sink.on_anomaly(&event).await {
                    tracing::warn!(
                        kind = ?event.kind,
                        source = %event.source,
                        error = %error,
                        "foreman.anomaly.sink_failed"
                    );
                }
            }
        }
        tracing::debug!("foreman.anomaly.stream_finished");
    }

    /// [`AlertStream::run`] on a new task.
    pub fn spawn(self, sinks: Vec<Arc<dyn AlertSink>>) -> JoinHandle<()> {
        tokio::spawn(self.run(sinks))
    }
}
