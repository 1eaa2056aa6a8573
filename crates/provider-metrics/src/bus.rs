use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::{MetricsEvent, SystemEvent};

/// Bounded, non-blocking channel carrying [`MetricsEvent`]s to subscribers.
///
/// Emission never waits: when the channel is full or the receiver is gone the
/// event is dropped and counted.
pub struct MetricsBus {
    tx: mpsc::Sender<MetricsEvent>,
    dropped: Arc<AtomicU64>,
}

impl MetricsBus {
    /// Create a new bus with the specified channel capacity
    ///
    /// Returns the bus (for emitting events) and the receiver (for consuming events)
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: MetricsEvent) {
        if let Err(error) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(
                "metrics event '{}' dropped ({} total)",
                match &error {
                    mpsc::error::TrySendError::Full(event)
                    | mpsc::error::TrySendError::Closed(event) => event.name(),
                },
                dropped
            );
        }
    }

    pub fn emit_system(&self, event: SystemEvent) {
        self.emit(MetricsEvent::System(event));
    }

    /// Report a batch of drops observed elsewhere. Not counted itself, so a
    /// full channel cannot feed back into the counter.
    pub fn emit_dropped_notification(&self, count: u64, reason: &str) {
        let _ = self.tx.try_send(MetricsEvent::System(SystemEvent::MetricsDropped {
            count,
            reason: reason.to_string(),
        }));
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Clone for MetricsBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}
