use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::bus::MetricsBus;
use crate::events::{MetricsEvent, SystemEvent};
use crate::storage::MetricsStorage;
use crate::timeseries::{aggregated_points, request_points};

/// Worker that consumes metrics events from the bus and writes their points to storage
pub struct MetricsWorker {
    storage: Arc<dyn MetricsStorage>,
    running: Arc<AtomicBool>,
    retention: Option<Duration>,
}

impl MetricsWorker {
    /// Create a new metrics worker with the given storage backend
    pub fn new(storage: Arc<dyn MetricsStorage>) -> Self {
        Self {
            storage,
            running: Arc::new(AtomicBool::new(false)),
            retention: None,
        }
    }

    /// Prune persisted points older than `max_age` whenever the in-memory
    /// retention sweep runs.
    pub fn with_retention(mut self, max_age: Duration) -> Self {
        self.retention = Some(max_age);
        self
    }

    /// Spawn the worker task
    ///
    /// Returns a handle to stop the worker
    pub fn spawn(
        &self,
        mut receiver: mpsc::Receiver<MetricsEvent>,
        bus: MetricsBus,
    ) -> Arc<AtomicBool> {
        let storage = Arc::clone(&self.storage);
        let running = Arc::clone(&self.running);
        let retention = self.retention;
        running.store(true, Ordering::SeqCst);

        let running_clone = Arc::clone(&running);

        tokio::spawn(async move {
            if let Err(e) = storage.init().await {
                error!("metrics storage initialization failed: {}", e);
            }
            info!("MetricsWorker started");
            bus.emit_system(SystemEvent::WorkerStarted);

            while running.load(Ordering::SeqCst) {
                match receiver.recv().await {
                    Some(event) => {
                        if let Err(e) = Self::handle_event(&storage, &event, retention).await {
                            warn!("Failed to handle metrics event: {}", e);
                            bus.emit_system(SystemEvent::StorageError {
                                error: e.to_string(),
                                event_type: event_type_name(&event),
                            });
                        }
                    }
                    None => {
                        info!("MetricsWorker channel closed");
                        break;
                    }
                }
            }

            info!("MetricsWorker stopped");
            bus.emit_system(SystemEvent::WorkerStopped);
        });

        running_clone
    }

    async fn handle_event(
        storage: &Arc<dyn MetricsStorage>,
        event: &MetricsEvent,
        retention: Option<Duration>,
    ) -> anyhow::Result<()> {
        match event {
            MetricsEvent::Collected { metric, .. } => {
                let written = storage.insert_points(request_points(metric)).await?;
                log::debug!(
                    "persisted {} points for request {} ({}:{})",
                    written,
                    metric.request_id,
                    metric.provider,
                    metric.model
                );
            }
            MetricsEvent::Aggregated { window, .. } => {
                let written = storage.insert_points(aggregated_points(window)).await?;
                log::debug!(
                    "persisted {} points for {} window ending {}",
                    written,
                    window.period_label(),
                    window.overall.window_end
                );
            }
            MetricsEvent::Alert { alert, .. } => {
                info!(
                    "Alert: {} {} for {} (value {}, threshold {})",
                    alert.severity,
                    alert.kind.as_str(),
                    alert.provider,
                    alert.value,
                    alert.threshold
                );
            }
            MetricsEvent::System(system_event) => match system_event {
                SystemEvent::WorkerStarted => info!("System: WorkerStarted"),
                SystemEvent::WorkerStopped => info!("System: WorkerStopped"),
                SystemEvent::MetricsDropped { count, reason } => {
                    warn!("System: MetricsDropped - {} events, reason: {}", count, reason);
                }
                SystemEvent::StorageError { error, event_type } => {
                    error!("System: StorageError for {} - {}", event_type, error);
                }
                SystemEvent::StorageTrimmed {
                    removed_points,
                    estimated_bytes,
                    max_bytes,
                } => {
                    warn!(
                        "System: StorageTrimmed - {} points removed ({} of {} bytes)",
                        removed_points, estimated_bytes, max_bytes
                    );
                }
                SystemEvent::RetentionSwept {
                    removed_raw,
                    removed_aggregated,
                    compressed,
                } => {
                    info!(
                        "System: RetentionSwept - raw {}, aggregated {}, compressed {}",
                        removed_raw, removed_aggregated, compressed
                    );
                    if let Some(max_age) = retention {
                        let pruned = storage.prune_before(Utc::now() - max_age).await?;
                        if pruned > 0 {
                            info!("Pruned {} persisted points", pruned);
                        }
                    }
                }
            },
        }
        Ok(())
    }

    /// Stop the worker gracefully
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn event_type_name(event: &MetricsEvent) -> String {
    match event {
        MetricsEvent::System(e) => match e {
            SystemEvent::WorkerStarted => "System::WorkerStarted",
            SystemEvent::WorkerStopped => "System::WorkerStopped",
            SystemEvent::MetricsDropped { .. } => "System::MetricsDropped",
            SystemEvent::StorageError { .. } => "System::StorageError",
            SystemEvent::StorageTrimmed { .. } => "System::StorageTrimmed",
            SystemEvent::RetentionSwept { .. } => "System::RetentionSwept",
        }
        .to_string(),
        other => other.name().to_string(),
    }
}
