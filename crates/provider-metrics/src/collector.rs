use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::bus::MetricsBus;
use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::pipeline::MetricsPipeline;
use crate::scheduler::Scheduler;
use crate::types::{
    AggregatedWindow, CostSummary, ExportFormat, HealthSummary, MetricsSnapshot, Operation,
    ProviderError, ProviderResponse, QueryOptions, TimeSeriesDataPoint,
};

type Inspection = Box<dyn FnOnce(&MetricsPipeline) + Send>;

enum CollectorCommand {
    RequestStarted {
        request_id: String,
        provider: String,
        model: String,
        operation: Operation,
        metadata: Option<HashMap<String, serde_json::Value>>,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        request_id: String,
        response: ProviderResponse,
        cached: bool,
        at: DateTime<Utc>,
    },
    RequestFailed {
        request_id: String,
        error: ProviderError,
        rate_limit: bool,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    SetEnabled(bool),
    WindowTick {
        window_size_secs: u64,
    },
    RetentionSweep,
    Inspect(Inspection),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl CollectorCommand {
    fn label(&self) -> &'static str {
        match self {
            CollectorCommand::RequestStarted { .. } => "start_request",
            CollectorCommand::RequestCompleted { .. } => "complete_request",
            CollectorCommand::RequestFailed { .. } => "fail_request",
            CollectorCommand::SetEnabled(_) => "set_enabled",
            CollectorCommand::WindowTick { .. } => "window_tick",
            CollectorCommand::RetentionSweep => "retention_sweep",
            CollectorCommand::Inspect(_) => "inspect",
            CollectorCommand::Shutdown { .. } => "shutdown",
        }
    }
}

/// Applies one command to the pipeline. Shutdown is handled by the actor loop.
fn handle(pipeline: &mut MetricsPipeline, command: CollectorCommand) {
    match command {
        CollectorCommand::RequestStarted {
            request_id,
            provider,
            model,
            operation,
            metadata,
            at,
        } => {
            pipeline.start_request_at(&request_id, &provider, &model, operation, metadata, at);
        }
        CollectorCommand::RequestCompleted {
            request_id,
            response,
            cached,
            at,
        } => {
            pipeline.complete_request_at(&request_id, &response, cached, at);
        }
        CollectorCommand::RequestFailed {
            request_id,
            error,
            rate_limit,
            retry_count,
            at,
        } => {
            pipeline.fail_request_at(&request_id, &error, rate_limit, retry_count, at);
        }
        CollectorCommand::SetEnabled(enabled) => pipeline.set_enabled(enabled),
        CollectorCommand::WindowTick { window_size_secs } => {
            pipeline.run_window(window_size_secs);
        }
        CollectorCommand::RetentionSweep => {
            let report = pipeline.run_retention();
            log::info!(
                "retention sweep: removed {} raw, {} aggregated, compressed {}",
                report.removed_raw,
                report.removed_aggregated,
                report.compressed
            );
        }
        CollectorCommand::Inspect(inspect) => inspect(pipeline),
        CollectorCommand::Shutdown { .. } => {}
    }
}

/// Cloneable handle to the metrics actor.
///
/// Ingestion calls never block and never fail; timestamps are taken when the
/// call is made, not when the actor gets to it.
#[derive(Clone)]
pub struct MetricsCollector {
    tx: mpsc::UnboundedSender<CollectorCommand>,
    clock: Arc<dyn Clock>,
    internal_errors: Arc<AtomicU64>,
}

impl MetricsCollector {
    /// Validates `config`, then starts the actor with one timer per window
    /// size and one for the retention sweep. Must be called from within a
    /// tokio runtime.
    pub fn spawn(config: MetricsConfig, bus: MetricsBus, clock: Arc<dyn Clock>) -> MetricsResult<Self> {
        let config = config.validate()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<CollectorCommand>();
        let window_sizes = config.window_sizes_secs.clone();
        let retention_interval = config.storage.retention_interval_secs;

        let mut pipeline = MetricsPipeline::new(config, bus, Arc::clone(&clock));
        let internal_errors = pipeline.internal_error_counter();

        let mut scheduler = Scheduler::new();
        for window_size_secs in window_sizes {
            let weak = tx.downgrade();
            scheduler.every(
                format!("window-{}s", window_size_secs),
                Duration::from_secs(window_size_secs),
                move || match weak.upgrade() {
                    Some(tx) => tx
                        .send(CollectorCommand::WindowTick { window_size_secs })
                        .is_ok(),
                    None => false,
                },
            );
        }
        let weak = tx.downgrade();
        scheduler.every(
            "retention",
            Duration::from_secs(retention_interval),
            move || match weak.upgrade() {
                Some(tx) => tx.send(CollectorCommand::RetentionSweep).is_ok(),
                None => false,
            },
        );

        tokio::spawn(async move {
            log::info!(
                "metrics collector started (timers: {})",
                scheduler.timer_names().join(", ")
            );

            while let Some(command) = rx.recv().await {
                if let CollectorCommand::Shutdown { reply } = command {
                    scheduler.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                let label = command.label();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handle(&mut pipeline, command)));
                if outcome.is_err() {
                    pipeline.record_internal_error(label);
                }
            }

            log::info!("metrics collector stopped");
        });

        Ok(Self {
            tx,
            clock,
            internal_errors,
        })
    }

    fn send(&self, command: CollectorCommand) {
        if self.tx.send(command).is_err() {
            let total = self.internal_errors.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("metrics collector is gone, dropping command ({} total)", total);
        }
    }

    async fn request<T, F>(&self, read: F) -> MetricsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&MetricsPipeline) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(CollectorCommand::Inspect(Box::new(move |pipeline| {
                let _ = reply.send(read(pipeline));
            })))
            .map_err(|_| MetricsError::ChannelClosed)?;
        response.await.map_err(|_| MetricsError::ChannelClosed)
    }

    pub fn start_request(
        &self,
        request_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        operation: Operation,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) {
        self.send(CollectorCommand::RequestStarted {
            request_id: request_id.into(),
            provider: provider.into(),
            model: model.into(),
            operation,
            metadata,
            at: self.clock.now(),
        });
    }

    pub fn complete_request(&self, request_id: impl Into<String>, response: ProviderResponse, cached: bool) {
        self.send(CollectorCommand::RequestCompleted {
            request_id: request_id.into(),
            response,
            cached,
            at: self.clock.now(),
        });
    }

    pub fn fail_request(
        &self,
        request_id: impl Into<String>,
        error: ProviderError,
        rate_limit: bool,
        retry_count: u32,
    ) {
        self.send(CollectorCommand::RequestFailed {
            request_id: request_id.into(),
            error,
            rate_limit,
            retry_count,
            at: self.clock.now(),
        });
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.send(CollectorCommand::SetEnabled(enabled));
    }

    pub async fn query(&self, options: QueryOptions) -> MetricsResult<Vec<TimeSeriesDataPoint>> {
        self.request(move |pipeline| pipeline.query(&options)).await
    }

    pub async fn export(
        &self,
        format: ExportFormat,
        options: Option<QueryOptions>,
    ) -> MetricsResult<String> {
        self.request(move |pipeline| pipeline.export(format, options.as_ref()))
            .await?
    }

    /// Like [`export`](Self::export) but parses the format name first, so an
    /// unknown name fails with [`MetricsError::UnsupportedFormat`].
    pub async fn export_named(&self, format: &str, options: Option<QueryOptions>) -> MetricsResult<String> {
        let format: ExportFormat = format.parse()?;
        self.export(format, options).await
    }

    pub async fn prometheus(&self) -> MetricsResult<String> {
        self.request(|pipeline| pipeline.prometheus()).await
    }

    pub async fn metrics_json(&self) -> MetricsResult<String> {
        self.request(|pipeline| pipeline.metrics_json()).await?
    }

    pub async fn snapshot(&self) -> MetricsResult<MetricsSnapshot> {
        self.request(|pipeline| pipeline.snapshot()).await
    }

    pub async fn health(&self) -> MetricsResult<HealthSummary> {
        self.request(|pipeline| pipeline.health()).await
    }

    pub async fn cost_summary(&self) -> MetricsResult<CostSummary> {
        self.request(|pipeline| pipeline.cost_summary()).await
    }

    pub async fn window_history(&self, window_size_secs: u64) -> MetricsResult<Vec<AggregatedWindow>> {
        self.request(move |pipeline| pipeline.window_history(window_size_secs))
            .await
    }

    pub fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    /// Stops the timers and the actor. Later ingestion calls are counted as
    /// internal errors and later reads fail with `ChannelClosed`.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(CollectorCommand::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}
