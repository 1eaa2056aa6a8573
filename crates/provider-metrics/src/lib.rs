//! Request-level metrics for LLM provider calls: lifecycle tracking,
//! per-provider and per-model aggregates, threshold alerts, windowed
//! summaries, a time-series store with exporters, and retention.

pub mod aggregator;
pub mod alerts;
pub mod bus;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod pipeline;
pub mod pricing;
pub mod retention;
pub mod ring;
pub mod scheduler;
pub mod storage;
pub mod timeseries;
pub mod tracker;
pub mod types;
pub mod window;
pub mod worker;

pub use aggregator::{ModelAggregator, ProviderAggregator};
pub use alerts::{AlertEvaluator, AlertEvent, AlertKind, Severity};
pub use bus::MetricsBus;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::MetricsCollector;
pub use config::{AlertThresholds, MetricsConfig, StorageConfig};
pub use error::{MetricsError, MetricsResult};
pub use events::{EventMeta, MetricsEvent, SystemEvent};
pub use pipeline::MetricsPipeline;
pub use pricing::{ModelPricing, PricingTable};
pub use retention::{CompressedBatch, RetentionManager, SweepReport, TrimReport};
pub use scheduler::Scheduler;
pub use storage::{MetricsStorage, SqliteMetricsStorage};
pub use timeseries::TimeSeriesStore;
pub use tracker::{RequestLifecycleTracker, Sampler};
pub use types::{
    AggregatedWindow, Aggregation, CostSummary, ExportFormat, HealthStatus, HealthSummary,
    MetricsSnapshot, ModelAggregate, Operation, ProviderAggregate, ProviderError, ProviderHealth,
    ProviderResponse, QueryOptions, RequestMetric, RetentionKind, RetentionPolicy,
    Tags, TimeSeriesDataPoint, TimeWindowMetrics, TokenUsage,
};
pub use window::WindowAggregator;
pub use worker::MetricsWorker;
