use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::aggregator::{ModelAggregator, ProviderAggregator};
use crate::alerts::{AlertEvaluator, AlertEvent};
use crate::bus::MetricsBus;
use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::error::MetricsResult;
use crate::events::{EventMeta, MetricsEvent, SystemEvent};
use crate::pricing::PricingTable;
use crate::retention::{RetentionManager, SweepReport};
use crate::timeseries::TimeSeriesStore;
use crate::tracker::{RequestLifecycleTracker, Sampler};
use crate::types::{
    AggregatedWindow, CostSummary, ExportFormat, HealthStatus, HealthSummary, MetricsSnapshot,
    ModelAggregate, Operation, ProviderAggregate, ProviderError, ProviderHealth, ProviderResponse,
    QueryOptions, RequestMetric, TimeSeriesDataPoint,
};
use crate::window::{aggregate_window, window_bounds, WindowAggregator};

/// The whole request-metrics state, owned by one logical timeline.
///
/// Every mutating call is infallible from the caller's point of view: unknown
/// ids and a disabled pipeline are silent no-ops.
pub struct MetricsPipeline {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    bus: MetricsBus,
    tracker: RequestLifecycleTracker,
    providers: ProviderAggregator,
    models: ModelAggregator,
    alerts: AlertEvaluator,
    windows: WindowAggregator,
    store: TimeSeriesStore,
    retention: RetentionManager,
    internal_errors: Arc<AtomicU64>,
    /// Bus drop count already announced with a `MetricsDropped` event.
    reported_drops: u64,
}

impl MetricsPipeline {
    pub fn new(config: MetricsConfig, bus: MetricsBus, clock: Arc<dyn Clock>) -> Self {
        let sampler = Sampler::new(config.sample_rate, config.sample_seed);
        let pricing = PricingTable::with_overrides(&config.pricing_overrides);
        let mut tracker = RequestLifecycleTracker::new(config.max_history, sampler, pricing);
        tracker.set_enabled(config.enabled);

        Self {
            providers: ProviderAggregator::new(config.latency_sample_capacity),
            models: ModelAggregator::new(),
            alerts: AlertEvaluator::new(config.alerts.clone()),
            windows: WindowAggregator::new(config.window_sizes_secs.clone(), config.max_window_entries),
            store: TimeSeriesStore::new(),
            retention: RetentionManager::new(config.storage.clone()),
            internal_errors: Arc::new(AtomicU64::new(0)),
            reported_drops: 0,
            tracker,
            config,
            clock,
            bus,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        self.tracker.set_enabled(enabled);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn start_request(
        &mut self,
        request_id: &str,
        provider: &str,
        model: &str,
        operation: Operation,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> bool {
        let now = self.clock.now();
        self.start_request_at(request_id, provider, model, operation, metadata, now)
    }

    pub fn start_request_at(
        &mut self,
        request_id: &str,
        provider: &str,
        model: &str,
        operation: Operation,
        metadata: Option<HashMap<String, serde_json::Value>>,
        now: DateTime<Utc>,
    ) -> bool {
        self.tracker
            .start_request(request_id, provider, model, operation, metadata, now)
    }

    pub fn complete_request(
        &mut self,
        request_id: &str,
        response: &ProviderResponse,
        cached: bool,
    ) -> Option<RequestMetric> {
        let now = self.clock.now();
        self.complete_request_at(request_id, response, cached, now)
    }

    pub fn complete_request_at(
        &mut self,
        request_id: &str,
        response: &ProviderResponse,
        cached: bool,
        now: DateTime<Utc>,
    ) -> Option<RequestMetric> {
        let metric = self.tracker.complete_request(request_id, response, cached, now)?;
        self.record_terminal(&metric, now);
        Some(metric)
    }

    pub fn fail_request(
        &mut self,
        request_id: &str,
        error: &ProviderError,
        rate_limit: bool,
        retry_count: u32,
    ) -> Option<RequestMetric> {
        let now = self.clock.now();
        self.fail_request_at(request_id, error, rate_limit, retry_count, now)
    }

    pub fn fail_request_at(
        &mut self,
        request_id: &str,
        error: &ProviderError,
        rate_limit: bool,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Option<RequestMetric> {
        let metric = self
            .tracker
            .fail_request(request_id, error, rate_limit, retry_count, now)?;
        self.record_terminal(&metric, now);
        Some(metric)
    }

    fn record_terminal(&mut self, metric: &RequestMetric, now: DateTime<Utc>) {
        let aggregate = self.providers.record(metric).clone();
        self.models.record(metric, now);

        self.bus.emit(MetricsEvent::Collected {
            meta: EventMeta::at(now),
            metric: metric.clone(),
        });

        for alert in self.alerts.evaluate(metric, &aggregate, now) {
            self.publish_alert(alert, now);
        }

        self.store.store_request_metrics(metric);
        if let Some(trim) = self.retention.enforce_size(&mut self.store) {
            self.bus.emit_system(SystemEvent::StorageTrimmed {
                removed_points: trim.removed_points,
                estimated_bytes: trim.estimated_bytes,
                max_bytes: trim.max_bytes,
            });
        }
    }

    fn publish_alert(&self, alert: AlertEvent, now: DateTime<Utc>) {
        log::warn!(
            "[{}] {} alert for {}: {}",
            alert.severity,
            alert.kind.as_str(),
            alert.provider,
            alert.message
        );
        self.bus.emit(MetricsEvent::Alert {
            meta: EventMeta::at(now),
            alert,
        });
    }

    /// One window tick at the clock's current instant.
    pub fn run_window(&mut self, window_size_secs: u64) -> AggregatedWindow {
        let now = self.clock.now();
        self.run_window_at(window_size_secs, now)
    }

    pub fn run_window_at(&mut self, window_size_secs: u64, now: DateTime<Utc>) -> AggregatedWindow {
        let (start, end) = window_bounds(window_size_secs, now);
        let slice = self.tracker.snapshot_between(start, end);
        if !self.config.enabled {
            return aggregate_window(window_size_secs, now, &slice);
        }
        let window = self.windows.record_tick(window_size_secs, now, &slice);

        self.store.store_aggregated_metrics(&window);
        log::debug!(
            "aggregated {} window: {} requests, {} errors",
            window.period_label(),
            window.overall.request_count,
            window.overall.error_count
        );
        self.bus.emit(MetricsEvent::Aggregated {
            meta: EventMeta::at(now),
            window: window.clone(),
        });
        window
    }

    pub fn run_retention(&mut self) -> SweepReport {
        let now = self.clock.now();
        self.run_retention_at(now)
    }

    pub fn run_retention_at(&mut self, now: DateTime<Utc>) -> SweepReport {
        self.report_dropped_events();
        let report = self.retention.sweep(&mut self.store, now);
        self.bus.emit_system(SystemEvent::RetentionSwept {
            removed_raw: report.removed_raw,
            removed_aggregated: report.removed_aggregated,
            compressed: report.compressed,
        });
        report
    }

    /// Announces bus drops that happened since the last announcement.
    fn report_dropped_events(&mut self) {
        let dropped = self.bus.dropped_count();
        if dropped > self.reported_drops {
            let count = dropped - self.reported_drops;
            log::warn!("{} metrics events dropped since the last sweep", count);
            self.bus
                .emit_dropped_notification(count, "event bus full or closed");
            self.reported_drops = dropped;
        }
    }

    pub fn query(&self, options: &QueryOptions) -> Vec<TimeSeriesDataPoint> {
        self.store.query(options)
    }

    pub fn export(&self, format: ExportFormat, options: Option<&QueryOptions>) -> MetricsResult<String> {
        self.store.export(format, options)
    }

    pub fn prometheus(&self) -> String {
        crate::export::prometheus(&self.store.query(&QueryOptions::default()))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            generated_at: self.clock.now(),
            providers: self.providers.all(),
            models: self.models.all(),
            latest_windows: self.windows.latest(),
        }
    }

    pub fn metrics_json(&self) -> MetricsResult<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn health(&self) -> HealthSummary {
        let thresholds = self.alerts.thresholds();
        let classify = |error_rate: f64| {
            if error_rate > thresholds.error_rate_critical {
                HealthStatus::Unhealthy
            } else if error_rate > thresholds.error_rate_high {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        };

        let providers: Vec<ProviderHealth> = self
            .providers
            .all()
            .into_iter()
            .map(|aggregate| ProviderHealth {
                status: classify(aggregate.error_rate),
                provider: aggregate.provider,
                total_requests: aggregate.total_requests,
                error_rate: aggregate.error_rate,
                avg_latency_ms: aggregate.avg_latency_ms,
                p95_latency_ms: aggregate.p95_latency_ms,
            })
            .collect();

        let status = providers
            .iter()
            .map(|provider| provider.status)
            .max_by_key(|status| match status {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy);

        HealthSummary {
            enabled: self.config.enabled,
            status,
            tracked_requests: self.tracker.history_len(),
            pending_requests: self.tracker.pending_len(),
            providers,
            raw_points: self.store.raw_len(),
            aggregated_groups: self.store.aggregated_groups(),
            compressed_points: self.retention.compressed_len(),
            estimated_storage_bytes: self.retention.estimated_bytes(&self.store),
            dropped_events: self.bus.dropped_count(),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }

    pub fn cost_summary(&self) -> CostSummary {
        let mut summary = CostSummary::default();
        for aggregate in self.providers.all() {
            summary.total_cost += aggregate.total_cost;
            summary.total_tokens += aggregate.total_tokens;
            summary.total_requests += aggregate.total_requests;
            summary
                .by_provider
                .insert(aggregate.provider.clone(), aggregate.total_cost);
        }
        for model in self.models.all() {
            summary.by_model.insert(
                crate::types::model_key(&model.provider, &model.model),
                model.avg_cost * model.request_count as f64,
            );
        }
        summary
    }

    pub fn provider_aggregate(&self, provider: &str) -> Option<&ProviderAggregate> {
        self.providers.get(provider)
    }

    pub fn model_aggregate(&self, provider: &str, model: &str) -> Option<&ModelAggregate> {
        self.models.get(provider, model)
    }

    pub fn window_history(&self, window_size_secs: u64) -> Vec<AggregatedWindow> {
        self.windows.history(window_size_secs)
    }

    pub fn tracker(&self) -> &RequestLifecycleTracker {
        &self.tracker
    }

    pub fn store(&self) -> &TimeSeriesStore {
        &self.store
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn bus(&self) -> &MetricsBus {
        &self.bus
    }

    /// Shared counter of failures swallowed on the ingestion path.
    pub fn internal_error_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.internal_errors)
    }

    pub fn record_internal_error(&self, context: &str) {
        let total = self.internal_errors.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("metrics pipeline swallowed an internal failure in {} ({} total)", context, total);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use tokio::sync::mpsc;

    use super::*;
    use crate::alerts::{AlertKind, Severity};
    use crate::clock::ManualClock;
    use crate::timeseries::REQUEST_LATENCY_MS;
    use crate::types::TokenUsage;

    fn setup(config: MetricsConfig) -> (MetricsPipeline, ManualClock, mpsc::Receiver<MetricsEvent>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap());
        let (bus, rx) = MetricsBus::new(1_000);
        let pipeline = MetricsPipeline::new(config, bus, Arc::new(clock.clone()));
        (pipeline, clock, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<MetricsEvent>) -> Vec<MetricsEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn response(model: &str, prompt: u64, completion: u64) -> ProviderResponse {
        ProviderResponse {
            id: "chatcmpl-1".into(),
            model: model.into(),
            usage: Some(TokenUsage::new(prompt, completion)),
            provider: "openai".into(),
        }
    }

    #[test]
    fn completion_updates_aggregates_store_and_emits_collected() {
        let (mut pipeline, clock, mut rx) = setup(MetricsConfig::default());

        pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None);
        clock.advance(Duration::milliseconds(640));
        let metric = pipeline
            .complete_request("a", &response("gpt-4", 1000, 500), false)
            .expect("tracked");

        let aggregate = pipeline.provider_aggregate("openai").expect("aggregate");
        assert_eq!(aggregate.total_requests, 1);
        assert_eq!(aggregate.p50_latency_ms, 640);
        assert!((aggregate.total_cost - 0.06).abs() < 1e-4);

        let ts = metric.start_time.timestamp_millis();
        let points = pipeline.query(
            &QueryOptions::default()
                .metric(REQUEST_LATENCY_MS)
                .provider("openai")
                .between(ts - 1, ts + 1),
        );
        assert_eq!(points[0].value, 640.0);

        let names: Vec<&str> = drain(&mut rx).iter().map(MetricsEvent::name).collect();
        assert_eq!(names, vec!["collected"]);
    }

    #[test]
    fn slow_success_raises_critical_latency_alert() {
        let (mut pipeline, clock, mut rx) = setup(MetricsConfig::default());
        pipeline.start_request("slow", "openai", "gpt-4", Operation::ChatCompletion, None);
        clock.advance(Duration::milliseconds(12_000));
        pipeline.complete_request("slow", &response("gpt-4", 1, 1), false);

        let alerts: Vec<AlertEvent> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                MetricsEvent::Alert { alert, .. } => Some(alert),
                _ => None,
            })
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Latency);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn unknown_ids_and_disabled_pipeline_are_silent() {
        let (mut pipeline, _clock, mut rx) = setup(MetricsConfig::default());
        assert!(pipeline.complete_request("nope", &response("gpt-4", 1, 1), false).is_none());
        assert!(pipeline.fail_request("nope", &ProviderError::new("x"), false, 0).is_none());

        pipeline.set_enabled(false);
        assert!(!pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(pipeline.store().raw_len(), 0);
        assert!(!pipeline.health().enabled);
    }

    #[test]
    fn window_tick_stores_aggregate_points_and_emits() {
        let (mut pipeline, clock, mut rx) = setup(MetricsConfig::default());
        pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None);
        clock.advance(Duration::seconds(1));
        pipeline.complete_request("a", &response("gpt-4", 10, 10), true);
        drain(&mut rx);

        clock.advance(Duration::seconds(30));
        let window = pipeline.run_window(60);

        assert_eq!(window.overall.request_count, 1);
        assert_eq!(window.overall.cache_hits, 1);
        assert_eq!(pipeline.store().aggregated_groups(), 1);
        assert_eq!(pipeline.window_history(60).len(), 1);
        assert_eq!(pipeline.snapshot().latest_windows.len(), 1);
        let names: Vec<&str> = drain(&mut rx).iter().map(MetricsEvent::name).collect();
        assert_eq!(names, vec!["aggregated"]);
    }

    #[test]
    fn disabled_window_tick_computes_but_records_nothing() {
        let (mut pipeline, clock, mut rx) = setup(MetricsConfig::default());
        pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None);
        pipeline.complete_request("a", &response("gpt-4", 10, 10), false);
        drain(&mut rx);

        pipeline.set_enabled(false);
        clock.advance(Duration::seconds(1));
        let window = pipeline.run_window(60);

        assert_eq!(window.overall.request_count, 1);
        assert!(pipeline.window_history(60).is_empty());
        assert!(pipeline.snapshot().latest_windows.is_empty());
        assert_eq!(pipeline.store().aggregated_groups(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn retention_sweep_announces_bus_drops() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap());
        let (bus, mut rx) = MetricsBus::new(1);
        let mut pipeline = MetricsPipeline::new(MetricsConfig::default(), bus, Arc::new(clock));

        for id in ["a", "b", "c"] {
            pipeline.start_request(id, "openai", "gpt-4", Operation::ChatCompletion, None);
            pipeline.complete_request(id, &response("gpt-4", 1, 1), false);
        }
        assert_eq!(pipeline.bus().dropped_count(), 2);
        drain(&mut rx);

        pipeline.run_retention();

        match rx.try_recv() {
            Ok(MetricsEvent::System(SystemEvent::MetricsDropped { count, .. })) => assert_eq!(count, 2),
            other => panic!("expected MetricsDropped, got {:?}", other.map(|event| event.name())),
        }
        // The sweep summary found the channel full and is announced next time.
        pipeline.run_retention();
        match rx.try_recv() {
            Ok(MetricsEvent::System(SystemEvent::MetricsDropped { count, .. })) => assert_eq!(count, 1),
            other => panic!("expected MetricsDropped, got {:?}", other.map(|event| event.name())),
        }
    }

    #[test]
    fn internal_errors_surface_in_health() {
        let (pipeline, _clock, _rx) = setup(MetricsConfig::default());
        pipeline.record_internal_error("window tick");
        pipeline.record_internal_error("window tick");
        assert_eq!(pipeline.health().internal_errors, 2);
        assert_eq!(pipeline.internal_error_counter().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn size_guard_emits_storage_trimmed() {
        let mut config = MetricsConfig::default();
        config.storage.max_storage_bytes = 1_000;
        let (mut pipeline, _clock, mut rx) = setup(config);

        pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None);
        pipeline.complete_request("a", &response("gpt-4", 10, 10), false);

        let trimmed = drain(&mut rx).into_iter().any(|event| {
            matches!(event, MetricsEvent::System(SystemEvent::StorageTrimmed { .. }))
        });
        assert!(trimmed);
        assert!(pipeline.store().raw_len() < 8);
    }

    #[test]
    fn health_and_cost_summaries_reflect_providers() {
        let (mut pipeline, _clock, _rx) = setup(MetricsConfig::default());
        pipeline.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None);
        pipeline.complete_request("a", &response("gpt-4", 1000, 500), false);
        pipeline.start_request("b", "llama.cpp", "mistral", Operation::ChatCompletion, None);
        pipeline.fail_request("b", &ProviderError::new("down"), false, 0);

        let health = pipeline.health();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.providers.len(), 2);
        assert_eq!(health.tracked_requests, 2);
        assert_eq!(health.pending_requests, 0);

        let costs = pipeline.cost_summary();
        assert!((costs.total_cost - 0.06).abs() < 1e-4);
        assert_eq!(costs.by_provider["llama.cpp"], 0.0);
        assert!((costs.by_model["openai:gpt-4"] - 0.06).abs() < 1e-4);
        assert_eq!(costs.total_requests, 2);
    }
}
