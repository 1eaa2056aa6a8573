use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use provider_metrics::timeseries::{REQUEST_LATENCY_MS, REQUEST_TOTAL};
use provider_metrics::{
    AlertEvent, AlertKind, ExportFormat, ManualClock, MetricsBus, MetricsConfig, MetricsError,
    MetricsEvent, MetricsPipeline, Operation, ProviderError, ProviderResponse, QueryOptions,
    Severity, TokenUsage,
};
use tokio::sync::mpsc;

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 3, 14, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn pipeline(config: MetricsConfig) -> (MetricsPipeline, ManualClock, mpsc::Receiver<MetricsEvent>) {
    let clock = ManualClock::new(start_time());
    let (bus, rx) = MetricsBus::new(10_000);
    (MetricsPipeline::new(config, bus, Arc::new(clock.clone())), clock, rx)
}

fn ok_response(provider: &str, model: &str, prompt: u64, completion: u64) -> ProviderResponse {
    ProviderResponse {
        id: "resp".into(),
        model: model.into(),
        usage: Some(TokenUsage::new(prompt, completion)),
        provider: provider.into(),
    }
}

fn alerts(rx: &mut mpsc::Receiver<MetricsEvent>) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let MetricsEvent::Alert { alert, .. } = event {
            alerts.push(alert);
        }
    }
    alerts
}

#[test]
fn three_successes_and_two_failures_raise_error_rate_alert() {
    let (mut pipeline, clock, mut rx) = pipeline(MetricsConfig::default());

    for i in 0..3 {
        let id = format!("ok-{i}");
        pipeline.start_request(&id, "openai", "gpt-4", Operation::ChatCompletion, None);
        clock.advance(Duration::milliseconds(100));
        pipeline.complete_request(&id, &ok_response("openai", "gpt-4", 10, 10), false);
    }
    for i in 0..2 {
        let id = format!("fail-{i}");
        pipeline.start_request(&id, "openai", "gpt-4", Operation::ChatCompletion, None);
        clock.advance(Duration::milliseconds(100));
        pipeline.fail_request(&id, &ProviderError::new("bad gateway").with_code("502"), false, 0);
    }

    let aggregate = pipeline.provider_aggregate("openai").expect("aggregate");
    assert_eq!(aggregate.total_requests, 5);
    assert_eq!(aggregate.failed_requests, 2);
    assert!((aggregate.error_rate - 0.4).abs() < 1e-9);

    let error_alerts: Vec<AlertEvent> = alerts(&mut rx)
        .into_iter()
        .filter(|alert| alert.kind == AlertKind::ErrorRate)
        .collect();
    assert_eq!(error_alerts.len(), 2);
    assert!(error_alerts.iter().all(|alert| alert.severity >= Severity::High));
    assert!((error_alerts[1].value - 0.4).abs() < 1e-9);
}

#[test]
fn percentiles_are_ordered_and_history_is_bounded() {
    let mut config = MetricsConfig::default();
    config.max_history = 50;
    let (mut pipeline, clock, _rx) = pipeline(config);

    for i in 0..200u64 {
        let id = format!("r-{i}");
        pipeline.start_request(&id, "anthropic", "claude-3-haiku", Operation::ChatCompletion, None);
        clock.advance(Duration::milliseconds(((i * 7919) % 900 + 10) as i64));
        pipeline.complete_request(&id, &ok_response("anthropic", "claude-3-haiku", 5, 5), i % 3 == 0);
        assert!(pipeline.tracker().history_len() <= 50);
    }

    let aggregate = pipeline.provider_aggregate("anthropic").expect("aggregate");
    assert!(aggregate.p50_latency_ms <= aggregate.p95_latency_ms);
    assert!(aggregate.p95_latency_ms <= aggregate.p99_latency_ms);
    assert_eq!(pipeline.tracker().history_len(), 50);
    assert_eq!(aggregate.total_requests, 200);
}

#[test]
fn self_hosted_models_cost_nothing_and_gpt4_pricing_applies() {
    let (mut pipeline, _clock, _rx) = pipeline(MetricsConfig::default());

    pipeline.start_request("local", "ollama", "llama3:8b", Operation::ChatCompletion, None);
    let local = pipeline
        .complete_request("local", &ok_response("ollama", "llama3:8b", 100_000, 50_000), false)
        .expect("tracked");
    assert_eq!(local.cost, Some(0.0));

    pipeline.start_request("paid", "openai", "gpt-4", Operation::ChatCompletion, None);
    let paid = pipeline
        .complete_request("paid", &ok_response("openai", "gpt-4", 1000, 500), false)
        .expect("tracked");
    assert!((paid.cost.expect("cost") - 0.06).abs() < 1e-4);
}

#[test]
fn sampling_tracks_roughly_the_configured_share() {
    let mut config = MetricsConfig::default();
    config.sample_rate = 0.25;
    config.sample_seed = Some(42);
    config.max_history = 20_000;
    let (mut pipeline, _clock, _rx) = pipeline(config);

    let tracked = (0..8_000)
        .filter(|i| {
            pipeline.start_request(&format!("s-{i}"), "openai", "gpt-4", Operation::Embedding, None)
        })
        .count();

    assert!((1_700..=2_300).contains(&tracked), "tracked {tracked}");
    assert_eq!(pipeline.tracker().pending_len(), tracked);
}

#[test]
fn stored_request_is_queryable_by_latency_metric() {
    let (mut pipeline, clock, _rx) = pipeline(MetricsConfig::default());
    pipeline.start_request("q", "openai", "gpt-4o", Operation::ChatCompletion, None);
    clock.advance(Duration::milliseconds(333));
    let metric = pipeline
        .complete_request("q", &ok_response("openai", "gpt-4o", 1, 1), false)
        .expect("tracked");

    let ts = metric.start_time.timestamp_millis();
    let points = pipeline.query(
        &QueryOptions::default()
            .metric(REQUEST_LATENCY_MS)
            .provider(&metric.provider)
            .between(ts - 1, ts + 1),
    );
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 333.0);
}

#[test]
fn raw_points_expire_after_the_raw_policy() {
    let (mut pipeline, clock, _rx) = pipeline(MetricsConfig::default());
    pipeline.start_request("old", "openai", "gpt-4", Operation::ChatCompletion, None);
    pipeline.complete_request("old", &ok_response("openai", "gpt-4", 1, 1), false);
    assert!(pipeline.store().raw_len() > 0);

    clock.advance(Duration::days(8));
    let report = pipeline.run_retention();

    assert!(report.removed_raw > 0);
    assert_eq!(pipeline.store().raw_len(), 0);
    let totals = pipeline.query(&QueryOptions::default().metric(REQUEST_TOTAL));
    assert!(totals.is_empty());
}

#[test]
fn exports_cover_every_format_and_reject_unknown_names() {
    let (mut pipeline, _clock, _rx) = pipeline(MetricsConfig::default());
    pipeline.start_request("e", "openai", "gpt-4", Operation::ChatCompletion, None);
    pipeline.complete_request("e", &ok_response("openai", "gpt-4", 3, 4), false);

    let prometheus = pipeline.export(ExportFormat::Prometheus, None).expect("prometheus");
    assert!(prometheus.contains("# TYPE ai_request_total gauge"));

    let influx = pipeline.export(ExportFormat::Influxdb, None).expect("influx");
    assert!(influx.lines().any(|line| line.starts_with("ai_request_total,")));

    let csv = pipeline.export(ExportFormat::Csv, None).expect("csv");
    assert!(csv.starts_with("timestamp,metric,value,tags\n"));

    let json = pipeline.export(ExportFormat::Json, None).expect("json");
    assert!(json.trim_start().starts_with('['));

    let unknown = "graphite".parse::<ExportFormat>();
    assert!(matches!(unknown, Err(MetricsError::UnsupportedFormat(name)) if name == "graphite"));
}

#[test]
fn config_loads_from_toml() {
    let config = MetricsConfig::from_toml_str(
        r#"
        sample_rate = 1.5
        max_history = 500
        window_sizes_secs = [300, 60, 60]

        [alerts]
        latency_high_ms = 2000

        [pricing_overrides.acme.small]
        input = 1.0
        output = 2.0
        "#,
    )
    .expect("config");

    assert_eq!(config.sample_rate, 1.0);
    assert_eq!(config.max_history, 500);
    assert_eq!(config.window_sizes_secs, vec![60, 300]);
    assert_eq!(config.alerts.latency_high_ms, 2000);
    assert_eq!(config.alerts.latency_critical_ms, 10_000);

    let (mut pipeline, _clock, _rx) = pipeline(config);
    pipeline.start_request("c", "acme", "small", Operation::ChatCompletion, None);
    let metric = pipeline
        .complete_request("c", &ok_response("acme", "small", 1_000_000, 1_000_000), false)
        .expect("tracked");
    assert!((metric.cost.expect("cost") - 3.0).abs() < 1e-9);
}
