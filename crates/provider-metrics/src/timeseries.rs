use std::collections::{BTreeMap, HashMap};

use crate::error::MetricsResult;
use crate::export;
use crate::types::{
    AggregatedWindow, Aggregation, ExportFormat, QueryOptions, RequestMetric, Tags,
    TimeSeriesDataPoint, TimeWindowMetrics,
};

pub const REQUEST_TOTAL: &str = "ai_request_total";
pub const REQUEST_LATENCY_MS: &str = "ai_request_latency_ms";
pub const REQUEST_TOKENS_PROMPT: &str = "ai_request_tokens_prompt";
pub const REQUEST_TOKENS_COMPLETION: &str = "ai_request_tokens_completion";
pub const REQUEST_TOKENS_TOTAL: &str = "ai_request_tokens_total";
pub const REQUEST_COST_USD: &str = "ai_request_cost_usd";
pub const REQUEST_CACHE_HIT: &str = "ai_request_cache_hit";
pub const REQUEST_ERROR: &str = "ai_request_error";

pub const WINDOW_REQUESTS: &str = "ai_window_requests";
pub const WINDOW_ERRORS: &str = "ai_window_errors";
pub const WINDOW_ERROR_RATE: &str = "ai_window_error_rate";
pub const WINDOW_LATENCY_AVG_MS: &str = "ai_window_latency_avg_ms";
pub const WINDOW_TOKENS: &str = "ai_window_tokens";
pub const WINDOW_COST_USD: &str = "ai_window_cost_usd";
pub const WINDOW_CACHE_HITS: &str = "ai_window_cache_hits";
pub const WINDOW_CACHE_MISSES: &str = "ai_window_cache_misses";

pub const TAG_PROVIDER: &str = "provider";
pub const TAG_MODEL: &str = "model";
pub const TAG_OPERATION: &str = "operation";
pub const TAG_SUCCESS: &str = "success";
pub const TAG_ERROR_CODE: &str = "error_code";
pub const TAG_PERIOD: &str = "period";
pub const TAG_SCOPE: &str = "scope";
pub const TAG_AGGREGATION: &str = "aggregation";

/// Expands one request record into its typed points, stamped at the request start.
pub fn request_points(metric: &RequestMetric) -> Vec<TimeSeriesDataPoint> {
    let timestamp = metric.start_time.timestamp_millis();
    let mut tags = Tags::new();
    tags.insert(TAG_PROVIDER.into(), metric.provider.clone());
    tags.insert(TAG_MODEL.into(), metric.model.clone());
    tags.insert(TAG_OPERATION.into(), metric.operation.as_str().into());
    tags.insert(TAG_SUCCESS.into(), metric.success.to_string());

    let point = |name: &str, value: f64| TimeSeriesDataPoint::new(timestamp, name, value, tags.clone());
    let mut points = vec![point(REQUEST_TOTAL, 1.0)];

    if let Some(latency) = metric.latency_ms {
        points.push(point(REQUEST_LATENCY_MS, latency as f64));
    }
    if let Some(usage) = metric.token_usage {
        points.push(point(REQUEST_TOKENS_PROMPT, usage.prompt_tokens as f64));
        points.push(point(REQUEST_TOKENS_COMPLETION, usage.completion_tokens as f64));
        points.push(point(REQUEST_TOKENS_TOTAL, usage.total_tokens as f64));
    }
    if let Some(cost) = metric.cost {
        points.push(point(REQUEST_COST_USD, cost));
    }
    points.push(point(REQUEST_CACHE_HIT, if metric.cached { 1.0 } else { 0.0 }));

    let mut error = point(REQUEST_ERROR, if metric.is_failure() { 1.0 } else { 0.0 });
    if let Some(code) = &metric.error_code {
        error.tags.insert(TAG_ERROR_CODE.into(), code.clone());
    }
    points.push(error);

    points
}

/// Expands one window tick into points for the overall, provider and model scopes.
pub fn aggregated_points(window: &AggregatedWindow) -> Vec<TimeSeriesDataPoint> {
    let period = window.period_label();
    let mut points = Vec::new();

    let mut overall = Tags::new();
    overall.insert(TAG_PERIOD.into(), period.clone());
    overall.insert(TAG_SCOPE.into(), "overall".into());
    push_window_points(&mut points, &window.overall, &overall);

    for (provider, metrics) in &window.by_provider {
        let mut tags = Tags::new();
        tags.insert(TAG_PERIOD.into(), period.clone());
        tags.insert(TAG_SCOPE.into(), "provider".into());
        tags.insert(TAG_PROVIDER.into(), provider.clone());
        push_window_points(&mut points, metrics, &tags);
    }

    for (key, metrics) in &window.by_model {
        let (provider, model) = key.split_once(':').unwrap_or((key.as_str(), ""));
        let mut tags = Tags::new();
        tags.insert(TAG_PERIOD.into(), period.clone());
        tags.insert(TAG_SCOPE.into(), "model".into());
        tags.insert(TAG_PROVIDER.into(), provider.to_string());
        tags.insert(TAG_MODEL.into(), model.to_string());
        push_window_points(&mut points, metrics, &tags);
    }

    points
}

fn push_window_points(points: &mut Vec<TimeSeriesDataPoint>, metrics: &TimeWindowMetrics, tags: &Tags) {
    let timestamp = metrics.window_end.timestamp_millis();
    let avg_latency = if metrics.request_count == 0 {
        0.0
    } else {
        metrics.total_latency_ms as f64 / metrics.request_count as f64
    };
    for (name, value) in [
        (WINDOW_REQUESTS, metrics.request_count as f64),
        (WINDOW_ERRORS, metrics.error_count as f64),
        (WINDOW_ERROR_RATE, metrics.error_rate()),
        (WINDOW_LATENCY_AVG_MS, avg_latency),
        (WINDOW_TOKENS, metrics.total_tokens as f64),
        (WINDOW_COST_USD, metrics.total_cost),
        (WINDOW_CACHE_HITS, metrics.cache_hits as f64),
        (WINDOW_CACHE_MISSES, metrics.cache_misses as f64),
    ] {
        points.push(TimeSeriesDataPoint::new(timestamp, name, value, tags.clone()));
    }
}

/// In-memory store of raw request points and windowed aggregate groups.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesStore {
    raw: Vec<TimeSeriesDataPoint>,
    /// Keyed `"{period}_{window end ms}"`.
    aggregated: BTreeMap<String, Vec<TimeSeriesDataPoint>>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_request_metrics(&mut self, metric: &RequestMetric) -> usize {
        let points = request_points(metric);
        let added = points.len();
        self.raw.extend(points);
        added
    }

    pub fn store_aggregated_metrics(&mut self, window: &AggregatedWindow) -> usize {
        let key = format!(
            "{}_{}",
            window.period_label(),
            window.overall.window_end.timestamp_millis()
        );
        let points = aggregated_points(window);
        let added = points.len();
        self.aggregated.entry(key).or_default().extend(points);
        added
    }

    pub fn query(&self, options: &QueryOptions) -> Vec<TimeSeriesDataPoint> {
        let matched = self
            .raw
            .iter()
            .chain(self.aggregated.values().flatten())
            .filter(|point| matches(point, options));

        let mut results: Vec<TimeSeriesDataPoint> = match (options.aggregation, options.interval_ms) {
            (Some(aggregation), Some(interval)) if interval > 0 => {
                bucketize(matched, aggregation, interval, options)
            }
            _ => matched.cloned().collect(),
        };

        results.sort_by_key(|point| point.timestamp);
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn export(&self, format: ExportFormat, options: Option<&QueryOptions>) -> MetricsResult<String> {
        let points = self.query(options.unwrap_or(&QueryOptions::default()));
        export::render(&points, format)
    }

    pub fn raw_points(&self) -> &[TimeSeriesDataPoint] {
        &self.raw
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn aggregated_groups(&self) -> usize {
        self.aggregated.len()
    }

    pub fn aggregated_len(&self) -> usize {
        self.aggregated.values().map(Vec::len).sum()
    }

    pub fn point_count(&self) -> usize {
        self.raw_len() + self.aggregated_len()
    }

    /// Removes and returns the `count` oldest raw points by insertion order.
    pub(crate) fn drain_oldest_raw(&mut self, count: usize) -> Vec<TimeSeriesDataPoint> {
        let count = count.min(self.raw.len());
        self.raw.drain(..count).collect()
    }

    /// Removes raw points matching `predicate`, returning them in stored order.
    pub(crate) fn extract_raw<F>(&mut self, predicate: F) -> Vec<TimeSeriesDataPoint>
    where
        F: Fn(&TimeSeriesDataPoint) -> bool,
    {
        let (extracted, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.raw).into_iter().partition(|point| predicate(point));
        self.raw = kept;
        extracted
    }

    pub(crate) fn aggregated_groups_mut(&mut self) -> &mut BTreeMap<String, Vec<TimeSeriesDataPoint>> {
        &mut self.aggregated
    }
}

fn matches(point: &TimeSeriesDataPoint, options: &QueryOptions) -> bool {
    if options.start_time.is_some_and(|start| point.timestamp < start) {
        return false;
    }
    if options.end_time.is_some_and(|end| point.timestamp > end) {
        return false;
    }
    if options.metric.as_deref().is_some_and(|metric| point.metric != metric) {
        return false;
    }
    if options
        .provider
        .as_deref()
        .is_some_and(|provider| point.tag(TAG_PROVIDER) != Some(provider))
    {
        return false;
    }
    if options
        .model
        .as_deref()
        .is_some_and(|model| point.tag(TAG_MODEL) != Some(model))
    {
        return false;
    }
    true
}

fn bucketize<'a>(
    points: impl Iterator<Item = &'a TimeSeriesDataPoint>,
    aggregation: Aggregation,
    interval: i64,
    options: &QueryOptions,
) -> Vec<TimeSeriesDataPoint> {
    let mut buckets: HashMap<(String, i64), Vec<f64>> = HashMap::new();
    for point in points {
        let bucket = point.timestamp.div_euclid(interval) * interval;
        buckets
            .entry((point.metric.clone(), bucket))
            .or_default()
            .push(point.value);
    }

    let mut tags = Tags::new();
    tags.insert(TAG_AGGREGATION.into(), aggregation_name(aggregation).into());
    if let Some(provider) = &options.provider {
        tags.insert(TAG_PROVIDER.into(), provider.clone());
    }
    if let Some(model) = &options.model {
        tags.insert(TAG_MODEL.into(), model.clone());
    }

    let mut results: Vec<TimeSeriesDataPoint> = buckets
        .into_iter()
        .map(|((metric, bucket), values)| {
            TimeSeriesDataPoint::new(bucket, metric, reduce(&values, aggregation), tags.clone())
        })
        .collect();
    results.sort_by(|a, b| (a.timestamp, &a.metric).cmp(&(b.timestamp, &b.metric)));
    results
}

fn aggregation_name(aggregation: Aggregation) -> &'static str {
    match aggregation {
        Aggregation::Avg => "avg",
        Aggregation::Sum => "sum",
        Aggregation::Min => "min",
        Aggregation::Max => "max",
        Aggregation::Count => "count",
    }
}

fn reduce(values: &[f64], aggregation: Aggregation) -> f64 {
    match aggregation {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Avg if values.is_empty() => 0.0,
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => values.len() as f64,
    }
}
