use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetricsError;

/// Tag set of a time-series point. Ordered so exports are deterministic.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ChatCompletion,
    ChatCompletionStream,
    Embedding,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletion => "chat_completion",
            Self::ChatCompletionStream => "chat_completion_stream",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful provider response, as handed over by the provider layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    pub provider: String,
}

/// Failed provider call, as handed over by the provider layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// One tracked provider call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMetric {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub token_usage: Option<TokenUsage>,
    pub cost: Option<f64>,
    pub cached: bool,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub rate_limit: bool,
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RequestMetric {
    pub fn pending(
        request_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        operation: Operation,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            provider: provider.into(),
            model: model.into(),
            operation,
            start_time,
            end_time: None,
            latency_ms: None,
            token_usage: None,
            cost: None,
            cached: false,
            success: false,
            error_code: None,
            error_message: None,
            rate_limit: false,
            retry_count: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !self.success
    }

    pub fn model_key(&self) -> String {
        model_key(&self.provider, &self.model)
    }
}

pub fn model_key(provider: &str, model: &str) -> String {
    format!("{}:{}", provider, model)
}

/// Running statistics for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderAggregate {
    pub provider: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub rate_limit_events: u64,
    pub cache_hits: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

/// Running statistics for one `provider:model` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelAggregate {
    pub provider: String,
    pub model: String,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub avg_cost: f64,
    pub success_rate: f64,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindowMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
    pub total_latency_ms: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl TimeWindowMetrics {
    pub fn empty(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            window_start,
            window_end,
            request_count: 0,
            error_count: 0,
            total_latency_ms: 0,
            total_tokens: 0,
            total_cost: 0.0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.cache_hits + self.cache_misses)
    }
}

/// Result of one window tick: overall bucket plus provider and model breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedWindow {
    pub window_size_secs: u64,
    pub overall: TimeWindowMetrics,
    pub by_provider: BTreeMap<String, TimeWindowMetrics>,
    pub by_model: BTreeMap<String, TimeWindowMetrics>,
}

impl AggregatedWindow {
    /// Label used as the `period` tag and aggregated-group key prefix, e.g. `5m`.
    pub fn period_label(&self) -> String {
        period_label(self.window_size_secs)
    }
}

pub fn period_label(window_size_secs: u64) -> String {
    if window_size_secs % 3600 == 0 {
        format!("{}h", window_size_secs / 3600)
    } else if window_size_secs % 60 == 0 {
        format!("{}m", window_size_secs / 60)
    } else {
        format!("{}s", window_size_secs)
    }
}

/// The storage atom: `(timestamp ms, metric, value, tags)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesDataPoint {
    pub timestamp: i64,
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub tags: Tags,
}

impl TimeSeriesDataPoint {
    pub fn new(timestamp: i64, metric: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self {
            timestamp,
            metric: metric.into(),
            value,
            tags,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    Raw,
    Aggregated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub name: String,
    pub kind: RetentionKind,
    pub max_age_secs: u64,
    /// Window size governed by an aggregated policy; `None` governs every period.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl RetentionPolicy {
    pub fn raw(name: impl Into<String>, max_age_secs: u64) -> Self {
        Self {
            name: name.into(),
            kind: RetentionKind::Raw,
            max_age_secs,
            interval_secs: None,
        }
    }

    pub fn aggregated(name: impl Into<String>, interval_secs: u64, max_age_secs: u64) -> Self {
        Self {
            name: name.into(),
            kind: RetentionKind::Aggregated,
            max_age_secs,
            interval_secs: Some(interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

/// Filter for [`crate::timeseries::TimeSeriesStore::query`]. Times are epoch milliseconds, inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryOptions {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub metric: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub aggregation: Option<Aggregation>,
    pub interval_ms: Option<i64>,
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn between(mut self, start_time: i64, end_time: i64) -> Self {
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation, interval_ms: i64) -> Self {
        self.aggregation = Some(aggregation);
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Prometheus,
    Influxdb,
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::Influxdb => "influxdb",
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "prometheus" => Ok(Self::Prometheus),
            "influxdb" | "influx" => Ok(Self::Influxdb),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(MetricsError::UnsupportedFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub total_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub enabled: bool,
    pub status: HealthStatus,
    pub tracked_requests: usize,
    pub pending_requests: usize,
    pub providers: Vec<ProviderHealth>,
    pub raw_points: usize,
    pub aggregated_groups: usize,
    pub compressed_points: usize,
    pub estimated_storage_bytes: u64,
    pub dropped_events: u64,
    pub internal_errors: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
}

/// JSON pull view of the running aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub providers: Vec<ProviderAggregate>,
    pub models: Vec<ModelAggregate>,
    pub latest_windows: Vec<AggregatedWindow>,
}

pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
