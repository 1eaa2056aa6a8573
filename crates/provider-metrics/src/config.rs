use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, MetricsResult};
use crate::pricing::ModelPricing;
use crate::types::RetentionPolicy;

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// Largest accepted window size.
pub const MAX_WINDOW_SECS: u64 = 30 * DAY_SECS;
/// Largest accepted timer or compression interval.
pub const MAX_INTERVAL_SECS: u64 = 365 * DAY_SECS;
/// Largest accepted retention age.
pub const MAX_RETENTION_AGE_SECS: u64 = 10 * 365 * DAY_SECS;

/// Configuration for the request-metrics pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Global switch; when false every mutating call is a no-op.
    pub enabled: bool,
    /// Probability in [0, 1] that a request is tracked at all.
    pub sample_rate: f64,
    /// Seed for the sampling RNG. Unset means OS entropy.
    pub sample_seed: Option<u64>,
    /// Maximum number of records kept in history.
    pub max_history: usize,
    /// Capacity of each provider's rolling latency sample.
    pub latency_sample_capacity: usize,
    pub window_sizes_secs: Vec<u64>,
    /// Aggregated windows kept per window size.
    pub max_window_entries: usize,
    pub event_bus_capacity: usize,
    pub alerts: AlertThresholds,
    pub storage: StorageConfig,
    /// `provider -> model -> pricing`, merged over the built-in table.
    pub pricing_overrides: HashMap<String, HashMap<String, ModelPricing>>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            sample_seed: None,
            max_history: 10_000,
            latency_sample_capacity: 1_000,
            window_sizes_secs: vec![60, 300, 3600],
            max_window_entries: 100,
            event_bus_capacity: 1_024,
            alerts: AlertThresholds::default(),
            storage: StorageConfig::default(),
            pricing_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    pub latency_high_ms: u64,
    pub latency_critical_ms: u64,
    pub error_rate_high: f64,
    pub error_rate_critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            latency_high_ms: 5_000,
            latency_critical_ms: 10_000,
            error_rate_high: 0.05,
            error_rate_critical: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub max_storage_bytes: u64,
    /// Fixed size estimate for one live point.
    pub bytes_per_point: u64,
    /// Size estimate for one point held in a compressed batch.
    pub bytes_per_compressed_point: u64,
    pub compression_age_secs: u64,
    pub compression_bucket_secs: u64,
    pub retention_interval_secs: u64,
    pub policies: Vec<RetentionPolicy>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_storage_bytes: 100 * 1024 * 1024,
            bytes_per_point: 200,
            bytes_per_compressed_point: 48,
            compression_age_secs: DAY_SECS,
            compression_bucket_secs: HOUR_SECS,
            retention_interval_secs: HOUR_SECS,
            policies: vec![
                RetentionPolicy::raw("raw", 7 * DAY_SECS),
                RetentionPolicy::aggregated("1m", 60, 7 * DAY_SECS),
                RetentionPolicy::aggregated("5m", 300, 30 * DAY_SECS),
                RetentionPolicy::aggregated("1h", HOUR_SECS, 90 * DAY_SECS),
            ],
        }
    }
}

impl MetricsConfig {
    pub fn from_toml_str(source: &str) -> MetricsResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> MetricsResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Clamps the sample rate and rejects settings the pipeline cannot run with.
    pub fn validate(mut self) -> MetricsResult<Self> {
        if !self.sample_rate.is_finite() {
            return Err(MetricsError::Config("sample_rate must be a number".into()));
        }
        self.sample_rate = self.sample_rate.clamp(0.0, 1.0);

        if self.max_history == 0 {
            return Err(MetricsError::Config("max_history must be at least 1".into()));
        }
        if self.latency_sample_capacity == 0 {
            return Err(MetricsError::Config(
                "latency_sample_capacity must be at least 1".into(),
            ));
        }
        if self.event_bus_capacity == 0 {
            return Err(MetricsError::Config("event_bus_capacity must be at least 1".into()));
        }
        if self.window_sizes_secs.iter().any(|size| *size == 0) {
            return Err(MetricsError::Config("window sizes must be non-zero".into()));
        }
        if let Some(size) = self.window_sizes_secs.iter().find(|size| **size > MAX_WINDOW_SECS) {
            return Err(MetricsError::Config(format!(
                "window size {}s exceeds the {}s limit",
                size, MAX_WINDOW_SECS
            )));
        }
        if self.storage.retention_interval_secs == 0 || self.storage.compression_bucket_secs == 0 {
            return Err(MetricsError::Config(
                "retention and compression intervals must be non-zero".into(),
            ));
        }
        if self.storage.retention_interval_secs > MAX_INTERVAL_SECS
            || self.storage.compression_bucket_secs > MAX_INTERVAL_SECS
        {
            return Err(MetricsError::Config(format!(
                "retention and compression intervals must not exceed {}s",
                MAX_INTERVAL_SECS
            )));
        }
        if self.storage.compression_age_secs > MAX_RETENTION_AGE_SECS {
            return Err(MetricsError::Config(format!(
                "compression_age_secs must not exceed {}s",
                MAX_RETENTION_AGE_SECS
            )));
        }
        if let Some(policy) = self
            .storage
            .policies
            .iter()
            .find(|policy| policy.max_age_secs > MAX_RETENTION_AGE_SECS)
        {
            return Err(MetricsError::Config(format!(
                "retention policy '{}' max_age_secs exceeds {}s",
                policy.name, MAX_RETENTION_AGE_SECS
            )));
        }

        self.window_sizes_secs.sort_unstable();
        self.window_sizes_secs.dedup();
        Ok(self)
    }
}
