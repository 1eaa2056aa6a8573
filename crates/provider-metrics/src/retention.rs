use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::timeseries::TimeSeriesStore;
use crate::types::{period_label, RetentionKind, RetentionPolicy, Tags, TimeSeriesDataPoint};

const MILLIS_PER_SEC: i64 = 1_000;

/// Delta-encoded batch of raw points sharing one epoch bucket.
///
/// Immutable once built: timestamps are stored as offsets from
/// `base_timestamp`, with metric names, values and tags in parallel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedBatch {
    bucket_id: i64,
    base_timestamp: i64,
    offsets: Vec<u64>,
    metrics: Vec<String>,
    values: Vec<f64>,
    tags: Vec<Tags>,
}

impl CompressedBatch {
    pub fn encode(bucket_id: i64, mut points: Vec<TimeSeriesDataPoint>) -> Self {
        points.sort_by_key(|point| point.timestamp);
        let base_timestamp = points.first().map(|point| point.timestamp).unwrap_or(0);

        let mut batch = Self {
            bucket_id,
            base_timestamp,
            offsets: Vec::with_capacity(points.len()),
            metrics: Vec::with_capacity(points.len()),
            values: Vec::with_capacity(points.len()),
            tags: Vec::with_capacity(points.len()),
        };
        for point in points {
            batch.offsets.push((point.timestamp - base_timestamp) as u64);
            batch.metrics.push(point.metric);
            batch.values.push(point.value);
            batch.tags.push(point.tags);
        }
        batch
    }

    pub fn decode(&self) -> Vec<TimeSeriesDataPoint> {
        self.offsets
            .iter()
            .zip(&self.metrics)
            .zip(&self.values)
            .zip(&self.tags)
            .map(|(((offset, metric), value), tags)| {
                TimeSeriesDataPoint::new(
                    self.base_timestamp + *offset as i64,
                    metric.clone(),
                    *value,
                    tags.clone(),
                )
            })
            .collect()
    }

    /// A new batch holding this batch's points plus `points`.
    pub fn merged(&self, points: Vec<TimeSeriesDataPoint>) -> Self {
        let mut all = self.decode();
        all.extend(points);
        Self::encode(self.bucket_id, all)
    }

    pub fn bucket_id(&self) -> i64 {
        self.bucket_id
    }

    pub fn base_timestamp(&self) -> i64 {
        self.base_timestamp
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn newest_timestamp(&self) -> i64 {
        self.base_timestamp + self.offsets.last().copied().unwrap_or(0) as i64
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed_raw: usize,
    pub removed_aggregated: usize,
    pub removed_groups: usize,
    pub compressed: usize,
    pub dropped_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimReport {
    pub removed_points: usize,
    pub estimated_bytes: u64,
    pub max_bytes: u64,
}

/// Applies retention policies, the storage-size guard and compression to a
/// [`TimeSeriesStore`]. Owns the compressed batches, which are kept for size
/// accounting only and never surface in queries or exports.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    config: StorageConfig,
    compressed: BTreeMap<i64, CompressedBatch>,
}

impl RetentionManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            compressed: BTreeMap::new(),
        }
    }

    pub fn policies(&self) -> &[RetentionPolicy] {
        &self.config.policies
    }

    pub fn compressed_batches(&self) -> &BTreeMap<i64, CompressedBatch> {
        &self.compressed
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.values().map(CompressedBatch::len).sum()
    }

    pub fn estimated_bytes(&self, store: &TimeSeriesStore) -> u64 {
        (store.raw_len() as u64)
            .saturating_mul(self.config.bytes_per_point)
            .saturating_add(self.fixed_bytes(store))
    }

    /// Bytes held by aggregated groups and compressed batches, which the size
    /// guard cannot reclaim.
    fn fixed_bytes(&self, store: &TimeSeriesStore) -> u64 {
        (store.aggregated_len() as u64)
            .saturating_mul(self.config.bytes_per_point)
            .saturating_add(
                (self.compressed_len() as u64).saturating_mul(self.config.bytes_per_compressed_point),
            )
    }

    /// Drops the oldest 10% of raw points when the size estimate is over budget.
    ///
    /// Skipped when aggregated and compressed data alone fill the budget, since
    /// trimming raw points could never bring the estimate back under it.
    pub fn enforce_size(&mut self, store: &mut TimeSeriesStore) -> Option<TrimReport> {
        let estimated_bytes = self.estimated_bytes(store);
        if estimated_bytes <= self.config.max_storage_bytes || store.raw_len() == 0 {
            return None;
        }
        let fixed_bytes = self.fixed_bytes(store);
        if fixed_bytes >= self.config.max_storage_bytes {
            log::debug!(
                "metrics storage estimate {} bytes over budget, but {} bytes are aggregates; raw points kept",
                estimated_bytes,
                fixed_bytes
            );
            return None;
        }

        let to_remove = store.raw_len().div_ceil(10).max(1);
        let removed_points = store.drain_oldest_raw(to_remove).len();
        log::warn!(
            "metrics storage estimate {} bytes exceeds {} bytes; trimmed {} oldest raw points",
            estimated_bytes,
            self.config.max_storage_bytes,
            removed_points
        );
        Some(TrimReport {
            removed_points,
            estimated_bytes,
            max_bytes: self.config.max_storage_bytes,
        })
    }

    /// Scheduled pass: policy pruning, then compression of aged raw points.
    pub fn sweep(&mut self, store: &mut TimeSeriesStore, now: DateTime<Utc>) -> SweepReport {
        let now_ms = now.timestamp_millis();
        let mut report = SweepReport::default();

        for policy in &self.config.policies {
            let cutoff = now_ms.saturating_sub(secs_to_millis(policy.max_age_secs));
            match policy.kind {
                RetentionKind::Raw => {
                    report.removed_raw += store.extract_raw(|point| point.timestamp < cutoff).len();
                }
                RetentionKind::Aggregated => {
                    let period = policy.interval_secs.map(period_label);
                    let groups = store.aggregated_groups_mut();
                    let mut emptied = Vec::new();
                    for (key, points) in groups.iter_mut() {
                        if period.as_deref().is_some_and(|period| group_period(key) != period) {
                            continue;
                        }
                        let before = points.len();
                        points.retain(|point| point.timestamp >= cutoff);
                        report.removed_aggregated += before - points.len();
                        if points.is_empty() {
                            emptied.push(key.clone());
                        }
                    }
                    for key in emptied {
                        groups.remove(&key);
                        report.removed_groups += 1;
                    }
                }
            }
        }

        report.compressed = self.compress(store, now);

        if let Some(max_raw_age) = self
            .config
            .policies
            .iter()
            .filter(|policy| policy.kind == RetentionKind::Raw)
            .map(|policy| policy.max_age_secs)
            .max()
        {
            let cutoff = now_ms.saturating_sub(secs_to_millis(max_raw_age));
            let before = self.compressed.len();
            self.compressed.retain(|_, batch| batch.newest_timestamp() >= cutoff);
            report.dropped_batches = before - self.compressed.len();
        }

        log::info!(
            "retention sweep: removed {} raw / {} aggregated points ({} groups), compressed {}, dropped {} batches",
            report.removed_raw,
            report.removed_aggregated,
            report.removed_groups,
            report.compressed,
            report.dropped_batches
        );
        report
    }

    /// Moves raw points older than the compression age into per-bucket batches.
    pub fn compress(&mut self, store: &mut TimeSeriesStore, now: DateTime<Utc>) -> usize {
        let cutoff = now
            .timestamp_millis()
            .saturating_sub(secs_to_millis(self.config.compression_age_secs));
        let aged = store.extract_raw(|point| point.timestamp < cutoff);
        if aged.is_empty() {
            return 0;
        }
        let compressed = aged.len();

        let bucket_ms = secs_to_millis(self.config.compression_bucket_secs).max(1);
        let mut by_bucket: BTreeMap<i64, Vec<TimeSeriesDataPoint>> = BTreeMap::new();
        for point in aged {
            by_bucket
                .entry(point.timestamp.div_euclid(bucket_ms))
                .or_default()
                .push(point);
        }

        for (bucket_id, points) in by_bucket {
            let batch = match self.compressed.get(&bucket_id) {
                Some(existing) => existing.merged(points),
                None => CompressedBatch::encode(bucket_id, points),
            };
            self.compressed.insert(bucket_id, batch);
        }
        compressed
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(MILLIS_PER_SEC)
}

fn group_period(key: &str) -> &str {
    key.rsplit_once('_').map(|(period, _)| period).unwrap_or(key)
}
